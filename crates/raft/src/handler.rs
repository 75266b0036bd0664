//! Follower-side raft RPC handling: append-entries, votes, fetches
//! and the info surface. The connection pipeline routes every command
//! classified as raft traffic here.

use std::sync::Arc;

use tracing::{info, warn};

use quarkdb_core::resp::{formatter, RespValue};
use quarkdb_core::RedisCommand;
use quarkdb_core::RedisRequest;

use crate::journal::RaftJournal;
use crate::messages::{
    AppendEntriesRequest, AppendEntriesResponse, AppendOutcome, VoteRequest, VoteResponse,
};
use crate::state::{RaftRole, RaftState};
use crate::RaftError;

pub struct RaftHandler {
    journal: Arc<RaftJournal>,
    state: Arc<RaftState>,
}

impl RaftHandler {
    pub fn new(journal: Arc<RaftJournal>, state: Arc<RaftState>) -> Self {
        RaftHandler { journal, state }
    }

    /// Entry point for RESP-level raft traffic.
    pub fn dispatch(&self, request: &RedisRequest) -> RespValue {
        let outcome = match request.command() {
            Some(RedisCommand::RaftAppendEntries) => self.append_entries(request),
            Some(RedisCommand::RaftRequestVote) => self.request_vote(request),
            Some(RedisCommand::RaftHandshake) => self.handshake(request),
            Some(RedisCommand::RaftFetch) => self.fetch(request),
            Some(RedisCommand::RaftInfo) => Ok(self.info()),
            _ => Ok(formatter::err(format!(
                "unhandled raft command '{}'",
                request.describe()
            ))),
        };
        match outcome {
            Ok(reply) => reply,
            Err(err) => formatter::err(err.to_string()),
        }
    }

    fn append_entries(&self, request: &RedisRequest) -> Result<RespValue, RaftError> {
        let message = AppendEntriesRequest::parse(request)?;

        if message.cluster_id != self.journal.cluster_id() {
            return Ok(formatter::err(format!(
                "wrong cluster, this is '{}'",
                self.journal.cluster_id()
            )));
        }

        let response = self.handle_append(&message)?;
        Ok(response.to_resp())
    }

    fn handle_append(
        &self,
        message: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        let mut current_term = self.journal.current_term();
        if message.term < current_term {
            return Ok(AppendEntriesResponse {
                term: current_term,
                log_size: self.journal.log_size(),
                outcome: AppendOutcome::TermMismatch,
            });
        }

        // valid leader for this term: adopt it and reset the election
        // timer before touching the log
        self.state.observed_leader(message.term, &message.leader)?;
        current_term = message.term;

        // the previous entry must exist and carry the promised term
        let log_start = self.journal.log_start();
        let log_size = self.journal.log_size();
        if message.prev_index >= log_size {
            return Ok(AppendEntriesResponse {
                term: current_term,
                log_size,
                outcome: AppendOutcome::LogGap,
            });
        }
        if message.prev_index >= log_start {
            let local_prev = self.journal.term_of(message.prev_index)?;
            if local_prev != message.prev_term {
                warn!(
                    prev_index = message.prev_index,
                    local_term = local_prev,
                    leader_term = message.prev_term,
                    "log diverges from leader"
                );
                return Ok(AppendEntriesResponse {
                    term: current_term,
                    log_size,
                    outcome: AppendOutcome::LogGap,
                });
            }
        }

        for (offset, entry) in message.entries.iter().enumerate() {
            let index = message.prev_index + 1 + offset as i64;
            if index < self.journal.log_size() {
                // conflicting suffixes get truncated, duplicates skipped
                if self.journal.term_of(index)? == entry.term {
                    continue;
                }
                self.journal.remove_entries(index)?;
            }
            self.journal.append(index, entry)?;
        }

        let tail = self.journal.log_size() - 1;
        self.journal
            .set_commit_index(message.commit_index.min(tail))?;

        Ok(AppendEntriesResponse {
            term: current_term,
            log_size: self.journal.log_size(),
            outcome: AppendOutcome::Ok,
        })
    }

    fn request_vote(&self, request: &RedisRequest) -> Result<RespValue, RaftError> {
        let message = VoteRequest::parse(request)?;

        if message.cluster_id != self.journal.cluster_id() {
            return Ok(formatter::err(format!(
                "wrong cluster, this is '{}'",
                self.journal.cluster_id()
            )));
        }

        let response = self.handle_vote(&message)?;
        Ok(response.to_resp())
    }

    fn handle_vote(&self, message: &VoteRequest) -> Result<VoteResponse, RaftError> {
        if message.term > self.journal.current_term() {
            self.state.observed_term(message.term)?;
        }
        let current_term = self.journal.current_term();
        if message.term < current_term {
            return Ok(VoteResponse {
                term: current_term,
                granted: false,
            });
        }

        // candidate log must be at least as up to date as ours
        let my_last_index = self.journal.log_size() - 1;
        let my_last_term = self.journal.term_of(my_last_index).unwrap_or(0);
        let up_to_date = message.last_term > my_last_term
            || (message.last_term == my_last_term && message.last_index >= my_last_index);
        if !up_to_date {
            return Ok(VoteResponse {
                term: current_term,
                granted: false,
            });
        }

        let granted = self.journal.try_vote(current_term, &message.candidate)?;
        if granted {
            info!(term = current_term, candidate = %message.candidate, "vote granted");
        }
        Ok(VoteResponse {
            term: current_term,
            granted,
        })
    }

    /// First exchange on a fresh peer connection: prove we belong to
    /// the same cluster before any log traffic flows.
    fn handshake(&self, request: &RedisRequest) -> Result<RespValue, RaftError> {
        if request.len() != 2 {
            return Ok(formatter::err_args("raft_handshake"));
        }
        if request.arg(1) != self.journal.cluster_id().as_bytes() {
            return Ok(formatter::err(format!(
                "wrong cluster, this is '{}'",
                self.journal.cluster_id()
            )));
        }
        Ok(formatter::ok())
    }

    fn fetch(&self, request: &RedisRequest) -> Result<RespValue, RaftError> {
        if request.len() != 2 {
            return Ok(formatter::err_args("raft_fetch"));
        }
        let index = std::str::from_utf8(request.arg(1))
            .ok()
            .and_then(|text| text.parse::<i64>().ok())
            .ok_or_else(|| RaftError::Protocol("malformed index".to_string()))?;

        match self.journal.fetch(index) {
            Ok(entry) => Ok(formatter::string(entry.serialize()?)),
            Err(RaftError::OutOfBounds { .. }) => Ok(formatter::null()),
            Err(err) => Err(err),
        }
    }

    fn info(&self) -> RespValue {
        let snapshot = self.state.snapshot();
        let role = match snapshot.role {
            RaftRole::Follower => "follower",
            RaftRole::Observer => "observer",
            RaftRole::Candidate => "candidate",
            RaftRole::Leader => "leader",
            RaftRole::Shutdown => "shutdown",
        };
        let leader = snapshot
            .leader
            .map(|leader| leader.to_string())
            .unwrap_or_else(|| "none".to_string());

        formatter::vector(vec![
            format!("cluster-id {}", self.journal.cluster_id()),
            format!("role {role}"),
            format!("term {}", snapshot.term),
            format!("leader {leader}"),
            format!("log-start {}", self.journal.log_start()),
            format!("log-size {}", self.journal.log_size()),
            format!("commit-index {}", self.journal.commit_index()),
            format!("membership-epoch {}", self.journal.membership().epoch),
            format!("members {}", self.journal.membership().membership),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::RaftEntry;
    use quarkdb_core::Membership;

    fn scratch() -> (tempfile::TempDir, Arc<RaftJournal>, Arc<RaftState>, RaftHandler) {
        let dir = tempfile::tempdir().unwrap();
        let membership: Membership = "n1:1001,n2:1002,n3:1003".parse().unwrap();
        let journal = Arc::new(
            RaftJournal::create(dir.path().join("journal"), "cluster-1", membership).unwrap(),
        );
        let state = Arc::new(RaftState::new(journal.clone(), "n2:1002".parse().unwrap()));
        let handler = RaftHandler::new(journal.clone(), state.clone());
        (dir, journal, state, handler)
    }

    fn entries(term: i64, keys: &[&str]) -> Vec<RaftEntry> {
        keys.iter()
            .map(|key| RaftEntry::new(term, RedisRequest::from(["set", *key, "v"])))
            .collect()
    }

    fn append_message(
        term: i64,
        prev_index: i64,
        prev_term: i64,
        commit: i64,
        batch: Vec<RaftEntry>,
    ) -> AppendEntriesRequest {
        AppendEntriesRequest {
            cluster_id: "cluster-1".to_string(),
            leader: "n1:1001".parse().unwrap(),
            term,
            prev_index,
            prev_term,
            commit_index: commit,
            entries: batch,
        }
    }

    #[test]
    fn replication_happy_path() {
        let (_dir, journal, state, handler) = scratch();

        let response = handler
            .handle_append(&append_message(1, 0, 0, 0, entries(1, &["a", "b"])))
            .unwrap();
        assert_eq!(response.outcome, AppendOutcome::Ok);
        assert_eq!(response.log_size, 3);
        assert_eq!(journal.commit_index(), 0);

        // leader advances its commit on the next heartbeat
        let response = handler
            .handle_append(&append_message(1, 2, 1, 2, Vec::new()))
            .unwrap();
        assert_eq!(response.outcome, AppendOutcome::Ok);
        assert_eq!(journal.commit_index(), 2);
        assert_eq!(
            state.snapshot().leader,
            Some("n1:1001".parse().unwrap())
        );
    }

    #[test]
    fn stale_terms_are_rejected() {
        let (_dir, journal, _state, handler) = scratch();
        journal.bump_term(5).unwrap();

        let response = handler
            .handle_append(&append_message(3, 0, 0, 0, entries(3, &["x"])))
            .unwrap();
        assert_eq!(response.outcome, AppendOutcome::TermMismatch);
        assert_eq!(response.term, 5);
        assert_eq!(journal.log_size(), 1);
    }

    #[test]
    fn gaps_are_reported() {
        let (_dir, _journal, _state, handler) = scratch();

        let response = handler
            .handle_append(&append_message(1, 10, 1, 0, entries(1, &["x"])))
            .unwrap();
        assert_eq!(response.outcome, AppendOutcome::LogGap);
    }

    #[test]
    fn conflicting_suffix_is_replaced() {
        let (_dir, journal, _state, handler) = scratch();

        handler
            .handle_append(&append_message(1, 0, 0, 0, entries(1, &["a", "b", "c"])))
            .unwrap();
        assert_eq!(journal.log_size(), 4);

        // a new leader overwrites the uncommitted tail
        let response = handler
            .handle_append(&append_message(2, 1, 1, 0, entries(2, &["B", "C"])))
            .unwrap();
        assert_eq!(response.outcome, AppendOutcome::Ok);
        assert_eq!(journal.log_size(), 4);
        assert_eq!(journal.term_of(2).unwrap(), 2);
        assert_eq!(
            journal.fetch(2).unwrap().request,
            RedisRequest::from(["set", "B", "v"])
        );
    }

    #[test]
    fn votes_enforce_log_freshness() {
        let (_dir, journal, _state, handler) = scratch();
        handler
            .handle_append(&append_message(2, 0, 0, 0, entries(2, &["a", "b"])))
            .unwrap();

        // candidate with a shorter log of the same term: denied
        let response = handler
            .handle_vote(&VoteRequest {
                cluster_id: "cluster-1".to_string(),
                candidate: "n3:1003".parse().unwrap(),
                term: 3,
                last_index: 1,
                last_term: 2,
            })
            .unwrap();
        assert!(!response.granted);
        assert_eq!(journal.current_term(), 3);

        // candidate at least as fresh: granted
        let response = handler
            .handle_vote(&VoteRequest {
                cluster_id: "cluster-1".to_string(),
                candidate: "n3:1003".parse().unwrap(),
                term: 4,
                last_index: 2,
                last_term: 2,
            })
            .unwrap();
        assert!(response.granted);

        // second candidate in the same term: the vote is spent
        let response = handler
            .handle_vote(&VoteRequest {
                cluster_id: "cluster-1".to_string(),
                candidate: "n1:1001".parse().unwrap(),
                term: 4,
                last_index: 9,
                last_term: 2,
            })
            .unwrap();
        assert!(!response.granted);
    }

    #[test]
    fn wrong_cluster_is_refused() {
        let (_dir, _journal, _state, handler) = scratch();
        let mut message = append_message(1, 0, 0, 0, Vec::new());
        message.cluster_id = "someone-else".to_string();

        let reply = handler
            .append_entries(&message.to_redis_request().unwrap())
            .unwrap();
        assert!(reply.is_error());
    }
}
