//! The director owns the election timer and drives role transitions:
//! follower timeouts, candidate campaigns, leader upkeep.
//!
//! Heartbeats themselves are sent by the replication workers; the
//! director only watches for their absence.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use quarkdb_core::RaftTerm;

use crate::client::PeerClient;
use crate::commit_tracker::CommitTracker;
use crate::journal::{RaftEntry, RaftJournal};
use crate::messages::{VoteRequest, VoteResponse};
use crate::state::{RaftRole, RaftState};
use crate::RaftError;

#[derive(Debug, Clone)]
pub struct ElectionTiming {
    pub timeout_low: Duration,
    pub timeout_high: Duration,
    pub heartbeat_interval: Duration,
}

pub struct Director {
    journal: Arc<RaftJournal>,
    state: Arc<RaftState>,
    commit_tracker: Arc<CommitTracker>,
    timing: ElectionTiming,
}

impl Director {
    pub fn new(
        journal: Arc<RaftJournal>,
        state: Arc<RaftState>,
        commit_tracker: Arc<CommitTracker>,
        timing: ElectionTiming,
    ) -> Self {
        Director {
            journal,
            state,
            commit_tracker,
            timing,
        }
    }

    fn randomized_timeout(&self) -> Duration {
        let low = self.timing.timeout_low.as_millis() as u64;
        let high = self.timing.timeout_high.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(low..high))
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut roles = self.state.subscribe();

        loop {
            let snapshot = roles.borrow_and_update().clone();
            match snapshot.role {
                RaftRole::Shutdown => return,

                RaftRole::Observer => {
                    // observers never campaign; just follow along
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = roles.changed() => {}
                    }
                }

                RaftRole::Follower => {
                    let timeout = self.randomized_timeout();
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = roles.changed() => {}
                        _ = tokio::time::sleep(timeout) => {
                            if self.state.since_last_heartbeat() >= self.timing.timeout_low {
                                if let Err(err) = self.campaign().await {
                                    warn!(error = %err, "election attempt failed");
                                    self.state.step_down();
                                }
                            }
                        }
                    }
                }

                RaftRole::Candidate => {
                    // the campaign itself runs from the follower arm;
                    // reaching here means one is mid-flight or stalled
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = roles.changed() => {}
                        _ = tokio::time::sleep(self.randomized_timeout()) => {
                            self.state.step_down();
                        }
                    }
                }

                RaftRole::Leader => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = roles.changed() => {}
                        _ = tokio::time::sleep(self.timing.heartbeat_interval) => {
                            // a leader voted out of the membership
                            // must not keep leading
                            let members = self.journal.membership().membership;
                            if !members.contains_member(self.state.myself()) {
                                info!("no longer part of the membership, stepping down");
                                self.state.step_down();
                            }
                        }
                    }
                }
            }
        }
    }

    /// One election round: bump term, solicit votes, ascend on quorum.
    async fn campaign(&self) -> Result<(), RaftError> {
        let term = self.state.become_candidate()?;
        let membership = self.journal.membership().membership;
        let quorum = membership.quorum_size();

        let last_index = self.journal.log_size() - 1;
        let last_term = self.journal.term_of(last_index)?;
        let request = VoteRequest {
            cluster_id: self.journal.cluster_id().to_string(),
            candidate: self.state.myself().clone(),
            term,
            last_index,
            last_term,
        }
        .to_redis_request();

        let peers: Vec<_> = membership
            .members
            .iter()
            .filter(|member| *member != self.state.myself())
            .cloned()
            .collect();

        let mut ballots = Vec::new();
        for peer in peers {
            let request = request.clone();
            let deadline = self.timing.timeout_low;
            ballots.push(tokio::spawn(async move {
                let mut client = PeerClient::new(peer);
                tokio::time::timeout(deadline, client.request(&request))
                    .await
                    .ok()
                    .and_then(|reply| reply.ok())
                    .and_then(|reply| VoteResponse::parse(&reply).ok())
            }));
        }

        // our own ballot
        let mut granted = 1usize;
        let mut highest_term: RaftTerm = term;
        for ballot in ballots {
            if let Ok(Some(response)) = ballot.await {
                if response.granted {
                    granted += 1;
                } else {
                    highest_term = highest_term.max(response.term);
                }
            }
        }

        if highest_term > term {
            self.state.observed_term(highest_term)?;
            return Ok(());
        }

        if granted >= quorum && self.state.ascend(term) {
            info!(term, granted, "assuming leadership");
            self.append_leadership_marker(term)?;
        } else {
            info!(term, granted, quorum, "election lost");
            self.state.step_down();
        }
        Ok(())
    }

    /// Journal one entry owned by the new term, carrying the static
    /// clock so every replica's dynamic clock catches up.
    fn append_leadership_marker(&self, term: RaftTerm) -> Result<(), RaftError> {
        let static_clock = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let index = self.journal.log_size();
        self.journal
            .append(index, &RaftEntry::leadership_marker(term, static_clock))?;
        self.commit_tracker.note_local_append()?;
        Ok(())
    }
}
