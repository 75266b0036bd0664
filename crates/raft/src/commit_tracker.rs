//! Commit tracking: per-peer match indices folded into the cluster
//! commit index.
//!
//! An index commits once a quorum of the current voting members have
//! replicated it AND it belongs to the current term. Committing an
//! earlier-term entry directly would violate raft safety; such entries
//! only commit transitively underneath a current-term entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use quarkdb_core::{LogIndex, RaftServer};

use crate::journal::RaftJournal;
use crate::RaftError;

pub struct CommitTracker {
    journal: Arc<RaftJournal>,
    myself: RaftServer,
    matched: Mutex<HashMap<RaftServer, LogIndex>>,
}

impl CommitTracker {
    pub fn new(journal: Arc<RaftJournal>, myself: RaftServer) -> Self {
        CommitTracker {
            journal,
            myself,
            matched: Mutex::new(HashMap::new()),
        }
    }

    /// A follower acknowledged everything up to `index`.
    pub fn update(&self, peer: &RaftServer, index: LogIndex) -> Result<(), RaftError> {
        {
            let mut matched = self
                .matched
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let slot = matched.entry(peer.clone()).or_insert(index);
            if *slot < index {
                *slot = index;
            }
        }
        self.recompute()
    }

    /// The leader extended its own log; re-evaluate (matters most for
    /// single-node clusters, where quorum is just us).
    pub fn note_local_append(&self) -> Result<(), RaftError> {
        self.recompute()
    }

    /// Membership changed: stale peers fall out of the quorum set.
    pub fn membership_changed(&self) -> Result<(), RaftError> {
        let members = self.journal.membership().membership;
        self.matched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|peer, _| members.contains(peer));
        self.recompute()
    }

    fn recompute(&self) -> Result<(), RaftError> {
        let membership = self.journal.membership().membership;
        let quorum = membership.quorum_size();

        let matched = self
            .matched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut indices: Vec<LogIndex> = membership
            .members
            .iter()
            .map(|member| {
                if *member == self.myself {
                    self.journal.log_size() - 1
                } else {
                    matched.get(member).copied().unwrap_or(-1)
                }
            })
            .collect();
        drop(matched);

        if indices.len() < quorum {
            return Ok(());
        }
        indices.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = indices[quorum - 1];

        if candidate <= self.journal.commit_index() {
            return Ok(());
        }

        // raft safety: only entries of the current term commit by
        // counting; earlier entries commit transitively below them
        if self.journal.term_of(candidate)? != self.journal.current_term() {
            debug!(candidate, "holding commit for an earlier-term entry");
            return Ok(());
        }

        self.journal.set_commit_index(candidate)?;
        Ok(())
    }
}
