//! Volatile raft role state.
//!
//! Every transition funnels through one internal method holding one
//! mutex, so concurrent transitions are impossible, and each change is
//! published on a watch channel for the director, the replication
//! manager and the dispatcher to react to. Term changes persist
//! through the journal before the role flips.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::watch;
use tracing::info;

use quarkdb_core::{RaftServer, RaftTerm};

use crate::journal::RaftJournal;
use crate::RaftError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    /// Receives entries, never votes, never counts for quorum.
    Observer,
    Candidate,
    Leader,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSnapshot {
    pub role: RaftRole,
    pub term: RaftTerm,
    pub leader: Option<RaftServer>,
}

pub struct RaftState {
    journal: Arc<RaftJournal>,
    myself: RaftServer,
    inner: Mutex<RoleSnapshot>,
    changes: watch::Sender<RoleSnapshot>,
    last_heartbeat: Mutex<Instant>,
}

impl RaftState {
    pub fn new(journal: Arc<RaftJournal>, myself: RaftServer) -> Self {
        let role = if journal.membership().membership.contains_member(&myself) {
            RaftRole::Follower
        } else {
            RaftRole::Observer
        };
        let snapshot = RoleSnapshot {
            role,
            term: journal.current_term(),
            leader: None,
        };
        let (changes, _) = watch::channel(snapshot.clone());
        RaftState {
            journal,
            myself,
            inner: Mutex::new(snapshot),
            changes,
            last_heartbeat: Mutex::new(Instant::now()),
        }
    }

    pub fn myself(&self) -> &RaftServer {
        &self.myself
    }

    pub fn snapshot(&self) -> RoleSnapshot {
        self.locked().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RoleSnapshot> {
        self.changes.subscribe()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, RoleSnapshot> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, snapshot: &RoleSnapshot) {
        let _ = self.changes.send(snapshot.clone());
    }

    /// The role this node falls back to when it is not leading or
    /// campaigning.
    fn base_role(&self) -> RaftRole {
        if self
            .journal
            .membership()
            .membership
            .contains_member(&self.myself)
        {
            RaftRole::Follower
        } else {
            RaftRole::Observer
        }
    }

    /// Any message carrying a higher term forces an immediate drop to
    /// follower under that term, vote cleared.
    pub fn observed_term(&self, term: RaftTerm) -> Result<(), RaftError> {
        let mut state = self.locked();
        if term <= state.term && state.role != RaftRole::Shutdown {
            return Ok(());
        }
        self.journal.bump_term(term)?;

        let role = self.base_role();
        info!(term, from = ?state.role, to = ?role, "stepping down on higher term");
        *state = RoleSnapshot {
            role,
            term,
            leader: None,
        };
        self.publish(&state);
        Ok(())
    }

    /// A valid heartbeat from `leader` at the current term.
    pub fn observed_leader(&self, term: RaftTerm, leader: &RaftServer) -> Result<(), RaftError> {
        self.observed_term(term)?;

        let mut state = self.locked();
        if state.term != term || state.role == RaftRole::Shutdown {
            return Ok(());
        }
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();

        let mut changed = false;
        if state.leader.as_ref() != Some(leader) {
            state.leader = Some(leader.clone());
            changed = true;
        }
        // a candidate concedes to a legitimate leader of its own term
        if state.role == RaftRole::Candidate {
            state.role = self.base_role();
            changed = true;
        }
        if changed {
            info!(term, leader = %leader, "acknowledged leader");
            self.publish(&state);
        }
        Ok(())
    }

    /// Follower → candidate: bump the term, vote for ourselves.
    /// Returns the election term.
    pub fn become_candidate(&self) -> Result<RaftTerm, RaftError> {
        let mut state = self.locked();
        if state.role != RaftRole::Follower {
            return Err(RaftError::Corruption(format!(
                "cannot campaign from role {:?}",
                state.role
            )));
        }
        let term = state.term + 1;
        self.journal.bump_term(term)?;
        if !self.journal.try_vote(term, &self.myself)? {
            return Err(RaftError::Corruption(
                "fresh term already carries a vote".to_string(),
            ));
        }

        info!(term, "starting election");
        *state = RoleSnapshot {
            role: RaftRole::Candidate,
            term,
            leader: None,
        };
        self.publish(&state);
        Ok(term)
    }

    /// Candidate → leader, valid only if the role and term are still
    /// the ones the election ran under.
    pub fn ascend(&self, term: RaftTerm) -> bool {
        let mut state = self.locked();
        if state.role != RaftRole::Candidate || state.term != term {
            return false;
        }
        info!(term, "won election");
        *state = RoleSnapshot {
            role: RaftRole::Leader,
            term,
            leader: Some(self.myself.clone()),
        };
        self.publish(&state);
        true
    }

    /// Candidate timeout or leader losing its membership: fall back
    /// without touching the term.
    pub fn step_down(&self) {
        let mut state = self.locked();
        if matches!(state.role, RaftRole::Shutdown) {
            return;
        }
        let role = self.base_role();
        if state.role != role {
            info!(from = ?state.role, to = ?role, term = state.term, "stepping down");
            state.role = role;
            state.leader = None;
            self.publish(&state);
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.locked();
        state.role = RaftRole::Shutdown;
        state.leader = None;
        self.publish(&state);
    }

    /// How long since the last valid leader contact.
    pub fn since_last_heartbeat(&self) -> std::time::Duration {
        self.last_heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }
}
