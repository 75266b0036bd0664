//! Replication: one worker per peer, owned by a manager that follows
//! the node's role.
//!
//! Each worker streams journal entries to its follower, retreating on
//! log gaps, feeding acknowledgements into the commit tracker and the
//! lease register, and sending empty appends as heartbeats while the
//! follower is caught up. When the follower has fallen off the trimmed
//! log entirely, the worker hands the peer to the resilver spawner and
//! pauses until the transfer finishes.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use quarkdb_core::{LogIndex, RaftServer, RaftTerm};

use crate::client::PeerClient;
use crate::commit_tracker::CommitTracker;
use crate::journal::RaftJournal;
use crate::lease_register::LeaseRegister;
use crate::messages::{AppendEntriesRequest, AppendEntriesResponse, AppendOutcome};
use crate::state::{RaftRole, RaftState};

/// Entries per append; more ride in follow-up rounds immediately.
const BATCH_SIZE: usize = 64;

/// Performed by the owner when a follower needs a full snapshot; the
/// future resolves once the transfer is done (or failed).
#[trait_variant::make(Send)]
pub trait ResilverSpawner: Send + Sync + 'static {
    async fn resilver(&self, target: RaftServer) -> Result<(), crate::RaftError>;
}

pub struct ReplicationManager<R> {
    journal: Arc<RaftJournal>,
    state: Arc<RaftState>,
    commit_tracker: Arc<CommitTracker>,
    lease_register: Arc<LeaseRegister>,
    resilver: Arc<R>,
    heartbeat_interval: Duration,
}

impl<R: ResilverSpawner> ReplicationManager<R> {
    pub fn new(
        journal: Arc<RaftJournal>,
        state: Arc<RaftState>,
        commit_tracker: Arc<CommitTracker>,
        lease_register: Arc<LeaseRegister>,
        resilver: Arc<R>,
        heartbeat_interval: Duration,
    ) -> Self {
        ReplicationManager {
            journal,
            state,
            commit_tracker,
            lease_register,
            resilver,
            heartbeat_interval,
        }
    }

    /// Track role changes, running one worker set per leadership term.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut roles = self.state.subscribe();
        let mut active: Option<(RaftTerm, CancellationToken)> = None;

        loop {
            let snapshot = roles.borrow_and_update().clone();

            let keep = matches!(snapshot.role, RaftRole::Leader)
                && active
                    .as_ref()
                    .is_some_and(|(term, _)| *term == snapshot.term);
            if !keep {
                if let Some((term, workers)) = active.take() {
                    debug!(term, "stopping replication workers");
                    workers.cancel();
                }
                if snapshot.role == RaftRole::Leader {
                    let workers = cancel.child_token();
                    let targets = self
                        .journal
                        .membership()
                        .membership
                        .replication_targets(self.state.myself());
                    info!(term = snapshot.term, peers = targets.len(), "starting replication");
                    for peer in targets {
                        tokio::spawn(self.clone().replicate_peer(
                            peer,
                            snapshot.term,
                            workers.clone(),
                        ));
                    }
                    active = Some((snapshot.term, workers));
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some((_, workers)) = active.take() {
                        workers.cancel();
                    }
                    return;
                }
                outcome = roles.changed() => {
                    if outcome.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn replicate_peer(
        self: Arc<Self>,
        peer: RaftServer,
        term: RaftTerm,
        cancel: CancellationToken,
    ) {
        let mut client = PeerClient::new(peer.clone());
        let mut appends = self.journal.subscribe_appends();
        let mut next_index = self.journal.log_size();

        while !cancel.is_cancelled() {
            let snapshot = self.state.snapshot();
            if snapshot.role != RaftRole::Leader || snapshot.term != term {
                return;
            }

            // follower fell below our trimmed log (we cannot even name
            // the previous entry's term): only a full snapshot helps
            let log_start = self.journal.log_start();
            if next_index < log_start || (next_index == log_start && log_start > 0) {
                warn!(peer = %peer, next_index, "follower behind log start, resilvering");
                match self.resilver.resilver(peer.clone()).await {
                    Ok(()) => next_index = self.journal.log_size(),
                    Err(err) => {
                        warn!(peer = %peer, error = %err, "resilvering failed");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(self.heartbeat_interval) => continue,
                        }
                    }
                }
            }

            let round = self.replication_round(&mut client, term, next_index).await;
            match round {
                Ok(Some(acked)) => {
                    next_index = acked + 1;
                    self.lease_register.register_contact(&peer);
                    if let Err(err) = self.commit_tracker.update(&peer, acked) {
                        warn!(peer = %peer, error = %err, "commit tracking failed");
                    }

                    // caught up: idle until new entries or heartbeat
                    if next_index >= self.journal.log_size() {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = appends.changed() => {}
                            _ = tokio::time::sleep(self.heartbeat_interval) => {}
                        }
                    }
                }
                Ok(None) => {
                    // receded; retry immediately with the new position
                    next_index = next_index.saturating_sub(1).max(self.journal.log_start());
                }
                Err(err) => {
                    debug!(peer = %peer, error = %err, "replication round failed");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.heartbeat_interval) => {}
                    }
                }
            }
        }
    }

    /// One append exchange. `Ok(Some(index))` acknowledges everything
    /// up to `index`; `Ok(None)` means the follower wants earlier
    /// entries.
    async fn replication_round(
        &self,
        client: &mut PeerClient,
        term: RaftTerm,
        next_index: LogIndex,
    ) -> Result<Option<LogIndex>, crate::RaftError> {
        let prev_index = next_index - 1;
        let prev_term = if prev_index < 0 {
            0
        } else {
            self.journal.term_of(prev_index)?
        };
        let entries = self.journal.fetch_range(next_index, BATCH_SIZE)?;
        let sent = entries.len() as i64;

        let message = AppendEntriesRequest {
            cluster_id: self.journal.cluster_id().to_string(),
            leader: self.state.myself().clone(),
            term,
            prev_index,
            prev_term,
            commit_index: self.journal.commit_index(),
            entries,
        };

        let reply = client.request(&message.to_redis_request()?).await?;
        let response = AppendEntriesResponse::parse(&reply)?;

        match response.outcome {
            AppendOutcome::Ok => Ok(Some(prev_index + sent)),
            AppendOutcome::TermMismatch => {
                if response.term > term {
                    self.state.observed_term(response.term)?;
                }
                Err(crate::RaftError::StaleTerm {
                    current: response.term,
                    observed: term,
                })
            }
            AppendOutcome::LogGap => Ok(None),
        }
    }
}
