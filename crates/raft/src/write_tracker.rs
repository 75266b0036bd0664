//! The apply loop: feeds committed journal entries through the state
//! machine, in order, exactly once, and hands each entry's replies
//! back to whoever journaled it.
//!
//! Membership entries are consumed here too: at commit time every
//! node swaps its previous/current member sets and the commit quorum
//! is evaluated under the new one from then on.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use quarkdb_core::resp::RespValue;
use quarkdb_core::{LogIndex, Membership, RedisCommand};
use quarkdb_machine::RedisDispatcher;

use crate::commit_tracker::CommitTracker;
use crate::journal::RaftJournal;
use crate::state::RaftState;
use crate::RaftError;

pub struct WriteTracker {
    journal: Arc<RaftJournal>,
    state: Arc<RaftState>,
    commit_tracker: Arc<CommitTracker>,
    dispatcher: RedisDispatcher,
    pending: Mutex<BTreeMap<LogIndex, oneshot::Sender<Vec<RespValue>>>>,
}

impl WriteTracker {
    pub fn new(
        journal: Arc<RaftJournal>,
        state: Arc<RaftState>,
        commit_tracker: Arc<CommitTracker>,
        dispatcher: RedisDispatcher,
    ) -> Self {
        WriteTracker {
            journal,
            state,
            commit_tracker,
            dispatcher,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Leader-side write submission: append at the tail and claim the
    /// entry's replies in one step, so the apply loop can never race
    /// past an unclaimed index.
    pub fn submit(
        &self,
        entry: &crate::journal::RaftEntry,
    ) -> Result<oneshot::Receiver<Vec<RespValue>>, RaftError> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let index = self.journal.append_tail(entry)?;
        let (tx, rx) = oneshot::channel();
        pending.insert(index, tx);
        drop(pending);

        self.commit_tracker.note_local_append()?;
        Ok(rx)
    }

    /// Claim the replies for `index` before it commits. The receiver
    /// resolves when the apply loop has pushed the entry through the
    /// state machine.
    pub fn register(&self, index: LogIndex) -> oneshot::Receiver<Vec<RespValue>> {
        let (tx, rx) = oneshot::channel();
        let previous = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(index, tx);
        debug_assert!(previous.is_none(), "double registration for index {index}");
        rx
    }

    /// Drop all claims, e.g. on leadership loss: the entries may still
    /// apply, but nobody local is waiting for them anymore.
    pub fn abandon_pending(&self) {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// The apply loop. Exits on cancellation or on the first fatal
    /// error, which the owner treats as grounds for shutdown.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), RaftError> {
        let mut commits = self.journal.subscribe_commits();

        loop {
            let target = *commits.borrow_and_update();
            if let Err(err) = self.apply_up_to(target) {
                error!(error = %err, "apply loop failed");
                self.state.shutdown();
                return Err(err);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                outcome = commits.changed() => {
                    if outcome.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn apply_up_to(&self, target: LogIndex) -> Result<(), RaftError> {
        while self.dispatcher.machine().last_applied() < target {
            let index = self.dispatcher.machine().last_applied() + 1;
            let entry = self.journal.fetch(index)?;

            if entry.request.command() == Some(RedisCommand::RaftMembership) {
                self.apply_membership(index, &entry.request.to_parts())?;
            }

            let replies = self.dispatcher.apply_write(index, &entry.request)?;
            self.deliver(index, replies);
        }
        Ok(())
    }

    fn apply_membership(&self, epoch: LogIndex, parts: &[Vec<u8>]) -> Result<(), RaftError> {
        let payload = parts
            .get(1)
            .ok_or_else(|| RaftError::Protocol("membership entry without payload".to_string()))?;
        let membership = Membership::from_str(&String::from_utf8_lossy(payload))
            .map_err(|err| RaftError::Protocol(err.to_string()))?;

        info!(epoch, members = %membership, "installing membership");
        self.journal.set_membership(membership.clone(), epoch)?;
        self.commit_tracker.membership_changed()?;

        // a leader that just voted itself out steps down here
        if !membership.contains_member(self.state.myself()) {
            warn!("not part of the new membership");
            self.state.step_down();
        }
        Ok(())
    }

    fn deliver(&self, index: LogIndex, replies: Vec<RespValue>) {
        let claim = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&index);
        if let Some(sender) = claim {
            // the connection may have gone away; that is fine
            let _ = sender.send(replies);
        }
    }
}
