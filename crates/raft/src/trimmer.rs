//! Background journal trimming.
//!
//! Keeps a configured window of applied entries around for lagging
//! followers and advances the log start past the rest. Resilvering
//! freezes trimming for its whole duration so checkpoint and log stay
//! coherent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use quarkdb_core::TrimmingConfig;
use quarkdb_machine::StateMachine;

use crate::journal::RaftJournal;

const TRIM_INTERVAL: Duration = Duration::from_secs(5);

pub struct Trimmer {
    journal: Arc<RaftJournal>,
    machine: Arc<StateMachine>,
    config: TrimmingConfig,
    frozen: Arc<AtomicU64>,
}

/// RAII freeze: trimming pauses while any of these are alive.
pub struct TrimmingFreeze {
    counter: Arc<AtomicU64>,
}

impl Drop for TrimmingFreeze {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Trimmer {
    pub fn new(
        journal: Arc<RaftJournal>,
        machine: Arc<StateMachine>,
        config: TrimmingConfig,
    ) -> Self {
        Trimmer {
            journal,
            machine,
            config,
            frozen: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn freeze(&self) -> TrimmingFreeze {
        self.frozen.fetch_add(1, Ordering::AcqRel);
        TrimmingFreeze {
            counter: self.frozen.clone(),
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(TRIM_INTERVAL) => {}
            }
            if self.frozen.load(Ordering::Acquire) > 0 {
                continue;
            }
            self.trim_round();
        }
    }

    fn trim_round(&self) {
        let applied = self.machine.last_applied();
        let safe = self.journal.commit_index().min(applied);
        let floor = safe - self.config.keep_at_least as i64;
        let log_start = self.journal.log_start();
        if floor <= log_start {
            return;
        }

        let target = floor.min(log_start + self.config.batch_size as i64);
        match self.journal.trim_until(target, applied) {
            Ok(()) => debug!(target, "journal trimmed"),
            Err(err) => warn!(error = %err, "journal trim failed"),
        }
    }
}
