//! The shard directory: everything one node persists, laid out as
//!
//! ```text
//! <shard>/SHARD-ID                     immutable identity
//! <shard>/RESILVERING-HISTORY          append-only event log
//! <shard>/current/state-machine/       the live state machine store
//! <shard>/current/raft-journal/        the live journal store
//! <shard>/resilvering-arena/<id>/      staged incoming transfers
//! <shard>/supplanted/<event-id>/       stores replaced by resilvering
//! <shard>/temp-snapshots/<id>/         outgoing checkpoint staging
//! ```
//!
//! Incoming resilvering stages a full replacement under the arena and
//! swaps it in atomically on FINISH; the old `current` moves to
//! `supplanted` so nothing is ever destroyed mid-flight.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::prelude::Error;

const SHARD_ID_FILE: &str = "SHARD-ID";
const RESILVERING_HISTORY_FILE: &str = "RESILVERING-HISTORY";

pub struct ShardDirectory {
    root: PathBuf,
    shard_id: String,
}

impl ShardDirectory {
    /// Create a brand-new shard directory tree.
    pub fn initialize(root: &Path, shard_id: &str) -> Result<Self, Error> {
        if root.join(SHARD_ID_FILE).exists() {
            return Err(Error::shard(format!(
                "shard directory {} already initialised",
                root.display()
            )));
        }
        fs::create_dir_all(root.join("current"))?;
        fs::create_dir_all(root.join("resilvering-arena"))?;
        fs::create_dir_all(root.join("supplanted"))?;
        fs::create_dir_all(root.join("temp-snapshots"))?;
        fs::write(root.join(SHARD_ID_FILE), shard_id)?;
        fs::write(root.join(RESILVERING_HISTORY_FILE), "")?;

        info!(shard_id, root = %root.display(), "shard directory initialised");
        Self::open(root)
    }

    /// Open an existing shard directory; missing identity is fatal.
    pub fn open(root: &Path) -> Result<Self, Error> {
        let shard_id = fs::read_to_string(root.join(SHARD_ID_FILE))
            .map_err(|err| {
                Error::shard(format!(
                    "cannot read shard identity at {}: {err}",
                    root.display()
                ))
            })?
            .trim()
            .to_string();
        if shard_id.is_empty() {
            return Err(Error::shard("empty shard identity"));
        }
        Ok(ShardDirectory {
            root: root.to_path_buf(),
            shard_id,
        })
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_machine_path(&self) -> PathBuf {
        self.root.join("current").join("state-machine")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.root.join("current").join("raft-journal")
    }

    /// Fresh staging directory for an outgoing checkpoint.
    pub fn temp_snapshot_path(&self, id: &str) -> PathBuf {
        self.root.join("temp-snapshots").join(id)
    }

    pub fn arena_path(&self, id: &str) -> PathBuf {
        self.root.join("resilvering-arena").join(id)
    }

    pub fn record_resilvering_event(&self, event: &str) -> Result<(), Error> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut history = fs::OpenOptions::new()
            .append(true)
            .open(self.root.join(RESILVERING_HISTORY_FILE))?;
        writeln!(history, "{stamp} {event}")?;
        Ok(())
    }

    /// Swap a fully-staged arena in as the new `current`, parking the
    /// old one under `supplanted/<event-id>`. The stores must be
    /// closed before calling this.
    pub fn supplant_with_arena(&self, id: &str) -> Result<(), Error> {
        let arena = self.arena_path(id);
        for required in ["state-machine", "raft-journal"] {
            if !arena.join(required).is_dir() {
                return Err(Error::shard(format!(
                    "incomplete resilvering arena: missing {required}"
                )));
            }
        }

        let parked = self.root.join("supplanted").join(id);
        if parked.exists() {
            return Err(Error::shard(format!("event {id} was already applied")));
        }

        fs::rename(self.root.join("current"), &parked)?;
        if let Err(err) = fs::rename(&arena, self.root.join("current")) {
            // roll the old store back so the node stays usable
            warn!(error = %err, "arena swap failed, restoring previous store");
            fs::rename(&parked, self.root.join("current"))?;
            return Err(err.into());
        }

        self.record_resilvering_event(&format!("supplanted-by {id}"))?;
        info!(id, "shard contents supplanted by resilvering");
        Ok(())
    }

    pub fn discard_arena(&self, id: &str) -> Result<(), Error> {
        let arena = self.arena_path(id);
        if arena.exists() {
            fs::remove_dir_all(&arena)?;
        }
        Ok(())
    }

    pub fn discard_temp_snapshot(&self, id: &str) -> Result<(), Error> {
        let path = self.temp_snapshot_path(id);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        Ok(())
    }
}

/// Target-side tracking of one incoming transfer. Only one may be
/// active at a time.
pub struct IncomingResilvering {
    pub id: String,
}

impl IncomingResilvering {
    pub fn start(shard: &ShardDirectory, id: &str) -> Result<Self, Error> {
        let arena = shard.arena_path(id);
        if arena.exists() {
            return Err(Error::shard(format!("resilvering {id} already staged")));
        }
        fs::create_dir_all(&arena)?;
        shard.record_resilvering_event(&format!("incoming-start {id}"))?;
        Ok(IncomingResilvering { id: id.to_string() })
    }

    /// Append one chunk; offsets must arrive in order per file.
    pub fn copy(
        &self,
        shard: &ShardDirectory,
        relative: &str,
        offset: u64,
        payload: &[u8],
    ) -> Result<(), Error> {
        if relative.starts_with('/') || relative.split('/').any(|part| part == "..") {
            return Err(Error::shard(format!("illegal transfer path '{relative}'")));
        }
        let target = shard.arena_path(&self.id).join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let current_size = target.metadata().map(|meta| meta.len()).unwrap_or(0);
        if current_size != offset {
            return Err(Error::shard(format!(
                "out-of-order chunk for '{relative}': at {current_size}, got offset {offset}"
            )));
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&target)?;
        file.write_all(payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, ShardDirectory) {
        let dir = tempfile::tempdir().unwrap();
        let shard = ShardDirectory::initialize(&dir.path().join("shard"), "shard-1").unwrap();
        (dir, shard)
    }

    #[test]
    fn debug_three_raft_nodes() {
        use quarkdb_machine::{StateMachine, StateMachineOptions};
        use crate::prelude::Membership;
        use quarkdb_raft::RaftJournal;

        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            let root = dir.path().join(format!("shard-{i}"));
            let shard = ShardDirectory::initialize(&root, "e2e-cluster").unwrap();
            let r = StateMachine::open(shard.state_machine_path(), StateMachineOptions::default());
            eprintln!("{i}: state_machine open ok={}", r.is_ok());
            if let Err(e) = &r {
                eprintln!("err: {e:?}");
            }
            drop(r.unwrap());
            let membership = Membership::new(vec![], Vec::new());
            let rj = RaftJournal::create(shard.journal_path(), "e2e-cluster", membership);
            eprintln!("{i}: raft journal create ok={}", rj.is_ok());
            if let Err(e) = &rj {
                eprintln!("err: {e:?}");
            }
        }
    }

    #[test]
    fn initialise_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("shard");
        {
            let shard = ShardDirectory::initialize(&root, "shard-42").unwrap();
            assert_eq!(shard.shard_id(), "shard-42");
        }
        let shard = ShardDirectory::open(&root).unwrap();
        assert_eq!(shard.shard_id(), "shard-42");

        // double initialisation is refused
        assert!(ShardDirectory::initialize(&root, "other").is_err());
    }

    #[test]
    fn incoming_transfer_staging() {
        let (_dir, shard) = scratch();

        let incoming = IncomingResilvering::start(&shard, "event-1").unwrap();
        incoming
            .copy(&shard, "state-machine/data.sst", 0, b"hello ")
            .unwrap();
        incoming
            .copy(&shard, "state-machine/data.sst", 6, b"world")
            .unwrap();

        let staged = shard.arena_path("event-1").join("state-machine/data.sst");
        assert_eq!(fs::read(staged).unwrap(), b"hello world");

        // out-of-order offsets and escapes are rejected
        assert!(incoming
            .copy(&shard, "state-machine/data.sst", 3, b"x")
            .is_err());
        assert!(incoming.copy(&shard, "../escape", 0, b"x").is_err());

        // a second transfer under the same id is refused
        assert!(IncomingResilvering::start(&shard, "event-1").is_err());
    }

    #[test]
    fn arena_swap_parks_the_old_store() {
        let (_dir, shard) = scratch();
        fs::create_dir_all(shard.state_machine_path()).unwrap();
        fs::write(shard.state_machine_path().join("old"), b"old").unwrap();

        let incoming = IncomingResilvering::start(&shard, "event-2").unwrap();
        incoming
            .copy(&shard, "state-machine/new", 0, b"new")
            .unwrap();
        incoming
            .copy(&shard, "raft-journal/new", 0, b"new")
            .unwrap();

        shard.supplant_with_arena("event-2").unwrap();

        assert!(shard.state_machine_path().join("new").exists());
        assert!(shard
            .root()
            .join("supplanted/event-2/state-machine/old")
            .exists());
    }

    #[test]
    fn incomplete_arena_is_rejected() {
        let (_dir, shard) = scratch();
        fs::create_dir_all(shard.state_machine_path()).unwrap();

        let incoming = IncomingResilvering::start(&shard, "event-3").unwrap();
        incoming.copy(&shard, "state-machine/x", 0, b"x").unwrap();
        // no raft-journal staged
        assert!(shard.supplant_with_arena("event-3").is_err());
    }
}
