//! The raft journal: a persistent, strictly-monotone log of entries
//! plus the node's raft hard state.
//!
//! Appends and truncations serialise behind a mutex; fetches read
//! engine snapshots and stay lock-free. Every mutation of hard state
//! (term, vote, membership) is WAL-synced before the call returns.
//!
//! Physical layout inside the journal's own store: entries at
//! `E || index_be8`, hard state under `raft.*` names, the format
//! marker at `__format`.

use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use quarkdb_core::{LogIndex, Membership, MembershipEpoch, RaftServer, RaftTerm, RedisRequest};
use quarkdb_fjall::KvEngine;

use crate::RaftError;

const ENTRY_PREFIX: u8 = b'E';

mod state_keys {
    pub const FORMAT: &[u8] = b"__format";
    pub const FORMAT_VALUE: &str = "0";

    pub const CLUSTER_ID: &[u8] = b"raft.cluster-id";
    pub const CURRENT_TERM: &[u8] = b"raft.current-term";
    pub const VOTED_FOR: &[u8] = b"raft.voted-for";
    pub const LOG_START: &[u8] = b"raft.log-start";
    pub const LOG_SIZE: &[u8] = b"raft.log-size";
    pub const COMMIT_INDEX: &[u8] = b"raft.commit-index";
    pub const MEMBERS: &[u8] = b"raft.members";
    pub const PREVIOUS_MEMBERS: &[u8] = b"raft.previous-members";
}

/// One replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftEntry {
    pub term: RaftTerm,
    pub request: RedisRequest,
}

impl RaftEntry {
    pub fn new(term: RaftTerm, request: RedisRequest) -> Self {
        RaftEntry { term, request }
    }

    /// The no-op marker a fresh leader journals so its term owns at
    /// least one entry and the dynamic clock synchronises.
    pub fn leadership_marker(term: RaftTerm, clock: u64) -> Self {
        RaftEntry {
            term,
            request: RedisRequest::from_parts(vec![
                b"journal_leadership_marker".to_vec(),
                clock.to_be_bytes().to_vec(),
            ]),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, RaftError> {
        let wire: (RaftTerm, Vec<Vec<u8>>) = (self.term, self.request.to_parts());
        bincode::serialize(&wire).map_err(|err| RaftError::Corruption(err.to_string()))
    }

    pub fn parse(raw: &[u8]) -> Result<Self, RaftError> {
        let (term, parts): (RaftTerm, Vec<Vec<u8>>) =
            bincode::deserialize(raw).map_err(|err| RaftError::Corruption(err.to_string()))?;
        Ok(RaftEntry {
            term,
            request: RedisRequest::from(parts),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VoteRecord {
    term: RaftTerm,
    server: RaftServer,
}

#[derive(Debug, Clone)]
struct JournalState {
    current_term: RaftTerm,
    voted_for: Option<VoteRecord>,
    log_start: LogIndex,
    log_size: LogIndex,
    commit_index: LogIndex,
    members: MembershipEpoch,
    previous_members: MembershipEpoch,
}

pub struct RaftJournal {
    engine: KvEngine,
    cluster_id: String,
    state: Mutex<JournalState>,
    commit_tx: watch::Sender<LogIndex>,
    append_tx: watch::Sender<LogIndex>,
}

fn entry_key(index: LogIndex) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = ENTRY_PREFIX;
    key[1..].copy_from_slice(&(index as u64).to_be_bytes());
    key
}

impl RaftJournal {
    /// Initialise a brand-new journal: cluster identity, seed
    /// membership, and entry zero so the log is never empty.
    pub fn create(
        path: impl AsRef<Path>,
        cluster_id: &str,
        membership: Membership,
    ) -> Result<Self, RaftError> {
        let engine = KvEngine::open(path.as_ref(), None)?;
        engine.ensure_format(state_keys::FORMAT, state_keys::FORMAT_VALUE)?;

        if engine.snapshot().exists(state_keys::CLUSTER_ID)? {
            return Err(RaftError::Corruption(format!(
                "journal at {} already initialised",
                path.as_ref().display()
            )));
        }

        let seed = RaftEntry::leadership_marker(0, 0);
        let members = MembershipEpoch {
            membership,
            epoch: 0,
        };

        let mut batch = engine.batch();
        batch.insert(state_keys::CLUSTER_ID, cluster_id.as_bytes());
        batch.insert(state_keys::CURRENT_TERM, 0i64.to_be_bytes());
        batch.insert(state_keys::LOG_START, 0i64.to_be_bytes());
        batch.insert(state_keys::LOG_SIZE, 1i64.to_be_bytes());
        batch.insert(state_keys::COMMIT_INDEX, 0i64.to_be_bytes());
        batch.insert(
            state_keys::MEMBERS,
            bincode::serialize(&members).map_err(|err| RaftError::Corruption(err.to_string()))?,
        );
        batch.insert(
            state_keys::PREVIOUS_MEMBERS,
            bincode::serialize(&members).map_err(|err| RaftError::Corruption(err.to_string()))?,
        );
        batch.insert(entry_key(0), seed.serialize()?);
        batch.commit(true)?;

        info!(cluster_id, path = %path.as_ref().display(), "journal initialised");
        Self::open(path, cluster_id)
    }

    /// Open an existing journal. A cluster-ID mismatch is fatal: this
    /// store belongs to a different cluster.
    pub fn open(path: impl AsRef<Path>, expected_cluster_id: &str) -> Result<Self, RaftError> {
        let engine = KvEngine::open(path.as_ref(), None)?;
        engine.ensure_format(state_keys::FORMAT, state_keys::FORMAT_VALUE)?;

        let snapshot = engine.snapshot();
        let cluster_id = String::from_utf8_lossy(
            &snapshot
                .get(state_keys::CLUSTER_ID)?
                .ok_or_else(|| RaftError::Corruption("journal missing cluster id".to_string()))?,
        )
        .into_owned();

        if cluster_id != expected_cluster_id {
            return Err(RaftError::ClusterIdMismatch {
                expected: expected_cluster_id.to_string(),
                found: cluster_id,
            });
        }

        let read_index = |key: &[u8]| -> Result<LogIndex, RaftError> {
            let raw = snapshot
                .get(key)?
                .ok_or_else(|| RaftError::Corruption("journal missing hard state".to_string()))?;
            let array: [u8; 8] = raw
                .as_slice()
                .try_into()
                .map_err(|_| RaftError::Corruption("malformed hard state".to_string()))?;
            Ok(i64::from_be_bytes(array))
        };

        let voted_for = match snapshot.get(state_keys::VOTED_FOR)? {
            None => None,
            Some(raw) => Some(
                bincode::deserialize(&raw)
                    .map_err(|err| RaftError::Corruption(err.to_string()))?,
            ),
        };
        let members: MembershipEpoch = bincode::deserialize(
            &snapshot
                .get(state_keys::MEMBERS)?
                .ok_or_else(|| RaftError::Corruption("journal missing membership".to_string()))?,
        )
        .map_err(|err| RaftError::Corruption(err.to_string()))?;
        let previous_members: MembershipEpoch = bincode::deserialize(
            &snapshot.get(state_keys::PREVIOUS_MEMBERS)?.ok_or_else(|| {
                RaftError::Corruption("journal missing previous membership".to_string())
            })?,
        )
        .map_err(|err| RaftError::Corruption(err.to_string()))?;

        let state = JournalState {
            current_term: read_index(state_keys::CURRENT_TERM)?,
            voted_for,
            log_start: read_index(state_keys::LOG_START)?,
            log_size: read_index(state_keys::LOG_SIZE)?,
            commit_index: read_index(state_keys::COMMIT_INDEX)?,
            members,
            previous_members,
        };
        drop(snapshot);

        let (commit_tx, _) = watch::channel(state.commit_index);
        let (append_tx, _) = watch::channel(state.log_size);
        Ok(RaftJournal {
            engine,
            cluster_id,
            state: Mutex::new(state),
            commit_tx,
            append_tx,
        })
    }

    pub fn engine(&self) -> &KvEngine {
        &self.engine
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, JournalState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current_term(&self) -> RaftTerm {
        self.locked().current_term
    }

    pub fn log_start(&self) -> LogIndex {
        self.locked().log_start
    }

    pub fn log_size(&self) -> LogIndex {
        self.locked().log_size
    }

    pub fn commit_index(&self) -> LogIndex {
        self.locked().commit_index
    }

    pub fn membership(&self) -> MembershipEpoch {
        self.locked().members.clone()
    }

    pub fn previous_membership(&self) -> MembershipEpoch {
        self.locked().previous_members.clone()
    }

    pub fn subscribe_commits(&self) -> watch::Receiver<LogIndex> {
        self.commit_tx.subscribe()
    }

    /// Wakes replicators whenever the log tail moves.
    pub fn subscribe_appends(&self) -> watch::Receiver<LogIndex> {
        self.append_tx.subscribe()
    }

    /// Raise the term, clearing the term-scoped vote. Lowering is
    /// rejected.
    pub fn bump_term(&self, term: RaftTerm) -> Result<(), RaftError> {
        let mut state = self.locked();
        if term < state.current_term {
            return Err(RaftError::StaleTerm {
                current: state.current_term,
                observed: term,
            });
        }
        if term == state.current_term {
            return Ok(());
        }

        let mut batch = self.engine.batch();
        batch.insert(state_keys::CURRENT_TERM, term.to_be_bytes());
        batch.remove(state_keys::VOTED_FOR);
        batch.commit(true)?;

        state.current_term = term;
        state.voted_for = None;
        Ok(())
    }

    /// Record a vote for `server` in `term`. Returns false if this
    /// node already voted for someone else in that term.
    pub fn try_vote(&self, term: RaftTerm, server: &RaftServer) -> Result<bool, RaftError> {
        let mut state = self.locked();
        if term != state.current_term {
            return Err(RaftError::StaleTerm {
                current: state.current_term,
                observed: term,
            });
        }
        if let Some(existing) = &state.voted_for {
            return Ok(existing.term == term && existing.server == *server);
        }

        let record = VoteRecord {
            term,
            server: server.clone(),
        };
        let mut batch = self.engine.batch();
        batch.insert(
            state_keys::VOTED_FOR,
            bincode::serialize(&record).map_err(|err| RaftError::Corruption(err.to_string()))?,
        );
        batch.commit(true)?;
        state.voted_for = Some(record);
        Ok(true)
    }

    /// Append at the tail. The entry's term may never exceed the
    /// node's current term, and terms are monotone along the log.
    pub fn append(&self, index: LogIndex, entry: &RaftEntry) -> Result<(), RaftError> {
        let mut state = self.locked();
        self.append_locked(&mut state, index, entry)
    }

    fn append_locked(
        &self,
        state: &mut JournalState,
        index: LogIndex,
        entry: &RaftEntry,
    ) -> Result<(), RaftError> {
        if index != state.log_size {
            return Err(RaftError::AppendMisordered {
                expected: state.log_size,
                got: index,
            });
        }
        if entry.term > state.current_term {
            return Err(RaftError::Corruption(format!(
                "appending entry of term {} above current term {}",
                entry.term, state.current_term
            )));
        }
        if index > state.log_start {
            let previous = self.fetch_locked(state, index - 1)?;
            if previous.term > entry.term {
                return Err(RaftError::Corruption(format!(
                    "term regression at index {}: {} after {}",
                    index, entry.term, previous.term
                )));
            }
        }

        let mut batch = self.engine.batch();
        batch.insert(entry_key(index), entry.serialize()?);
        batch.insert(state_keys::LOG_SIZE, (index + 1).to_be_bytes());
        batch.commit(true)?;
        state.log_size = index + 1;
        let _ = self.append_tx.send(state.log_size);
        Ok(())
    }

    /// Leader-side append at whatever the tail currently is; index
    /// selection and append are atomic.
    pub fn append_tail(&self, entry: &RaftEntry) -> Result<LogIndex, RaftError> {
        let mut state = self.locked();
        let index = state.log_size;
        self.append_locked(&mut state, index, entry)?;
        Ok(index)
    }

    pub fn fetch(&self, index: LogIndex) -> Result<RaftEntry, RaftError> {
        let state = self.locked();
        self.fetch_locked(&state, index)
    }

    fn fetch_locked(&self, state: &JournalState, index: LogIndex) -> Result<RaftEntry, RaftError> {
        if index < state.log_start || index >= state.log_size {
            return Err(RaftError::OutOfBounds {
                index,
                log_start: state.log_start,
                log_size: state.log_size,
            });
        }
        let raw = self
            .engine
            .snapshot()
            .get(&entry_key(index))?
            .ok_or_else(|| RaftError::Corruption(format!("entry {index} vanished")))?;
        RaftEntry::parse(&raw)
    }

    pub fn term_of(&self, index: LogIndex) -> Result<RaftTerm, RaftError> {
        Ok(self.fetch(index)?.term)
    }

    /// Up to `limit` entries starting at `start`.
    pub fn fetch_range(&self, start: LogIndex, limit: usize) -> Result<Vec<RaftEntry>, RaftError> {
        let mut entries = Vec::with_capacity(limit);
        let log_size = self.log_size();
        let mut index = start;
        while index < log_size && entries.len() < limit {
            entries.push(self.fetch(index)?);
            index += 1;
        }
        Ok(entries)
    }

    /// Truncate the suffix starting at `from`. Never allowed at or
    /// below the commit index.
    pub fn remove_entries(&self, from: LogIndex) -> Result<(), RaftError> {
        let mut state = self.locked();
        if from <= state.commit_index {
            return Err(RaftError::Corruption(format!(
                "refusing to truncate committed entries: from {} commit {}",
                from, state.commit_index
            )));
        }
        if from >= state.log_size {
            return Ok(());
        }

        let mut batch = self.engine.batch();
        for index in from..state.log_size {
            batch.remove(entry_key(index));
        }
        batch.insert(state_keys::LOG_SIZE, from.to_be_bytes());
        batch.commit(true)?;
        state.log_size = from;
        let _ = self.append_tx.send(state.log_size);
        Ok(())
    }

    /// Monotone advance of the commit index; waiters are notified.
    pub fn set_commit_index(&self, index: LogIndex) -> Result<(), RaftError> {
        let mut state = self.locked();
        if index <= state.commit_index {
            return Ok(());
        }
        if index > state.log_size - 1 {
            return Err(RaftError::Corruption(format!(
                "commit index {} beyond log tail {}",
                index,
                state.log_size - 1
            )));
        }

        let mut batch = self.engine.batch();
        batch.insert(state_keys::COMMIT_INDEX, index.to_be_bytes());
        batch.commit(true)?;
        state.commit_index = index;
        let _ = self.commit_tx.send(index);
        Ok(())
    }

    /// Advance the log start, dropping entries below it. The caller
    /// guarantees everything dropped is both committed and applied.
    pub fn trim_until(&self, index: LogIndex, last_applied: LogIndex) -> Result<(), RaftError> {
        let mut state = self.locked();
        let limit = state.commit_index.min(last_applied);
        if index > limit {
            return Err(RaftError::Corruption(format!(
                "trim to {} beyond safe limit {}",
                index, limit
            )));
        }
        if index <= state.log_start {
            return Ok(());
        }

        let mut batch = self.engine.batch();
        for doomed in state.log_start..index {
            batch.remove(entry_key(doomed));
        }
        batch.insert(state_keys::LOG_START, index.to_be_bytes());
        batch.commit(true)?;
        state.log_start = index;
        Ok(())
    }

    /// Install a new membership: the current set becomes the previous
    /// one, quorum is henceforth evaluated under the new set.
    pub fn set_membership(&self, membership: Membership, epoch: LogIndex) -> Result<(), RaftError> {
        let mut state = self.locked();
        let incoming = MembershipEpoch { membership, epoch };

        let mut batch = self.engine.batch();
        batch.insert(
            state_keys::PREVIOUS_MEMBERS,
            bincode::serialize(&state.members)
                .map_err(|err| RaftError::Corruption(err.to_string()))?,
        );
        batch.insert(
            state_keys::MEMBERS,
            bincode::serialize(&incoming).map_err(|err| RaftError::Corruption(err.to_string()))?,
        );
        batch.commit(true)?;

        state.previous_members = std::mem::replace(&mut state.members, incoming);
        Ok(())
    }

    /// Consistent on-disk copy of the journal.
    pub fn checkpoint(&self, target: &Path) -> Result<(), RaftError> {
        // the state mutex quiesces writers for the duration
        let _state = self.locked();
        self.engine.checkpoint(target)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, RaftJournal) {
        let dir = tempfile::tempdir().unwrap();
        let membership: Membership = "n1:1001,n2:1002,n3:1003".parse().unwrap();
        let journal =
            RaftJournal::create(dir.path().join("journal"), "cluster-abc", membership).unwrap();
        (dir, journal)
    }

    fn entry(term: RaftTerm, key: &str) -> RaftEntry {
        RaftEntry::new(term, RedisRequest::from(["set", key, "v"]))
    }

    #[test]
    fn starts_with_the_seed_entry() {
        let (_dir, journal) = scratch();
        assert_eq!(journal.log_start(), 0);
        assert_eq!(journal.log_size(), 1);
        assert_eq!(journal.commit_index(), 0);
        assert_eq!(journal.fetch(0).unwrap().term, 0);
    }

    #[test]
    fn append_contract() {
        let (_dir, journal) = scratch();
        journal.bump_term(2).unwrap();

        journal.append(1, &entry(1, "a")).unwrap();
        journal.append(2, &entry(2, "b")).unwrap();

        // wrong position
        assert!(matches!(
            journal.append(5, &entry(2, "x")),
            Err(RaftError::AppendMisordered { .. })
        ));
        // future term
        assert!(journal.append(3, &entry(9, "x")).is_err());
        // term regression
        assert!(journal.append(3, &entry(1, "x")).is_err());
    }

    #[test]
    fn truncation_respects_commits() {
        let (_dir, journal) = scratch();
        journal.bump_term(1).unwrap();
        for i in 1..=4 {
            journal.append(i, &entry(1, &format!("k{i}"))).unwrap();
        }
        journal.set_commit_index(2).unwrap();

        assert!(journal.remove_entries(2).is_err());
        journal.remove_entries(3).unwrap();
        assert_eq!(journal.log_size(), 3);

        // commit index can never pass the tail
        assert!(journal.set_commit_index(3).is_err());
    }

    #[test]
    fn trimming_respects_applied_floor() {
        let (_dir, journal) = scratch();
        journal.bump_term(1).unwrap();
        for i in 1..=5 {
            journal.append(i, &entry(1, &format!("k{i}"))).unwrap();
        }
        journal.set_commit_index(5).unwrap();

        // state machine only applied up to 3
        assert!(journal.trim_until(4, 3).is_err());
        journal.trim_until(3, 3).unwrap();
        assert_eq!(journal.log_start(), 3);
        assert!(matches!(
            journal.fetch(2),
            Err(RaftError::OutOfBounds { .. })
        ));
        assert!(journal.fetch(3).is_ok());
    }

    #[test]
    fn votes_are_term_scoped() {
        let (_dir, journal) = scratch();
        journal.bump_term(3).unwrap();

        let candidate: RaftServer = "n2:1002".parse().unwrap();
        let rival: RaftServer = "n3:1003".parse().unwrap();

        assert!(journal.try_vote(3, &candidate).unwrap());
        // repeat vote for the same candidate is idempotent
        assert!(journal.try_vote(3, &candidate).unwrap());
        assert!(!journal.try_vote(3, &rival).unwrap());

        // new term clears the vote
        journal.bump_term(4).unwrap();
        assert!(journal.try_vote(4, &rival).unwrap());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let membership: Membership = "n1:1001".parse().unwrap();
        let path = dir.path().join("journal");
        {
            let journal = RaftJournal::create(&path, "cluster-xyz", membership).unwrap();
            journal.bump_term(7).unwrap();
            journal.append(1, &entry(7, "persisted")).unwrap();
            journal.set_commit_index(1).unwrap();
        }

        let journal = RaftJournal::open(&path, "cluster-xyz").unwrap();
        assert_eq!(journal.current_term(), 7);
        assert_eq!(journal.log_size(), 2);
        assert_eq!(journal.commit_index(), 1);
        assert_eq!(
            journal.fetch(1).unwrap().request,
            RedisRequest::from(["set", "persisted", "v"])
        );

        // wrong identity is fatal
        assert!(matches!(
            RaftJournal::open(&path, "some-other-cluster"),
            Err(RaftError::ClusterIdMismatch { .. })
        ));
    }

    #[test]
    fn membership_swap_keeps_previous() {
        let (_dir, journal) = scratch();
        let next: Membership = "n1:1001,n2:1002,n3:1003,n4:1004".parse().unwrap();
        journal.set_membership(next.clone(), 9).unwrap();

        assert_eq!(journal.membership().membership, next);
        assert_eq!(journal.membership().epoch, 9);
        assert_eq!(journal.previous_membership().epoch, 0);
        assert_eq!(journal.previous_membership().membership.members.len(), 3);
    }
}
