//! Staging areas: the only way in and out of the state machine.
//!
//! A read-only staging area pins an engine snapshot; reads are
//! repeatable and writes are rejected. A read-write staging area holds
//! the state machine's write lock plus an indexed overlay, so reads
//! observe the transaction's own uncommitted writes. Either way, the
//! whole transaction commits atomically together with its log index.
//!
//! In bulkload mode there is no locking and no reading: puts accumulate
//! into a plain batch and descriptors are rebuilt at finalization.

use std::collections::btree_map::{self, BTreeMap};
use std::iter::Peekable;
use std::sync::MutexGuard;

use quarkdb_fjall::{EngineSnapshot, KvPair};

use crate::keys::DESCRIPTOR_PREFIX;
use crate::revision::RevisionTracker;
use crate::MachineError;

pub(crate) enum StagingMode<'a> {
    ReadOnly {
        snapshot: EngineSnapshot,
    },
    ReadWrite {
        _guard: MutexGuard<'a, ()>,
        snapshot: EngineSnapshot,
        overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    },
    Bulkload {
        writes: Vec<(Vec<u8>, Vec<u8>)>,
    },
}

pub struct StagingArea<'a> {
    pub(crate) mode: StagingMode<'a>,
    pub(crate) revision: RevisionTracker,
    pub(crate) clock_update: Option<u64>,
}

impl<'a> StagingArea<'a> {
    pub(crate) fn read_only(snapshot: EngineSnapshot) -> Self {
        StagingArea {
            mode: StagingMode::ReadOnly { snapshot },
            revision: RevisionTracker::default(),
            clock_update: None,
        }
    }

    pub(crate) fn read_write(guard: MutexGuard<'a, ()>, snapshot: EngineSnapshot) -> Self {
        StagingArea {
            mode: StagingMode::ReadWrite {
                _guard: guard,
                snapshot,
                overlay: BTreeMap::new(),
            },
            revision: RevisionTracker::default(),
            clock_update: None,
        }
    }

    pub(crate) fn bulkload() -> Self {
        StagingArea {
            mode: StagingMode::Bulkload { writes: Vec::new() },
            revision: RevisionTracker::default(),
            clock_update: None,
        }
    }

    pub fn is_writable(&self) -> bool {
        !matches!(self.mode, StagingMode::ReadOnly { .. })
    }

    /// Read through the overlay, then the snapshot. Bulkload mode
    /// answers "not found" for everything: reads are disabled.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MachineError> {
        match &self.mode {
            StagingMode::ReadOnly { snapshot } => Ok(snapshot.get(key)?),
            StagingMode::ReadWrite {
                snapshot, overlay, ..
            } => match overlay.get(key) {
                Some(staged) => Ok(staged.clone()),
                None => Ok(snapshot.get(key)?),
            },
            StagingMode::Bulkload { .. } => Ok(None),
        }
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool, MachineError> {
        Ok(self.get(key)?.is_some())
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MachineError> {
        match &mut self.mode {
            StagingMode::ReadOnly { .. } => Err(MachineError::ReadOnlyStaging),
            StagingMode::ReadWrite { overlay, .. } => {
                overlay.insert(key, Some(value));
                Ok(())
            }
            StagingMode::Bulkload { writes } => {
                // descriptors are rebuilt wholesale when bulkload ends
                if key.first() != Some(&DESCRIPTOR_PREFIX) {
                    writes.push((key, value));
                }
                Ok(())
            }
        }
    }

    pub fn del(&mut self, key: Vec<u8>) -> Result<(), MachineError> {
        match &mut self.mode {
            StagingMode::ReadOnly { .. } => Err(MachineError::ReadOnlyStaging),
            StagingMode::ReadWrite { overlay, .. } => {
                overlay.insert(key, None);
                Ok(())
            }
            StagingMode::Bulkload { .. } => Err(MachineError::BulkloadViolation(
                "no deletions allowed during bulk load",
            )),
        }
    }

    /// Iterate every pair whose key starts with `prefix`, overlay
    /// merged in.
    pub fn iter_prefix<'s>(
        &'s self,
        prefix: &[u8],
    ) -> Box<dyn Iterator<Item = Result<KvPair, MachineError>> + 's> {
        let upper = prefix_upper_bound(prefix);
        match &self.mode {
            StagingMode::ReadOnly { snapshot } => {
                Box::new(snapshot.prefix(prefix).map(|pair| Ok(pair?)))
            }
            StagingMode::ReadWrite {
                snapshot, overlay, ..
            } => {
                let overlay_range = match &upper {
                    Some(end) => overlay.range(prefix.to_vec()..end.clone()),
                    None => overlay.range(prefix.to_vec()..),
                };
                Box::new(MergedIter::new(
                    snapshot.prefix(prefix).map(|pair| Ok(pair?)),
                    overlay_range,
                ))
            }
            StagingMode::Bulkload { .. } => Box::new(std::iter::empty()),
        }
    }

    /// Iterate every pair with key >= `start`, overlay merged in.
    pub fn iter_from<'s>(
        &'s self,
        start: &[u8],
    ) -> Box<dyn Iterator<Item = Result<KvPair, MachineError>> + 's> {
        match &self.mode {
            StagingMode::ReadOnly { snapshot } => {
                Box::new(snapshot.range_from(start).map(|pair| Ok(pair?)))
            }
            StagingMode::ReadWrite {
                snapshot, overlay, ..
            } => Box::new(MergedIter::new(
                snapshot.range_from(start).map(|pair| Ok(pair?)),
                overlay.range(start.to_vec()..),
            )),
            StagingMode::Bulkload { .. } => Box::new(std::iter::empty()),
        }
    }

    /// Record that this transaction observed a dynamic clock value; the
    /// commit persists the maximum seen.
    pub fn bump_clock(&mut self, value: u64) {
        self.clock_update = Some(self.clock_update.map_or(value, |cur| cur.max(value)));
    }

    pub fn revision_mut(&mut self) -> &mut RevisionTracker {
        &mut self.revision
    }

    /// Throw away all staged effects, keeping the lock. Used when a
    /// command fails client-side but the log index must still advance.
    pub fn rollback(&mut self) {
        if let StagingMode::ReadWrite { overlay, .. } = &mut self.mode {
            overlay.clear();
        }
        self.revision.clear();
        self.clock_update = None;
    }
}

/// Smallest byte string strictly greater than every string starting
/// with `prefix`, if one exists.
pub(crate) fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(upper);
        }
        upper.pop();
    }
    None
}

/// Two-way merge of the engine snapshot and the overlay. The overlay
/// wins on equal keys; `None` entries suppress the snapshot pair.
struct MergedIter<'a, I>
where
    I: Iterator<Item = Result<KvPair, MachineError>>,
{
    base: Peekable<I>,
    overlay: Peekable<btree_map::Range<'a, Vec<u8>, Option<Vec<u8>>>>,
}

impl<'a, I> MergedIter<'a, I>
where
    I: Iterator<Item = Result<KvPair, MachineError>>,
{
    fn new(base: I, overlay: btree_map::Range<'a, Vec<u8>, Option<Vec<u8>>>) -> Self {
        MergedIter {
            base: base.peekable(),
            overlay: overlay.peekable(),
        }
    }
}

impl<'a, I> Iterator for MergedIter<'a, I>
where
    I: Iterator<Item = Result<KvPair, MachineError>>,
{
    type Item = Result<KvPair, MachineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let base_key = match self.base.peek() {
                Some(Ok((key, _))) => Some(key.clone()),
                Some(Err(_)) => return self.base.next(),
                None => None,
            };
            let overlay_key = self.overlay.peek().map(|(key, _)| (*key).clone());

            match (base_key, overlay_key) {
                (None, None) => return None,
                (Some(_), None) => return self.base.next(),
                (None, Some(_)) => {
                    let (key, staged) = self.overlay.next().unwrap();
                    match staged {
                        Some(value) => return Some(Ok((key.clone(), value.clone()))),
                        None => continue,
                    }
                }
                (Some(base), Some(overlay)) => {
                    if base < overlay {
                        return self.base.next();
                    }
                    if base == overlay {
                        // overlay shadows the snapshot pair
                        self.base.next();
                    }
                    let (key, staged) = self.overlay.next().unwrap();
                    match staged {
                        Some(value) => return Some(Ok((key.clone(), value.clone()))),
                        None => continue,
                    }
                }
            }
        }
    }
}
