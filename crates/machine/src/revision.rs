//! Change tracking for versioned hashes.
//!
//! Every mutation of a versioned hash inside one transaction appends a
//! `(field, new_value_or_tombstone)` tuple here. At commit time the
//! batch of revisions is handed to the configured sink so a pub/sub
//! surface can fan out change events. The state machine itself never
//! interprets the tuples again.

use std::collections::BTreeMap;

/// One updated field: `None` marks a deletion.
pub type RevisionUpdate = (Vec<u8>, Option<Vec<u8>>);

/// All versioned-hash changes produced by a single transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionTracker {
    revisions: BTreeMap<Vec<u8>, KeyRevision>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRevision {
    /// Version of the key after this transaction.
    pub version: u64,
    pub updates: Vec<RevisionUpdate>,
}

impl RevisionTracker {
    pub fn record(&mut self, key: &[u8], version: u64, field: &[u8], value: Option<&[u8]>) {
        let entry = self
            .revisions
            .entry(key.to_vec())
            .or_insert_with(|| KeyRevision {
                version,
                updates: Vec::new(),
            });
        entry.version = version;
        entry
            .updates
            .push((field.to_vec(), value.map(|v| v.to_vec())));
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    pub fn clear(&mut self) {
        self.revisions.clear();
    }

    pub fn into_revisions(self) -> Vec<(Vec<u8>, KeyRevision)> {
        self.revisions.into_iter().collect()
    }
}

/// Receiver for committed revisions. The default sink drops them; the
/// pub/sub layer plugs in its own.
pub trait RevisionSink: Send + Sync {
    fn publish(&self, key: &[u8], revision: &KeyRevision);
}

#[derive(Debug, Default)]
pub struct NoopRevisionSink;

impl RevisionSink for NoopRevisionSink {
    fn publish(&self, _key: &[u8], _revision: &KeyRevision) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_updates_per_key() {
        let mut tracker = RevisionTracker::default();
        tracker.record(b"vh", 4, b"f1", Some(b"v1"));
        tracker.record(b"vh", 4, b"f2", None);
        tracker.record(b"other", 9, b"x", Some(b"y"));

        let revisions = tracker.into_revisions();
        assert_eq!(revisions.len(), 2);

        let (key, revision) = &revisions[1];
        assert_eq!(key, b"vh");
        assert_eq!(revision.version, 4);
        assert_eq!(
            revision.updates,
            vec![
                (b"f1".to_vec(), Some(b"v1".to_vec())),
                (b"f2".to_vec(), None),
            ]
        );
    }

    #[test]
    fn later_version_wins() {
        let mut tracker = RevisionTracker::default();
        tracker.record(b"vh", 4, b"f1", Some(b"a"));
        tracker.record(b"vh", 5, b"f1", Some(b"b"));

        let revisions = tracker.into_revisions();
        assert_eq!(revisions[0].1.version, 5);
        assert_eq!(revisions[0].1.updates.len(), 2);
    }
}
