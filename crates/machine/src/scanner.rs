//! Background consistency scanner.
//!
//! Periodically re-derives the descriptor invariants from the physical
//! rows on a snapshot: one descriptor per key, matching type tag on
//! every field, size equal to the actual field count (byte length for
//! strings), deque bounds consistent. A violation means replicas may
//! have diverged; the caller treats it as fatal.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::descriptor::KeyDescriptor;
use crate::keys::{self, KeyType};
use crate::machine::StateMachine;
use crate::staging::StagingArea;
use crate::MachineError;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub keys_checked: u64,
}

pub struct ConsistencyScanner {
    machine: Arc<StateMachine>,
    interval: Duration,
}

impl ConsistencyScanner {
    pub fn new(machine: Arc<StateMachine>, interval: Duration) -> Self {
        ConsistencyScanner { machine, interval }
    }

    /// Worker loop; exits on cancellation. An invariant violation
    /// bubbles out so the node can abort instead of serving corrupt
    /// data.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), MachineError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }

            let machine = self.machine.clone();
            let outcome =
                tokio::task::spawn_blocking(move || scan_once(&machine))
                    .await
                    .map_err(|err| MachineError::Corruption(err.to_string()))?;

            match outcome {
                Ok(report) => {
                    info!(keys = report.keys_checked, "consistency scan clean");
                }
                Err(err) => {
                    error!(error = %err, "consistency scan failed");
                    return Err(err);
                }
            }
        }
    }
}

/// One full pass over a snapshot.
pub fn scan_once(machine: &StateMachine) -> Result<ScanReport, MachineError> {
    let staging = machine.staging_read();
    let mut report = ScanReport::default();

    for pair in staging.iter_prefix(&[keys::DESCRIPTOR_PREFIX]) {
        let (physical, payload) = pair?;
        let user_key = &physical[1..];
        let descriptor = KeyDescriptor::parse(&payload)
            .map_err(|err| MachineError::Corruption(err.to_string()))?;

        check_key(&staging, user_key, &descriptor)?;
        report.keys_checked += 1;
    }
    Ok(report)
}

fn check_key(
    staging: &StagingArea<'_>,
    user_key: &[u8],
    descriptor: &KeyDescriptor,
) -> Result<(), MachineError> {
    let complain = |what: String| {
        Err(MachineError::Corruption(format!(
            "key '{}': {}",
            String::from_utf8_lossy(user_key),
            what
        )))
    };

    match descriptor {
        KeyDescriptor::String { size } => {
            let Some(value) = staging.get(&keys::string_key(user_key))? else {
                return complain("string descriptor without value row".to_string());
            };
            if value.len() as i64 != *size {
                return complain(format!(
                    "string size {} but value holds {} bytes",
                    size,
                    value.len()
                ));
            }
        }
        KeyDescriptor::Lease { deadline, .. } => {
            if !staging.exists(&keys::lease_key(user_key))? {
                return complain("lease descriptor without value row".to_string());
            }
            if !staging.exists(&keys::expiration_event_key(*deadline, user_key))? {
                return complain(format!("lease missing expiration event at {deadline}"));
            }
        }
        KeyDescriptor::Deque {
            size,
            start_index,
            end_index,
        } => {
            if end_index - start_index != *size as u64 {
                return complain(format!(
                    "deque bounds [{start_index}, {end_index}) disagree with size {size}"
                ));
            }
            let fields = count_fields(staging, KeyType::Deque, user_key)?;
            if fields != *size {
                return complain(format!("deque size {size} but {fields} element rows"));
            }
        }
        KeyDescriptor::LocalityHash { size } => {
            let data = count_prefix(staging, &keys::locality_data_prefix(user_key))?;
            let index = count_prefix(staging, &keys::locality_index_prefix(user_key))?;
            if data != *size || index != *size {
                return complain(format!(
                    "locality hash size {size} but {data} data rows and {index} index rows"
                ));
            }
        }
        KeyDescriptor::Hash { size } => {
            let fields = count_fields(staging, KeyType::Hash, user_key)?;
            if fields != *size {
                return complain(format!("hash size {size} but {fields} field rows"));
            }
        }
        KeyDescriptor::Set { size } => {
            let fields = count_fields(staging, KeyType::Set, user_key)?;
            if fields != *size {
                return complain(format!("set size {size} but {fields} member rows"));
            }
        }
        KeyDescriptor::VersionedHash { size, .. } => {
            let fields = count_fields(staging, KeyType::VersionedHash, user_key)?;
            if fields != *size {
                return complain(format!(
                    "versioned hash size {size} but {fields} field rows"
                ));
            }
        }
    }
    Ok(())
}

fn count_fields(
    staging: &StagingArea<'_>,
    key_type: KeyType,
    user_key: &[u8],
) -> Result<i64, MachineError> {
    count_prefix(staging, &keys::field_prefix(key_type, user_key))
}

fn count_prefix(staging: &StagingArea<'_>, prefix: &[u8]) -> Result<i64, MachineError> {
    let mut count = 0;
    for pair in staging.iter_prefix(prefix) {
        pair?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateMachineOptions;

    fn scratch() -> (tempfile::TempDir, StateMachine) {
        let dir = tempfile::tempdir().unwrap();
        let machine =
            StateMachine::open(dir.path().join("sm"), StateMachineOptions::default()).unwrap();
        (dir, machine)
    }

    #[test]
    fn clean_store_passes() {
        let (_dir, machine) = scratch();

        let mut staging = machine.staging_write();
        machine.set(&mut staging, b"s", b"abc").unwrap();
        machine.hset(&mut staging, b"h", b"f1", b"v1").unwrap();
        machine.hset(&mut staging, b"h", b"f2", b"v2").unwrap();
        machine.sadd(&mut staging, b"set", &[b"m1", b"m2"]).unwrap();
        machine.rpush(&mut staging, b"q", &[b"a", b"b"]).unwrap();
        machine
            .lhset(&mut staging, b"lh", b"f", b"hint", b"v")
            .unwrap();
        machine.vhset(&mut staging, b"vh", b"f", b"v").unwrap();
        machine
            .lease_acquire(&mut staging, b"L", b"holder", 1000, 1)
            .unwrap();
        machine.commit_staging(staging, 1).unwrap();

        let report = scan_once(&machine).unwrap();
        assert_eq!(report.keys_checked, 7);
    }

    #[test]
    fn detects_size_drift() {
        let (_dir, machine) = scratch();

        let mut staging = machine.staging_write();
        machine.hset(&mut staging, b"h", b"f1", b"v1").unwrap();
        machine.commit_staging(staging, 1).unwrap();

        // sabotage: descriptor claims two fields
        let mut batch = machine.engine().batch();
        let descriptor = KeyDescriptor::Hash { size: 2 };
        batch.insert(keys::descriptor_key(b"h"), descriptor.serialize());
        batch.commit(false).unwrap();

        assert!(matches!(
            scan_once(&machine),
            Err(MachineError::Corruption(_))
        ));
    }

    #[test]
    fn detects_orphaned_string_descriptor() {
        let (_dir, machine) = scratch();

        let mut batch = machine.engine().batch();
        let descriptor = KeyDescriptor::String { size: 3 };
        batch.insert(keys::descriptor_key(b"ghost"), descriptor.serialize());
        batch.commit(false).unwrap();

        assert!(matches!(
            scan_once(&machine),
            Err(MachineError::Corruption(_))
        ));
    }
}
