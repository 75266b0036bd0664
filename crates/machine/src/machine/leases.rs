//! User-visible leases: a named, time-bounded ownership claim.
//!
//! Commands reaching the state machine are already timestamped by the
//! leader: the trailing argument carries the bound dynamic-clock
//! value, so every replica makes identical expiry decisions. Expired
//! leases are reclaimed lazily by the next timestamped command that
//! observes them.

use serde::{Deserialize, Serialize};

use super::*;

/// Value row of a lease, stored at `f || user_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseValue {
    pub holder: Vec<u8>,
    pub renewal: u64,
    pub deadline: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAcquisition {
    Acquired { deadline: u64 },
    Renewed { deadline: u64 },
    Busy { holder: Vec<u8>, remaining_ms: u64 },
}

/// Snapshot of a live lease, as returned by the get path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInfo {
    pub holder: Vec<u8>,
    pub renewal: u64,
    pub deadline: u64,
}

impl StateMachine {
    pub fn lease_acquire(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        holder: &[u8],
        duration_ms: u64,
        timestamp: u64,
    ) -> Result<LeaseAcquisition, MachineError> {
        let existing = self.live_lease(staging, key, timestamp)?;
        let deadline = timestamp.saturating_add(duration_ms);

        if let Some(lease) = existing {
            if lease.holder != holder {
                return Ok(LeaseAcquisition::Busy {
                    remaining_ms: lease.deadline - timestamp,
                    holder: lease.holder,
                });
            }
            self.write_lease(staging, key, holder, timestamp, deadline, Some(lease.deadline))?;
            return Ok(LeaseAcquisition::Renewed { deadline });
        }

        self.write_lease(staging, key, holder, timestamp, deadline, None)?;
        Ok(LeaseAcquisition::Acquired { deadline })
    }

    pub fn lease_get(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        timestamp: u64,
    ) -> Result<Option<LeaseInfo>, MachineError> {
        Ok(self.live_lease(staging, key, timestamp)?.map(|lease| LeaseInfo {
            holder: lease.holder,
            renewal: lease.renewal,
            deadline: lease.deadline,
        }))
    }

    /// Returns whether a live lease was actually released.
    pub fn lease_release(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        timestamp: u64,
    ) -> Result<bool, MachineError> {
        let lease = self.live_lease(staging, key, timestamp)?;
        match lease {
            None => Ok(false),
            Some(lease) => {
                self.purge_lease(staging, key, lease.deadline)?;
                Ok(true)
            }
        }
    }

    /// The lease on `key` if it is still live at `timestamp`. An
    /// expired lease is physically reclaimed on the spot.
    fn live_lease(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        timestamp: u64,
    ) -> Result<Option<LeaseValue>, MachineError> {
        match self.expect_type(staging, key, KeyType::Lease)? {
            None => Ok(None),
            Some(_) => {
                let raw = staging.get(&keys::lease_key(key))?.ok_or_else(|| {
                    MachineError::Corruption(format!(
                        "lease descriptor without value row for {}",
                        String::from_utf8_lossy(key)
                    ))
                })?;
                let lease: LeaseValue = bincode::deserialize(&raw)
                    .map_err(|err| MachineError::Corruption(err.to_string()))?;

                if lease.deadline <= timestamp {
                    self.purge_lease(staging, key, lease.deadline)?;
                    return Ok(None);
                }
                Ok(Some(lease))
            }
        }
    }

    fn write_lease(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        holder: &[u8],
        renewal: u64,
        deadline: u64,
        previous_deadline: Option<u64>,
    ) -> Result<(), MachineError> {
        if let Some(previous) = previous_deadline {
            staging.del(keys::expiration_event_key(previous, key))?;
        }

        let value = LeaseValue {
            holder: holder.to_vec(),
            renewal,
            deadline,
        };
        let encoded =
            bincode::serialize(&value).map_err(|err| MachineError::Corruption(err.to_string()))?;
        staging.put(keys::lease_key(key), encoded)?;
        staging.put(keys::expiration_event_key(deadline, key), Vec::new())?;

        let descriptor = KeyDescriptor::Lease {
            size: 1,
            renewal,
            deadline,
        };
        staging.put(keys::descriptor_key(key), descriptor.serialize())?;
        Ok(())
    }

    fn purge_lease(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        deadline: u64,
    ) -> Result<(), MachineError> {
        staging.del(keys::lease_key(key))?;
        staging.del(keys::expiration_event_key(deadline, key))?;
        staging.del(keys::descriptor_key(key))?;
        Ok(())
    }
}
