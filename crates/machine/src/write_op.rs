//! The single helper every write path flows through.
//!
//! A `WriteOperation` locks a key's descriptor inside the staging
//! overlay, validates the key type, exposes field-level mutation, and
//! finally rewrites or deletes the descriptor based on the new size.
//! Type mismatches leave the operation invalid: the caller reports
//! `WRONGTYPE` and the surrounding transaction still commits, so the
//! log index advances identically on every replica.

use crate::descriptor::KeyDescriptor;
use crate::keys::{self, KeyType};
use crate::staging::StagingArea;
use crate::MachineError;

pub struct WriteOperation<'w, 'a> {
    staging: &'w mut StagingArea<'a>,
    user_key: Vec<u8>,
    expected: KeyType,
    descriptor: KeyDescriptor,
    existed: bool,
    valid: bool,
}

impl<'w, 'a> WriteOperation<'w, 'a> {
    pub fn new(
        staging: &'w mut StagingArea<'a>,
        user_key: &[u8],
        expected: KeyType,
    ) -> Result<Self, MachineError> {
        let raw = staging.get(&keys::descriptor_key(user_key))?;

        let (descriptor, existed, valid) = match raw {
            None => (KeyDescriptor::empty(expected), false, true),
            Some(bytes) => {
                let descriptor = KeyDescriptor::parse(&bytes)
                    .map_err(|err| MachineError::Corruption(err.to_string()))?;
                let valid = descriptor.key_type() == expected;
                if valid {
                    (descriptor, true, true)
                } else {
                    (KeyDescriptor::empty(expected), true, false)
                }
            }
        };

        Ok(WriteOperation {
            staging,
            user_key: user_key.to_vec(),
            expected,
            descriptor,
            existed,
            valid,
        })
    }

    /// False when the key already exists with a different type.
    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn key_exists(&self) -> bool {
        self.existed && self.valid
    }

    pub fn key_size(&self) -> i64 {
        if self.key_exists() {
            self.descriptor.size()
        } else {
            0
        }
    }

    pub fn descriptor(&self) -> &KeyDescriptor {
        &self.descriptor
    }

    pub fn descriptor_mut(&mut self) -> &mut KeyDescriptor {
        &mut self.descriptor
    }

    pub fn user_key(&self) -> &[u8] {
        &self.user_key
    }

    fn field_locator(&self, field: &[u8]) -> Vec<u8> {
        debug_assert!(self.expected.is_composite());
        debug_assert!(self.expected != KeyType::LocalityHash);
        keys::field_key(self.expected, &self.user_key, field)
    }

    pub fn get_field(&self, field: &[u8]) -> Result<Option<Vec<u8>>, MachineError> {
        self.staging.get(&self.field_locator(field))
    }

    pub fn field_exists(&self, field: &[u8]) -> Result<bool, MachineError> {
        self.staging.exists(&self.field_locator(field))
    }

    pub fn write_field(&mut self, field: &[u8], value: &[u8]) -> Result<(), MachineError> {
        self.staging.put(self.field_locator(field), value.to_vec())
    }

    /// Returns whether the field was actually there.
    pub fn delete_field(&mut self, field: &[u8]) -> Result<bool, MachineError> {
        let locator = self.field_locator(field);
        if !self.staging.exists(&locator)? {
            return Ok(false);
        }
        self.staging.del(locator)?;
        Ok(true)
    }

    /// Write the value row of a plain string.
    pub fn write_string(&mut self, value: &[u8]) -> Result<(), MachineError> {
        debug_assert_eq!(self.expected, KeyType::String);
        self.staging
            .put(keys::string_key(&self.user_key), value.to_vec())
    }

    /// Escape hatch for the irregular layouts (locality hashes, leases)
    /// that maintain more than one row per logical field.
    pub fn staging(&mut self) -> &mut StagingArea<'a> {
        self.staging
    }

    pub fn staging_ref(&self) -> &StagingArea<'a> {
        self.staging
    }

    /// Rewrite or delete the descriptor. Size zero removes it entirely
    /// for composite types; a string of length zero still exists.
    pub fn finalize(mut self, new_size: i64) -> Result<(), MachineError> {
        debug_assert!(self.valid);
        if new_size < 0 {
            return Err(MachineError::Corruption(format!(
                "negative size {} for key {}",
                new_size,
                String::from_utf8_lossy(&self.user_key)
            )));
        }

        let locator = keys::descriptor_key(&self.user_key);
        if new_size == 0 && self.expected.is_composite() {
            self.staging.del(locator)?;
        } else {
            self.descriptor.set_size(new_size);
            self.staging.put(locator, self.descriptor.serialize())?;
        }
        Ok(())
    }

    /// Drop the key's descriptor outright, for paths that dismantle a
    /// key (lease expiry, release).
    pub fn drop_descriptor(self) -> Result<(), MachineError> {
        let locator = keys::descriptor_key(&self.user_key);
        self.staging.del(locator)
    }
}
