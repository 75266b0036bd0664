//! Versioned hashes: hash semantics plus a version counter that bumps
//! once per mutating command, with every field change recorded in the
//! transaction's revision tracker for downstream fan-out.

use super::*;

impl StateMachine {
    /// Returns the key's version after the update.
    pub fn vhset(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        field: &[u8],
        value: &[u8],
    ) -> Result<u64, MachineError> {
        let mut op = WriteOperation::new(staging, key, KeyType::VersionedHash)?;
        if !op.valid() {
            return Err(MachineError::WrongType);
        }

        let KeyDescriptor::VersionedHash { version, .. } = op.descriptor().clone() else {
            unreachable!("descriptor type checked above");
        };
        let new_version = version + 1;

        let created = !op.field_exists(field)?;
        op.write_field(field, value)?;
        if let KeyDescriptor::VersionedHash { version, .. } = op.descriptor_mut() {
            *version = new_version;
        }
        let new_size = op.key_size() + created as i64;
        op.finalize(new_size)?;

        staging
            .revision_mut()
            .record(key, new_version, field, Some(value));
        Ok(new_version)
    }

    pub fn vhdel(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        fields: &[&[u8]],
    ) -> Result<i64, MachineError> {
        let mut op = WriteOperation::new(staging, key, KeyType::VersionedHash)?;
        if !op.valid() {
            return Err(MachineError::WrongType);
        }

        let KeyDescriptor::VersionedHash { version, .. } = op.descriptor().clone() else {
            unreachable!("descriptor type checked above");
        };

        let mut removed_fields = Vec::new();
        for field in fields {
            if op.delete_field(field)? {
                removed_fields.push(field.to_vec());
            }
        }
        let removed = removed_fields.len() as i64;

        if removed > 0 {
            let new_version = version + 1;
            if let KeyDescriptor::VersionedHash { version, .. } = op.descriptor_mut() {
                *version = new_version;
            }
            let new_size = op.key_size() - removed;
            op.finalize(new_size)?;

            for field in removed_fields {
                staging.revision_mut().record(key, new_version, &field, None);
            }
        } else {
            let size = op.key_size();
            op.finalize(size)?;
        }
        Ok(removed)
    }

    pub fn vhget(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
        field: &[u8],
    ) -> Result<Option<Vec<u8>>, MachineError> {
        if self
            .expect_type(staging, key, KeyType::VersionedHash)?
            .is_none()
        {
            return Ok(None);
        }
        staging.get(&keys::field_key(KeyType::VersionedHash, key, field))
    }

    /// (current version, flat field/value pairs).
    pub fn vhgetall(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
    ) -> Result<(u64, Vec<Vec<u8>>), MachineError> {
        let Some(descriptor) = self.expect_type(staging, key, KeyType::VersionedHash)? else {
            return Ok((0, Vec::new()));
        };
        let KeyDescriptor::VersionedHash { version, .. } = descriptor else {
            unreachable!("descriptor type checked above");
        };

        let pairs = self.collect_fields(staging, key, KeyType::VersionedHash, |field, value, out| {
            out.push(field);
            out.push(value);
        })?;
        Ok((version, pairs))
    }

    pub fn vhlen(&self, staging: &StagingArea<'_>, key: &[u8]) -> Result<i64, MachineError> {
        Ok(self
            .expect_type(staging, key, KeyType::VersionedHash)?
            .map_or(0, |d| d.size()))
    }
}
