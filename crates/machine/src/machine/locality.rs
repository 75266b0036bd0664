//! Locality hashes: hash semantics plus an auxiliary index keyed by
//! `(locality-hint, field)`, so scans stream fields in hint order and
//! consumers with hint locality get cache-friendly reads.
//!
//! Each logical field owns two physical rows under the key's prefix:
//! a `d` data row addressed by field, carrying the hint and the value,
//! and an `i` index row addressed by (hint, field), carrying the value
//! again.

use super::*;

/// Data row payload: `hint_len_be8 || hint || value`.
fn encode_data_row(hint: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + hint.len() + value.len());
    out.extend_from_slice(&(hint.len() as u64).to_be_bytes());
    out.extend_from_slice(hint);
    out.extend_from_slice(value);
    out
}

fn decode_data_row(raw: &[u8]) -> Result<(Vec<u8>, Vec<u8>), MachineError> {
    let malformed = || MachineError::Corruption("malformed locality data row".to_string());
    let len_bytes = raw.get(..8).ok_or_else(malformed)?;
    let hint_len = u64::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
    let hint = raw.get(8..8 + hint_len).ok_or_else(malformed)?;
    let value = &raw[8 + hint_len..];
    Ok((hint.to_vec(), value.to_vec()))
}

impl StateMachine {
    /// Returns whether the field was created (as opposed to updated).
    pub fn lhset(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        field: &[u8],
        hint: &[u8],
        value: &[u8],
    ) -> Result<bool, MachineError> {
        let size = {
            let op = WriteOperation::new(staging, key, KeyType::LocalityHash)?;
            if !op.valid() {
                return Err(MachineError::WrongType);
            }
            op.key_size()
        };

        let data_locator = keys::locality_data_key(key, field);
        let previous = staging.get(&data_locator)?;
        let created = previous.is_none();

        // a hint change moves the index row
        if let Some(raw) = previous {
            let (old_hint, _) = decode_data_row(&raw)?;
            if old_hint != hint {
                staging.del(keys::locality_index_key(key, &old_hint, field))?;
            }
        }

        staging.put(data_locator, encode_data_row(hint, value))?;
        staging.put(keys::locality_index_key(key, hint, field), value.to_vec())?;

        let mut descriptor = KeyDescriptor::empty(KeyType::LocalityHash);
        descriptor.set_size(size + created as i64);
        staging.put(keys::descriptor_key(key), descriptor.serialize())?;
        Ok(created)
    }

    pub fn lhget(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
        field: &[u8],
        hint: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, MachineError> {
        if self
            .expect_type(staging, key, KeyType::LocalityHash)?
            .is_none()
        {
            return Ok(None);
        }

        // with a correct hint the index row answers directly; a stale
        // hint falls back to the data row
        if let Some(hint) = hint {
            if let Some(value) = staging.get(&keys::locality_index_key(key, hint, field))? {
                return Ok(Some(value));
            }
        }

        match staging.get(&keys::locality_data_key(key, field))? {
            None => Ok(None),
            Some(raw) => Ok(Some(decode_data_row(&raw)?.1)),
        }
    }

    pub fn lhdel(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        fields: &[&[u8]],
    ) -> Result<i64, MachineError> {
        let size = {
            let op = WriteOperation::new(staging, key, KeyType::LocalityHash)?;
            if !op.valid() {
                return Err(MachineError::WrongType);
            }
            op.key_size()
        };

        let mut removed = 0;
        for field in fields {
            let data_locator = keys::locality_data_key(key, field);
            let Some(raw) = staging.get(&data_locator)? else {
                continue;
            };
            let (hint, _) = decode_data_row(&raw)?;
            staging.del(data_locator)?;
            staging.del(keys::locality_index_key(key, &hint, field))?;
            removed += 1;
        }

        let new_size = size - removed;
        let locator = keys::descriptor_key(key);
        if new_size == 0 {
            staging.del(locator)?;
        } else {
            let mut descriptor = KeyDescriptor::empty(KeyType::LocalityHash);
            descriptor.set_size(new_size);
            staging.put(locator, descriptor.serialize())?;
        }
        Ok(removed)
    }

    pub fn lhlen(&self, staging: &StagingArea<'_>, key: &[u8]) -> Result<i64, MachineError> {
        Ok(self
            .expect_type(staging, key, KeyType::LocalityHash)?
            .map_or(0, |d| d.size()))
    }

    /// All (field, value) pairs in hint order.
    pub fn lhgetall(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
    ) -> Result<Vec<Vec<u8>>, MachineError> {
        if self
            .expect_type(staging, key, KeyType::LocalityHash)?
            .is_none()
        {
            return Ok(Vec::new());
        }
        let prefix = keys::locality_index_prefix(key);
        let mut out = Vec::new();
        for pair in staging.iter_prefix(&prefix) {
            let (physical, value) = pair?;
            let (_, field) = keys::split_locality_index(&physical[prefix.len()..])
                .map_err(|err| MachineError::Corruption(err.to_string()))?;
            out.push(field.to_vec());
            out.push(value);
        }
        Ok(out)
    }

    /// One page of (field, value) pairs in hint order. The cursor is
    /// the opaque index-row suffix to resume from.
    pub fn lhscan(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
        cursor: &[u8],
        count: usize,
    ) -> Result<(Option<Vec<u8>>, Vec<Vec<u8>>), MachineError> {
        if self
            .expect_type(staging, key, KeyType::LocalityHash)?
            .is_none()
        {
            return Ok((None, Vec::new()));
        }
        let prefix = keys::locality_index_prefix(key);
        let mut seek = prefix.clone();
        seek.extend_from_slice(cursor);

        let mut out = Vec::new();
        let mut emitted = 0usize;
        for pair in staging.iter_from(&seek) {
            let (physical, value) = pair?;
            if !physical.starts_with(&prefix) {
                break;
            }
            let suffix = &physical[prefix.len()..];
            if emitted == count {
                return Ok((Some(suffix.to_vec()), out));
            }
            emitted += 1;
            let (_, field) = keys::split_locality_index(suffix)
                .map_err(|err| MachineError::Corruption(err.to_string()))?;
            out.push(field.to_vec());
            out.push(value);
        }
        Ok((None, out))
    }

    /// Migrate one plain hash field into a locality hash under a hint.
    /// Both keys are type-checked; the field must exist in the source.
    pub fn convert_hash_field_to_lhash(
        &self,
        staging: &mut StagingArea<'_>,
        source: &[u8],
        field: &[u8],
        target: &[u8],
        hint: &[u8],
    ) -> Result<bool, MachineError> {
        let Some(value) = self.hget_for_update(staging, source, field)? else {
            return Ok(false);
        };
        self.lhset(staging, target, field, hint, &value)?;
        self.hdel(staging, source, &[field])?;
        Ok(true)
    }

    fn hget_for_update(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        field: &[u8],
    ) -> Result<Option<Vec<u8>>, MachineError> {
        let op = WriteOperation::new(staging, key, KeyType::Hash)?;
        if !op.valid() {
            return Err(MachineError::WrongType);
        }
        op.get_field(field)
    }
}
