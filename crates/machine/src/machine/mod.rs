//! The deterministic state machine.
//!
//! For every `(LogIndex, request)` pair the produced reply and the
//! resulting byte-for-byte store content are uniquely determined: no
//! wall clocks, no randomness, no iteration order beyond the engine's.
//! Timestamps for lease commands arrive as explicit arguments, bound by
//! the leader before journaling.

use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use quarkdb_core::LogIndex;
use quarkdb_fjall::KvEngine;

use crate::descriptor::KeyDescriptor;
use crate::keys::{self, internal_keys, KeyType};
use crate::pattern::{glob_match, pattern_prefix};
use crate::revision::{NoopRevisionSink, RevisionSink};
use crate::staging::{StagingArea, StagingMode};
use crate::write_op::WriteOperation;
use crate::MachineError;

mod deques;
mod leases;
mod locality;
mod system;
mod vhash;

pub use leases::{LeaseAcquisition, LeaseValue};

pub struct StateMachineOptions {
    pub cache_size_mb: Option<usize>,
    pub durable_writes: bool,
    pub bulkload: bool,
    pub revision_sink: Arc<dyn RevisionSink>,
}

impl Default for StateMachineOptions {
    fn default() -> Self {
        StateMachineOptions {
            cache_size_mb: None,
            durable_writes: true,
            bulkload: false,
            revision_sink: Arc::new(NoopRevisionSink),
        }
    }
}

pub struct StateMachine {
    engine: KvEngine,
    write_mutex: Mutex<()>,
    last_applied: AtomicI64,
    clock: AtomicU64,
    durable: bool,
    bulkload: bool,
    sink: Arc<dyn RevisionSink>,
}

impl StateMachine {
    pub fn open(
        path: impl AsRef<Path>,
        options: StateMachineOptions,
    ) -> Result<Self, MachineError> {
        let engine = KvEngine::open(path.as_ref(), options.cache_size_mb)?;
        engine.ensure_format(internal_keys::FORMAT, internal_keys::FORMAT_VALUE)?;

        let snapshot = engine.snapshot();
        let last_applied = match snapshot.get(internal_keys::LAST_APPLIED)? {
            Some(bytes) => parse_be_i64(&bytes)?,
            None => 0,
        };
        let clock = match snapshot.get(internal_keys::CLOCK)? {
            Some(bytes) => parse_be_u64(&bytes)?,
            None => 0,
        };
        let mid_bulkload = snapshot.exists(internal_keys::IN_BULKLOAD)?;
        drop(snapshot);

        if mid_bulkload && !options.bulkload {
            return Err(MachineError::Corruption(
                "store carries an unfinished bulkload, refusing normal open".to_string(),
            ));
        }
        if options.bulkload {
            if last_applied != 0 {
                return Err(MachineError::Corruption(
                    "bulkload requires a brand-new store".to_string(),
                ));
            }
            let mut batch = engine.batch();
            batch.insert(internal_keys::IN_BULKLOAD, b"1");
            batch.commit(true)?;
        }

        info!(
            path = %path.as_ref().display(),
            last_applied,
            clock,
            bulkload = options.bulkload,
            "state machine open"
        );

        Ok(StateMachine {
            engine,
            write_mutex: Mutex::new(()),
            last_applied: AtomicI64::new(last_applied),
            clock: AtomicU64::new(clock),
            durable: options.durable_writes && !options.bulkload,
            bulkload: options.bulkload,
            sink: options.revision_sink,
        })
    }

    pub fn engine(&self) -> &KvEngine {
        &self.engine
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied.load(Ordering::Acquire)
    }

    pub fn dynamic_clock(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    pub fn in_bulkload(&self) -> bool {
        self.bulkload
    }

    /// Read-only staging area over a fresh snapshot.
    pub fn staging_read(&self) -> StagingArea<'_> {
        StagingArea::read_only(self.engine.snapshot())
    }

    /// Read-write staging area; takes the write lock for its lifetime.
    pub fn staging_write(&self) -> StagingArea<'_> {
        if self.bulkload {
            return StagingArea::bulkload();
        }
        let guard = self
            .write_mutex
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        StagingArea::read_write(guard, self.engine.snapshot())
    }

    /// Commit a staging area at `index`. Index zero means "no user
    /// entry applied" and skips the last-applied bookkeeping.
    pub fn commit_staging(
        &self,
        staging: StagingArea<'_>,
        index: LogIndex,
    ) -> Result<(), MachineError> {
        let StagingArea {
            mode,
            revision,
            clock_update,
        } = staging;

        match mode {
            StagingMode::ReadOnly { .. } => Err(MachineError::ReadOnlyStaging),
            StagingMode::Bulkload { writes } => {
                if index != 0 {
                    return Err(MachineError::IndexMismatch { expected: 0, got: index });
                }
                let mut batch = self.engine.batch();
                for (key, value) in writes {
                    batch.insert(key, value);
                }
                batch.commit(false)?;
                Ok(())
            }
            StagingMode::ReadWrite { overlay, _guard, .. } => {
                let mut batch = self.engine.batch();

                if index != 0 {
                    let expected = self.last_applied.load(Ordering::Acquire) + 1;
                    if index != expected {
                        return Err(MachineError::IndexMismatch {
                            expected,
                            got: index,
                        });
                    }
                    batch.insert(internal_keys::LAST_APPLIED, index.to_be_bytes());
                }

                let clock_advance = clock_update
                    .filter(|observed| *observed > self.clock.load(Ordering::Acquire));
                if let Some(observed) = clock_advance {
                    batch.insert(internal_keys::CLOCK, observed.to_be_bytes());
                }

                for (key, staged) in overlay {
                    match staged {
                        Some(value) => batch.insert(key, value),
                        None => batch.remove(key),
                    }
                }

                batch.commit(self.durable)?;

                if index != 0 {
                    self.last_applied.store(index, Ordering::Release);
                }
                if let Some(observed) = clock_advance {
                    self.clock.fetch_max(observed, Ordering::AcqRel);
                }
                for (key, key_revision) in revision.into_revisions() {
                    self.sink.publish(&key, &key_revision);
                }
                Ok(())
            }
        }
    }

    /// End bulkload: rebuild every descriptor by walking the field
    /// rows, then clear the marker. The store becomes openable in
    /// normal mode again.
    pub fn finalize_bulkload(&self) -> Result<(), MachineError> {
        if !self.bulkload {
            return Err(MachineError::BulkloadViolation(
                "store is not in bulkload mode",
            ));
        }
        self.engine.sync()?;

        let snapshot = self.engine.snapshot();
        let mut batch = self.engine.batch();
        let mut current: Option<(KeyType, Vec<u8>, i64)> = None;
        let mut rebuilt = 0u64;

        let mut flush =
            |entry: &mut Option<(KeyType, Vec<u8>, i64)>, batch: &mut quarkdb_fjall::EngineBatch| {
                if let Some((key_type, user_key, count)) = entry.take() {
                    let mut descriptor = KeyDescriptor::empty(key_type);
                    descriptor.set_size(count);
                    batch.insert(keys::descriptor_key(&user_key), descriptor.serialize());
                }
            };

        for pair in snapshot.iter_all() {
            let (physical, value) = pair?;
            let Some(key_type) = physical.first().copied().and_then(KeyType::from_tag) else {
                continue;
            };
            let decoded = keys::decode(&physical)
                .map_err(|err| MachineError::Corruption(err.to_string()))?;

            let size_unit = match key_type {
                KeyType::String => value.len() as i64,
                _ => 1,
            };
            match &mut current {
                Some((cur_type, cur_key, count))
                    if *cur_type == key_type && *cur_key == decoded.user_key =>
                {
                    *count += size_unit;
                }
                _ => {
                    flush(&mut current, &mut batch);
                    current = Some((key_type, decoded.user_key, size_unit));
                }
            }
            rebuilt += 1;
        }
        flush(&mut current, &mut batch);

        batch.remove(internal_keys::IN_BULKLOAD);
        batch.commit(true)?;
        info!(rows = rebuilt, "bulkload finalized, descriptors rebuilt");
        Ok(())
    }

    /// Consistent on-disk copy; holds the write lock for the duration.
    pub fn checkpoint(&self, target: &Path) -> Result<(), MachineError> {
        let _guard = self
            .write_mutex
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.engine.checkpoint(target)?;
        Ok(())
    }

    pub fn verify_checksum(&self) -> Result<u64, MachineError> {
        Ok(self.engine.verify_checksum()?)
    }

    // ------------------------------------------------------------------
    // descriptors
    // ------------------------------------------------------------------

    pub fn load_descriptor(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
    ) -> Result<Option<KeyDescriptor>, MachineError> {
        match staging.get(&keys::descriptor_key(key))? {
            None => Ok(None),
            Some(bytes) => KeyDescriptor::parse(&bytes)
                .map(Some)
                .map_err(|err| MachineError::Corruption(err.to_string())),
        }
    }

    /// Descriptor of `key` if present, or `WRONGTYPE` when it exists
    /// under a different type.
    fn expect_type(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
        expected: KeyType,
    ) -> Result<Option<KeyDescriptor>, MachineError> {
        match self.load_descriptor(staging, key)? {
            None => Ok(None),
            Some(descriptor) if descriptor.key_type() == expected => Ok(Some(descriptor)),
            Some(_) => Err(MachineError::WrongType),
        }
    }

    pub fn key_type(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
    ) -> Result<Option<KeyType>, MachineError> {
        Ok(self.load_descriptor(staging, key)?.map(|d| d.key_type()))
    }

    // ------------------------------------------------------------------
    // strings
    // ------------------------------------------------------------------

    pub fn set(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), MachineError> {
        let mut op = WriteOperation::new(staging, key, KeyType::String)?;
        if !op.valid() {
            return Err(MachineError::WrongType);
        }
        op.write_string(value)?;
        op.finalize(value.len() as i64)
    }

    pub fn get(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, MachineError> {
        if self.expect_type(staging, key, KeyType::String)?.is_none() {
            return Ok(None);
        }
        staging.get(&keys::string_key(key))
    }

    pub fn exists(
        &self,
        staging: &StagingArea<'_>,
        user_keys: &[&[u8]],
    ) -> Result<i64, MachineError> {
        let mut count = 0;
        for key in user_keys {
            if staging.exists(&keys::descriptor_key(key))? {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn del(
        &self,
        staging: &mut StagingArea<'_>,
        user_keys: &[&[u8]],
    ) -> Result<i64, MachineError> {
        let mut removed = 0;
        for key in user_keys {
            let Some(descriptor) = self.load_descriptor(staging, key)? else {
                continue;
            };
            match descriptor.key_type() {
                KeyType::String => {
                    staging.del(keys::string_key(key))?;
                }
                KeyType::Lease => {
                    if let KeyDescriptor::Lease { deadline, .. } = descriptor {
                        staging.del(keys::expiration_event_key(deadline, key))?;
                    }
                    staging.del(keys::lease_key(key))?;
                }
                composite_type => {
                    debug_assert!(composite_type.is_composite());
                    self.remove_all_with_prefix(
                        staging,
                        &keys::field_prefix(composite_type, key),
                    )?;
                }
            }
            staging.del(keys::descriptor_key(key))?;
            removed += 1;
        }
        Ok(removed)
    }

    fn remove_all_with_prefix(
        &self,
        staging: &mut StagingArea<'_>,
        prefix: &[u8],
    ) -> Result<i64, MachineError> {
        let doomed: Vec<Vec<u8>> = staging
            .iter_prefix(prefix)
            .map(|pair| pair.map(|(key, _)| key))
            .collect::<Result<_, _>>()?;
        let count = doomed.len() as i64;
        for key in doomed {
            staging.del(key)?;
        }
        Ok(count)
    }

    pub fn keys(
        &self,
        staging: &StagingArea<'_>,
        pattern: &[u8],
    ) -> Result<Vec<Vec<u8>>, MachineError> {
        let literal = pattern_prefix(pattern);
        let mut seek = Vec::with_capacity(1 + literal.len());
        seek.push(keys::DESCRIPTOR_PREFIX);
        seek.extend_from_slice(literal);

        let mut out = Vec::new();
        for pair in staging.iter_from(&seek) {
            let (physical, _) = pair?;
            if physical.first() != Some(&keys::DESCRIPTOR_PREFIX) {
                break;
            }
            let user_key = &physical[1..];
            if !user_key.starts_with(literal) {
                break;
            }
            if glob_match(pattern, user_key) {
                out.push(user_key.to_vec());
            }
        }
        Ok(out)
    }

    /// One page of user keys. Returns `(next_cursor, matches)`; the
    /// count bounds the number of keys examined, not matched.
    pub fn scan(
        &self,
        staging: &StagingArea<'_>,
        cursor: &[u8],
        pattern: &[u8],
        count: usize,
    ) -> Result<(Option<Vec<u8>>, Vec<Vec<u8>>), MachineError> {
        let literal = pattern_prefix(pattern);
        let resume: &[u8] = if cursor > literal { cursor } else { literal };
        let mut seek = Vec::with_capacity(1 + resume.len());
        seek.push(keys::DESCRIPTOR_PREFIX);
        seek.extend_from_slice(resume);

        let mut out = Vec::new();
        let mut examined = 0usize;
        for pair in staging.iter_from(&seek) {
            let (physical, _) = pair?;
            if physical.first() != Some(&keys::DESCRIPTOR_PREFIX) {
                break;
            }
            let user_key = &physical[1..];
            if !user_key.starts_with(literal) {
                break;
            }
            if examined == count {
                return Ok((Some(user_key.to_vec()), out));
            }
            examined += 1;
            if pattern.is_empty() || glob_match(pattern, user_key) {
                out.push(user_key.to_vec());
            }
        }
        Ok((None, out))
    }

    /// Wipe all user-visible data. Internal metadata and the
    /// configuration namespace survive.
    pub fn flushall(&self, staging: &mut StagingArea<'_>) -> Result<(), MachineError> {
        let doomed: Vec<Vec<u8>> = staging
            .iter_from(b"")
            .filter_map(|pair| match pair {
                Ok((key, _)) => {
                    let protected = matches!(
                        key.first(),
                        Some(&keys::INTERNAL_PREFIX) | Some(&keys::CONFIG_PREFIX)
                    );
                    if protected {
                        None
                    } else {
                        Some(Ok(key))
                    }
                }
                Err(err) => Some(Err(err)),
            })
            .collect::<Result<_, _>>()?;
        for key in doomed {
            staging.del(key)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // hashes
    // ------------------------------------------------------------------

    pub fn hset(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        field: &[u8],
        value: &[u8],
    ) -> Result<bool, MachineError> {
        let mut op = WriteOperation::new(staging, key, KeyType::Hash)?;
        if !op.valid() {
            return Err(MachineError::WrongType);
        }
        let created = !op.field_exists(field)?;
        op.write_field(field, value)?;
        let new_size = op.key_size() + created as i64;
        op.finalize(new_size)?;
        Ok(created)
    }

    pub fn hsetnx(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        field: &[u8],
        value: &[u8],
    ) -> Result<bool, MachineError> {
        let mut op = WriteOperation::new(staging, key, KeyType::Hash)?;
        if !op.valid() {
            return Err(MachineError::WrongType);
        }
        if op.field_exists(field)? {
            let size = op.key_size();
            op.finalize(size)?;
            return Ok(false);
        }
        op.write_field(field, value)?;
        let new_size = op.key_size() + 1;
        op.finalize(new_size)?;
        Ok(true)
    }

    pub fn hmset(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        pairs: &[(&[u8], &[u8])],
    ) -> Result<(), MachineError> {
        let mut op = WriteOperation::new(staging, key, KeyType::Hash)?;
        if !op.valid() {
            return Err(MachineError::WrongType);
        }
        let mut added = 0;
        for (field, value) in pairs {
            if !op.field_exists(field)? {
                added += 1;
            }
            op.write_field(field, value)?;
        }
        let new_size = op.key_size() + added;
        op.finalize(new_size)
    }

    pub fn hget(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
        field: &[u8],
    ) -> Result<Option<Vec<u8>>, MachineError> {
        if self.expect_type(staging, key, KeyType::Hash)?.is_none() {
            return Ok(None);
        }
        staging.get(&keys::field_key(KeyType::Hash, key, field))
    }

    pub fn hdel(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        fields: &[&[u8]],
    ) -> Result<i64, MachineError> {
        let mut op = WriteOperation::new(staging, key, KeyType::Hash)?;
        if !op.valid() {
            return Err(MachineError::WrongType);
        }
        let mut removed = 0;
        for field in fields {
            if op.delete_field(field)? {
                removed += 1;
            }
        }
        let new_size = op.key_size() - removed;
        op.finalize(new_size)?;
        Ok(removed)
    }

    pub fn hlen(&self, staging: &StagingArea<'_>, key: &[u8]) -> Result<i64, MachineError> {
        Ok(self
            .expect_type(staging, key, KeyType::Hash)?
            .map_or(0, |d| d.size()))
    }

    pub fn hgetall(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
    ) -> Result<Vec<Vec<u8>>, MachineError> {
        self.collect_fields(staging, key, KeyType::Hash, |field, value, out| {
            out.push(field);
            out.push(value);
        })
    }

    pub fn hkeys(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
    ) -> Result<Vec<Vec<u8>>, MachineError> {
        self.collect_fields(staging, key, KeyType::Hash, |field, _, out| out.push(field))
    }

    pub fn hvals(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
    ) -> Result<Vec<Vec<u8>>, MachineError> {
        self.collect_fields(staging, key, KeyType::Hash, |_, value, out| out.push(value))
    }

    fn collect_fields(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
        key_type: KeyType,
        mut push: impl FnMut(Vec<u8>, Vec<u8>, &mut Vec<Vec<u8>>),
    ) -> Result<Vec<Vec<u8>>, MachineError> {
        if self.expect_type(staging, key, key_type)?.is_none() {
            return Ok(Vec::new());
        }
        let prefix = keys::field_prefix(key_type, key);
        let mut out = Vec::new();
        for pair in staging.iter_prefix(&prefix) {
            let (physical, value) = pair?;
            push(physical[prefix.len()..].to_vec(), value, &mut out);
        }
        Ok(out)
    }

    pub fn hexists(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
        field: &[u8],
    ) -> Result<bool, MachineError> {
        if self.expect_type(staging, key, KeyType::Hash)?.is_none() {
            return Ok(false);
        }
        staging.exists(&keys::field_key(KeyType::Hash, key, field))
    }

    /// One page of (field, value) pairs; cursor is the field to resume
    /// from.
    pub fn hscan(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
        cursor: &[u8],
        count: usize,
    ) -> Result<(Option<Vec<u8>>, Vec<Vec<u8>>), MachineError> {
        self.scan_fields(staging, key, KeyType::Hash, cursor, count)
    }

    fn scan_fields(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
        key_type: KeyType,
        cursor: &[u8],
        count: usize,
    ) -> Result<(Option<Vec<u8>>, Vec<Vec<u8>>), MachineError> {
        if self.expect_type(staging, key, key_type)?.is_none() {
            return Ok((None, Vec::new()));
        }
        let prefix = keys::field_prefix(key_type, key);
        let mut seek = prefix.clone();
        seek.extend_from_slice(cursor);

        let mut out = Vec::new();
        let mut emitted = 0usize;
        for pair in staging.iter_from(&seek) {
            let (physical, value) = pair?;
            if !physical.starts_with(&prefix) {
                break;
            }
            let field = physical[prefix.len()..].to_vec();
            if emitted == count {
                return Ok((Some(field), out));
            }
            emitted += 1;
            out.push(field);
            out.push(value);
        }
        Ok((None, out))
    }

    pub fn hincrby(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        field: &[u8],
        delta: &[u8],
    ) -> Result<i64, MachineError> {
        let delta = parse_integer(delta).ok_or(MachineError::NotInteger)?;

        let mut op = WriteOperation::new(staging, key, KeyType::Hash)?;
        if !op.valid() {
            return Err(MachineError::WrongType);
        }
        let current = match op.get_field(field)? {
            None => 0,
            Some(bytes) => parse_integer(&bytes).ok_or(MachineError::HashValueNotInteger)?,
        };
        let result = current
            .checked_add(delta)
            .ok_or(MachineError::NotInteger)?;

        let created = !op.field_exists(field)?;
        op.write_field(field, result.to_string().as_bytes())?;
        let new_size = op.key_size() + created as i64;
        op.finalize(new_size)?;
        Ok(result)
    }

    pub fn hincrbyfloat(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        field: &[u8],
        delta: &[u8],
    ) -> Result<f64, MachineError> {
        let delta = parse_float(delta).ok_or(MachineError::NotFloat)?;

        let mut op = WriteOperation::new(staging, key, KeyType::Hash)?;
        if !op.valid() {
            return Err(MachineError::WrongType);
        }
        let current = match op.get_field(field)? {
            None => 0.0,
            Some(bytes) => parse_float(&bytes).ok_or(MachineError::HashValueNotFloat)?,
        };
        let result = current + delta;

        let created = !op.field_exists(field)?;
        op.write_field(field, format_float(result).as_bytes())?;
        let new_size = op.key_size() + created as i64;
        op.finalize(new_size)?;
        Ok(result)
    }

    /// Multi-step increment across (key, field, delta) triples. The
    /// reply is the sum of the successful steps' results; per-step
    /// client errors are swallowed, only infrastructure failures
    /// propagate.
    pub fn hincrbymulti(
        &self,
        staging: &mut StagingArea<'_>,
        steps: &[(&[u8], &[u8], &[u8])],
    ) -> Result<i64, MachineError> {
        let mut sum = 0i64;
        for (key, field, delta) in steps {
            match self.hincrby(staging, key, field, delta) {
                Ok(result) => sum = sum.wrapping_add(result),
                Err(err) if err.is_client_error() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(sum)
    }

    /// Clone an entire hash onto a key that must not exist yet.
    /// Returns false when the source is missing.
    pub fn hclone(
        &self,
        staging: &mut StagingArea<'_>,
        source: &[u8],
        target: &[u8],
    ) -> Result<bool, MachineError> {
        if staging.exists(&keys::descriptor_key(target))? {
            return Err(MachineError::KeyExists);
        }
        let Some(descriptor) = self.expect_type(staging, source, KeyType::Hash)? else {
            return Ok(false);
        };

        let source_prefix = keys::field_prefix(KeyType::Hash, source);
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = staging
            .iter_prefix(&source_prefix)
            .map(|pair| pair.map(|(key, value)| (key[source_prefix.len()..].to_vec(), value)))
            .collect::<Result<_, _>>()?;

        for (field, value) in pairs {
            staging.put(keys::field_key(KeyType::Hash, target, &field), value)?;
        }
        staging.put(keys::descriptor_key(target), descriptor.serialize())?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // sets
    // ------------------------------------------------------------------

    pub fn sadd(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        members: &[&[u8]],
    ) -> Result<i64, MachineError> {
        let mut op = WriteOperation::new(staging, key, KeyType::Set)?;
        if !op.valid() {
            return Err(MachineError::WrongType);
        }
        let mut added = 0;
        for member in members {
            if !op.field_exists(member)? {
                op.write_field(member, b"1")?;
                added += 1;
            }
        }
        let new_size = op.key_size() + added;
        op.finalize(new_size)?;
        Ok(added)
    }

    pub fn srem(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        members: &[&[u8]],
    ) -> Result<i64, MachineError> {
        let mut op = WriteOperation::new(staging, key, KeyType::Set)?;
        if !op.valid() {
            return Err(MachineError::WrongType);
        }
        let mut removed = 0;
        for member in members {
            if op.delete_field(member)? {
                removed += 1;
            }
        }
        let new_size = op.key_size() - removed;
        op.finalize(new_size)?;
        Ok(removed)
    }

    pub fn sismember(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
        member: &[u8],
    ) -> Result<bool, MachineError> {
        if self.expect_type(staging, key, KeyType::Set)?.is_none() {
            return Ok(false);
        }
        staging.exists(&keys::field_key(KeyType::Set, key, member))
    }

    pub fn smembers(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
    ) -> Result<Vec<Vec<u8>>, MachineError> {
        self.collect_fields(staging, key, KeyType::Set, |member, _, out| {
            out.push(member)
        })
    }

    pub fn scard(&self, staging: &StagingArea<'_>, key: &[u8]) -> Result<i64, MachineError> {
        Ok(self
            .expect_type(staging, key, KeyType::Set)?
            .map_or(0, |d| d.size()))
    }

    pub fn sscan(
        &self,
        staging: &StagingArea<'_>,
        key: &[u8],
        cursor: &[u8],
        count: usize,
    ) -> Result<(Option<Vec<u8>>, Vec<Vec<u8>>), MachineError> {
        if self.expect_type(staging, key, KeyType::Set)?.is_none() {
            return Ok((None, Vec::new()));
        }
        let prefix = keys::field_prefix(KeyType::Set, key);
        let mut seek = prefix.clone();
        seek.extend_from_slice(cursor);

        let mut out = Vec::new();
        for pair in staging.iter_from(&seek) {
            let (physical, _) = pair?;
            if !physical.starts_with(&prefix) {
                break;
            }
            let member = physical[prefix.len()..].to_vec();
            if out.len() == count {
                return Ok((Some(member), out));
            }
            out.push(member);
        }
        Ok((None, out))
    }

    /// Move a member between two sets; both ends are type-checked
    /// before anything mutates.
    pub fn smove(
        &self,
        staging: &mut StagingArea<'_>,
        source: &[u8],
        target: &[u8],
        member: &[u8],
    ) -> Result<bool, MachineError> {
        // validate the target type up front
        if let Some(descriptor) = self.load_descriptor(staging, target)? {
            if descriptor.key_type() != KeyType::Set {
                return Err(MachineError::WrongType);
            }
        }

        let mut source_op = WriteOperation::new(staging, source, KeyType::Set)?;
        if !source_op.valid() {
            return Err(MachineError::WrongType);
        }
        if !source_op.delete_field(member)? {
            let size = source_op.key_size();
            source_op.finalize(size)?;
            return Ok(false);
        }
        let source_size = source_op.key_size() - 1;
        source_op.finalize(source_size)?;

        if source != target {
            let mut target_op = WriteOperation::new(staging, target, KeyType::Set)?;
            debug_assert!(target_op.valid());
            if !target_op.field_exists(member)? {
                target_op.write_field(member, b"1")?;
                let target_size = target_op.key_size() + 1;
                target_op.finalize(target_size)?;
            } else {
                let target_size = target_op.key_size();
                target_op.finalize(target_size)?;
            }
        } else {
            // moving onto itself: re-add what we removed
            let mut target_op = WriteOperation::new(staging, target, KeyType::Set)?;
            target_op.write_field(member, b"1")?;
            let target_size = target_op.key_size() + 1;
            target_op.finalize(target_size)?;
        }
        Ok(true)
    }
}

fn parse_be_i64(bytes: &[u8]) -> Result<i64, MachineError> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| MachineError::Corruption("malformed 8-byte integer".to_string()))?;
    Ok(i64::from_be_bytes(array))
}

fn parse_be_u64(bytes: &[u8]) -> Result<u64, MachineError> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| MachineError::Corruption("malformed 8-byte integer".to_string()))?;
    Ok(u64::from_be_bytes(array))
}

/// Strict signed 64-bit parse for user-visible counters.
pub(crate) fn parse_integer(bytes: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(bytes).ok()?;
    if text.is_empty() || text.starts_with('+') || text.starts_with(' ') {
        return None;
    }
    text.parse::<i64>().ok()
}

pub(crate) fn parse_float(bytes: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(bytes).ok()?;
    if text.is_empty() || text.trim() != text {
        return None;
    }
    let value = text.parse::<f64>().ok()?;
    if value.is_nan() || value.is_infinite() {
        return None;
    }
    Some(value)
}

/// Decimal float rendering without a trailing `.0` for whole numbers,
/// matching the redis reply shape.
pub(crate) fn format_float(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e17 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("path", &self.engine.path())
            .field("last_applied", &self.last_applied())
            .field("bulkload", &self.bulkload)
            .finish()
    }
}

#[cfg(test)]
mod debug_lock_tests {
    use super::*;
    #[test]
    fn debug_three_opens() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            let path = dir.path().join(format!("shard-{i}"));
            std::fs::create_dir_all(&path).unwrap();
            let r = StateMachine::open(&path, StateMachineOptions::default());
            eprintln!("{i}: {:?}", r.is_ok());
            if let Err(e) = &r {
                eprintln!("err: {e:?}");
            }
        }
    }
}
