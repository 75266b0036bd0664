//! System-side operations: the configuration namespace, the dynamic
//! clock, raw scans and the leadership no-op marker.

use super::*;

impl StateMachine {
    // ------------------------------------------------------------------
    // configuration namespace: lives under `~`, invisible to
    // KEYS / SCAN / FLUSHALL
    // ------------------------------------------------------------------

    pub fn config_get(
        &self,
        staging: &StagingArea<'_>,
        name: &[u8],
    ) -> Result<Option<Vec<u8>>, MachineError> {
        staging.get(&keys::config_key(name))
    }

    pub fn config_set(
        &self,
        staging: &mut StagingArea<'_>,
        name: &[u8],
        value: &[u8],
    ) -> Result<(), MachineError> {
        staging.put(keys::config_key(name), value.to_vec())
    }

    /// Flat (name, value) pairs of the whole namespace.
    pub fn config_getall(
        &self,
        staging: &StagingArea<'_>,
    ) -> Result<Vec<Vec<u8>>, MachineError> {
        let mut out = Vec::new();
        for pair in staging.iter_prefix(&[keys::CONFIG_PREFIX]) {
            let (physical, value) = pair?;
            out.push(physical[1..].to_vec());
            out.push(value);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // dynamic clock
    // ------------------------------------------------------------------

    /// The clock as this staging area sees it, uncommitted bumps
    /// included.
    pub fn read_clock(&self, staging: &StagingArea<'_>) -> Result<u64, MachineError> {
        match staging.get(internal_keys::CLOCK)? {
            None => Ok(0),
            Some(bytes) => {
                let array: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    MachineError::Corruption("malformed clock value".to_string())
                })?;
                Ok(u64::from_be_bytes(array))
            }
        }
    }

    /// Apply a leadership marker: raise the dynamic clock to the value
    /// the new leader journaled, never lowering it. The entry itself is
    /// a no-op; committing it guarantees the new term owns at least one
    /// entry.
    pub fn apply_leadership_marker(
        &self,
        staging: &mut StagingArea<'_>,
        observed_clock: u64,
    ) -> Result<(), MachineError> {
        staging.bump_clock(observed_clock);
        Ok(())
    }

    // ------------------------------------------------------------------
    // raw scan, a debugging aid over the physical key space
    // ------------------------------------------------------------------

    /// One page of raw (physical key, value) pairs starting at
    /// `cursor`. Unlike SCAN this exposes internal rows too.
    pub fn raw_scan(
        &self,
        staging: &StagingArea<'_>,
        cursor: &[u8],
        count: usize,
    ) -> Result<(Option<Vec<u8>>, Vec<Vec<u8>>), MachineError> {
        let mut out = Vec::new();
        let mut emitted = 0usize;
        for pair in staging.iter_from(cursor) {
            let (physical, value) = pair?;
            if emitted == count {
                return Ok((Some(physical), out));
            }
            emitted += 1;
            out.push(physical);
            out.push(value);
        }
        Ok((None, out))
    }
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
    fn config_namespace_is_isolated() {
        let (_dir, machine) = scratch();

        let mut staging = machine.staging_write();
        machine
            .config_set(&mut staging, b"trimming.keep", b"50000")
            .unwrap();
        machine.set(&mut staging, b"userkey", b"uservalue").unwrap();
        machine.commit_staging(staging, 1).unwrap();

        let staging = machine.staging_read();
        assert_eq!(
            machine
                .config_get(&staging, b"trimming.keep")
                .unwrap()
                .unwrap(),
            b"50000"
        );
        // invisible to user-facing enumeration
        assert_eq!(machine.keys(&staging, b"*").unwrap(), vec![b"userkey".to_vec()]);

        let all = machine.config_getall(&staging).unwrap();
        assert_eq!(all, vec![b"trimming.keep".to_vec(), b"50000".to_vec()]);
    }

    #[test]
    fn config_survives_flushall() {
        let (_dir, machine) = scratch();

        let mut staging = machine.staging_write();
        machine.config_set(&mut staging, b"name", b"value").unwrap();
        machine.set(&mut staging, b"k", b"v").unwrap();
        machine.flushall(&mut staging).unwrap();
        machine.commit_staging(staging, 1).unwrap();

        let staging = machine.staging_read();
        assert!(machine.get(&staging, b"k").unwrap().is_none());
        assert!(machine.config_get(&staging, b"name").unwrap().is_some());
    }

    #[test]
    fn clock_is_monotone_and_persisted() {
        let (_dir, machine) = scratch();

        let mut staging = machine.staging_write();
        machine.apply_leadership_marker(&mut staging, 500).unwrap();
        machine.commit_staging(staging, 1).unwrap();
        assert_eq!(machine.dynamic_clock(), 500);

        // lower observations never wind the clock back
        let mut staging = machine.staging_write();
        machine.apply_leadership_marker(&mut staging, 200).unwrap();
        machine.commit_staging(staging, 2).unwrap();
        assert_eq!(machine.dynamic_clock(), 500);

        let staging = machine.staging_read();
        assert_eq!(machine.read_clock(&staging).unwrap(), 500);
    }

    #[test]
    fn raw_scan_pages_through_everything() {
        let (_dir, machine) = scratch();

        let mut staging = machine.staging_write();
        machine.set(&mut staging, b"a", b"1").unwrap();
        machine.set(&mut staging, b"b", b"2").unwrap();
        machine.commit_staging(staging, 1).unwrap();

        let staging = machine.staging_read();
        let (cursor, first) = machine.raw_scan(&staging, b"", 2).unwrap();
        assert_eq!(first.len(), 4);
        let cursor = cursor.expect("store has more rows than the page");

        let (_, rest) = machine.raw_scan(&staging, &cursor, 1000).unwrap();
        assert!(!rest.is_empty());
    }
}
