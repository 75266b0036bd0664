//! Deques: elements addressed by a big-endian u64 field so iteration
//! order is deque order. Pushes move one index outward, pops shrink
//! symmetrically; the indices never wrap.

use super::*;

/// Which end of the deque an operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Front,
    Back,
}

impl StateMachine {
    pub fn lpush(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        items: &[&[u8]],
    ) -> Result<i64, MachineError> {
        self.deque_push(staging, Direction::Front, key, items)
    }

    pub fn rpush(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
        items: &[&[u8]],
    ) -> Result<i64, MachineError> {
        self.deque_push(staging, Direction::Back, key, items)
    }

    pub fn lpop(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, MachineError> {
        self.deque_pop(staging, Direction::Front, key)
    }

    pub fn rpop(
        &self,
        staging: &mut StagingArea<'_>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, MachineError> {
        self.deque_pop(staging, Direction::Back, key)
    }

    pub fn llen(&self, staging: &StagingArea<'_>, key: &[u8]) -> Result<i64, MachineError> {
        Ok(self
            .expect_type(staging, key, KeyType::Deque)?
            .map_or(0, |d| d.size()))
    }

    fn deque_push(
        &self,
        staging: &mut StagingArea<'_>,
        direction: Direction,
        key: &[u8],
        items: &[&[u8]],
    ) -> Result<i64, MachineError> {
        let mut op = WriteOperation::new(staging, key, KeyType::Deque)?;
        if !op.valid() {
            return Err(MachineError::WrongType);
        }

        let KeyDescriptor::Deque {
            size,
            mut start_index,
            mut end_index,
        } = op.descriptor().clone()
        else {
            unreachable!("descriptor type checked above");
        };

        // reject the whole push before touching anything if any step
        // would run an index off the end of the u64 range
        let span = items.len() as u64;
        match direction {
            Direction::Front if start_index < span => return Err(MachineError::DequeOverflow),
            Direction::Back if u64::MAX - end_index < span => {
                return Err(MachineError::DequeOverflow)
            }
            _ => {}
        }

        for item in items {
            let slot = match direction {
                Direction::Front => {
                    start_index -= 1;
                    start_index
                }
                Direction::Back => {
                    let slot = end_index;
                    end_index += 1;
                    slot
                }
            };
            op.write_field(&slot.to_be_bytes(), item)?;
        }

        let new_size = size + items.len() as i64;
        if let KeyDescriptor::Deque {
            start_index: s,
            end_index: e,
            ..
        } = op.descriptor_mut()
        {
            *s = start_index;
            *e = end_index;
        }
        op.finalize(new_size)?;
        Ok(new_size)
    }

    fn deque_pop(
        &self,
        staging: &mut StagingArea<'_>,
        direction: Direction,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, MachineError> {
        let mut op = WriteOperation::new(staging, key, KeyType::Deque)?;
        if !op.valid() {
            return Err(MachineError::WrongType);
        }
        if !op.key_exists() || op.key_size() == 0 {
            return Ok(None);
        }

        let KeyDescriptor::Deque {
            size,
            mut start_index,
            mut end_index,
        } = op.descriptor().clone()
        else {
            unreachable!("descriptor type checked above");
        };

        let slot = match direction {
            Direction::Front => {
                let slot = start_index;
                start_index += 1;
                slot
            }
            Direction::Back => {
                end_index -= 1;
                end_index
            }
        };

        let item = op.get_field(&slot.to_be_bytes())?.ok_or_else(|| {
            MachineError::Corruption(format!(
                "deque {} missing element at index {}",
                String::from_utf8_lossy(key),
                slot
            ))
        })?;
        op.delete_field(&slot.to_be_bytes())?;

        if let KeyDescriptor::Deque {
            start_index: s,
            end_index: e,
            ..
        } = op.descriptor_mut()
        {
            *s = start_index;
            *e = end_index;
        }
        op.finalize(size - 1)?;
        Ok(Some(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::INDEX_INITIAL;
    use crate::StateMachineOptions;

    fn scratch() -> (tempfile::TempDir, StateMachine) {
        let dir = tempfile::tempdir().unwrap();
        let machine =
            StateMachine::open(dir.path().join("sm"), StateMachineOptions::default()).unwrap();
        (dir, machine)
    }

    #[test]
    fn push_pop_round_trip() {
        let (_dir, machine) = scratch();

        let mut staging = machine.staging_write();
        assert_eq!(
            machine
                .rpush(&mut staging, b"q", &[b"a", b"b", b"c", b"d"])
                .unwrap(),
            4
        );
        assert_eq!(machine.lpop(&mut staging, b"q").unwrap().unwrap(), b"a");
        assert_eq!(machine.rpop(&mut staging, b"q").unwrap().unwrap(), b"d");
        assert_eq!(machine.llen(&staging, b"q").unwrap(), 2);
        assert_eq!(machine.lpop(&mut staging, b"q").unwrap().unwrap(), b"b");
        assert_eq!(machine.lpop(&mut staging, b"q").unwrap().unwrap(), b"c");
        assert_eq!(machine.lpop(&mut staging, b"q").unwrap(), None);
        machine.commit_staging(staging, 1).unwrap();
    }

    #[test]
    fn empty_deque_disappears_and_recenters() {
        let (_dir, machine) = scratch();

        let mut staging = machine.staging_write();
        machine.lpush(&mut staging, b"q", &[b"x"]).unwrap();
        machine.rpop(&mut staging, b"q").unwrap();

        // descriptor gone once drained
        assert!(machine.load_descriptor(&staging, b"q").unwrap().is_none());

        // next push starts from the middle again
        machine.rpush(&mut staging, b"q", &[b"y"]).unwrap();
        match machine.load_descriptor(&staging, b"q").unwrap().unwrap() {
            KeyDescriptor::Deque {
                size,
                start_index,
                end_index,
            } => {
                assert_eq!(size, 1);
                assert_eq!(start_index, INDEX_INITIAL);
                assert_eq!(end_index, INDEX_INITIAL + 1);
            }
            other => panic!("unexpected descriptor {other:?}"),
        }
        machine.commit_staging(staging, 1).unwrap();
    }

    #[test]
    fn front_pushes_walk_left() {
        let (_dir, machine) = scratch();

        let mut staging = machine.staging_write();
        machine.lpush(&mut staging, b"q", &[b"one", b"two"]).unwrap();
        match machine.load_descriptor(&staging, b"q").unwrap().unwrap() {
            KeyDescriptor::Deque {
                size,
                start_index,
                end_index,
            } => {
                assert_eq!(size, 2);
                assert_eq!(start_index, INDEX_INITIAL - 2);
                assert_eq!(end_index, INDEX_INITIAL);
                assert_eq!(end_index - start_index, 2);
            }
            other => panic!("unexpected descriptor {other:?}"),
        }

        // LPUSH one two → [two, one]
        assert_eq!(machine.lpop(&mut staging, b"q").unwrap().unwrap(), b"two");
        assert_eq!(machine.lpop(&mut staging, b"q").unwrap().unwrap(), b"one");
        machine.commit_staging(staging, 1).unwrap();
    }

    #[test]
    fn wrongtype_against_deque() {
        let (_dir, machine) = scratch();

        let mut staging = machine.staging_write();
        machine.set(&mut staging, b"s", b"value").unwrap();
        assert!(matches!(
            machine.lpush(&mut staging, b"s", &[b"x"]),
            Err(MachineError::WrongType)
        ));
        machine.commit_staging(staging, 1).unwrap();
    }
}
