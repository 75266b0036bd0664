//! Key descriptors: the single source of truth for a user key's
//! existence, type and size.
//!
//! One record per user key, stored at `! || user_key`. The payload is a
//! tagged variant: the tag byte doubles as the key's type tag, and the
//! tail is sized by type: plain types carry the size only, deques and
//! leases carry two extra indices, versioned hashes carry one.

use crate::keys::KeyType;

/// Deque indices start in the middle of the u64 range and move outward.
pub const INDEX_INITIAL: u64 = 1u64 << 63;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyDescriptor {
    String {
        size: i64,
    },
    Hash {
        size: i64,
    },
    Set {
        size: i64,
    },
    LocalityHash {
        size: i64,
    },
    Deque {
        size: i64,
        start_index: u64,
        end_index: u64,
    },
    Lease {
        size: i64,
        renewal: u64,
        deadline: u64,
    },
    VersionedHash {
        size: i64,
        version: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot parse key descriptor: {0}")]
pub struct DescriptorParseError(pub String);

impl KeyDescriptor {
    /// Fresh descriptor for a key that is about to be created.
    pub fn empty(key_type: KeyType) -> KeyDescriptor {
        match key_type {
            KeyType::String => KeyDescriptor::String { size: 0 },
            KeyType::Hash => KeyDescriptor::Hash { size: 0 },
            KeyType::Set => KeyDescriptor::Set { size: 0 },
            KeyType::LocalityHash => KeyDescriptor::LocalityHash { size: 0 },
            KeyType::Deque => KeyDescriptor::Deque {
                size: 0,
                start_index: INDEX_INITIAL,
                end_index: INDEX_INITIAL,
            },
            KeyType::Lease => KeyDescriptor::Lease {
                size: 0,
                renewal: 0,
                deadline: 0,
            },
            KeyType::VersionedHash => KeyDescriptor::VersionedHash { size: 0, version: 0 },
        }
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            KeyDescriptor::String { .. } => KeyType::String,
            KeyDescriptor::Hash { .. } => KeyType::Hash,
            KeyDescriptor::Set { .. } => KeyType::Set,
            KeyDescriptor::LocalityHash { .. } => KeyType::LocalityHash,
            KeyDescriptor::Deque { .. } => KeyType::Deque,
            KeyDescriptor::Lease { .. } => KeyType::Lease,
            KeyDescriptor::VersionedHash { .. } => KeyType::VersionedHash,
        }
    }

    pub fn size(&self) -> i64 {
        match self {
            KeyDescriptor::String { size }
            | KeyDescriptor::Hash { size }
            | KeyDescriptor::Set { size }
            | KeyDescriptor::LocalityHash { size }
            | KeyDescriptor::Deque { size, .. }
            | KeyDescriptor::Lease { size, .. }
            | KeyDescriptor::VersionedHash { size, .. } => *size,
        }
    }

    pub fn set_size(&mut self, new_size: i64) {
        match self {
            KeyDescriptor::String { size }
            | KeyDescriptor::Hash { size }
            | KeyDescriptor::Set { size }
            | KeyDescriptor::LocalityHash { size }
            | KeyDescriptor::Deque { size, .. }
            | KeyDescriptor::Lease { size, .. }
            | KeyDescriptor::VersionedHash { size, .. } => *size = new_size,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(25);
        out.push(self.key_type().tag());
        out.extend_from_slice(&self.size().to_be_bytes());

        match self {
            KeyDescriptor::Deque {
                start_index,
                end_index,
                ..
            } => {
                out.extend_from_slice(&start_index.to_be_bytes());
                out.extend_from_slice(&end_index.to_be_bytes());
            }
            KeyDescriptor::Lease {
                renewal, deadline, ..
            } => {
                out.extend_from_slice(&renewal.to_be_bytes());
                out.extend_from_slice(&deadline.to_be_bytes());
            }
            KeyDescriptor::VersionedHash { version, .. } => {
                out.extend_from_slice(&version.to_be_bytes());
            }
            _ => {}
        }
        out
    }

    pub fn parse(payload: &[u8]) -> Result<KeyDescriptor, DescriptorParseError> {
        let error = || DescriptorParseError(hex::encode(payload));

        let (&tag, rest) = payload.split_first().ok_or_else(error)?;
        let key_type = KeyType::from_tag(tag).ok_or_else(error)?;

        let read_i64 = |offset: usize| -> Result<i64, DescriptorParseError> {
            let bytes = rest.get(offset..offset + 8).ok_or_else(error)?;
            Ok(i64::from_be_bytes(bytes.try_into().unwrap()))
        };
        let read_u64 = |offset: usize| -> Result<u64, DescriptorParseError> {
            let bytes = rest.get(offset..offset + 8).ok_or_else(error)?;
            Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
        };

        let expected_len = match key_type {
            KeyType::Deque | KeyType::Lease => 24,
            KeyType::VersionedHash => 16,
            _ => 8,
        };
        if rest.len() != expected_len {
            return Err(error());
        }

        let size = read_i64(0)?;
        let descriptor = match key_type {
            KeyType::String => KeyDescriptor::String { size },
            KeyType::Hash => KeyDescriptor::Hash { size },
            KeyType::Set => KeyDescriptor::Set { size },
            KeyType::LocalityHash => KeyDescriptor::LocalityHash { size },
            KeyType::Deque => {
                let start_index = read_u64(8)?;
                let end_index = read_u64(16)?;
                if start_index > end_index {
                    return Err(error());
                }
                KeyDescriptor::Deque {
                    size,
                    start_index,
                    end_index,
                }
            }
            KeyType::Lease => KeyDescriptor::Lease {
                size,
                renewal: read_u64(8)?,
                deadline: read_u64(16)?,
            },
            KeyType::VersionedHash => KeyDescriptor::VersionedHash {
                size,
                version: read_u64(8)?,
            },
        };
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(descriptor: KeyDescriptor) {
        let parsed = KeyDescriptor::parse(&descriptor.serialize()).unwrap();
        assert_eq!(parsed, descriptor);
    }

    #[test]
    fn all_variants_round_trip() {
        round_trip(KeyDescriptor::String { size: 12 });
        round_trip(KeyDescriptor::Hash { size: 9 });
        round_trip(KeyDescriptor::Set { size: 0 });
        round_trip(KeyDescriptor::LocalityHash { size: 3 });
        round_trip(KeyDescriptor::Deque {
            size: 2,
            start_index: INDEX_INITIAL - 1,
            end_index: INDEX_INITIAL + 1,
        });
        round_trip(KeyDescriptor::Lease {
            size: 1,
            renewal: 9,
            deadline: 19,
        });
        round_trip(KeyDescriptor::VersionedHash { size: 4, version: 77 });
    }

    #[test]
    fn fresh_deque_starts_centered() {
        let descriptor = KeyDescriptor::empty(KeyType::Deque);
        match descriptor {
            KeyDescriptor::Deque {
                size,
                start_index,
                end_index,
            } => {
                assert_eq!(size, 0);
                assert_eq!(start_index, INDEX_INITIAL);
                assert_eq!(end_index, INDEX_INITIAL);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(KeyDescriptor::parse(b"").is_err());
        assert!(KeyDescriptor::parse(b"z\0\0\0\0\0\0\0\0").is_err());

        // truncated deque payload
        let mut bytes = KeyDescriptor::empty(KeyType::Deque).serialize();
        bytes.truncate(bytes.len() - 1);
        assert!(KeyDescriptor::parse(&bytes).is_err());

        // inverted deque indices
        let bad = KeyDescriptor::Deque {
            size: 0,
            start_index: INDEX_INITIAL + 1,
            end_index: INDEX_INITIAL,
        };
        assert!(KeyDescriptor::parse(&bad.serialize()).is_err());
    }
}
