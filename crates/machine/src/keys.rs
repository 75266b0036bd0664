//! Physical key encoding for the typed key-space.
//!
//! Single-byte prefixes partition the raw sorted store:
//!
//! - `!` descriptors, one per user key
//! - `~` configuration namespace, invisible to KEYS/SCAN
//! - `_` internal metadata (`__format`, `__last-applied`, `__clock`, ...)
//! - `@` lease expiration index
//! - `a`..`g` the seven user-visible types
//!
//! Composite keys append `##` and the field to the escaped user key,
//! where escaping rewrites `#` as `|#`. Key-internal hashes therefore
//! always carry a `|` before them, and the first `#` pair whose lead
//! byte is not preceded by `|` is the boundary. All multi-byte integers
//! are big-endian so lexicographic order matches numeric order.

use std::fmt;

/// Type tag of a user-visible key, fixed at first write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    String,
    Hash,
    Set,
    Deque,
    LocalityHash,
    Lease,
    VersionedHash,
}

impl KeyType {
    pub fn tag(&self) -> u8 {
        match self {
            KeyType::String => b'a',
            KeyType::Hash => b'b',
            KeyType::Set => b'c',
            KeyType::Deque => b'd',
            KeyType::LocalityHash => b'e',
            KeyType::Lease => b'f',
            KeyType::VersionedHash => b'g',
        }
    }

    pub fn from_tag(tag: u8) -> Option<KeyType> {
        match tag {
            b'a' => Some(KeyType::String),
            b'b' => Some(KeyType::Hash),
            b'c' => Some(KeyType::Set),
            b'd' => Some(KeyType::Deque),
            b'e' => Some(KeyType::LocalityHash),
            b'f' => Some(KeyType::Lease),
            b'g' => Some(KeyType::VersionedHash),
            _ => None,
        }
    }

    /// Whether fields hang off the key through the escaped-prefix
    /// scheme.
    pub fn is_composite(&self) -> bool {
        !matches!(self, KeyType::String | KeyType::Lease)
    }

    /// The name reported by TYPE.
    pub fn name(&self) -> &'static str {
        match self {
            KeyType::String => "string",
            KeyType::Hash => "hash",
            KeyType::Set => "set",
            KeyType::Deque => "deque",
            KeyType::LocalityHash => "locality hash",
            KeyType::Lease => "lease",
            KeyType::VersionedHash => "versioned hash",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub const DESCRIPTOR_PREFIX: u8 = b'!';
pub const CONFIG_PREFIX: u8 = b'~';
pub const INTERNAL_PREFIX: u8 = b'_';
pub const EXPIRATION_PREFIX: u8 = b'@';

/// Sub-tags inside a locality hash: `d` data rows keyed by field, `i`
/// index rows keyed by (hint, field).
pub const LOCALITY_DATA: u8 = b'd';
pub const LOCALITY_INDEX: u8 = b'i';

pub mod internal_keys {
    pub const FORMAT: &[u8] = b"__format";
    pub const LAST_APPLIED: &[u8] = b"__last-applied";
    pub const CLOCK: &[u8] = b"__clock";
    pub const IN_BULKLOAD: &[u8] = b"__in-bulkload";

    /// Current physical layout version.
    pub const FORMAT_VALUE: &str = "0";
}

/// A decode failure; carries the offending physical key for logs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot decode physical key {}", hex::encode(.0))]
pub struct KeyParseError(pub Vec<u8>);

pub fn descriptor_key(user_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + user_key.len());
    out.push(DESCRIPTOR_PREFIX);
    out.extend_from_slice(user_key);
    out
}

pub fn string_key(user_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + user_key.len());
    out.push(KeyType::String.tag());
    out.extend_from_slice(user_key);
    out
}

pub fn lease_key(user_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + user_key.len());
    out.push(KeyType::Lease.tag());
    out.extend_from_slice(user_key);
    out
}

pub fn config_key(name: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + name.len());
    out.push(CONFIG_PREFIX);
    out.extend_from_slice(name);
    out
}

/// `@ || deadline_be || user_key`: a forward scan yields leases in
/// expiry order.
pub fn expiration_event_key(deadline: u64, user_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + user_key.len());
    out.push(EXPIRATION_PREFIX);
    out.extend_from_slice(&deadline.to_be_bytes());
    out.extend_from_slice(user_key);
    out
}

pub fn decode_expiration_event(physical: &[u8]) -> Result<(u64, &[u8]), KeyParseError> {
    if physical.len() < 9 || physical[0] != EXPIRATION_PREFIX {
        return Err(KeyParseError(physical.to_vec()));
    }
    let deadline = u64::from_be_bytes(physical[1..9].try_into().unwrap());
    Ok((deadline, &physical[9..]))
}

fn append_escaped(out: &mut Vec<u8>, user_key: &[u8]) {
    for &byte in user_key {
        if byte == b'#' {
            out.push(b'|');
        }
        out.push(byte);
    }
}

/// `<tag><escaped(key)>##`, the seek target for "all fields of key".
pub fn field_prefix(key_type: KeyType, user_key: &[u8]) -> Vec<u8> {
    debug_assert!(key_type.is_composite());
    let mut out = Vec::with_capacity(user_key.len() + 3);
    out.push(key_type.tag());
    append_escaped(&mut out, user_key);
    out.extend_from_slice(b"##");
    out
}

pub fn field_key(key_type: KeyType, user_key: &[u8], field: &[u8]) -> Vec<u8> {
    let mut out = field_prefix(key_type, user_key);
    out.extend_from_slice(field);
    out
}

/// Deque elements live at `u64_be(index)` so iteration by field returns
/// elements in deque order.
pub fn deque_field_key(user_key: &[u8], index: u64) -> Vec<u8> {
    field_key(KeyType::Deque, user_key, &index.to_be_bytes())
}

/// Locality-hash data row: field-addressed, like a plain hash field but
/// nested under the `d` sub-tag.
pub fn locality_data_key(user_key: &[u8], field: &[u8]) -> Vec<u8> {
    let mut out = field_prefix(KeyType::LocalityHash, user_key);
    out.push(LOCALITY_DATA);
    out.extend_from_slice(field);
    out
}

pub fn locality_data_prefix(user_key: &[u8]) -> Vec<u8> {
    let mut out = field_prefix(KeyType::LocalityHash, user_key);
    out.push(LOCALITY_DATA);
    out
}

/// Locality-hash index row: `(hint, field)`-addressed, so scanning
/// streams fields in hint order.
pub fn locality_index_key(user_key: &[u8], hint: &[u8], field: &[u8]) -> Vec<u8> {
    let mut out = field_prefix(KeyType::LocalityHash, user_key);
    out.push(LOCALITY_INDEX);
    append_escaped(&mut out, hint);
    out.extend_from_slice(b"##");
    out.extend_from_slice(field);
    out
}

pub fn locality_index_prefix(user_key: &[u8]) -> Vec<u8> {
    let mut out = field_prefix(KeyType::LocalityHash, user_key);
    out.push(LOCALITY_INDEX);
    out
}

/// Split a locality index suffix (everything after the `i` sub-tag)
/// back into `(hint, field)`.
pub fn split_locality_index(suffix: &[u8]) -> Result<(Vec<u8>, &[u8]), KeyParseError> {
    let boundary = find_boundary(suffix).ok_or_else(|| KeyParseError(suffix.to_vec()))?;
    let hint = unescape(&suffix[..boundary - 2]).ok_or_else(|| KeyParseError(suffix.to_vec()))?;
    Ok((hint, &suffix[boundary..]))
}

/// A fully decoded physical key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    pub key_type: KeyType,
    pub user_key: Vec<u8>,
    pub field: Option<Vec<u8>>,
}

/// Inverse of the composite encodings. Total left-inverse on everything
/// the encoders produce; reports an error on anything else.
pub fn decode(physical: &[u8]) -> Result<DecodedKey, KeyParseError> {
    let parse_error = || KeyParseError(physical.to_vec());

    let (&tag, rest) = physical.split_first().ok_or_else(parse_error)?;
    let key_type = KeyType::from_tag(tag).ok_or_else(parse_error)?;

    if !key_type.is_composite() {
        return Ok(DecodedKey {
            key_type,
            user_key: rest.to_vec(),
            field: None,
        });
    }

    let boundary = find_boundary(rest).ok_or_else(parse_error)?;
    let user_key = unescape(&rest[..boundary - 2]).ok_or_else(parse_error)?;

    Ok(DecodedKey {
        key_type,
        user_key,
        field: Some(rest[boundary..].to_vec()),
    })
}

/// Position just past the `##` boundary, or None on a malformed key.
/// The lead `#` of the boundary is never preceded by `|`; escaped
/// hashes always are.
fn find_boundary(encoded: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < encoded.len() {
        if i + 1 < encoded.len() && encoded[i] == b'#' && encoded[i + 1] == b'#' {
            let escaped = i > 0 && encoded[i - 1] == b'|';
            if !escaped {
                return Some(i + 2);
            }
            // escaped `|#` directly followed by the boundary: skip the
            // escaped pair and retry from the second hash
            i += 1;
            continue;
        }
        i += 1;
    }
    None
}

fn unescape(escaped: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut i = 0;
    while i < escaped.len() {
        if escaped[i] == b'#' {
            // a bare hash can only appear escaped
            if out.last() != Some(&b'|') {
                return None;
            }
            *out.last_mut().unwrap() = b'#';
        } else {
            out.push(escaped[i]);
        }
        i += 1;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(key_type: KeyType, user_key: &[u8], field: &[u8]) {
        let physical = field_key(key_type, user_key, field);
        let decoded = decode(&physical).unwrap();
        assert_eq!(decoded.key_type, key_type);
        assert_eq!(decoded.user_key, user_key);
        assert_eq!(decoded.field.as_deref(), Some(field));
    }

    #[test]
    fn plain_keys_round_trip() {
        round_trip(KeyType::Hash, b"myhash", b"field1");
        round_trip(KeyType::Set, b"myset", b"member");
        round_trip(KeyType::Hash, b"myhash", b"");
    }

    #[test]
    fn hash_heavy_keys_round_trip() {
        round_trip(KeyType::Hash, b"#", b"f");
        round_trip(KeyType::Hash, b"##", b"f");
        round_trip(KeyType::Hash, b"a#b", b"f");
        round_trip(KeyType::Hash, b"a|#b", b"f");
        round_trip(KeyType::Hash, b"|#|#", b"f");
        round_trip(KeyType::Hash, b"###", b"field#with#hashes");
    }

    #[test]
    fn escaping_keeps_distinct_keys_distinct() {
        let one = field_key(KeyType::Hash, b"a#x", b"f");
        let two = field_key(KeyType::Hash, b"a", b"x##f");
        assert_ne!(one, two);
    }

    #[test]
    fn prefix_is_a_prefix_of_every_field() {
        let prefix = field_prefix(KeyType::Hash, b"k#ey");
        let field = field_key(KeyType::Hash, b"k#ey", b"f1");
        assert!(field.starts_with(&prefix));
    }

    #[test]
    fn deque_fields_sort_numerically() {
        let low = deque_field_key(b"q", (1u64 << 63) - 2);
        let mid = deque_field_key(b"q", 1u64 << 63);
        let high = deque_field_key(b"q", (1u64 << 63) + 1);
        assert!(low < mid && mid < high);
    }

    #[test]
    fn string_and_lease_have_no_field() {
        let decoded = decode(&string_key(b"abc")).unwrap();
        assert_eq!(decoded.key_type, KeyType::String);
        assert_eq!(decoded.user_key, b"abc");
        assert!(decoded.field.is_none());

        let decoded = decode(&lease_key(b"lock")).unwrap();
        assert_eq!(decoded.key_type, KeyType::Lease);
        assert_eq!(decoded.user_key, b"lock");
    }

    #[test]
    fn expiration_events_sort_by_deadline() {
        let early = expiration_event_key(10, b"zzz");
        let late = expiration_event_key(11, b"aaa");
        assert!(early < late);

        let (deadline, key) = decode_expiration_event(&early).unwrap();
        assert_eq!(deadline, 10);
        assert_eq!(key, b"zzz");
    }

    #[test]
    fn locality_rows_group_by_subtag() {
        let data = locality_data_key(b"lh", b"f1");
        let index = locality_index_key(b"lh", b"hint1", b"f1");
        assert!(data.starts_with(&locality_data_prefix(b"lh")));
        assert!(index.starts_with(&locality_index_prefix(b"lh")));

        // data rows sort before index rows within one key
        assert!(data < index);
    }

    #[test]
    fn locality_index_splits_back() {
        let index = locality_index_key(b"lh", b"hi#nt", b"field");
        let prefix = locality_index_prefix(b"lh");
        let (hint, field) = split_locality_index(&index[prefix.len()..]).unwrap();
        assert_eq!(hint, b"hi#nt");
        assert_eq!(field, b"field");
    }

    #[test]
    fn malformed_keys_are_reported() {
        assert!(decode(b"").is_err());
        assert!(decode(b"zoops").is_err());
        // composite without any boundary
        assert!(decode(&[KeyType::Hash.tag(), b'a', b'b']).is_err());
    }

    #[test]
    fn decode_is_untouched_by_field_content() {
        // fields may contain the boundary pattern; the first boundary wins
        round_trip(KeyType::Hash, b"k", b"##");
        round_trip(KeyType::Hash, b"k", b"|###");
    }
}
