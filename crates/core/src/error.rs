use thiserror::Error;

/// Errors shared across crates: parsing of cross-cutting value types.
/// Subsystem-specific failures live in their own crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("cannot parse '{0}' as a host:port pair")]
    MalformedMember(String),

    #[error("malformed transaction payload: {0}")]
    MalformedTransaction(String),

    #[error("value is not an integer or out of range")]
    NotAnInteger,
}

/// Strict signed 64-bit parse, the one used for every user-supplied
/// integer. Rejects leading `+`, whitespace, and partial parses.
pub fn parse_i64(bytes: &[u8]) -> Result<i64, CoreError> {
    let text = std::str::from_utf8(bytes).map_err(|_| CoreError::NotAnInteger)?;
    if text.is_empty() || text.starts_with('+') {
        return Err(CoreError::NotAnInteger);
    }
    text.parse::<i64>().map_err(|_| CoreError::NotAnInteger)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_integer_parsing() {
        assert_eq!(parse_i64(b"123"), Ok(123));
        assert_eq!(parse_i64(b"-9"), Ok(-9));
        assert!(parse_i64(b"").is_err());
        assert!(parse_i64(b"+5").is_err());
        assert!(parse_i64(b" 5").is_err());
        assert!(parse_i64(b"5x").is_err());
        assert!(parse_i64(b"3.14").is_err());
        assert!(parse_i64(b"99999999999999999999").is_err());
    }
}
