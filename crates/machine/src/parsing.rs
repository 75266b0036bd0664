//! Argument parsing shared by the SCAN command family.
//!
//! Cursor grammar: `"0"` starts a scan, `"next:<resume>"` resumes one;
//! everything else is an invalid cursor. `COUNT` must be a positive
//! integer, `MATCH` is only available where the command supports it.

use bytes::Bytes;

use crate::machine::parse_integer;
use crate::MachineError;

pub const SCAN_DEFAULT_COUNT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanArgs {
    /// Raw resume position; empty means "from the beginning".
    pub cursor: Vec<u8>,
    pub count: usize,
    pub pattern: Vec<u8>,
}

pub fn parse_scan_args(args: &[Bytes], allow_match: bool) -> Result<ScanArgs, MachineError> {
    let (cursor_arg, options) = args
        .split_first()
        .ok_or(MachineError::InvalidCursor)?;

    let cursor = if cursor_arg.as_ref() == b"0" {
        Vec::new()
    } else if let Some(resume) = cursor_arg.strip_prefix(b"next:") {
        resume.to_vec()
    } else {
        return Err(MachineError::InvalidCursor);
    };

    let mut parsed = ScanArgs {
        cursor,
        count: SCAN_DEFAULT_COUNT,
        pattern: Vec::new(),
    };

    let mut position = 0;
    while position < options.len() {
        if position + 1 == options.len() {
            return Err(MachineError::SyntaxError);
        }
        let option = options[position].to_ascii_lowercase();
        let value = &options[position + 1];

        match option.as_slice() {
            b"count" => {
                if value.starts_with(b"-") || value.as_ref() == b"0" {
                    return Err(MachineError::SyntaxError);
                }
                let count = parse_integer(value).ok_or(MachineError::NotInteger)?;
                parsed.count = count as usize;
            }
            b"match" if allow_match => {
                parsed.pattern = value.to_vec();
            }
            _ => return Err(MachineError::SyntaxError),
        }
        position += 2;
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<Bytes> {
        parts
            .iter()
            .map(|part| Bytes::copy_from_slice(part.as_bytes()))
            .collect()
    }

    #[test]
    fn cursor_grammar() {
        let parsed = parse_scan_args(&args(&["0"]), true).unwrap();
        assert!(parsed.cursor.is_empty());
        assert_eq!(parsed.count, SCAN_DEFAULT_COUNT);

        let parsed = parse_scan_args(&args(&["next:f4"]), true).unwrap();
        assert_eq!(parsed.cursor, b"f4");

        assert!(matches!(
            parse_scan_args(&args(&["17"]), true),
            Err(MachineError::InvalidCursor)
        ));
    }

    #[test]
    fn count_and_match() {
        let parsed = parse_scan_args(&args(&["0", "COUNT", "3", "MATCH", "f*"]), true).unwrap();
        assert_eq!(parsed.count, 3);
        assert_eq!(parsed.pattern, b"f*");

        assert!(matches!(
            parse_scan_args(&args(&["0", "count", "0"]), true),
            Err(MachineError::SyntaxError)
        ));
        assert!(matches!(
            parse_scan_args(&args(&["0", "count", "-2"]), true),
            Err(MachineError::SyntaxError)
        ));
        assert!(matches!(
            parse_scan_args(&args(&["0", "count", "many"]), true),
            Err(MachineError::NotInteger)
        ));
    }

    #[test]
    fn match_rejected_where_unsupported() {
        assert!(matches!(
            parse_scan_args(&args(&["0", "match", "f*"]), false),
            Err(MachineError::SyntaxError)
        ));
    }

    #[test]
    fn dangling_and_unknown_options() {
        assert!(matches!(
            parse_scan_args(&args(&["0", "count"]), true),
            Err(MachineError::SyntaxError)
        ));
        assert!(matches!(
            parse_scan_args(&args(&["0", "limit", "5"]), true),
            Err(MachineError::SyntaxError)
        ));
    }
}
