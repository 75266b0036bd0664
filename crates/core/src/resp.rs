//! RESP value model and reply construction.
//!
//! A `RespValue` is the decoded form of anything that travels over the
//! wire; `formatter` builds the replies the dispatcher hands back.
//! Encoding to bytes lives here so that every crate producing replies
//! agrees on the exact byte layout.

use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    /// The null bulk string, `$-1\r\n`.
    Null,
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            RespValue::Simple(text) => {
                out.put_u8(b'+');
                out.put_slice(text.as_bytes());
                out.put_slice(b"\r\n");
            }
            RespValue::Error(text) => {
                out.put_u8(b'-');
                out.put_slice(text.as_bytes());
                out.put_slice(b"\r\n");
            }
            RespValue::Integer(number) => {
                out.put_u8(b':');
                out.put_slice(number.to_string().as_bytes());
                out.put_slice(b"\r\n");
            }
            RespValue::Bulk(payload) => {
                out.put_u8(b'$');
                out.put_slice(payload.len().to_string().as_bytes());
                out.put_slice(b"\r\n");
                out.put_slice(payload);
                out.put_slice(b"\r\n");
            }
            RespValue::Null => {
                out.put_slice(b"$-1\r\n");
            }
            RespValue::Array(items) => {
                out.put_u8(b'*');
                out.put_slice(items.len().to_string().as_bytes());
                out.put_slice(b"\r\n");
                for item in items {
                    item.encode(out);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out.freeze()
    }

    /// True for `-ERR ...` style replies of any kind.
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }
}

/// Encode a request the way clients send commands: an array of bulk
/// strings.
pub fn encode_request(args: &[Bytes], out: &mut BytesMut) {
    out.put_u8(b'*');
    out.put_slice(args.len().to_string().as_bytes());
    out.put_slice(b"\r\n");
    for arg in args {
        out.put_u8(b'$');
        out.put_slice(arg.len().to_string().as_bytes());
        out.put_slice(b"\r\n");
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("protocol error: {0}")]
pub struct RespParseError(pub String);

/// Incremental decode of one value from the front of `buffer`.
///
/// `Ok(None)` means the buffer holds only a partial value: read more
/// bytes and retry. On success the consumed bytes are split off.
pub fn decode_value(buffer: &mut BytesMut) -> Result<Option<RespValue>, RespParseError> {
    match parse_at(buffer, 0)? {
        None => Ok(None),
        Some((value, consumed)) => {
            let _ = buffer.split_to(consumed);
            Ok(Some(value))
        }
    }
}

/// Parse one value starting at `offset`; returns the value and the
/// offset one past its end.
fn parse_at(buffer: &[u8], offset: usize) -> Result<Option<(RespValue, usize)>, RespParseError> {
    let Some(&marker) = buffer.get(offset) else {
        return Ok(None);
    };

    let Some((line, after_line)) = read_line(buffer, offset + 1) else {
        return Ok(None);
    };

    match marker {
        b'+' => Ok(Some((
            RespValue::Simple(String::from_utf8_lossy(line).into_owned()),
            after_line,
        ))),
        b'-' => Ok(Some((
            RespValue::Error(String::from_utf8_lossy(line).into_owned()),
            after_line,
        ))),
        b':' => {
            let number = parse_decimal(line)?;
            Ok(Some((RespValue::Integer(number), after_line)))
        }
        b'$' => {
            let length = parse_decimal(line)?;
            if length == -1 {
                return Ok(Some((RespValue::Null, after_line)));
            }
            if length < 0 {
                return Err(RespParseError(format!("invalid bulk length {length}")));
            }
            let length = length as usize;
            let end = after_line + length + 2;
            if buffer.len() < end {
                return Ok(None);
            }
            if &buffer[after_line + length..end] != b"\r\n" {
                return Err(RespParseError("bulk string missing terminator".to_string()));
            }
            let payload = Bytes::copy_from_slice(&buffer[after_line..after_line + length]);
            Ok(Some((RespValue::Bulk(payload), end)))
        }
        b'*' => {
            let count = parse_decimal(line)?;
            if count < 0 {
                return Err(RespParseError(format!("invalid array length {count}")));
            }
            let mut items = Vec::with_capacity(count as usize);
            let mut cursor = after_line;
            for _ in 0..count {
                match parse_at(buffer, cursor)? {
                    None => return Ok(None),
                    Some((item, next)) => {
                        items.push(item);
                        cursor = next;
                    }
                }
            }
            Ok(Some((RespValue::Array(items), cursor)))
        }
        other => Err(RespParseError(format!(
            "unexpected type marker 0x{other:02x}"
        ))),
    }
}

/// The slice up to the next CRLF and the offset just past it.
fn read_line(buffer: &[u8], from: usize) -> Option<(&[u8], usize)> {
    let haystack = buffer.get(from..)?;
    let position = haystack.windows(2).position(|pair| pair == b"\r\n")?;
    Some((&haystack[..position], from + position + 2))
}

fn parse_decimal(line: &[u8]) -> Result<i64, RespParseError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| RespParseError("malformed length line".to_string()))
}

/// Reply constructors, mirrored across every dispatch path.
pub mod formatter {
    use super::RespValue;
    use bytes::Bytes;

    pub fn ok() -> RespValue {
        RespValue::Simple("OK".to_string())
    }

    pub fn pong() -> RespValue {
        RespValue::Simple("PONG".to_string())
    }

    pub fn status(text: impl Into<String>) -> RespValue {
        RespValue::Simple(text.into())
    }

    pub fn err(msg: impl AsRef<str>) -> RespValue {
        RespValue::Error(format!("ERR {}", msg.as_ref()))
    }

    pub fn err_args(cmd: impl AsRef<str>) -> RespValue {
        err(format!(
            "wrong number of arguments for '{}' command",
            cmd.as_ref()
        ))
    }

    pub fn wrong_type() -> RespValue {
        RespValue::Error(
            "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
        )
    }

    pub fn noauth() -> RespValue {
        RespValue::Error("NOAUTH Authentication required.".to_string())
    }

    pub fn moved(target: impl AsRef<str>) -> RespValue {
        RespValue::Error(format!("MOVED {}", target.as_ref()))
    }

    pub fn not_leader(leader: Option<&str>) -> RespValue {
        match leader {
            Some(addr) => RespValue::Error(format!("NOT_LEADER try {addr}")),
            None => RespValue::Error("NOT_LEADER no leader is known".to_string()),
        }
    }

    pub fn unavailable(msg: impl AsRef<str>) -> RespValue {
        RespValue::Error(format!("UNAVAILABLE {}", msg.as_ref()))
    }

    pub fn invalid_argument(msg: impl AsRef<str>) -> RespValue {
        RespValue::Error(format!("INVALID-ARGUMENT {}", msg.as_ref()))
    }

    pub fn null() -> RespValue {
        RespValue::Null
    }

    pub fn integer(number: i64) -> RespValue {
        RespValue::Integer(number)
    }

    pub fn string(payload: impl Into<Bytes>) -> RespValue {
        RespValue::Bulk(payload.into())
    }

    pub fn vector<I, T>(items: I) -> RespValue
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        RespValue::Array(
            items
                .into_iter()
                .map(|item| RespValue::Bulk(item.into()))
                .collect(),
        )
    }

    pub fn array(items: Vec<RespValue>) -> RespValue {
        RespValue::Array(items)
    }

    /// The two-element scan reply: next cursor plus the page of items.
    pub fn scan<I, T>(cursor: impl Into<String>, items: I) -> RespValue
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        RespValue::Array(vec![
            RespValue::Bulk(Bytes::from(cursor.into())),
            vector(items),
        ])
    }
}
