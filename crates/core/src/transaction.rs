//! Multi-operation transactions.
//!
//! A transaction is an ordered list of sub-requests that commits inside
//! one staging area at one log index. The dispatcher builds them in two
//! situations: an explicit client transaction, or a phantom one wrapped
//! around pipelined writes (invisible to the client, replies come back
//! flattened).
//!
//! Wire shape: `TX_READONLY <payload> phantom|real`, where the payload
//! frames every sub-request with big-endian u64 lengths.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CoreError;
use crate::request::{CommandType, RedisCommand, RedisRequest};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    requests: Vec<RedisRequest>,
    phantom: bool,
    has_writes: bool,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction::default()
    }

    /// A phantom transaction wrapping a single request.
    pub fn one_off(request: RedisRequest) -> Self {
        let mut tx = Transaction::new();
        tx.push(request);
        tx.phantom = true;
        tx
    }

    pub fn push(&mut self, request: RedisRequest) {
        if request.command_type() == Some(CommandType::Write) {
            self.has_writes = true;
        }
        self.requests.push(request);
    }

    pub fn set_phantom(&mut self, phantom: bool) {
        self.phantom = phantom;
    }

    pub fn is_phantom(&self) -> bool {
        self.phantom
    }

    pub fn contains_writes(&self) -> bool {
        self.has_writes
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn requests(&self) -> &[RedisRequest] {
        &self.requests
    }

    pub fn into_requests(self) -> Vec<RedisRequest> {
        self.requests
    }

    fn serialize_payload(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u64(self.requests.len() as u64);
        for request in &self.requests {
            out.put_u64(request.len() as u64);
            for arg in request.args() {
                out.put_u64(arg.len() as u64);
                out.put_slice(arg);
            }
        }
        out.freeze()
    }

    fn deserialize_payload(payload: &[u8]) -> Result<Vec<RedisRequest>, CoreError> {
        let mut cursor = Reader::new(payload);
        let total = cursor.read_u64()?;

        let mut requests = Vec::with_capacity(total as usize);
        for _ in 0..total {
            let parts = cursor.read_u64()?;
            let mut args = Vec::with_capacity(parts as usize);
            for _ in 0..parts {
                let len = cursor.read_u64()? as usize;
                args.push(Bytes::copy_from_slice(cursor.read_bytes(len)?));
            }
            requests.push(RedisRequest::new(args));
        }

        if !cursor.exhausted() {
            return Err(CoreError::MalformedTransaction(
                "trailing bytes after last sub-request".to_string(),
            ));
        }
        Ok(requests)
    }

    /// The single journal-ready request carrying this transaction.
    pub fn to_redis_request(&self) -> RedisRequest {
        let command = if self.has_writes {
            "tx_readwrite"
        } else {
            "tx_readonly"
        };
        let marker = if self.phantom { "phantom" } else { "real" };

        RedisRequest::new(vec![
            Bytes::from_static(command.as_bytes()),
            self.serialize_payload(),
            Bytes::from_static(marker.as_bytes()),
        ])
    }

    pub fn from_redis_request(request: &RedisRequest) -> Result<Self, CoreError> {
        let command = request.command();
        if command != Some(RedisCommand::TxReadonly) && command != Some(RedisCommand::TxReadwrite) {
            return Err(CoreError::MalformedTransaction(
                "not a transaction command".to_string(),
            ));
        }
        if request.len() != 3 {
            return Err(CoreError::MalformedTransaction(format!(
                "expected 3 arguments, got {}",
                request.len()
            )));
        }

        let phantom = match request.arg(2) {
            b"phantom" => true,
            b"real" => false,
            other => {
                return Err(CoreError::MalformedTransaction(format!(
                    "unknown phantom marker '{}'",
                    String::from_utf8_lossy(other)
                )))
            }
        };

        let mut tx = Transaction::new();
        for sub in Self::deserialize_payload(request.arg(1))? {
            tx.push(sub);
        }
        tx.phantom = phantom;

        if command == Some(RedisCommand::TxReadonly) && tx.has_writes {
            return Err(CoreError::MalformedTransaction(
                "readonly transaction contains writes".to_string(),
            ));
        }
        Ok(tx)
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn read_u64(&mut self) -> Result<u64, CoreError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CoreError> {
        if self.pos + len > self.data.len() {
            return Err(CoreError::MalformedTransaction(
                "payload truncated".to_string(),
            ));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn exhausted(&self) -> bool {
        self.pos == self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_readwrite() {
        let mut tx = Transaction::new();
        tx.push(RedisRequest::from(["set", "abc", "123"]));
        tx.push(RedisRequest::from(["get", "abc"]));
        tx.set_phantom(true);
        assert!(tx.contains_writes());

        let wire = tx.to_redis_request();
        assert_eq!(wire.command(), Some(RedisCommand::TxReadwrite));

        let back = Transaction::from_redis_request(&wire).unwrap();
        assert_eq!(back, tx);
        assert!(back.is_phantom());
    }

    #[test]
    fn round_trip_readonly() {
        let mut tx = Transaction::new();
        tx.push(RedisRequest::from(["get", "a"]));
        tx.push(RedisRequest::from(["hget", "h", "f"]));

        let wire = tx.to_redis_request();
        assert_eq!(wire.command(), Some(RedisCommand::TxReadonly));
        assert_eq!(wire.arg(2), b"real");

        let back = Transaction::from_redis_request(&wire).unwrap();
        assert_eq!(back.len(), 2);
        assert!(!back.contains_writes());
    }

    #[test]
    fn rejects_truncated_payload() {
        let tx = Transaction::one_off(RedisRequest::from(["set", "k", "v"]));
        let wire = tx.to_redis_request();

        let truncated = RedisRequest::new(vec![
            wire.arg_bytes(0),
            wire.arg_bytes(1).slice(0..wire.arg(1).len() - 1),
            wire.arg_bytes(2),
        ]);
        assert!(Transaction::from_redis_request(&truncated).is_err());
    }

    #[test]
    fn rejects_bad_marker() {
        let tx = Transaction::one_off(RedisRequest::from(["set", "k", "v"]));
        let wire = tx.to_redis_request();
        let bad = RedisRequest::new(vec![
            wire.arg_bytes(0),
            wire.arg_bytes(1),
            Bytes::from_static(b"maybe"),
        ]);
        assert!(Transaction::from_redis_request(&bad).is_err());
    }

    #[test]
    fn empty_values_survive() {
        let mut tx = Transaction::new();
        tx.push(RedisRequest::from(["hset", "h", "", ""]));
        let back = Transaction::from_redis_request(&tx.to_redis_request()).unwrap();
        assert_eq!(back.requests()[0].arg(2), b"");
        assert_eq!(back.requests()[0].arg(3), b"");
    }
}
