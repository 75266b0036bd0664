//! Raft RPCs as they travel over the wire.
//!
//! Peers speak the same RESP protocol as clients: a request is an
//! array of bulk strings, a response is a plain RESP value. Numbers
//! ride as decimal text, entries as their binary journal encoding.

use bytes::Bytes;

use quarkdb_core::resp::{formatter, RespValue};
use quarkdb_core::{LogIndex, RaftServer, RaftTerm, RedisRequest};

use crate::journal::RaftEntry;
use crate::RaftError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    pub cluster_id: String,
    pub leader: RaftServer,
    pub term: RaftTerm,
    pub prev_index: LogIndex,
    pub prev_term: RaftTerm,
    pub commit_index: LogIndex,
    pub entries: Vec<RaftEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Ok,
    /// The receiver's term is newer than the sender's.
    TermMismatch,
    /// The receiver's log does not contain a matching previous entry.
    LogGap,
}

impl AppendOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            AppendOutcome::Ok => "ok",
            AppendOutcome::TermMismatch => "term_mismatch",
            AppendOutcome::LogGap => "log_gap",
        }
    }

    fn parse(text: &str) -> Result<Self, RaftError> {
        match text {
            "ok" => Ok(AppendOutcome::Ok),
            "term_mismatch" => Ok(AppendOutcome::TermMismatch),
            "log_gap" => Ok(AppendOutcome::LogGap),
            other => Err(RaftError::Protocol(format!(
                "unknown append outcome '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    pub term: RaftTerm,
    pub log_size: LogIndex,
    pub outcome: AppendOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRequest {
    pub cluster_id: String,
    pub candidate: RaftServer,
    pub term: RaftTerm,
    pub last_index: LogIndex,
    pub last_term: RaftTerm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteResponse {
    pub term: RaftTerm,
    pub granted: bool,
}

fn number(value: i64) -> Bytes {
    Bytes::from(value.to_string())
}

fn parse_number(raw: &[u8]) -> Result<i64, RaftError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| RaftError::Protocol("malformed number field".to_string()))
}

fn parse_server(raw: &[u8]) -> Result<RaftServer, RaftError> {
    String::from_utf8_lossy(raw)
        .parse()
        .map_err(|_| RaftError::Protocol("malformed server field".to_string()))
}

impl AppendEntriesRequest {
    pub fn to_redis_request(&self) -> Result<RedisRequest, RaftError> {
        let mut args: Vec<Bytes> = vec![
            Bytes::from_static(b"raft_append_entries"),
            Bytes::from(self.cluster_id.clone().into_bytes()),
            Bytes::from(self.leader.to_string().into_bytes()),
            number(self.term),
            number(self.prev_index),
            number(self.prev_term),
            number(self.commit_index),
            number(self.entries.len() as i64),
        ];
        for entry in &self.entries {
            args.push(Bytes::from(entry.serialize()?));
        }
        Ok(RedisRequest::new(args))
    }

    pub fn parse(request: &RedisRequest) -> Result<Self, RaftError> {
        if request.len() < 8 {
            return Err(RaftError::Protocol(
                "short raft_append_entries request".to_string(),
            ));
        }
        let entry_count = parse_number(request.arg(7))? as usize;
        if request.len() != 8 + entry_count {
            return Err(RaftError::Protocol(format!(
                "raft_append_entries advertises {} entries but carries {}",
                entry_count,
                request.len() - 8
            )));
        }

        let mut entries = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            entries.push(RaftEntry::parse(request.arg(8 + i))?);
        }

        Ok(AppendEntriesRequest {
            cluster_id: String::from_utf8_lossy(request.arg(1)).into_owned(),
            leader: parse_server(request.arg(2))?,
            term: parse_number(request.arg(3))?,
            prev_index: parse_number(request.arg(4))?,
            prev_term: parse_number(request.arg(5))?,
            commit_index: parse_number(request.arg(6))?,
            entries,
        })
    }
}

impl AppendEntriesResponse {
    pub fn to_resp(&self) -> RespValue {
        formatter::array(vec![
            formatter::integer(self.term),
            formatter::integer(self.log_size),
            formatter::status(self.outcome.as_str()),
        ])
    }

    pub fn parse(value: &RespValue) -> Result<Self, RaftError> {
        let RespValue::Array(items) = value else {
            return Err(RaftError::Protocol(format!(
                "unexpected append response: {value:?}"
            )));
        };
        match items.as_slice() {
            [RespValue::Integer(term), RespValue::Integer(log_size), RespValue::Simple(outcome)] => {
                Ok(AppendEntriesResponse {
                    term: *term,
                    log_size: *log_size,
                    outcome: AppendOutcome::parse(outcome)?,
                })
            }
            _ => Err(RaftError::Protocol(
                "malformed append response fields".to_string(),
            )),
        }
    }
}

impl VoteRequest {
    pub fn to_redis_request(&self) -> RedisRequest {
        RedisRequest::new(vec![
            Bytes::from_static(b"raft_request_vote"),
            Bytes::from(self.cluster_id.clone().into_bytes()),
            Bytes::from(self.candidate.to_string().into_bytes()),
            number(self.term),
            number(self.last_index),
            number(self.last_term),
        ])
    }

    pub fn parse(request: &RedisRequest) -> Result<Self, RaftError> {
        if request.len() != 6 {
            return Err(RaftError::Protocol(
                "malformed raft_request_vote request".to_string(),
            ));
        }
        Ok(VoteRequest {
            cluster_id: String::from_utf8_lossy(request.arg(1)).into_owned(),
            candidate: parse_server(request.arg(2))?,
            term: parse_number(request.arg(3))?,
            last_index: parse_number(request.arg(4))?,
            last_term: parse_number(request.arg(5))?,
        })
    }
}

impl VoteResponse {
    pub fn to_resp(&self) -> RespValue {
        formatter::array(vec![
            formatter::integer(self.term),
            formatter::integer(self.granted as i64),
        ])
    }

    pub fn parse(value: &RespValue) -> Result<Self, RaftError> {
        let RespValue::Array(items) = value else {
            return Err(RaftError::Protocol(format!(
                "unexpected vote response: {value:?}"
            )));
        };
        match items.as_slice() {
            [RespValue::Integer(term), RespValue::Integer(granted)] => Ok(VoteResponse {
                term: *term,
                granted: *granted != 0,
            }),
            _ => Err(RaftError::Protocol(
                "malformed vote response fields".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarkdb_core::RedisRequest as Req;

    #[test]
    fn append_entries_round_trip() {
        let request = AppendEntriesRequest {
            cluster_id: "cluster-1".to_string(),
            leader: "n1:1001".parse().unwrap(),
            term: 4,
            prev_index: 17,
            prev_term: 3,
            commit_index: 15,
            entries: vec![
                RaftEntry::new(4, Req::from(["set", "a", "1"])),
                RaftEntry::new(4, Req::from(["del", "b"])),
            ],
        };
        let wire = request.to_redis_request().unwrap();
        let back = AppendEntriesRequest::parse(&wire).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn heartbeats_carry_no_entries() {
        let request = AppendEntriesRequest {
            cluster_id: "cluster-1".to_string(),
            leader: "n1:1001".parse().unwrap(),
            term: 4,
            prev_index: 17,
            prev_term: 3,
            commit_index: 17,
            entries: Vec::new(),
        };
        let wire = request.to_redis_request().unwrap();
        assert_eq!(wire.len(), 8);
        assert_eq!(AppendEntriesRequest::parse(&wire).unwrap(), request);
    }

    #[test]
    fn responses_round_trip() {
        for outcome in [
            AppendOutcome::Ok,
            AppendOutcome::TermMismatch,
            AppendOutcome::LogGap,
        ] {
            let response = AppendEntriesResponse {
                term: 9,
                log_size: 42,
                outcome,
            };
            assert_eq!(
                AppendEntriesResponse::parse(&response.to_resp()).unwrap(),
                response
            );
        }

        let vote = VoteResponse {
            term: 3,
            granted: true,
        };
        assert_eq!(VoteResponse::parse(&vote.to_resp()).unwrap(), vote);
    }

    #[test]
    fn vote_request_round_trip() {
        let request = VoteRequest {
            cluster_id: "cluster-1".to_string(),
            candidate: "n2:1002".parse().unwrap(),
            term: 7,
            last_index: 100,
            last_term: 6,
        };
        assert_eq!(
            VoteRequest::parse(&request.to_redis_request()).unwrap(),
            request
        );
    }

    #[test]
    fn entry_count_must_match() {
        let request = AppendEntriesRequest {
            cluster_id: "c".to_string(),
            leader: "n1:1001".parse().unwrap(),
            term: 1,
            prev_index: 0,
            prev_term: 0,
            commit_index: 0,
            entries: vec![RaftEntry::new(1, Req::from(["set", "a", "1"]))],
        };
        let wire = request.to_redis_request().unwrap();
        let mut parts = wire.to_parts();
        parts[7] = b"3".to_vec();
        assert!(AppendEntriesRequest::parse(&RedisRequest::from(parts)).is_err());
    }
}
