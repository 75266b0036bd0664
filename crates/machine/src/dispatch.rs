//! Request-level dispatch into the state machine.
//!
//! Reads run against a read-only staging area; writes arrive with a
//! log index, run inside a read-write staging area and commit even
//! when the command itself fails client-side, so the index advances
//! identically on every replica. Transactions share one staging area
//! across all their sub-requests.

use std::sync::Arc;

use bytes::Bytes;
use quarkdb_core::resp::{formatter, RespValue};
use quarkdb_core::{LogIndex, RedisCommand, RedisRequest, Transaction};

use crate::machine::StateMachine;
use crate::parsing::parse_scan_args;
use crate::staging::StagingArea;
use crate::{LeaseAcquisition, MachineError};

#[derive(Clone)]
pub struct RedisDispatcher {
    machine: Arc<StateMachine>,
}

impl RedisDispatcher {
    pub fn new(machine: Arc<StateMachine>) -> Self {
        RedisDispatcher { machine }
    }

    pub fn machine(&self) -> &Arc<StateMachine> {
        &self.machine
    }

    /// Serve a read-only request from a fresh snapshot. Returns one
    /// reply per expected response slot: phantom transactions fan out.
    pub fn serve_read(&self, request: &RedisRequest) -> Vec<RespValue> {
        let staging = self.machine.staging_read();

        if request.command() == Some(RedisCommand::TxReadonly) {
            return match Transaction::from_redis_request(request) {
                Err(err) => vec![formatter::err(err.to_string())],
                Ok(tx) => {
                    let replies: Vec<RespValue> = tx
                        .requests()
                        .iter()
                        .map(|sub| self.dispatch_read(&staging, sub))
                        .collect();
                    package_tx_replies(&tx, replies)
                }
            };
        }

        vec![self.dispatch_read(&staging, request)]
    }

    /// Apply one committed journal entry. Client-side failures become
    /// error replies and the index still advances; only infrastructure
    /// failures surface as `Err`, and those are grounds for shutdown.
    pub fn apply_write(
        &self,
        index: LogIndex,
        request: &RedisRequest,
    ) -> Result<Vec<RespValue>, MachineError> {
        let mut staging = self.machine.staging_write();

        let replies = match request.command() {
            Some(RedisCommand::TxReadwrite) | Some(RedisCommand::TxReadonly) => {
                match Transaction::from_redis_request(request) {
                    Err(err) => {
                        staging.rollback();
                        vec![formatter::err(err.to_string())]
                    }
                    Ok(tx) => {
                        let mut replies = Vec::with_capacity(tx.len());
                        for sub in tx.requests() {
                            let reply = if sub.is_write() {
                                self.try_write(&mut staging, sub)?
                            } else {
                                self.dispatch_read(&staging, sub)
                            };
                            replies.push(reply);
                        }
                        package_tx_replies(&tx, replies)
                    }
                }
            }
            _ => {
                let reply = self.try_write(&mut staging, request)?;
                if reply.is_error() {
                    // no state change escapes a failed command
                    staging.rollback();
                }
                vec![reply]
            }
        };

        self.machine.commit_staging(staging, index)?;
        Ok(replies)
    }

    /// Apply a write outside the journal (standalone mode, tooling).
    /// Commits at index zero: no last-applied bookkeeping.
    pub fn apply_direct(&self, request: &RedisRequest) -> Result<Vec<RespValue>, MachineError> {
        self.apply_write(0, request)
    }

    /// A write, with client errors folded into the reply.
    fn try_write(
        &self,
        staging: &mut StagingArea<'_>,
        request: &RedisRequest,
    ) -> Result<RespValue, MachineError> {
        match self.dispatch_write(staging, request) {
            Ok(reply) => Ok(reply),
            Err(err) if err.is_client_error() => Ok(err.to_resp()),
            Err(err) => Err(err),
        }
    }

    fn dispatch_write(
        &self,
        staging: &mut StagingArea<'_>,
        request: &RedisRequest,
    ) -> Result<RespValue, MachineError> {
        let machine = &self.machine;
        let Some(command) = request.command() else {
            return Ok(unknown_command(request));
        };

        let reply = match command {
            RedisCommand::Set => {
                require_args(request, 3)?;
                machine.set(staging, request.arg(1), request.arg(2))?;
                formatter::ok()
            }
            RedisCommand::Del => {
                require_at_least(request, 2)?;
                let keys = collect_args(request, 1);
                formatter::integer(machine.del(staging, &keys)?)
            }
            RedisCommand::Flushall => {
                require_args(request, 1)?;
                machine.flushall(staging)?;
                formatter::ok()
            }
            RedisCommand::Hset => {
                require_args(request, 4)?;
                let created =
                    machine.hset(staging, request.arg(1), request.arg(2), request.arg(3))?;
                formatter::integer(created as i64)
            }
            RedisCommand::Hsetnx => {
                require_args(request, 4)?;
                let set =
                    machine.hsetnx(staging, request.arg(1), request.arg(2), request.arg(3))?;
                formatter::integer(set as i64)
            }
            RedisCommand::Hmset => {
                if request.len() < 4 || request.len() % 2 != 0 {
                    return Err(arity(request));
                }
                let pairs: Vec<(&[u8], &[u8])> = request.tail(2)
                    .chunks(2)
                    .map(|chunk| (chunk[0].as_ref(), chunk[1].as_ref()))
                    .collect();
                machine.hmset(staging, request.arg(1), &pairs)?;
                formatter::ok()
            }
            RedisCommand::Hdel => {
                require_at_least(request, 3)?;
                let fields = collect_args(request, 2);
                formatter::integer(machine.hdel(staging, request.arg(1), &fields)?)
            }
            RedisCommand::Hincrby => {
                require_args(request, 4)?;
                let result =
                    machine.hincrby(staging, request.arg(1), request.arg(2), request.arg(3))?;
                formatter::integer(result)
            }
            RedisCommand::Hincrbyfloat => {
                require_args(request, 4)?;
                let result =
                    machine.hincrbyfloat(staging, request.arg(1), request.arg(2), request.arg(3))?;
                formatter::string(crate::machine::format_float(result))
            }
            RedisCommand::Hincrbymulti => {
                if request.len() < 4 || (request.len() - 1) % 3 != 0 {
                    return Err(arity(request));
                }
                let steps: Vec<(&[u8], &[u8], &[u8])> = request.tail(1)
                    .chunks(3)
                    .map(|chunk| (chunk[0].as_ref(), chunk[1].as_ref(), chunk[2].as_ref()))
                    .collect();
                formatter::integer(machine.hincrbymulti(staging, &steps)?)
            }
            RedisCommand::Hclone => {
                require_args(request, 3)?;
                if machine.hclone(staging, request.arg(1), request.arg(2))? {
                    formatter::ok()
                } else {
                    formatter::err("no such key")
                }
            }
            RedisCommand::Sadd => {
                require_at_least(request, 3)?;
                let members = collect_args(request, 2);
                formatter::integer(machine.sadd(staging, request.arg(1), &members)?)
            }
            RedisCommand::Srem => {
                require_at_least(request, 3)?;
                let members = collect_args(request, 2);
                formatter::integer(machine.srem(staging, request.arg(1), &members)?)
            }
            RedisCommand::Smove => {
                require_args(request, 4)?;
                let moved =
                    machine.smove(staging, request.arg(1), request.arg(2), request.arg(3))?;
                formatter::integer(moved as i64)
            }
            RedisCommand::Lpush => {
                require_at_least(request, 3)?;
                let items = collect_args(request, 2);
                formatter::integer(machine.lpush(staging, request.arg(1), &items)?)
            }
            RedisCommand::Rpush => {
                require_at_least(request, 3)?;
                let items = collect_args(request, 2);
                formatter::integer(machine.rpush(staging, request.arg(1), &items)?)
            }
            RedisCommand::Lpop => {
                require_args(request, 2)?;
                option_to_bulk(machine.lpop(staging, request.arg(1))?)
            }
            RedisCommand::Rpop => {
                require_args(request, 2)?;
                option_to_bulk(machine.rpop(staging, request.arg(1))?)
            }
            RedisCommand::Lhset => {
                require_args(request, 5)?;
                let created = machine.lhset(
                    staging,
                    request.arg(1),
                    request.arg(2),
                    request.arg(3),
                    request.arg(4),
                )?;
                formatter::integer(created as i64)
            }
            RedisCommand::Lhdel => {
                require_at_least(request, 3)?;
                let fields = collect_args(request, 2);
                formatter::integer(machine.lhdel(staging, request.arg(1), &fields)?)
            }
            RedisCommand::Vhset => {
                require_args(request, 4)?;
                let version =
                    machine.vhset(staging, request.arg(1), request.arg(2), request.arg(3))?;
                formatter::integer(version as i64)
            }
            RedisCommand::Vhdel => {
                require_at_least(request, 3)?;
                let fields = collect_args(request, 2);
                formatter::integer(machine.vhdel(staging, request.arg(1), &fields)?)
            }
            RedisCommand::ConfigSet => {
                require_args(request, 3)?;
                machine.config_set(staging, request.arg(1), request.arg(2))?;
                formatter::ok()
            }
            RedisCommand::TimestampedLeaseAcquire => {
                require_args(request, 5)?;
                let duration = parse_u64_arg(request.arg(3))?;
                let timestamp = parse_clock_arg(request.arg(4))?;
                staging.bump_clock(timestamp);
                match machine.lease_acquire(
                    staging,
                    request.arg(1),
                    request.arg(2),
                    duration,
                    timestamp,
                )? {
                    LeaseAcquisition::Acquired { .. } => formatter::status("ACQUIRED"),
                    LeaseAcquisition::Renewed { .. } => formatter::status("RENEWED"),
                    LeaseAcquisition::Busy {
                        holder,
                        remaining_ms,
                    } => formatter::err(format!(
                        "lease held by '{}', time remaining {} ms",
                        String::from_utf8_lossy(&holder),
                        remaining_ms
                    )),
                }
            }
            RedisCommand::TimestampedLeaseGet => {
                require_args(request, 3)?;
                let timestamp = parse_clock_arg(request.arg(2))?;
                staging.bump_clock(timestamp);
                match machine.lease_get(staging, request.arg(1), timestamp)? {
                    None => formatter::null(),
                    Some(info) => formatter::array(vec![
                        formatter::string(info.holder),
                        formatter::string(info.deadline.to_string()),
                    ]),
                }
            }
            RedisCommand::TimestampedLeaseRelease => {
                require_args(request, 3)?;
                let timestamp = parse_clock_arg(request.arg(2))?;
                staging.bump_clock(timestamp);
                if machine.lease_release(staging, request.arg(1), timestamp)? {
                    formatter::ok()
                } else {
                    formatter::null()
                }
            }
            RedisCommand::ConvertHashFieldToLhash => {
                require_args(request, 5)?;
                let converted = machine.convert_hash_field_to_lhash(
                    staging,
                    request.arg(1),
                    request.arg(2),
                    request.arg(3),
                    request.arg(4),
                )?;
                formatter::integer(converted as i64)
            }
            RedisCommand::JournalLeadershipMarker => {
                require_args(request, 2)?;
                let observed = parse_clock_arg(request.arg(1))?;
                machine.apply_leadership_marker(staging, observed)?;
                formatter::ok()
            }
            RedisCommand::RaftMembership => {
                // the journal layer consumes the payload at commit
                // time; the state machine only advances its index
                formatter::ok()
            }
            RedisCommand::LeaseAcquire
            | RedisCommand::LeaseGet
            | RedisCommand::LeaseRelease => {
                // these must be rewritten into their timestamped forms
                // before they ever reach the state machine
                formatter::err(format!(
                    "internal dispatching error, raw lease command '{}' hit the state machine",
                    command
                ))
            }
            _ => unknown_command(request),
        };
        Ok(reply)
    }

    fn dispatch_read(&self, staging: &StagingArea<'_>, request: &RedisRequest) -> RespValue {
        match self.dispatch_read_inner(staging, request) {
            Ok(reply) => reply,
            Err(err) => err.to_resp(),
        }
    }

    fn dispatch_read_inner(
        &self,
        staging: &StagingArea<'_>,
        request: &RedisRequest,
    ) -> Result<RespValue, MachineError> {
        let machine = &self.machine;
        let Some(command) = request.command() else {
            return Ok(unknown_command(request));
        };

        let reply = match command {
            RedisCommand::Get => {
                require_args(request, 2)?;
                option_to_bulk(machine.get(staging, request.arg(1))?)
            }
            RedisCommand::Exists => {
                require_at_least(request, 2)?;
                let keys = collect_args(request, 1);
                formatter::integer(machine.exists(staging, &keys)?)
            }
            RedisCommand::Keys => {
                require_args(request, 2)?;
                formatter::vector(machine.keys(staging, request.arg(1))?)
            }
            RedisCommand::Scan => {
                require_at_least(request, 2)?;
                let args = parse_scan_args(request.tail(1), true)?;
                let (next, keys) =
                    machine.scan(staging, &args.cursor, &args.pattern, args.count)?;
                scan_reply(next, keys)
            }
            RedisCommand::Type => {
                require_args(request, 2)?;
                match machine.key_type(staging, request.arg(1))? {
                    None => formatter::status("none"),
                    Some(key_type) => formatter::status(key_type.name()),
                }
            }
            RedisCommand::Hget => {
                require_args(request, 3)?;
                option_to_bulk(machine.hget(staging, request.arg(1), request.arg(2))?)
            }
            RedisCommand::Hexists => {
                require_args(request, 3)?;
                let exists = machine.hexists(staging, request.arg(1), request.arg(2))?;
                formatter::integer(exists as i64)
            }
            RedisCommand::Hkeys => {
                require_args(request, 2)?;
                formatter::vector(machine.hkeys(staging, request.arg(1))?)
            }
            RedisCommand::Hvals => {
                require_args(request, 2)?;
                formatter::vector(machine.hvals(staging, request.arg(1))?)
            }
            RedisCommand::Hgetall => {
                require_args(request, 2)?;
                formatter::vector(machine.hgetall(staging, request.arg(1))?)
            }
            RedisCommand::Hlen => {
                require_args(request, 2)?;
                formatter::integer(machine.hlen(staging, request.arg(1))?)
            }
            RedisCommand::Hscan => {
                require_at_least(request, 3)?;
                let args = parse_scan_args(request.tail(2), false)?;
                let (next, items) =
                    machine.hscan(staging, request.arg(1), &args.cursor, args.count)?;
                scan_reply(next, items)
            }
            RedisCommand::Sismember => {
                require_args(request, 3)?;
                let member = machine.sismember(staging, request.arg(1), request.arg(2))?;
                formatter::integer(member as i64)
            }
            RedisCommand::Smembers => {
                require_args(request, 2)?;
                formatter::vector(machine.smembers(staging, request.arg(1))?)
            }
            RedisCommand::Scard => {
                require_args(request, 2)?;
                formatter::integer(machine.scard(staging, request.arg(1))?)
            }
            RedisCommand::Sscan => {
                require_at_least(request, 3)?;
                let args = parse_scan_args(request.tail(2), false)?;
                let (next, members) =
                    machine.sscan(staging, request.arg(1), &args.cursor, args.count)?;
                scan_reply(next, members)
            }
            RedisCommand::Llen => {
                require_args(request, 2)?;
                formatter::integer(machine.llen(staging, request.arg(1))?)
            }
            RedisCommand::Lhget => {
                if request.len() != 3 && request.len() != 4 {
                    return Err(arity(request));
                }
                let hint = (request.len() == 4).then(|| request.arg(3));
                option_to_bulk(machine.lhget(staging, request.arg(1), request.arg(2), hint)?)
            }
            RedisCommand::Lhlen => {
                require_args(request, 2)?;
                formatter::integer(machine.lhlen(staging, request.arg(1))?)
            }
            RedisCommand::Lhgetall => {
                require_args(request, 2)?;
                formatter::vector(machine.lhgetall(staging, request.arg(1))?)
            }
            RedisCommand::Lhscan => {
                require_at_least(request, 3)?;
                let args = parse_scan_args(request.tail(2), false)?;
                let (next, items) =
                    machine.lhscan(staging, request.arg(1), &args.cursor, args.count)?;
                scan_reply(next, items)
            }
            RedisCommand::Vhget => {
                require_args(request, 3)?;
                option_to_bulk(machine.vhget(staging, request.arg(1), request.arg(2))?)
            }
            RedisCommand::Vhgetall => {
                require_args(request, 2)?;
                let (_, pairs) = machine.vhgetall(staging, request.arg(1))?;
                formatter::vector(pairs)
            }
            RedisCommand::Vhlen => {
                require_args(request, 2)?;
                formatter::integer(machine.vhlen(staging, request.arg(1))?)
            }
            RedisCommand::ConfigGet => {
                require_args(request, 2)?;
                option_to_bulk(machine.config_get(staging, request.arg(1))?)
            }
            RedisCommand::ConfigGetall => {
                require_args(request, 1)?;
                formatter::vector(machine.config_getall(staging)?)
            }
            RedisCommand::ClockGet => {
                require_args(request, 1)?;
                formatter::integer(machine.read_clock(staging)? as i64)
            }
            RedisCommand::RawScan => {
                require_at_least(request, 2)?;
                let args = parse_scan_args(request.tail(1), false)?;
                let (next, rows) = machine.raw_scan(staging, &args.cursor, args.count)?;
                scan_reply(next, rows)
            }
            RedisCommand::ConvertStringToInt => {
                require_args(request, 2)?;
                let raw = request.arg(1);
                let array: [u8; 8] = raw
                    .try_into()
                    .map_err(|_| MachineError::Malformed("expected an 8-byte value".to_string()))?;
                formatter::integer(i64::from_be_bytes(array))
            }
            RedisCommand::ConvertIntToString => {
                require_args(request, 2)?;
                let value = crate::machine::parse_integer(request.arg(1))
                    .ok_or(MachineError::NotInteger)?;
                formatter::string(value.to_be_bytes().to_vec())
            }
            _ => unknown_command(request),
        };
        Ok(reply)
    }
}

/// Flat replies for phantom transactions, one array otherwise.
fn package_tx_replies(tx: &quarkdb_core::Transaction, replies: Vec<RespValue>) -> Vec<RespValue> {
    if tx.is_phantom() {
        replies
    } else {
        vec![formatter::array(replies)]
    }
}

fn unknown_command(request: &RedisRequest) -> RespValue {
    let name = if request.is_empty() {
        String::new()
    } else {
        String::from_utf8_lossy(request.arg(0)).into_owned()
    };
    formatter::err(format!("unknown command '{name}'"))
}

fn arity(request: &RedisRequest) -> MachineError {
    let name = request
        .command()
        .map(|cmd| cmd.name().to_string())
        .unwrap_or_default();
    MachineError::Malformed(format!("wrong number of arguments for '{name}' command"))
}

fn require_args(request: &RedisRequest, expected: usize) -> Result<(), MachineError> {
    if request.len() != expected {
        return Err(arity(request));
    }
    Ok(())
}

fn require_at_least(request: &RedisRequest, minimum: usize) -> Result<(), MachineError> {
    if request.len() < minimum {
        return Err(arity(request));
    }
    Ok(())
}

fn collect_args(request: &RedisRequest, from: usize) -> Vec<&[u8]> {
    request.tail(from).iter().map(|arg| arg.as_ref()).collect()
}

fn option_to_bulk(value: Option<Vec<u8>>) -> RespValue {
    match value {
        None => formatter::null(),
        Some(payload) => formatter::string(payload),
    }
}

fn scan_reply(next: Option<Vec<u8>>, items: Vec<Vec<u8>>) -> RespValue {
    let cursor = match next {
        None => Bytes::from_static(b"0"),
        Some(resume) => {
            let mut cursor = Vec::with_capacity(5 + resume.len());
            cursor.extend_from_slice(b"next:");
            cursor.extend_from_slice(&resume);
            Bytes::from(cursor)
        }
    };
    RespValue::Array(vec![RespValue::Bulk(cursor), formatter::vector(items)])
}

/// The binary u64 the leader appends to timestamped commands.
fn parse_clock_arg(raw: &[u8]) -> Result<u64, MachineError> {
    let array: [u8; 8] = raw
        .try_into()
        .map_err(|_| MachineError::Malformed("malformed clock value".to_string()))?;
    Ok(u64::from_be_bytes(array))
}

/// Plain decimal u64, e.g. a lease duration.
fn parse_u64_arg(raw: &[u8]) -> Result<u64, MachineError> {
    let value = crate::machine::parse_integer(raw).ok_or(MachineError::NotInteger)?;
    u64::try_from(value).map_err(|_| MachineError::NotInteger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateMachineOptions;

    fn scratch() -> (tempfile::TempDir, RedisDispatcher) {
        let dir = tempfile::tempdir().unwrap();
        let machine = Arc::new(
            StateMachine::open(dir.path().join("sm"), StateMachineOptions::default()).unwrap(),
        );
        (dir, RedisDispatcher::new(machine))
    }

    fn write(dispatcher: &RedisDispatcher, index: LogIndex, parts: &[&str]) -> RespValue {
        let request = RedisRequest::from_parts(
            parts
                .iter()
                .map(|part| Bytes::copy_from_slice(part.as_bytes()))
                .collect::<Vec<_>>(),
        );
        dispatcher
            .apply_write(index, &request)
            .unwrap()
            .pop()
            .unwrap()
    }

    fn read(dispatcher: &RedisDispatcher, parts: &[&str]) -> RespValue {
        let request = RedisRequest::from_parts(
            parts
                .iter()
                .map(|part| Bytes::copy_from_slice(part.as_bytes()))
                .collect::<Vec<_>>(),
        );
        dispatcher.serve_read(&request).pop().unwrap()
    }

    #[test]
    fn basic_crud_scenario() {
        let (_dir, dispatcher) = scratch();

        assert_eq!(write(&dispatcher, 1, &["flushall"]), formatter::ok());
        assert_eq!(write(&dispatcher, 2, &["set", "abc", "12345"]), formatter::ok());
        assert_eq!(read(&dispatcher, &["get", "abc"]), formatter::string("12345"));
        assert_eq!(
            read(&dispatcher, &["exists", "abc", "qqq"]),
            formatter::integer(1)
        );
        assert_eq!(
            write(&dispatcher, 3, &["del", "abc", "qqq"]),
            formatter::integer(1)
        );
        assert_eq!(read(&dispatcher, &["exists", "abc"]), formatter::integer(0));
    }

    #[test]
    fn hash_scan_scenario() {
        let (_dir, dispatcher) = scratch();

        for i in 1..=9 {
            let reply = write(
                &dispatcher,
                i,
                &["hset", "hash", &format!("f{i}"), &format!("v{i}")],
            );
            assert_eq!(reply, formatter::integer(1));
        }
        assert_eq!(read(&dispatcher, &["hlen", "hash"]), formatter::integer(9));

        assert_eq!(
            read(&dispatcher, &["hscan", "hash", "0", "COUNT", "3"]),
            formatter::scan(
                "next:f4",
                vec!["f1", "v1", "f2", "v2", "f3", "v3"]
            )
        );
        assert_eq!(
            read(&dispatcher, &["hscan", "hash", "next:f4", "COUNT", "4"]),
            formatter::scan(
                "next:f8",
                vec!["f4", "v4", "f5", "v5", "f6", "v6", "f7", "v7"]
            )
        );
        assert_eq!(
            read(&dispatcher, &["hscan", "hash", "next:f8", "COUNT", "4"]),
            formatter::scan("0", vec!["f8", "v8", "f9", "v9"])
        );
    }

    #[test]
    fn type_mismatch_still_advances_the_index() {
        let (_dir, dispatcher) = scratch();

        assert_eq!(
            write(&dispatcher, 1, &["hset", "h", "f", "v"]),
            formatter::integer(1)
        );
        assert_eq!(write(&dispatcher, 2, &["set", "h", "wrong"]), {
            formatter::wrong_type()
        });

        // index advanced despite the error, state unchanged
        assert_eq!(dispatcher.machine().last_applied(), 2);
        assert_eq!(read(&dispatcher, &["hget", "h", "f"]), formatter::string("v"));
        assert_eq!(
            write(&dispatcher, 3, &["set", "ok", "1"]),
            formatter::ok()
        );
    }

    #[test]
    fn deque_scenario() {
        let (_dir, dispatcher) = scratch();

        assert_eq!(
            write(&dispatcher, 1, &["rpush", "q", "a", "b", "c", "d"]),
            formatter::integer(4)
        );
        assert_eq!(write(&dispatcher, 2, &["lpop", "q"]), formatter::string("a"));
        assert_eq!(write(&dispatcher, 3, &["rpop", "q"]), formatter::string("d"));
        assert_eq!(read(&dispatcher, &["llen", "q"]), formatter::integer(2));
        assert_eq!(write(&dispatcher, 4, &["lpop", "q"]), formatter::string("b"));
        assert_eq!(write(&dispatcher, 5, &["lpop", "q"]), formatter::string("c"));
        assert_eq!(write(&dispatcher, 6, &["lpop", "q"]), formatter::null());
    }

    #[test]
    fn lease_scenario() {
        let (_dir, dispatcher) = scratch();

        let acquire = |index: LogIndex, holder: &str, ts: u64| {
            let request = RedisRequest::new(vec![
                Bytes::from_static(b"timestamped_lease_acquire"),
                Bytes::from_static(b"L"),
                Bytes::copy_from_slice(holder.as_bytes()),
                Bytes::from_static(b"10"),
                Bytes::copy_from_slice(&ts.to_be_bytes()),
            ]);
            dispatcher.apply_write(index, &request).unwrap().pop().unwrap()
        };

        assert_eq!(acquire(1, "holder-1", 1), formatter::status("ACQUIRED"));
        assert_eq!(acquire(2, "holder-1", 9), formatter::status("RENEWED"));
        assert_eq!(
            acquire(3, "holder-2", 12),
            RespValue::Error("ERR lease held by 'holder-1', time remaining 7 ms".to_string())
        );
    }

    #[test]
    fn scan_with_match_filters_but_counts_examined() {
        let (_dir, dispatcher) = scratch();

        for (i, key) in ["alpha", "beta", "alpine", "gamma"].iter().enumerate() {
            write(&dispatcher, (i + 1) as LogIndex, &["set", key, "x"]);
        }

        assert_eq!(
            read(&dispatcher, &["scan", "0", "MATCH", "al*"]),
            formatter::scan("0", vec!["alpha", "alpine"])
        );
        // unknown cursors are rejected, not treated as positions
        assert_eq!(
            read(&dispatcher, &["scan", "17"]),
            formatter::err("invalid cursor")
        );
    }

    #[test]
    fn phantom_transactions_fan_out_flat() {
        let (_dir, dispatcher) = scratch();

        let mut tx = quarkdb_core::Transaction::new();
        tx.push(RedisRequest::from(["set", "a", "1"]));
        tx.push(RedisRequest::from(["set", "b", "2"]));
        tx.set_phantom(true);

        let replies = dispatcher
            .apply_write(1, &tx.to_redis_request())
            .unwrap();
        assert_eq!(replies, vec![formatter::ok(), formatter::ok()]);
        assert_eq!(dispatcher.machine().last_applied(), 1);

        // a real transaction wraps its replies in one array
        let mut tx = quarkdb_core::Transaction::new();
        tx.push(RedisRequest::from(["get", "a"]));
        tx.push(RedisRequest::from(["set", "c", "3"]));
        tx.set_phantom(false);

        let replies = dispatcher
            .apply_write(2, &tx.to_redis_request())
            .unwrap();
        assert_eq!(
            replies,
            vec![formatter::array(vec![
                formatter::string("1"),
                formatter::ok()
            ])]
        );
    }
}
