//! Request model: a parsed RESP command plus the command table.
//!
//! The command table is the single source of truth mapping command names
//! to `(RedisCommand, CommandType)`. A request is parsed exactly once, on
//! arrival; every downstream component switches on the enum.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use bytes::Bytes;

/// Every command quarkdb understands, user-visible or internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedisCommand {
    // strings
    Get,
    Set,
    Del,
    Exists,
    Keys,
    Scan,
    Flushall,
    Type,

    // hashes
    Hset,
    Hsetnx,
    Hmset,
    Hget,
    Hdel,
    Hexists,
    Hkeys,
    Hvals,
    Hgetall,
    Hlen,
    Hscan,
    Hincrby,
    Hincrbyfloat,
    Hincrbymulti,
    Hclone,

    // sets
    Sadd,
    Srem,
    Smove,
    Sismember,
    Smembers,
    Scard,
    Sscan,

    // deques
    Lpush,
    Rpush,
    Lpop,
    Rpop,
    Llen,

    // locality hashes
    Lhset,
    Lhget,
    Lhdel,
    Lhlen,
    Lhscan,
    Lhgetall,

    // versioned hashes
    Vhset,
    Vhdel,
    Vhget,
    Vhgetall,
    Vhlen,

    // leases, user-facing forms rewritten by the leader
    LeaseAcquire,
    LeaseGet,
    LeaseRelease,
    TimestampedLeaseAcquire,
    TimestampedLeaseGet,
    TimestampedLeaseRelease,

    // configuration namespace
    ConfigGet,
    ConfigSet,
    ConfigGetall,

    // transactions, only ever built server-side
    TxReadonly,
    TxReadwrite,

    // conversion helpers and debugging aids
    ConvertStringToInt,
    ConvertIntToString,
    ConvertHashFieldToLhash,
    RawScan,
    ClockGet,

    // journal markers
    JournalLeadershipMarker,
    RaftMembership,

    // raft peer-to-peer
    RaftAppendEntries,
    RaftRequestVote,
    RaftHandshake,
    RaftFetch,
    RaftAddObserver,
    RaftRemoveMember,
    RaftPromoteObserver,
    RaftInfo,
    ResilveringStart,
    ResilveringCopy,
    ResilveringFinish,
    ResilveringCancel,

    // authentication
    Auth,
    HmacAuthGenerateChallenge,
    HmacAuthValidateChallenge,

    // control
    Ping,
    ClientId,
    QuarkdbInfo,
    QuarkdbCheckpoint,
}

/// Broad classification driving routing in the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    /// Served from a state machine snapshot, never journaled.
    Read,
    /// Goes through the raft journal before touching the state machine.
    Write,
    /// Node-local control plane, no state machine involvement.
    Control,
    /// Peer-to-peer raft traffic.
    Raft,
    /// Allowed before authentication completes.
    Authentication,
}

macro_rules! command_table {
    ($(($name:literal, $cmd:ident, $kind:ident)),* $(,)?) => {
        const COMMANDS: &[(&str, RedisCommand, CommandType)] = &[
            $(($name, RedisCommand::$cmd, CommandType::$kind)),*
        ];
    };
}

command_table! {
    ("get", Get, Read),
    ("set", Set, Write),
    ("del", Del, Write),
    ("exists", Exists, Read),
    ("keys", Keys, Read),
    ("scan", Scan, Read),
    ("flushall", Flushall, Write),
    ("type", Type, Read),

    ("hset", Hset, Write),
    ("hsetnx", Hsetnx, Write),
    ("hmset", Hmset, Write),
    ("hget", Hget, Read),
    ("hdel", Hdel, Write),
    ("hexists", Hexists, Read),
    ("hkeys", Hkeys, Read),
    ("hvals", Hvals, Read),
    ("hgetall", Hgetall, Read),
    ("hlen", Hlen, Read),
    ("hscan", Hscan, Read),
    ("hincrby", Hincrby, Write),
    ("hincrbyfloat", Hincrbyfloat, Write),
    ("hincrbymulti", Hincrbymulti, Write),
    ("hclone", Hclone, Write),

    ("sadd", Sadd, Write),
    ("srem", Srem, Write),
    ("smove", Smove, Write),
    ("sismember", Sismember, Read),
    ("smembers", Smembers, Read),
    ("scard", Scard, Read),
    ("sscan", Sscan, Read),

    ("lpush", Lpush, Write),
    ("rpush", Rpush, Write),
    ("lpop", Lpop, Write),
    ("rpop", Rpop, Write),
    ("llen", Llen, Read),

    ("lhset", Lhset, Write),
    ("lhget", Lhget, Read),
    ("lhdel", Lhdel, Write),
    ("lhlen", Lhlen, Read),
    ("lhscan", Lhscan, Read),
    ("lhgetall", Lhgetall, Read),

    ("vhset", Vhset, Write),
    ("vhdel", Vhdel, Write),
    ("vhget", Vhget, Read),
    ("vhgetall", Vhgetall, Read),
    ("vhlen", Vhlen, Read),

    // lease reads can expire leases, so every lease command is a write
    ("lease_acquire", LeaseAcquire, Write),
    ("lease_get", LeaseGet, Write),
    ("lease_release", LeaseRelease, Write),
    ("timestamped_lease_acquire", TimestampedLeaseAcquire, Write),
    ("timestamped_lease_get", TimestampedLeaseGet, Write),
    ("timestamped_lease_release", TimestampedLeaseRelease, Write),

    ("config_get", ConfigGet, Read),
    ("config_set", ConfigSet, Write),
    ("config_getall", ConfigGetall, Read),

    ("tx_readonly", TxReadonly, Read),
    ("tx_readwrite", TxReadwrite, Write),

    ("convert-string-to-int", ConvertStringToInt, Read),
    ("convert-int-to-string", ConvertIntToString, Read),
    ("convert-hash-field-to-lhash", ConvertHashFieldToLhash, Write),
    ("raw-scan", RawScan, Read),
    ("clock-get", ClockGet, Read),

    ("journal_leadership_marker", JournalLeadershipMarker, Write),
    ("raft_membership", RaftMembership, Write),

    ("raft_append_entries", RaftAppendEntries, Raft),
    ("raft_request_vote", RaftRequestVote, Raft),
    ("raft_handshake", RaftHandshake, Raft),
    ("raft_fetch", RaftFetch, Raft),
    ("raft_add_observer", RaftAddObserver, Raft),
    ("raft_remove_member", RaftRemoveMember, Raft),
    ("raft_promote_observer", RaftPromoteObserver, Raft),
    ("raft_info", RaftInfo, Raft),
    ("resilvering_start", ResilveringStart, Raft),
    ("resilvering_copy", ResilveringCopy, Raft),
    ("resilvering_finish", ResilveringFinish, Raft),
    ("resilvering_cancel", ResilveringCancel, Raft),

    ("auth", Auth, Authentication),
    ("hmac_auth_generate_challenge", HmacAuthGenerateChallenge, Authentication),
    ("hmac_auth_validate_challenge", HmacAuthValidateChallenge, Authentication),

    ("ping", Ping, Control),
    ("client_id", ClientId, Control),
    ("quarkdb_info", QuarkdbInfo, Control),
    ("quarkdb_checkpoint", QuarkdbCheckpoint, Control),
}

static COMMAND_INDEX: LazyLock<HashMap<&'static str, (RedisCommand, CommandType)>> =
    LazyLock::new(|| {
        COMMANDS
            .iter()
            .map(|(name, cmd, kind)| (*name, (*cmd, *kind)))
            .collect()
    });

impl RedisCommand {
    /// Look up a command by its wire name, case-insensitively.
    pub fn parse(name: &[u8]) -> Option<(RedisCommand, CommandType)> {
        let lowered = String::from_utf8_lossy(name).to_lowercase();
        COMMAND_INDEX.get(lowered.as_str()).copied()
    }

    pub fn name(&self) -> &'static str {
        COMMANDS
            .iter()
            .find(|(_, cmd, _)| cmd == self)
            .map(|(name, _, _)| *name)
            .unwrap_or("invalid")
    }

    /// Commands that may only originate inside the server itself: the
    /// dispatcher must reject them when they arrive from a client.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            RedisCommand::TimestampedLeaseAcquire
                | RedisCommand::TimestampedLeaseGet
                | RedisCommand::TimestampedLeaseRelease
                | RedisCommand::TxReadonly
                | RedisCommand::TxReadwrite
                | RedisCommand::JournalLeadershipMarker
                | RedisCommand::RaftMembership
                | RedisCommand::ConvertHashFieldToLhash
        )
    }
}

impl fmt::Display for RedisCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single parsed request: the raw argument slices plus the outcome of
/// the one-time command table lookup. Argument buffers are refcounted
/// slices into the connection's read buffer, so cloning a request is
/// cheap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedisRequest {
    args: Vec<Bytes>,
    command: Option<(RedisCommand, CommandType)>,
}

impl RedisRequest {
    pub fn new(args: Vec<Bytes>) -> Self {
        let mut req = RedisRequest {
            args,
            command: None,
        };
        req.parse_command();
        req
    }

    pub fn from_parts<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        Self::new(parts.into_iter().map(Into::into).collect())
    }

    fn parse_command(&mut self) {
        self.command = self
            .args
            .first()
            .and_then(|name| RedisCommand::parse(name));
    }

    /// Replace the command word, e.g. when the leader rewrites a lease
    /// command into its timestamped form.
    pub fn rename_command(&mut self, name: &'static str) {
        if self.args.is_empty() {
            self.args.push(Bytes::from_static(name.as_bytes()));
        } else {
            self.args[0] = Bytes::from_static(name.as_bytes());
        }
        self.parse_command();
    }

    pub fn push_arg(&mut self, arg: impl Into<Bytes>) {
        self.args.push(arg.into());
    }

    pub fn command(&self) -> Option<RedisCommand> {
        self.command.map(|(cmd, _)| cmd)
    }

    pub fn command_type(&self) -> Option<CommandType> {
        self.command.map(|(_, kind)| kind)
    }

    pub fn is_write(&self) -> bool {
        self.command_type() == Some(CommandType::Write)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn arg(&self, index: usize) -> &[u8] {
        &self.args[index]
    }

    pub fn arg_bytes(&self, index: usize) -> Bytes {
        self.args[index].clone()
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Arguments from `index` onwards, typically the tail of a variadic
    /// command.
    pub fn tail(&self, index: usize) -> &[Bytes] {
        &self.args[index.min(self.args.len())..]
    }

    /// Lossy display form for logs.
    pub fn describe(&self) -> String {
        self.args
            .iter()
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Owned byte vectors, for journal serialization.
    pub fn to_parts(&self) -> Vec<Vec<u8>> {
        self.args.iter().map(|arg| arg.to_vec()).collect()
    }
}

impl From<Vec<Vec<u8>>> for RedisRequest {
    fn from(parts: Vec<Vec<u8>>) -> Self {
        Self::new(parts.into_iter().map(Bytes::from).collect())
    }
}

impl<const N: usize> From<[&str; N]> for RedisRequest {
    fn from(parts: [&str; N]) -> Self {
        Self::new(
            parts
                .iter()
                .map(|part| Bytes::copy_from_slice(part.as_bytes()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lookup_is_case_insensitive() {
        assert_eq!(
            RedisCommand::parse(b"GET"),
            Some((RedisCommand::Get, CommandType::Read))
        );
        assert_eq!(
            RedisCommand::parse(b"hSeT"),
            Some((RedisCommand::Hset, CommandType::Write))
        );
        assert_eq!(RedisCommand::parse(b"no-such-command"), None);
    }

    #[test]
    fn lease_commands_are_writes() {
        for name in ["lease_acquire", "lease_get", "lease_release"] {
            let (_, kind) = RedisCommand::parse(name.as_bytes()).unwrap();
            assert_eq!(kind, CommandType::Write);
        }
    }

    #[test]
    fn internal_commands_flagged() {
        assert!(RedisCommand::TimestampedLeaseGet.is_internal());
        assert!(RedisCommand::TxReadwrite.is_internal());
        assert!(!RedisCommand::Get.is_internal());
        assert!(!RedisCommand::LeaseAcquire.is_internal());
    }

    #[test]
    fn rename_reparses_command() {
        let mut req = RedisRequest::from(["lease_get", "mykey"]);
        assert_eq!(req.command(), Some(RedisCommand::LeaseGet));

        req.rename_command("timestamped_lease_get");
        assert_eq!(req.command(), Some(RedisCommand::TimestampedLeaseGet));
        assert_eq!(req.arg(1), b"mykey");
    }

    #[test]
    fn round_trips_through_parts() {
        let req = RedisRequest::from(["set", "abc", "12345"]);
        let back = RedisRequest::from(req.to_parts());
        assert_eq!(back, req);
        assert_eq!(back.command(), Some(RedisCommand::Set));
    }
}
