//! Raft consensus for quarkdb: the journal, role state, commit
//! tracking, leader read leases, replication, elections, the apply
//! loop, journal trimming and full-shard resilvering.
//!
//! The components are built and owned by the node's composition root;
//! each receives its dependencies at construction and runs as a tokio
//! task cancelled through a shared token.

use thiserror::Error;

use quarkdb_core::{LogIndex, RaftTerm};
use quarkdb_fjall::EngineError;
use quarkdb_machine::MachineError;

pub mod client;
pub mod commit_tracker;
pub mod director;
pub mod handler;
pub mod journal;
pub mod lease_register;
pub mod membership;
pub mod messages;
pub mod replicator;
pub mod resilverer;
pub mod state;
pub mod trimmer;
pub mod write_tracker;

pub use client::PeerClient;
pub use commit_tracker::CommitTracker;
pub use director::{Director, ElectionTiming};
pub use handler::RaftHandler;
pub use journal::{RaftEntry, RaftJournal};
pub use lease_register::LeaseRegister;
pub use membership::{propose_change, MembershipChange};
pub use replicator::{ReplicationManager, ResilverSpawner};
pub use state::{RaftRole, RaftState, RoleSnapshot};
pub use trimmer::{Trimmer, TrimmingFreeze};
pub use write_tracker::WriteTracker;

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("state machine error: {0}")]
    Machine(#[from] MachineError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal belongs to cluster '{found}', expected '{expected}'")]
    ClusterIdMismatch { expected: String, found: String },

    #[error("stale term {observed}, current is {current}")]
    StaleTerm {
        current: RaftTerm,
        observed: RaftTerm,
    },

    #[error("append at {got}, expected tail {expected}")]
    AppendMisordered { expected: LogIndex, got: LogIndex },

    #[error("index {index} outside [{log_start}, {log_size})")]
    OutOfBounds {
        index: LogIndex,
        log_start: LogIndex,
        log_size: LogIndex,
    },

    #[error("not the leader")]
    NotLeader,

    #[error("a membership change is already in flight")]
    MembershipChangeInFlight,

    #[error("a resilvering for this target is already running")]
    ResilveringInProgress,

    #[error("peer error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("corruption: {0}")]
    Corruption(String),
}
