//! The typed key-space and deterministic state machine of quarkdb.
//!
//! Layers, bottom up: physical key encoding (`keys`), descriptors, the
//! staging area in and out of the store, the state machine proper with
//! its command families, and the request-level dispatcher that turns
//! `RedisRequest`s into replies at a given log index.

use quarkdb_core::resp::{formatter, RespValue};
use quarkdb_core::LogIndex;
use quarkdb_fjall::EngineError;
use thiserror::Error;

pub mod descriptor;
pub mod dispatch;
pub mod keys;
pub mod machine;
pub mod parsing;
pub mod pattern;
pub mod revision;
pub mod scanner;
pub mod staging;
pub mod write_op;

pub use dispatch::RedisDispatcher;
pub use machine::{
    LeaseAcquisition, LeaseValue, StateMachine, StateMachineOptions,
};
pub use revision::{KeyRevision, NoopRevisionSink, RevisionSink, RevisionTracker};
pub use staging::StagingArea;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("value is not an integer or out of range")]
    NotInteger,

    #[error("value is not a valid float")]
    NotFloat,

    #[error("hash value is not an integer")]
    HashValueNotInteger,

    #[error("hash value is not a float")]
    HashValueNotFloat,

    #[error("invalid cursor")]
    InvalidCursor,

    #[error("syntax error")]
    SyntaxError,

    #[error("target key already exists")]
    KeyExists,

    #[error("deque index overflow")]
    DequeOverflow,

    #[error("cannot write through a read-only staging area")]
    ReadOnlyStaging,

    #[error("{0}")]
    BulkloadViolation(&'static str),

    #[error("log index mismatch: expected {expected}, got {got}")]
    IndexMismatch { expected: LogIndex, got: LogIndex },

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("malformed request: {0}")]
    Malformed(String),
}

impl MachineError {
    /// Client errors map to RESP error replies and still commit the
    /// surrounding batch, so the log index advances identically on
    /// every replica. Everything else is infrastructure trouble.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            MachineError::WrongType
                | MachineError::NotInteger
                | MachineError::NotFloat
                | MachineError::HashValueNotInteger
                | MachineError::HashValueNotFloat
                | MachineError::InvalidCursor
                | MachineError::SyntaxError
                | MachineError::KeyExists
                | MachineError::DequeOverflow
                | MachineError::Malformed(_)
        )
    }

    /// Errors that demand a process abort: continuing would diverge
    /// replicas or serve corrupt data.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MachineError::IndexMismatch { .. } | MachineError::Corruption(_)
        )
    }

    pub fn to_resp(&self) -> RespValue {
        match self {
            MachineError::WrongType => formatter::wrong_type(),
            err if err.is_client_error() => formatter::err(err.to_string()),
            err => formatter::unavailable(err.to_string()),
        }
    }
}
