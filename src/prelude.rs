pub use quarkdb_core::*;

use miette::Diagnostic;
use std::fmt::Display;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug, Diagnostic)]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("shard error: {0}")]
    ShardError(String),

    #[error("storage error: {0}")]
    StorageError(#[from] quarkdb_machine::MachineError),

    #[error("raft error: {0}")]
    RaftError(#[from] quarkdb_raft::RaftError),

    #[error("engine error: {0}")]
    EngineError(#[from] quarkdb_fjall::EngineError),

    #[error("{0}")]
    Message(String),
}

impl Error {
    pub fn config(text: impl Display) -> Error {
        Error::ConfigError(text.to_string())
    }

    pub fn server(error: impl Display) -> Error {
        Error::ServerError(error.to_string())
    }

    pub fn shard(error: impl Display) -> Error {
        Error::ShardError(error.to_string())
    }

    pub fn message(text: impl Into<String>) -> Error {
        Error::Message(text.into())
    }
}
