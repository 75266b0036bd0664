//! Types and machinery that are common to all quarkdb crates.
//!
//! Glossary:
//!  - `LogIndex`: strictly-monotone position of an entry in the raft
//!    journal; also the unit of state-machine progress.
//!  - `ClockValue`: a monotone 64-bit counter used as the canonical
//!    timestamp source for lease commands; advanced by journaled markers.
//!  - `descriptor`: the single metadata record describing a user key's
//!    type, size and index positions.

pub mod cluster;
pub mod config;
pub mod error;
pub mod request;
pub mod resp;
pub mod transaction;

/// Position of an entry in the raft journal. Signed, like a file offset:
/// -1 shows up in raft RPCs as "no previous entry".
pub type LogIndex = i64;

/// Raft election term.
pub type RaftTerm = i64;

/// Milliseconds since an arbitrary epoch, used to timestamp leases.
/// Monotone per node; authoritative values travel inside journaled
/// commands only.
pub type ClockValue = u64;

pub use cluster::*;
pub use config::*;
pub use error::*;
pub use request::*;
pub use resp::*;
pub use transaction::*;
