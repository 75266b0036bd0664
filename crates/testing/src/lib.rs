//! Shared test fixtures for the quarkdb crates: scratch stores on temp
//! directories and request builders.

use std::sync::Arc;

use quarkdb_core::RedisRequest;
use quarkdb_machine::{RedisDispatcher, StateMachine, StateMachineOptions};

/// A state machine over a temp directory. Keep the guard alive for as
/// long as the machine is used.
pub fn scratch_machine() -> (tempfile::TempDir, Arc<StateMachine>) {
    let dir = tempfile::tempdir().expect("creating scratch directory");
    let machine = StateMachine::open(
        dir.path().join("state-machine"),
        StateMachineOptions::default(),
    )
    .expect("opening scratch state machine");
    (dir, Arc::new(machine))
}

pub fn scratch_dispatcher() -> (tempfile::TempDir, RedisDispatcher) {
    let (dir, machine) = scratch_machine();
    (dir, RedisDispatcher::new(machine))
}

/// Build a request from string parts.
pub fn req(parts: &[&str]) -> RedisRequest {
    RedisRequest::from_parts(
        parts
            .iter()
            .map(|part| part.as_bytes().to_vec())
            .collect::<Vec<_>>(),
    )
}

/// Build a request whose final argument is a binary big-endian u64,
/// the shape of timestamped lease commands.
pub fn req_with_clock(parts: &[&str], clock: u64) -> RedisRequest {
    let mut args: Vec<Vec<u8>> = parts.iter().map(|part| part.as_bytes().to_vec()).collect();
    args.push(clock.to_be_bytes().to_vec());
    RedisRequest::from_parts(args)
}
