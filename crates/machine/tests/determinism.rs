//! End-to-end properties of the state machine: strict index ordering,
//! checkpoint equivalence, and scan completeness.

use std::sync::Arc;

use quarkdb_core::resp::formatter;
use quarkdb_core::LogIndex;
use quarkdb_machine::{MachineError, RedisDispatcher, StateMachine, StateMachineOptions};
use quarkdb_testing::req;

fn apply(dispatcher: &RedisDispatcher, index: LogIndex, parts: &[&str]) {
    dispatcher.apply_write(index, &req(parts)).unwrap();
}

#[test]
fn applying_the_same_index_twice_is_rejected() {
    let (_dir, dispatcher) = quarkdb_testing::scratch_dispatcher();

    apply(&dispatcher, 1, &["set", "a", "1"]);
    let outcome = dispatcher.apply_write(1, &req(&["set", "a", "2"]));
    assert!(matches!(outcome, Err(MachineError::IndexMismatch { .. })));

    // skipping ahead is just as fatal
    let outcome = dispatcher.apply_write(5, &req(&["set", "a", "2"]));
    assert!(matches!(outcome, Err(MachineError::IndexMismatch { .. })));

    apply(&dispatcher, 2, &["set", "a", "2"]);
    assert_eq!(dispatcher.machine().last_applied(), 2);
}

#[test]
fn replay_matches_checkpoint() {
    let scratch = tempfile::tempdir().unwrap();
    let machine = Arc::new(
        StateMachine::open(
            scratch.path().join("original"),
            StateMachineOptions::default(),
        )
        .unwrap(),
    );
    let dispatcher = RedisDispatcher::new(machine.clone());

    let script: Vec<Vec<&str>> = vec![
        vec!["set", "abc", "12345"],
        vec!["hset", "h", "f1", "v1"],
        vec!["hset", "h", "f2", "v2"],
        vec!["rpush", "q", "a", "b", "c"],
        vec!["lpop", "q"],
        vec!["sadd", "s", "m1", "m2"],
        vec!["hdel", "h", "f1"],
    ];
    for (i, parts) in script.iter().enumerate() {
        apply(&dispatcher, (i + 1) as LogIndex, parts);
    }

    // checkpoint, then reopen the copy and compare raw content
    let copy = scratch.path().join("copy");
    machine.checkpoint(&copy).unwrap();
    let restored = StateMachine::open(&copy, StateMachineOptions::default()).unwrap();

    assert_eq!(restored.last_applied(), script.len() as LogIndex);

    let original_rows: Vec<_> = machine
        .engine()
        .snapshot()
        .iter_all()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let restored_rows: Vec<_> = restored
        .engine()
        .snapshot()
        .iter_all()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(original_rows, restored_rows);
}

#[test]
fn scan_visits_every_key_exactly_once() {
    let (_dir, dispatcher) = quarkdb_testing::scratch_dispatcher();

    let mut expected = Vec::new();
    for i in 0..25 {
        let key = format!("key-{i:02}");
        apply(&dispatcher, (i + 1) as LogIndex, &["set", &key, "x"]);
        expected.push(key);
    }

    let machine = dispatcher.machine();
    let staging_source = machine.clone();
    let staging = staging_source.staging_read();

    let mut seen = Vec::new();
    let mut cursor: Vec<u8> = Vec::new();
    loop {
        let (next, page) = staging_source
            .scan(&staging, &cursor, b"", 7)
            .unwrap();
        seen.extend(page.into_iter().map(|key| String::from_utf8(key).unwrap()));
        match next {
            None => break,
            Some(resume) => cursor = resume,
        }
    }
    assert_eq!(seen, expected);
}

#[test]
fn wrongtype_replies_still_commit() {
    let (_dir, dispatcher) = quarkdb_testing::scratch_dispatcher();

    apply(&dispatcher, 1, &["sadd", "s", "member"]);
    let replies = dispatcher.apply_write(2, &req(&["get", "s"]));
    // GET is a read; as a journal entry it is unknown to the write path
    assert!(replies.is_ok());

    let replies = dispatcher
        .apply_write(3, &req(&["hset", "s", "f", "v"]))
        .unwrap();
    assert_eq!(replies, vec![formatter::wrong_type()]);
    assert_eq!(dispatcher.machine().last_applied(), 3);
}
