//! End-to-end smoke tests: a real listener, a raw RESP client, and in
//! the cluster cases several nodes talking over loopback.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use quarkdb::prelude::*;
use quarkdb::serve::resp::Driver;
use quarkdb::shard::ShardDirectory;
use quarkdb::QuarkDbNode;
use quarkdb_core::resp::{decode_value, encode_request, RespValue};
use quarkdb_machine::{StateMachine, StateMachineOptions};
use quarkdb_raft::RaftJournal;

/// Minimal blocking RESP client for tests.
struct TestClient {
    stream: TcpStream,
    buffer: BytesMut,
}

impl TestClient {
    async fn connect(address: &str) -> TestClient {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match TcpStream::connect(address).await {
                Ok(stream) => {
                    return TestClient {
                        stream,
                        buffer: BytesMut::new(),
                    }
                }
                Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                Err(err) => panic!("cannot reach {address}: {err}"),
            }
        }
    }

    async fn command(&mut self, parts: &[&str]) -> RespValue {
        let args: Vec<bytes::Bytes> = parts
            .iter()
            .map(|part| bytes::Bytes::copy_from_slice(part.as_bytes()))
            .collect();
        let mut wire = BytesMut::new();
        encode_request(&args, &mut wire);
        self.stream.write_all(&wire).await.unwrap();

        loop {
            if let Some(value) = decode_value(&mut self.buffer).unwrap() {
                return value;
            }
            let read = self.stream.read_buf(&mut self.buffer).await.unwrap();
            assert!(read > 0, "server closed the connection");
        }
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn simple(text: &str) -> RespValue {
    RespValue::Simple(text.to_string())
}

fn bulk(text: &str) -> RespValue {
    RespValue::Bulk(bytes::Bytes::copy_from_slice(text.as_bytes()))
}

fn standalone_config(root: &Path, port: u16, password: Option<&str>) -> NodeConfig {
    NodeConfig {
        shard_directory: root.to_path_buf(),
        listen: format!("127.0.0.1:{port}"),
        myself: RaftServer::new("127.0.0.1", port),
        nodes: vec![],
        mode: NodeMode::Standalone,
        password: password.map(str::to_string),
        raft: Default::default(),
        storage: Default::default(),
        trimming: Default::default(),
    }
}

fn init_standalone(config: &NodeConfig) {
    let shard = ShardDirectory::initialize(&config.shard_directory, "test-shard").unwrap();
    drop(StateMachine::open(shard.state_machine_path(), StateMachineOptions::default()).unwrap());
}

async fn start_node(config: NodeConfig) -> Arc<QuarkDbNode> {
    let node = QuarkDbNode::spinup(config).unwrap();
    node.start_workers();
    tokio::spawn(Driver::run(
        node.config().listen.clone(),
        node.clone(),
        node.cancel_token(),
    ));
    node
}

#[tokio::test]
async fn standalone_crud_over_the_wire() {
    let scratch = tempfile::tempdir().unwrap();
    let config = standalone_config(&scratch.path().join("shard"), free_port(), None);
    init_standalone(&config);
    let node = start_node(config.clone()).await;

    let mut client = TestClient::connect(&config.listen).await;

    assert_eq!(client.command(&["ping"]).await, simple("PONG"));
    assert_eq!(client.command(&["flushall"]).await, simple("OK"));
    assert_eq!(client.command(&["set", "abc", "12345"]).await, simple("OK"));
    assert_eq!(client.command(&["get", "abc"]).await, bulk("12345"));
    assert_eq!(
        client.command(&["exists", "abc", "qqq"]).await,
        RespValue::Integer(1)
    );
    assert_eq!(
        client.command(&["del", "abc", "qqq"]).await,
        RespValue::Integer(1)
    );
    assert_eq!(client.command(&["exists", "abc"]).await, RespValue::Integer(0));

    // type mismatch over the wire
    assert_eq!(
        client.command(&["hset", "h", "f", "v"]).await,
        RespValue::Integer(1)
    );
    let reply = client.command(&["set", "h", "wrong"]).await;
    match reply {
        RespValue::Error(text) => assert!(text.starts_with("WRONGTYPE")),
        other => panic!("expected WRONGTYPE, got {other:?}"),
    }

    // internal commands are filtered at the door
    let reply = client.command(&["tx_readwrite", "payload", "phantom"]).await;
    assert!(reply.is_error());

    node.spindown().await;
}

#[tokio::test]
async fn authentication_gates_everything() {
    let scratch = tempfile::tempdir().unwrap();
    let password = "correct-horse-battery-staple-equine";
    let config = standalone_config(
        &scratch.path().join("shard"),
        free_port(),
        Some(password),
    );
    init_standalone(&config);
    let node = start_node(config.clone()).await;

    let mut client = TestClient::connect(&config.listen).await;

    let denied = client.command(&["get", "x"]).await;
    match denied {
        RespValue::Error(text) => assert!(text.starts_with("NOAUTH")),
        other => panic!("expected NOAUTH, got {other:?}"),
    }

    assert!(client.command(&["auth", "wrong"]).await.is_error());
    assert_eq!(client.command(&["auth", password]).await, simple("OK"));
    assert_eq!(client.command(&["set", "x", "1"]).await, simple("OK"));

    node.spindown().await;
}

fn raft_config(root: &Path, port: u16, nodes: &[u16]) -> NodeConfig {
    NodeConfig {
        shard_directory: root.to_path_buf(),
        listen: format!("127.0.0.1:{port}"),
        myself: RaftServer::new("127.0.0.1", port),
        nodes: nodes
            .iter()
            .map(|peer| RaftServer::new("127.0.0.1", *peer))
            .collect(),
        mode: NodeMode::Raft,
        password: None,
        raft: RaftTuning {
            election_timeout_low_ms: 300,
            election_timeout_high_ms: 600,
            heartbeat_interval_ms: 100,
            read_lease_margin_ms: 40,
        },
        storage: Default::default(),
        trimming: Default::default(),
    }
}

fn init_raft_node(config: &NodeConfig, cluster_id: &str) {
    eprintln!("init_raft_node: shard_directory={:?}", config.shard_directory);
    let shard = ShardDirectory::initialize(&config.shard_directory, cluster_id).unwrap();
    eprintln!("init_raft_node: state_machine_path={:?}", shard.state_machine_path());
    drop(StateMachine::open(shard.state_machine_path(), StateMachineOptions::default()).unwrap());
    let membership = Membership::new(config.nodes.clone(), Vec::new());
    RaftJournal::create(shard.journal_path(), cluster_id, membership).unwrap();
}

async fn await_leader(nodes: &[Arc<QuarkDbNode>]) -> usize {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        for (position, node) in nodes.iter().enumerate() {
            let raft = node.raft().expect("raft mode");
            if raft.state.snapshot().role == quarkdb_raft::RaftRole::Leader {
                return position;
            }
        }
        assert!(Instant::now() < deadline, "no leader elected in time");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_elects_and_replicates() {
    let scratch = tempfile::tempdir().unwrap();
    let ports: Vec<u16> = (0..3).map(|_| free_port()).collect();

    let configs: Vec<NodeConfig> = ports
        .iter()
        .enumerate()
        .map(|(i, port)| raft_config(&scratch.path().join(format!("shard-{i}")), *port, &ports))
        .collect();
    for config in &configs {
        init_raft_node(config, "e2e-cluster");
    }

    let mut nodes = Vec::new();
    for config in &configs {
        nodes.push(start_node(config.clone()).await);
    }

    let leader = await_leader(&nodes).await;
    let mut client = TestClient::connect(&configs[leader].listen).await;

    assert_eq!(client.command(&["set", "abc", "123"]).await, simple("OK"));
    assert_eq!(client.command(&["set", "def", "456"]).await, simple("OK"));
    assert_eq!(client.command(&["get", "abc"]).await, bulk("123"));

    // followers redirect writes to the leader
    let follower = (leader + 1) % 3;
    let mut follower_client = TestClient::connect(&configs[follower].listen).await;
    let redirected = follower_client.command(&["set", "zzz", "1"]).await;
    match redirected {
        RespValue::Error(text) => {
            assert!(text.starts_with("NOT_LEADER") || text.starts_with("MOVED"))
        }
        other => panic!("expected a redirect, got {other:?}"),
    }

    // committed data eventually lands on every replica
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if nodes.iter().all(|node| node.machine().last_applied() >= 2) {
            break;
        }
        assert!(Instant::now() < deadline, "replication never caught up");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for node in &nodes {
        node.spindown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_survives_leader_loss() {
    let scratch = tempfile::tempdir().unwrap();
    let ports: Vec<u16> = (0..3).map(|_| free_port()).collect();

    let configs: Vec<NodeConfig> = ports
        .iter()
        .enumerate()
        .map(|(i, port)| raft_config(&scratch.path().join(format!("shard-{i}")), *port, &ports))
        .collect();
    for config in &configs {
        init_raft_node(config, "failover-cluster");
    }

    let mut nodes = Vec::new();
    for config in &configs {
        nodes.push(start_node(config.clone()).await);
    }

    let old_leader = await_leader(&nodes).await;
    let mut client = TestClient::connect(&configs[old_leader].listen).await;
    assert_eq!(
        client.command(&["set", "survivor", "yes"]).await,
        simple("OK")
    );

    // wait until the write is fully replicated, then kill the leader
    let deadline = Instant::now() + Duration::from_secs(10);
    while !nodes.iter().all(|node| node.machine().last_applied() >= 2) {
        assert!(Instant::now() < deadline, "replication never caught up");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    nodes[old_leader].spindown().await;

    // within the election timeout a survivor takes over
    let survivors: Vec<Arc<QuarkDbNode>> = nodes
        .iter()
        .enumerate()
        .filter(|(position, _)| *position != old_leader)
        .map(|(_, node)| node.clone())
        .collect();
    let new_leader = await_leader(&survivors).await;

    // the committed write is present on the new leader
    let raft = survivors[new_leader].raft().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while survivors[new_leader].machine().last_applied() < raft.journal.commit_index() {
        assert!(Instant::now() < deadline, "apply lagged behind commit");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let address = survivors[new_leader].config().listen.clone();
    let mut client = TestClient::connect(&address).await;

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let reply = client.command(&["get", "survivor"]).await;
        if reply == bulk("yes") {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "committed write missing on new leader: {reply:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for node in survivors {
        node.spindown().await;
    }
}
