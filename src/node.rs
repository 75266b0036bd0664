//! The node: one composition root owning every subsystem.
//!
//! `spinup` constructs the stack in dependency order (shard directory,
//! state machine, dispatcher, journal, raft state, trackers, workers)
//! and `spindown` tears it down in reverse. Every worker hangs off one
//! cancellation token; nothing global, nothing lazily initialised.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use quarkdb_core::resp::{formatter, RespValue};
use quarkdb_core::{
    ClockValue, NodeConfig, NodeMode, RaftServer, RedisCommand, RedisRequest, Transaction,
};
use quarkdb_machine::scanner::ConsistencyScanner;
use quarkdb_machine::{RedisDispatcher, StateMachine, StateMachineOptions};
use quarkdb_raft::{
    propose_change, CommitTracker, Director, ElectionTiming, LeaseRegister, MembershipChange,
    RaftEntry, RaftHandler, RaftJournal, RaftRole, RaftState, ReplicationManager, ResilverSpawner,
    Trimmer, WriteTracker,
};

use crate::inflight::InFlightTracker;
use crate::prelude::Error;
use crate::shard::{IncomingResilvering, ShardDirectory};

const CONSISTENCY_SCAN_INTERVAL: Duration = Duration::from_secs(3600);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Why the serving loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Shutdown,
    /// The shard contents were replaced (resilvering); reopen in place.
    Reopen,
}

/// The raft side of the node; absent in standalone and bulkload modes.
pub struct RaftStack {
    pub journal: Arc<RaftJournal>,
    pub state: Arc<RaftState>,
    pub commit_tracker: Arc<CommitTracker>,
    pub lease_register: Arc<LeaseRegister>,
    pub write_tracker: Arc<WriteTracker>,
    pub trimmer: Arc<Trimmer>,
    pub handler: RaftHandler,
}

pub struct QuarkDbNode {
    config: NodeConfig,
    shard: ShardDirectory,
    machine: Arc<StateMachine>,
    dispatcher: RedisDispatcher,
    raft: Option<RaftStack>,
    in_flight: Arc<InFlightTracker>,
    cancel: CancellationToken,
    reopen_requested: AtomicBool,
    incoming_resilver: Mutex<Option<IncomingResilvering>>,
    outgoing_resilver: Mutex<HashSet<RaftServer>>,
    next_client_id: AtomicI64,
}

impl QuarkDbNode {
    /// Build the whole stack. Nothing runs yet; `start_workers` does.
    pub fn spinup(config: NodeConfig) -> Result<Arc<Self>, Error> {
        config.validate().map_err(Error::config)?;

        let shard = ShardDirectory::open(&config.shard_directory)?;
        let machine = Arc::new(StateMachine::open(
            shard.state_machine_path(),
            StateMachineOptions {
                cache_size_mb: config.storage.cache_size_mb,
                durable_writes: config.storage.durable_writes,
                bulkload: config.mode == NodeMode::Bulkload,
                ..StateMachineOptions::default()
            },
        )?);
        let dispatcher = RedisDispatcher::new(machine.clone());

        let raft = if config.mode == NodeMode::Raft {
            let journal = Arc::new(RaftJournal::open(shard.journal_path(), shard.shard_id())?);
            let state = Arc::new(RaftState::new(journal.clone(), config.myself.clone()));
            let commit_tracker =
                Arc::new(CommitTracker::new(journal.clone(), config.myself.clone()));
            let lease_register = Arc::new(LeaseRegister::new(
                config.myself.clone(),
                Duration::from_millis(config.raft.election_timeout_low_ms),
                Duration::from_millis(config.raft.read_lease_margin_ms),
            ));
            let write_tracker = Arc::new(WriteTracker::new(
                journal.clone(),
                state.clone(),
                commit_tracker.clone(),
                dispatcher.clone(),
            ));
            let trimmer = Arc::new(Trimmer::new(
                journal.clone(),
                machine.clone(),
                config.trimming.clone(),
            ));
            let handler = RaftHandler::new(journal.clone(), state.clone());

            Some(RaftStack {
                journal,
                state,
                commit_tracker,
                lease_register,
                write_tracker,
                trimmer,
                handler,
            })
        } else {
            None
        };

        info!(
            shard_id = shard.shard_id(),
            mode = ?config.mode,
            myself = %config.myself,
            "node assembled"
        );

        Ok(Arc::new(QuarkDbNode {
            config,
            shard,
            machine,
            dispatcher,
            raft,
            in_flight: Arc::new(InFlightTracker::default()),
            cancel: CancellationToken::new(),
            reopen_requested: AtomicBool::new(false),
            incoming_resilver: Mutex::new(None),
            outgoing_resilver: Mutex::new(HashSet::new()),
            next_client_id: AtomicI64::new(1),
        }))
    }

    /// Spawn the long-lived workers: apply loop, director, replication,
    /// trimmer, consistency scanner.
    pub fn start_workers(self: &Arc<Self>) {
        let cancel = self.cancel.clone();

        let scanner = ConsistencyScanner::new(self.machine.clone(), CONSISTENCY_SCAN_INTERVAL);
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if scanner.run(cancel).await.is_err() {
                    error!("consistency violation detected, aborting");
                    std::process::abort();
                }
            }
        });

        let Some(raft) = &self.raft else {
            return;
        };

        tokio::spawn({
            let tracker = raft.write_tracker.clone();
            let cancel = cancel.clone();
            async move {
                if tracker.run(cancel).await.is_err() {
                    error!("apply loop failed, aborting");
                    std::process::abort();
                }
            }
        });

        tokio::spawn(raft.trimmer.clone().run(cancel.clone()));

        let director = Arc::new(Director::new(
            raft.journal.clone(),
            raft.state.clone(),
            raft.commit_tracker.clone(),
            ElectionTiming {
                timeout_low: Duration::from_millis(self.config.raft.election_timeout_low_ms),
                timeout_high: Duration::from_millis(self.config.raft.election_timeout_high_ms),
                heartbeat_interval: Duration::from_millis(self.config.raft.heartbeat_interval_ms),
            },
        ));
        tokio::spawn(director.run(cancel.clone()));

        let replication = Arc::new(ReplicationManager::new(
            raft.journal.clone(),
            raft.state.clone(),
            raft.commit_tracker.clone(),
            raft.lease_register.clone(),
            Arc::new(NodeResilverer {
                node: Arc::downgrade(self),
            }),
            Duration::from_millis(self.config.raft.heartbeat_interval_ms),
        ));
        tokio::spawn(replication.run(cancel));
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn shard(&self) -> &ShardDirectory {
        &self.shard
    }

    pub fn machine(&self) -> &Arc<StateMachine> {
        &self.machine
    }

    pub fn raft(&self) -> Option<&RaftStack> {
        self.raft.as_ref()
    }

    pub fn in_flight(&self) -> &Arc<InFlightTracker> {
        &self.in_flight
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn next_client_id(&self) -> i64 {
        self.next_client_id.fetch_add(1, Ordering::AcqRel)
    }

    pub fn password(&self) -> Option<&[u8]> {
        self.config.password.as_deref().map(|p| p.as_bytes())
    }

    fn request_reopen(&self) {
        self.reopen_requested.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    /// Wait for the end of this node's life and say which kind it was.
    pub async fn run_to_completion(&self) -> RunOutcome {
        self.cancel.cancelled().await;
        if self.reopen_requested.load(Ordering::Acquire) {
            RunOutcome::Reopen
        } else {
            RunOutcome::Shutdown
        }
    }

    /// Orderly teardown: close the gate, drain, cancel workers, sync.
    pub async fn spindown(&self) {
        self.in_flight.close_gate();
        self.in_flight.drain().await;
        self.cancel.cancel();
        if let Some(raft) = &self.raft {
            raft.state.shutdown();
            raft.write_tracker.abandon_pending();
        }
        if let Err(err) = self.machine.engine().sync() {
            warn!(error = %err, "final sync failed");
        }
        info!("node spun down");
    }

    // ------------------------------------------------------------------
    // request execution
    // ------------------------------------------------------------------

    /// Reads run locally when this node is entitled to serve them.
    pub fn serve_read(&self, request: &RedisRequest) -> Vec<RespValue> {
        let Some(raft) = &self.raft else {
            if self.machine.in_bulkload() {
                return vec![formatter::err("reads are disabled during bulkload")];
            }
            return self.dispatcher.serve_read(request);
        };

        let snapshot = raft.state.snapshot();
        match snapshot.role {
            RaftRole::Leader => {
                let membership = raft.journal.membership().membership;
                if membership.members.len() == 1
                    || raft.lease_register.read_lease_valid(&membership)
                {
                    self.dispatcher.serve_read(request)
                } else {
                    vec![formatter::unavailable("read lease not held, retry")]
                }
            }
            _ => match snapshot.leader {
                Some(leader) => vec![formatter::moved(leader.to_string())],
                None => vec![formatter::unavailable("no leader is known")],
            },
        }
    }

    /// A batch of consecutive writes from one connection. More than
    /// one becomes a phantom transaction: one journal entry, replies
    /// fanned back out flat.
    pub async fn execute_writes(&self, mut requests: Vec<RedisRequest>) -> Vec<RespValue> {
        debug_assert!(!requests.is_empty());
        let expected = requests.len();

        let timestamp = self.bind_timestamp();
        for request in &mut requests {
            timestamp_lease_command(request, timestamp);
        }

        let journal_request = if requests.len() == 1 {
            requests.into_iter().next().expect("length checked")
        } else {
            let mut tx = Transaction::new();
            for request in requests {
                tx.push(request);
            }
            tx.set_phantom(true);
            tx.to_redis_request()
        };

        let Some(raft) = &self.raft else {
            return match self.dispatcher.apply_direct(&journal_request) {
                Ok(replies) => replies,
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "state machine failure, aborting");
                    std::process::abort();
                }
                Err(err) => vec![err.to_resp(); expected],
            };
        };

        let snapshot = raft.state.snapshot();
        if snapshot.role != RaftRole::Leader {
            let reply = match snapshot.leader {
                Some(leader) => {
                    let address = leader.to_string();
                    formatter::not_leader(Some(&address))
                }
                None => formatter::not_leader(None),
            };
            return vec![reply; expected];
        }

        let entry = RaftEntry::new(snapshot.term, journal_request);
        let receiver = match raft.write_tracker.submit(&entry) {
            Ok(receiver) => receiver,
            Err(err) => {
                warn!(error = %err, "journal append failed");
                return vec![formatter::unavailable(err.to_string()); expected];
            }
        };

        match tokio::time::timeout(WRITE_TIMEOUT, receiver).await {
            Ok(Ok(replies)) => replies,
            Ok(Err(_)) => {
                vec![formatter::unavailable("leadership lost before apply"); expected]
            }
            Err(_) => {
                vec![
                    formatter::unavailable(
                        "commit timeout, the write may or may not be applied"
                    );
                    expected
                ]
            }
        }
    }

    /// The timestamp bound into lease commands before journaling:
    /// monotone per node, never behind the dynamic clock.
    fn bind_timestamp(&self) -> ClockValue {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        wall.max(self.machine.dynamic_clock() + 1)
    }

    /// Control-plane commands.
    pub fn execute_control(&self, client_id: i64, request: &RedisRequest) -> RespValue {
        match request.command() {
            Some(RedisCommand::Ping) => {
                if request.len() == 2 {
                    formatter::string(request.arg_bytes(1))
                } else {
                    formatter::pong()
                }
            }
            Some(RedisCommand::ClientId) => formatter::integer(client_id),
            Some(RedisCommand::QuarkdbInfo) => self.info(),
            Some(RedisCommand::QuarkdbCheckpoint) => {
                if request.len() != 2 {
                    return formatter::err_args("quarkdb_checkpoint");
                }
                let target = String::from_utf8_lossy(request.arg(1)).into_owned();
                match self.checkpoint_into(std::path::Path::new(&target)) {
                    Ok(()) => formatter::ok(),
                    Err(err) => formatter::err(err.to_string()),
                }
            }
            _ => formatter::err(format!("unknown command '{}'", request.describe())),
        }
    }

    fn info(&self) -> RespValue {
        let mut lines = vec![
            format!("shard-id {}", self.shard.shard_id()),
            format!("mode {:?}", self.config.mode).to_lowercase(),
            format!("last-applied {}", self.machine.last_applied()),
            format!("dynamic-clock {}", self.machine.dynamic_clock()),
            format!("in-flight {}", self.in_flight.total()),
        ];
        if let Some(raft) = &self.raft {
            let snapshot = raft.state.snapshot();
            lines.push(format!("term {}", snapshot.term));
            lines.push(format!("role {:?}", snapshot.role).to_lowercase());
            lines.push(format!(
                "leader {}",
                snapshot
                    .leader
                    .map(|leader| leader.to_string())
                    .unwrap_or_else(|| "none".to_string())
            ));
            lines.push(format!("log-start {}", raft.journal.log_start()));
            lines.push(format!("log-size {}", raft.journal.log_size()));
            lines.push(format!("commit-index {}", raft.journal.commit_index()));
            lines.push(format!(
                "membership-epoch {}",
                raft.journal.membership().epoch
            ));
            lines.push(format!("members {}", raft.journal.membership().membership));
        }
        formatter::vector(lines)
    }

    /// Checkpoint both stores into `target`; refuses to overwrite.
    pub fn checkpoint_into(&self, target: &std::path::Path) -> Result<(), Error> {
        if target.exists() {
            return Err(Error::shard(format!(
                "checkpoint target {} already exists",
                target.display()
            )));
        }
        std::fs::create_dir_all(target)?;
        self.machine.checkpoint(&target.join("state-machine"))?;
        if let Some(raft) = &self.raft {
            raft.journal.checkpoint(&target.join("raft-journal"))?;
        }
        Ok(())
    }

    /// Raft-classified traffic: peer RPCs, membership changes, and
    /// incoming resilvering.
    pub async fn execute_raft(&self, request: &RedisRequest) -> RespValue {
        match request.command() {
            Some(
                RedisCommand::RaftAppendEntries
                | RedisCommand::RaftRequestVote
                | RedisCommand::RaftHandshake
                | RedisCommand::RaftFetch
                | RedisCommand::RaftInfo,
            ) => match &self.raft {
                Some(raft) => raft.handler.dispatch(request),
                None => formatter::err("this node does not participate in a raft cluster"),
            },

            Some(RedisCommand::RaftAddObserver) => self.membership_change(request, |node| {
                MembershipChange::AddObserver(node)
            }),
            Some(RedisCommand::RaftRemoveMember) => self.membership_change(request, |node| {
                MembershipChange::RemoveMember(node)
            }),
            Some(RedisCommand::RaftPromoteObserver) => self.membership_change(request, |node| {
                MembershipChange::PromoteObserver(node)
            }),

            Some(RedisCommand::ResilveringStart) => self.resilvering_start(request),
            Some(RedisCommand::ResilveringCopy) => self.resilvering_copy(request),
            Some(RedisCommand::ResilveringFinish) => self.resilvering_finish(request),
            Some(RedisCommand::ResilveringCancel) => self.resilvering_cancel(request),

            _ => formatter::err(format!("unknown command '{}'", request.describe())),
        }
    }

    fn membership_change(
        &self,
        request: &RedisRequest,
        build: impl FnOnce(RaftServer) -> MembershipChange,
    ) -> RespValue {
        let Some(raft) = &self.raft else {
            return formatter::err("this node does not participate in a raft cluster");
        };
        if request.len() != 2 {
            return formatter::err_args("membership change");
        }
        let Ok(target) = String::from_utf8_lossy(request.arg(1)).parse::<RaftServer>() else {
            return formatter::invalid_argument("expected host:port");
        };

        match propose_change(
            &raft.journal,
            &raft.state,
            &raft.commit_tracker,
            build(target),
        ) {
            Ok(index) => formatter::status(format!("proposed at index {index}")),
            Err(err) => formatter::err(err.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // incoming resilvering (target side)
    // ------------------------------------------------------------------

    fn resilvering_start(&self, request: &RedisRequest) -> RespValue {
        if request.len() != 2 {
            return formatter::err_args("resilvering_start");
        }
        let id = String::from_utf8_lossy(request.arg(1)).into_owned();

        let mut active = lock(&self.incoming_resilver);
        if active.is_some() {
            return formatter::err("a resilvering is already in progress");
        }
        match IncomingResilvering::start(&self.shard, &id) {
            Ok(incoming) => {
                info!(id, "incoming resilvering started");
                *active = Some(incoming);
                formatter::ok()
            }
            Err(err) => formatter::err(err.to_string()),
        }
    }

    fn resilvering_copy(&self, request: &RedisRequest) -> RespValue {
        if request.len() != 5 {
            return formatter::err_args("resilvering_copy");
        }
        let id = String::from_utf8_lossy(request.arg(1));
        let path = String::from_utf8_lossy(request.arg(2)).into_owned();
        let Ok(offset) = String::from_utf8_lossy(request.arg(3)).parse::<u64>() else {
            return formatter::invalid_argument("malformed offset");
        };

        let active = lock(&self.incoming_resilver);
        let Some(incoming) = active.as_ref().filter(|incoming| incoming.id == id.as_ref()) else {
            return formatter::err("no such resilvering in progress");
        };
        match incoming.copy(&self.shard, &path, offset, request.arg(4)) {
            Ok(()) => formatter::ok(),
            Err(err) => formatter::err(err.to_string()),
        }
    }

    fn resilvering_finish(&self, request: &RedisRequest) -> RespValue {
        if request.len() != 2 {
            return formatter::err_args("resilvering_finish");
        }
        let id = String::from_utf8_lossy(request.arg(1));

        let mut active = lock(&self.incoming_resilver);
        let Some(incoming) = active.take() else {
            return formatter::err("no resilvering in progress");
        };
        if incoming.id != id.as_ref() {
            *active = Some(incoming);
            return formatter::err("unknown resilvering id");
        }

        match self.shard.supplant_with_arena(&incoming.id) {
            Ok(()) => {
                info!(id = incoming.id, "resilvering finished, reopening");
                self.request_reopen();
                formatter::ok()
            }
            Err(err) => formatter::err(err.to_string()),
        }
    }

    fn resilvering_cancel(&self, request: &RedisRequest) -> RespValue {
        if request.len() != 2 {
            return formatter::err_args("resilvering_cancel");
        }
        let id = String::from_utf8_lossy(request.arg(1));

        let mut active = lock(&self.incoming_resilver);
        match active.take() {
            Some(incoming) if incoming.id == id.as_ref() => {
                let _ = self.shard.discard_arena(&incoming.id);
                formatter::ok()
            }
            other => {
                *active = other;
                formatter::err("no such resilvering in progress")
            }
        }
    }
}

/// The lease rewrite the leader performs before journaling: the
/// user-facing command name flips to its timestamped form and the
/// bound clock value is appended in binary.
fn timestamp_lease_command(request: &mut RedisRequest, timestamp: ClockValue) {
    let renamed = match request.command() {
        Some(RedisCommand::LeaseAcquire) => "timestamped_lease_acquire",
        Some(RedisCommand::LeaseGet) => "timestamped_lease_get",
        Some(RedisCommand::LeaseRelease) => "timestamped_lease_release",
        _ => return,
    };
    request.rename_command(renamed);
    request.push_arg(timestamp.to_be_bytes().to_vec());
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Leader-side resilvering entry point, handed to the replication
/// manager. Freezes trimming, checkpoints both stores, streams the
/// copy, cleans up.
struct NodeResilverer {
    node: std::sync::Weak<QuarkDbNode>,
}

impl ResilverSpawner for NodeResilverer {
    async fn resilver(&self, target: RaftServer) -> Result<(), quarkdb_raft::RaftError> {
        let Some(node) = self.node.upgrade() else {
            return Err(quarkdb_raft::RaftError::Network("node is gone".to_string()));
        };
        let Some(raft) = &node.raft else {
            return Err(quarkdb_raft::RaftError::NotLeader);
        };

        {
            let mut active = lock(&node.outgoing_resilver);
            if !active.insert(target.clone()) {
                return Err(quarkdb_raft::RaftError::ResilveringInProgress);
            }
        }

        let id = format!(
            "{}-{}-{}",
            node.shard.shard_id(),
            target.port,
            raft.journal.log_size()
        );
        let outcome = run_resilvering(&node, raft, &target, &id).await;

        let _ = node.shard.discard_temp_snapshot(&id);
        lock(&node.outgoing_resilver).remove(&target);
        outcome
    }
}

async fn run_resilvering(
    node: &Arc<QuarkDbNode>,
    raft: &RaftStack,
    target: &RaftServer,
    id: &str,
) -> Result<(), quarkdb_raft::RaftError> {
    // trimming stays frozen for the whole transfer so the checkpoint
    // and the live log stay within reach of each other
    let _freeze = raft.trimmer.freeze();

    let staging = node.shard.temp_snapshot_path(id);
    let machine = node.machine.clone();
    let journal = raft.journal.clone();
    {
        let staging = staging.clone();
        tokio::task::spawn_blocking(move || -> Result<(), quarkdb_raft::RaftError> {
            machine
                .checkpoint(&staging.join("state-machine"))
                .map_err(quarkdb_raft::RaftError::Machine)?;
            journal.checkpoint(&staging.join("raft-journal"))?;
            Ok(())
        })
        .await
        .map_err(|err| quarkdb_raft::RaftError::Network(err.to_string()))??;
    }

    node.shard
        .record_resilvering_event(&format!("outgoing-start {id} -> {target}"))
        .map_err(|err| quarkdb_raft::RaftError::Network(err.to_string()))?;

    quarkdb_raft::resilverer::transfer(target, id, &staging).await
}
