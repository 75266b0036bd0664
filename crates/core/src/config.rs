//! Node configuration, deserialized from the TOML file the daemon is
//! pointed at.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cluster::RaftServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// Single node, no consensus; writes bypass the journal.
    Standalone,
    /// Full raft replication.
    #[default]
    Raft,
    /// Import mode: write batches skip the WAL and reads are disabled.
    Bulkload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Root of the shard directory tree (§ persisted state layout).
    pub shard_directory: PathBuf,

    /// Address clients and peers connect to, e.g. "0.0.0.0:7777".
    pub listen: String,

    /// This node's identity within the cluster. Must match one of the
    /// configured members in raft mode.
    pub myself: RaftServer,

    /// Seed membership, only consulted when initialising a brand-new
    /// shard directory.
    #[serde(default)]
    pub nodes: Vec<RaftServer>,

    #[serde(default)]
    pub mode: NodeMode,

    /// When set, clients must AUTH (or complete an HMAC challenge)
    /// before anything else. Minimum length 32.
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub raft: RaftTuning,

    #[serde(default)]
    pub storage: StorageTuning,

    #[serde(default)]
    pub trimming: TrimmingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftTuning {
    /// Lower bound of the randomized election timeout, milliseconds.
    #[serde(default = "defaults::election_timeout_low_ms")]
    pub election_timeout_low_ms: u64,

    /// Upper bound of the randomized election timeout, milliseconds.
    #[serde(default = "defaults::election_timeout_high_ms")]
    pub election_timeout_high_ms: u64,

    /// Leader heartbeat cadence; keep well below the election floor.
    #[serde(default = "defaults::heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Safety margin subtracted from the lease window when deciding
    /// whether a leader may serve reads without contacting peers.
    #[serde(default = "defaults::read_lease_margin_ms")]
    pub read_lease_margin_ms: u64,
}

impl Default for RaftTuning {
    fn default() -> Self {
        RaftTuning {
            election_timeout_low_ms: defaults::election_timeout_low_ms(),
            election_timeout_high_ms: defaults::election_timeout_high_ms(),
            heartbeat_interval_ms: defaults::heartbeat_interval_ms(),
            read_lease_margin_ms: defaults::read_lease_margin_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageTuning {
    /// Block cache size for each store, in MB.
    #[serde(default)]
    pub cache_size_mb: Option<usize>,

    /// Whether state machine commits are WAL-synced before replying.
    /// Disabled automatically in bulkload mode.
    #[serde(default = "defaults::durable_writes")]
    pub durable_writes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrimmingConfig {
    /// Number of applied entries the journal keeps around for lagging
    /// followers before trimming.
    #[serde(default = "defaults::trim_keep_at_least")]
    pub keep_at_least: u64,

    /// Maximum entries removed per trimming round.
    #[serde(default = "defaults::trim_batch_size")]
    pub batch_size: u64,
}

impl Default for TrimmingConfig {
    fn default() -> Self {
        TrimmingConfig {
            keep_at_least: defaults::trim_keep_at_least(),
            batch_size: defaults::trim_batch_size(),
        }
    }
}

mod defaults {
    pub fn election_timeout_low_ms() -> u64 {
        1000
    }

    pub fn election_timeout_high_ms() -> u64 {
        1500
    }

    pub fn heartbeat_interval_ms() -> u64 {
        250
    }

    pub fn read_lease_margin_ms() -> u64 {
        50
    }

    pub fn durable_writes() -> bool {
        true
    }

    pub fn trim_keep_at_least() -> u64 {
        100_000
    }

    pub fn trim_batch_size() -> u64 {
        10_000
    }
}

impl NodeConfig {
    /// Sanity checks that must hold before the node is allowed to spin
    /// up. Returns a human-readable complaint.
    pub fn validate(&self) -> Result<(), String> {
        if self.raft.election_timeout_low_ms >= self.raft.election_timeout_high_ms {
            return Err("election timeout range is empty".to_string());
        }
        if self.raft.heartbeat_interval_ms * 2 > self.raft.election_timeout_low_ms {
            return Err("heartbeat interval must be at most half the election floor".to_string());
        }
        if let Some(password) = &self.password {
            if password.len() < 32 {
                return Err("password is too small, minimum size: 32".to_string());
            }
        }
        if self.mode == NodeMode::Raft && !self.nodes.is_empty() && !self.nodes.contains(&self.myself)
        {
            return Err(format!(
                "myself ({}) is not part of the configured nodes",
                self.myself
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> NodeConfig {
        NodeConfig {
            shard_directory: "/tmp/shard".into(),
            listen: "127.0.0.1:7777".to_string(),
            myself: RaftServer::new("127.0.0.1", 7777),
            nodes: vec![RaftServer::new("127.0.0.1", 7777)],
            mode: NodeMode::Raft,
            password: None,
            raft: RaftTuning::default(),
            storage: StorageTuning::default(),
            trimming: TrimmingConfig::default(),
        }
    }

    #[test]
    fn default_timeouts_are_sane() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_short_password() {
        let mut config = base_config();
        config.password = Some("hunter2".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_stranger_identity() {
        let mut config = base_config();
        config.myself = RaftServer::new("elsewhere", 9999);
        assert!(config.validate().is_err());
    }
}
