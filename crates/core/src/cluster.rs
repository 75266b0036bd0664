//! Cluster identity: member addresses, the immutable cluster ID, and
//! the membership sets that raft replicates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::LogIndex;

/// One raft participant, addressed as `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RaftServer {
    pub host: String,
    pub port: u16,
}

impl RaftServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        RaftServer {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for RaftServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for RaftServer {
    type Err = CoreError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let (host, port) = text
            .rsplit_once(':')
            .ok_or_else(|| CoreError::MalformedMember(text.to_string()))?;
        if host.is_empty() {
            return Err(CoreError::MalformedMember(text.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| CoreError::MalformedMember(text.to_string()))?;
        Ok(RaftServer::new(host, port))
    }
}

/// Parse a comma-separated member list, e.g. from configuration.
pub fn parse_servers(text: &str) -> Result<Vec<RaftServer>, CoreError> {
    text.split(',')
        .filter(|chunk| !chunk.is_empty())
        .map(RaftServer::from_str)
        .collect()
}

/// The full voting-plus-observing composition of the cluster at some
/// membership epoch. Observers receive entries but do not count towards
/// quorum and cannot vote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub members: Vec<RaftServer>,
    pub observers: Vec<RaftServer>,
}

impl Membership {
    pub fn new(members: Vec<RaftServer>, observers: Vec<RaftServer>) -> Self {
        Membership { members, observers }
    }

    pub fn contains_member(&self, node: &RaftServer) -> bool {
        self.members.contains(node)
    }

    pub fn contains(&self, node: &RaftServer) -> bool {
        self.members.contains(node) || self.observers.contains(node)
    }

    /// Smallest majority of the voting set.
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Everyone that should receive replicated entries, except `myself`.
    pub fn replication_targets(&self, myself: &RaftServer) -> Vec<RaftServer> {
        self.members
            .iter()
            .chain(self.observers.iter())
            .filter(|node| *node != myself)
            .cloned()
            .collect()
    }
}

impl fmt::Display for Membership {
    /// `host:port,host:port|observer:port`, the same shape raft
    /// membership entries carry in their payload.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members = self
            .members
            .iter()
            .map(|node| node.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let observers = self
            .observers
            .iter()
            .map(|node| node.to_string())
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{members}|{observers}")
    }
}

impl FromStr for Membership {
    type Err = CoreError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let (members, observers) = match text.split_once('|') {
            Some((members, observers)) => (members, observers),
            None => (text, ""),
        };
        Ok(Membership {
            members: parse_servers(members)?,
            observers: parse_servers(observers)?,
        })
    }
}

/// A membership set together with the epoch (log index of the entry
/// that installed it).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEpoch {
    pub membership: Membership,
    pub epoch: LogIndex,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_round_trip() {
        let server: RaftServer = "example.cern.ch:7777".parse().unwrap();
        assert_eq!(server.host, "example.cern.ch");
        assert_eq!(server.port, 7777);
        assert_eq!(server.to_string(), "example.cern.ch:7777");

        assert!("no-port".parse::<RaftServer>().is_err());
        assert!(":123".parse::<RaftServer>().is_err());
        assert!("host:99999".parse::<RaftServer>().is_err());
    }

    #[test]
    fn membership_round_trip() {
        let membership: Membership = "n1:1001,n2:1002,n3:1003|n4:1004".parse().unwrap();
        assert_eq!(membership.members.len(), 3);
        assert_eq!(membership.observers.len(), 1);
        assert_eq!(membership.quorum_size(), 2);
        assert_eq!(
            membership.to_string(),
            "n1:1001,n2:1002,n3:1003|n4:1004"
        );

        let no_observers: Membership = "n1:1001".parse().unwrap();
        assert!(no_observers.observers.is_empty());
        assert_eq!(no_observers.quorum_size(), 1);
    }

    #[test]
    fn replication_targets_exclude_self() {
        let membership: Membership = "n1:1,n2:2|n3:3".parse().unwrap();
        let me = RaftServer::new("n1", 1);
        let targets = membership.replication_targets(&me);
        assert_eq!(
            targets,
            vec![RaftServer::new("n2", 2), RaftServer::new("n3", 3)]
        );
    }
}
