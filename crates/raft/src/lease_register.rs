//! The leader's read lease, derived from heartbeat acknowledgements.
//!
//! Every successful follower contact stamps a timestamp here. While
//! the quorum-th newest stamp is younger than the election floor
//! (minus a safety margin), no rival can have been elected, so the
//! leader may serve linearizable reads without a round-trip.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use quarkdb_core::{Membership, RaftServer};

pub struct LeaseRegister {
    myself: RaftServer,
    election_floor: Duration,
    safety_margin: Duration,
    acks: Mutex<HashMap<RaftServer, Instant>>,
}

impl LeaseRegister {
    pub fn new(myself: RaftServer, election_floor: Duration, safety_margin: Duration) -> Self {
        LeaseRegister {
            myself,
            election_floor,
            safety_margin,
            acks: Mutex::new(HashMap::new()),
        }
    }

    /// A follower answered a heartbeat or replication request.
    pub fn register_contact(&self, peer: &RaftServer) {
        self.register_contact_at(peer, Instant::now());
    }

    fn register_contact_at(&self, peer: &RaftServer, when: Instant) {
        let mut acks = self
            .acks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = acks.entry(peer.clone()).or_insert(when);
        if *slot < when {
            *slot = when;
        }
    }

    /// Point in time until which the lease holds, or None when quorum
    /// contact is missing entirely.
    pub fn lease_deadline(&self, membership: &Membership) -> Option<Instant> {
        let quorum = membership.quorum_size();
        let acks = self
            .acks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut stamps: Vec<Instant> = Vec::with_capacity(membership.members.len());
        let now = Instant::now();
        for member in &membership.members {
            if *member == self.myself {
                stamps.push(now);
            } else if let Some(stamp) = acks.get(member) {
                stamps.push(*stamp);
            }
        }
        if stamps.len() < quorum {
            return None;
        }

        stamps.sort_unstable_by(|a, b| b.cmp(a));
        let anchor = stamps[quorum - 1];
        (self.election_floor > self.safety_margin)
            .then(|| anchor + self.election_floor - self.safety_margin)
    }

    /// Whether a linearizable read may be served locally right now.
    pub fn read_lease_valid(&self, membership: &Membership) -> bool {
        self.lease_deadline(membership)
            .is_some_and(|deadline| Instant::now() < deadline)
    }

    pub fn forget(&self, peer: &RaftServer) {
        self.acks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership() -> Membership {
        "n1:1001,n2:1002,n3:1003".parse().unwrap()
    }

    fn register() -> LeaseRegister {
        LeaseRegister::new(
            "n1:1001".parse().unwrap(),
            Duration::from_millis(1000),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn no_contact_no_lease() {
        let register = register();
        assert!(!register.read_lease_valid(&membership()));
    }

    #[test]
    fn fresh_quorum_contact_grants_lease() {
        let register = register();
        register.register_contact(&"n2:1002".parse().unwrap());
        assert!(register.read_lease_valid(&membership()));
    }

    #[test]
    fn stale_contact_expires_lease() {
        let register = register();
        let long_ago = Instant::now() - Duration::from_secs(10);
        register.register_contact_at(&"n2:1002".parse().unwrap(), long_ago);
        assert!(!register.read_lease_valid(&membership()));

        // a newer ack re-arms it; older stamps never clobber newer
        register.register_contact(&"n2:1002".parse().unwrap());
        register.register_contact_at(&"n2:1002".parse().unwrap(), long_ago);
        assert!(register.read_lease_valid(&membership()));
    }

    #[test]
    fn quorum_is_the_binding_stamp() {
        let register = register();
        let stale = Instant::now() - Duration::from_secs(10);

        // one fresh, one stale: the quorum-th newest (2nd of 3, self
        // included) is the fresh one
        register.register_contact(&"n2:1002".parse().unwrap());
        register.register_contact_at(&"n3:1003".parse().unwrap(), stale);
        assert!(register.read_lease_valid(&membership()));

        register.forget(&"n2:1002".parse().unwrap());
        assert!(!register.read_lease_valid(&membership()));
    }
}
