//! Single-step membership changes.
//!
//! A change is a dedicated journal entry carrying the full new member
//! sets; it takes effect on every node the moment it commits. At most
//! one change may be in flight: a membership epoch above the commit
//! index means the previous change has not committed yet.

use std::sync::Arc;

use tracing::info;

use quarkdb_core::{LogIndex, Membership, RaftServer};

use crate::commit_tracker::CommitTracker;
use crate::journal::{RaftEntry, RaftJournal};
use crate::state::{RaftRole, RaftState};
use crate::RaftError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    AddObserver(RaftServer),
    RemoveMember(RaftServer),
    PromoteObserver(RaftServer),
}

impl MembershipChange {
    /// The member sets after this change, or a complaint.
    fn applied_to(&self, current: &Membership) -> Result<Membership, RaftError> {
        let mut next = current.clone();
        match self {
            MembershipChange::AddObserver(node) => {
                if next.contains(node) {
                    return Err(RaftError::Protocol(format!(
                        "{node} is already part of the cluster"
                    )));
                }
                next.observers.push(node.clone());
            }
            MembershipChange::RemoveMember(node) => {
                let members_before = next.members.len();
                next.members.retain(|member| member != node);
                next.observers.retain(|observer| observer != node);
                if next.members.len() == members_before && !current.observers.contains(node) {
                    return Err(RaftError::Protocol(format!("{node} is not in the cluster")));
                }
                if next.members.is_empty() {
                    return Err(RaftError::Protocol(
                        "refusing to remove the last voting member".to_string(),
                    ));
                }
            }
            MembershipChange::PromoteObserver(node) => {
                if !next.observers.contains(node) {
                    return Err(RaftError::Protocol(format!("{node} is not an observer")));
                }
                next.observers.retain(|observer| observer != node);
                next.members.push(node.clone());
            }
        }
        Ok(next)
    }
}

/// Leader-side entry point. Journals the change; the write tracker
/// installs it once it commits.
pub fn propose_change(
    journal: &Arc<RaftJournal>,
    state: &Arc<RaftState>,
    commit_tracker: &Arc<CommitTracker>,
    change: MembershipChange,
) -> Result<LogIndex, RaftError> {
    let snapshot = state.snapshot();
    if snapshot.role != RaftRole::Leader {
        return Err(RaftError::NotLeader);
    }
    if journal.membership().epoch > journal.commit_index() {
        return Err(RaftError::MembershipChangeInFlight);
    }

    let next = change.applied_to(&journal.membership().membership)?;
    let index = journal.log_size();
    let entry = RaftEntry::new(
        snapshot.term,
        quarkdb_core::RedisRequest::from_parts(vec![
            b"raft_membership".to_vec(),
            next.to_string().into_bytes(),
        ]),
    );

    info!(index, change = ?change, next = %next, "proposing membership change");
    journal.append(index, &entry)?;
    commit_tracker.note_local_append()?;
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership(text: &str) -> Membership {
        text.parse().unwrap()
    }

    #[test]
    fn add_then_promote_then_remove() {
        let start = membership("n1:1,n2:2,n3:3");
        let node: RaftServer = "n4:4".parse().unwrap();

        let with_observer = MembershipChange::AddObserver(node.clone())
            .applied_to(&start)
            .unwrap();
        assert!(with_observer.observers.contains(&node));

        let promoted = MembershipChange::PromoteObserver(node.clone())
            .applied_to(&with_observer)
            .unwrap();
        assert!(promoted.contains_member(&node));
        assert!(promoted.observers.is_empty());
        assert_eq!(promoted.quorum_size(), 3);

        let removed = MembershipChange::RemoveMember(node.clone())
            .applied_to(&promoted)
            .unwrap();
        assert!(!removed.contains(&node));
    }

    #[test]
    fn change_validation() {
        let start = membership("n1:1,n2:2");
        let member: RaftServer = "n1:1".parse().unwrap();
        let stranger: RaftServer = "nx:9".parse().unwrap();

        assert!(MembershipChange::AddObserver(member.clone())
            .applied_to(&start)
            .is_err());
        assert!(MembershipChange::RemoveMember(stranger.clone())
            .applied_to(&start)
            .is_err());
        assert!(MembershipChange::PromoteObserver(stranger)
            .applied_to(&start)
            .is_err());

        let lone = membership("n1:1");
        assert!(MembershipChange::RemoveMember(member)
            .applied_to(&lone)
            .is_err());
    }
}
