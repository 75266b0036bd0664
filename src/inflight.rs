//! In-flight request accounting.
//!
//! Counters are striped across slots indexed by thread to keep the hot
//! increment off a single contended cache line; shutdown sums the
//! stripes until they reach zero.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

const STRIPES: usize = 16;

#[derive(Default)]
struct Stripe {
    count: AtomicI64,
    // padding so two stripes never share a cache line
    _pad: [u64; 7],
}

pub struct InFlightTracker {
    stripes: Vec<Stripe>,
    accepting: AtomicBool,
}

impl Default for InFlightTracker {
    fn default() -> Self {
        InFlightTracker {
            stripes: (0..STRIPES).map(|_| Stripe::default()).collect(),
            accepting: AtomicBool::new(true),
        }
    }
}

impl InFlightTracker {
    /// Register one in-flight request, unless the gate is closed.
    pub fn acquire(self: &Arc<Self>) -> Option<InFlightGuard> {
        if !self.accepting.load(Ordering::Acquire) {
            return None;
        }
        let slot = stripe_for_thread();
        self.stripes[slot].count.fetch_add(1, Ordering::AcqRel);
        Some(InFlightGuard {
            tracker: self.clone(),
            slot,
        })
    }

    pub fn total(&self) -> i64 {
        self.stripes
            .iter()
            .map(|stripe| stripe.count.load(Ordering::Acquire))
            .sum()
    }

    /// Stop admitting new requests.
    pub fn close_gate(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Spin until every in-flight request has drained.
    pub async fn drain(&self) {
        while self.total() > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

fn stripe_for_thread() -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    (hasher.finish() as usize) % STRIPES
}

pub struct InFlightGuard {
    tracker: Arc<InFlightTracker>,
    slot: usize,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.stripes[self.slot]
            .count
            .fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_gates() {
        let tracker = Arc::new(InFlightTracker::default());

        let one = tracker.acquire().unwrap();
        let two = tracker.acquire().unwrap();
        assert_eq!(tracker.total(), 2);

        drop(one);
        assert_eq!(tracker.total(), 1);

        tracker.close_gate();
        assert!(tracker.acquire().is_none());

        drop(two);
        assert_eq!(tracker.total(), 0);
    }
}
