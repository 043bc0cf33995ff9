//! Retry queues for aborted iterations and the escalation policy.
//!
//! Every thread owns a FIFO of items whose iteration aborted on it. The
//! queue is popped only by its owner but is pushed from anywhere, which is
//! how escalation works: each retry routes the item toward a more distant
//! thread (half-way to the package leader, then up the package tree), so
//! contention on a hot lock dissipates with growing radius.

use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;
use tracing::Level;

use crate::substrate::Topology;

/// An item that has aborted at least once. `retries` only ever grows.
#[derive(Debug)]
pub(crate) struct Aborted<T> {
    pub val: T,
    pub retries: u32,
}

/// Escalation policy selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AbortPolicy {
    /// `basic` on machines with at most two packages, `double` otherwise.
    #[default]
    Auto,
    /// Retry locally twice, climb within the package for a bounded number
    /// of levels, then climb packages.
    Bounded,
    /// Always retry locally.
    Eager,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PolicyKind {
    Basic,
    Double,
    Bounded,
    Eager,
}

pub(crate) struct AbortHandler<T> {
    queues: Vec<CachePadded<SegQueue<Aborted<T>>>>,
    kind: PolicyKind,
    topo: Topology,
}

impl<T> AbortHandler<T> {
    pub fn new(topo: &Topology, policy: AbortPolicy) -> Self {
        let kind = match policy {
            AbortPolicy::Auto => {
                if topo.max_packages() <= 2 {
                    PolicyKind::Basic
                } else {
                    PolicyKind::Double
                }
            }
            AbortPolicy::Bounded => PolicyKind::Bounded,
            AbortPolicy::Eager => PolicyKind::Eager,
        };
        Self {
            queues: (0..topo.threads())
                .map(|_| CachePadded::new(SegQueue::new()))
                .collect(),
            kind,
            topo: topo.clone(),
        }
    }

    /// First abort of an item: always retried locally.
    pub fn push_new(&self, tid: usize, val: T) {
        self.queues[tid].push(Aborted { val, retries: 1 });
    }

    /// Repeat abort: bump the retry count and route by policy.
    pub fn push_retry(&self, tid: usize, item: Aborted<T>) {
        let item = Aborted {
            val: item.val,
            retries: item.retries + 1,
        };
        let target = self.escalation_target(tid, item.retries);
        tracing::event!(name: "aborts::escalate", Level::TRACE, tid, target, retries = item.retries, "escalate");
        self.queues[target].push(item);
    }

    pub fn pop_local(&self, tid: usize) -> Option<Aborted<T>> {
        self.queues[tid].pop()
    }

    /// Where retry number `retries` of an item that aborted on `tid` is
    /// placed.
    pub fn escalation_target(&self, tid: usize, retries: u32) -> usize {
        let package = self.topo.package_of(tid);
        let leader = self.topo.leader_of(tid);
        match self.kind {
            PolicyKind::Eager => tid,
            // serialize via the tree over packages
            PolicyKind::Basic => self.topo.leader_of_package(package / 2),
            // odd retries stay local; even ones move half-way toward the
            // package leader, and leaders climb the package tree
            PolicyKind::Double => {
                if retries % 2 == 1 {
                    tid
                } else if tid != leader {
                    leader + (tid - leader) / 2
                } else {
                    self.topo.leader_of_package(package / 2)
                }
            }
            PolicyKind::Bounded => {
                if retries < 2 {
                    tid
                } else if retries < 5 && tid != leader {
                    leader + (tid - leader) / 2
                } else {
                    self.topo.leader_of_package(package / 2)
                }
            }
        }
    }
}
