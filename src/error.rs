use crate::{BlockId, CycleId, EdgeId, NodeId};
use std::fmt;
use thiserror::Error;

/// Fatal analysis errors. Any of these aborts the analysis of one path.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("node {0} does not exist")]
    UnknownNode(NodeId),

    #[error("edge {0} does not exist")]
    UnknownEdge(EdgeId),

    #[error("node {0} has been removed from the graph")]
    RemovedNode(NodeId),

    #[error("cycle {0} crosses no iteration boundary")]
    ZeroDistanceCycle(CycleId),

    #[error("cycle set edge {src} -> {dst} closes a loop in the cycle set DAG")]
    CycleSetLoop { src: u32, dst: u32 },

    #[error("no machine description for instruction class {0}")]
    UnknownInstruction(String),

    #[error("unit class {0} is not declared by the machine")]
    UnknownUnit(String),

    #[error("scheduling deadlock: {blocker} blocked twice at length {length}")]
    Deadlock { blocker: Blocker, length: u32 },

    #[error("gave up scheduling after {0} attempts")]
    TooManyAttempts(u32),

    #[error("negative count {count} derived for {site}")]
    NegativeCount { site: FlowSite, count: i64 },

    #[error("reconciliation failed twice in a row at {0}")]
    RepeatedFailure(FlowSite),

    #[error("reconciliation gave up after {0} failures")]
    TooManyFailures(u32),

    #[error("graph is empty")]
    EmptyGraph,
}

pub type Result<T> = std::result::Result<T, Error>;

/// The proximate reason a scheduling attempt did not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Blocker {
    /// A resource unit, indexed like ledger units.
    Unit(i32),
    Node(NodeId),
    Edge(EdgeId),
    Cycle(CycleId),
    /// The placement budget ran out.
    Budget,
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blocker::Unit(u) => write!(f, "unit {u}"),
            Blocker::Node(n) => write!(f, "node {n}"),
            Blocker::Edge(e) => write!(f, "edge {e}"),
            Blocker::Cycle(c) => write!(f, "cycle {c}"),
            Blocker::Budget => write!(f, "placement budget"),
        }
    }
}

/// Recoverable: no schedule fits at the attempted length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Infeasible {
    pub blocker: Blocker,
    /// Extra schedule length that resolves the blocker.
    pub extra_length: u32,
    /// Attempt number that failed, starting at 1.
    pub attempt: u32,
}

/// A place in the basic block graph where flow conservation was checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowSite {
    Block(BlockId),
    Arc(usize),
}

impl fmt::Display for FlowSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowSite::Block(b) => write!(f, "block {b}"),
            FlowSite::Arc(a) => write!(f, "arc {a}"),
        }
    }
}

/// Recoverable: guessed counts do not balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Imbalance {
    pub seed: BlockId,
    pub site: FlowSite,
    /// Amount the seed count must grow by.
    pub deficit: u64,
}

/// Why a retry loop must stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryStop {
    /// The same failure happened twice in a row.
    Repeated,
    /// The failure count reached the bound.
    Exhausted(u32),
}

/// Bookkeeping shared by the scheduling driver and count reconciliation:
/// remembers the previous failure and counts failures against a bound.
#[derive(Debug)]
pub(crate) struct RetryGuard<K> {
    last: Option<K>,
    failures: u32,
    max_failures: u32,
}

impl<K: PartialEq> RetryGuard<K> {
    pub(crate) fn new(max_failures: u32) -> Self {
        Self {
            last: None,
            failures: 0,
            max_failures,
        }
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }

    /// Record one failure identified by `key`.
    pub(crate) fn record(&mut self, key: K) -> std::result::Result<(), RetryStop> {
        self.failures += 1;
        if self.last.as_ref() == Some(&key) {
            return Err(RetryStop::Repeated);
        }
        self.last = Some(key);
        if self.failures >= self.max_failures {
            return Err(RetryStop::Exhausted(self.failures));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{RetryGuard, RetryStop};

    #[test]
    fn test_identical_failure_stops() {
        let mut guard = RetryGuard::new(10);
        assert_eq!(guard.record((1, 4)), Ok(()));
        assert_eq!(guard.record((1, 5)), Ok(()));
        assert_eq!(guard.record((1, 5)), Err(RetryStop::Repeated));
    }

    #[test]
    fn test_failure_bound() {
        let mut guard = RetryGuard::new(3);
        assert_eq!(guard.record(1), Ok(()));
        assert_eq!(guard.record(2), Ok(()));
        assert_eq!(guard.record(3), Err(RetryStop::Exhausted(3)));
        assert_eq!(guard.failures(), 3);
    }
}
