//! Execution count reconciliation over the basic block graph of a path.
//!
//! Profiled counts are sparse and noisy. Missing counts are derived from
//! flow conservation; when that stalls, one block is seeded with a guess
//! and the guess is raised by the exact deficit every time it makes some
//! derived count impossible.
use crate::{
    Error, FlowSite, Imbalance, Result, SchedulerConfig,
    error::{RetryGuard, RetryStop},
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Where a block count came from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountState {
    Measured(u64),
    /// a measured lower bound
    Partial(u64),
    Computed(u64),
    Guessed(u64),
    Unknown,
}

impl CountState {
    /// The exact count, when there is one.
    pub fn value(self) -> Option<u64> {
        match self {
            CountState::Measured(v) | CountState::Computed(v) | CountState::Guessed(v) => Some(v),
            CountState::Partial(_) | CountState::Unknown => None,
        }
    }

    fn lower_bound(self) -> Option<u64> {
        match self {
            CountState::Partial(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    /// entry of the path, inflow is not conserved
    pub is_source: bool,
    /// exit of the path, outflow is not conserved
    pub is_sink: bool,
    pub initial: CountState,
    pub count: CountState,
    incoming: Vec<usize>,
    outgoing: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct FlowArc {
    pub src: BlockId,
    pub dst: BlockId,
    pub measured: Option<u64>,
    pub count: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub guesses: u32,
    pub failures: u32,
}

/// A derived count that cannot be right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Violation {
    Negative { site: FlowSite, count: i64 },
    BelowPartial { site: FlowSite, deficit: u64 },
}

impl Violation {
    fn imbalance(self, seed: BlockId) -> Imbalance {
        match self {
            Violation::Negative { site, count } => Imbalance {
                seed,
                site,
                deficit: count.unsigned_abs(),
            },
            Violation::BelowPartial { site, deficit } => Imbalance {
                seed,
                site,
                deficit,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    In,
    Out,
}

#[derive(Debug, Clone, Default)]
pub struct BlockGraph {
    blocks: Vec<Block>,
    arcs: Vec<FlowArc>,
}

impl BlockGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&mut self, count: CountState, is_source: bool, is_sink: bool) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            id,
            is_source,
            is_sink,
            initial: count,
            count,
            incoming: vec![],
            outgoing: vec![],
        });
        id
    }

    pub fn add_arc(&mut self, src: BlockId, dst: BlockId, measured: Option<u64>) -> usize {
        let a = self.arcs.len();
        self.arcs.push(FlowArc {
            src,
            dst,
            measured,
            count: measured,
        });
        self.blocks[src.index()].outgoing.push(a);
        self.blocks[dst.index()].incoming.push(a);
        a
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn arcs(&self) -> &[FlowArc] {
        &self.arcs
    }

    pub fn count(&self, block: BlockId) -> CountState {
        self.blocks[block.index()].count
    }

    pub fn arc_count(&self, arc: usize) -> Option<u64> {
        self.arcs.get(arc).and_then(|a| a.count)
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| b.count.value().is_some())
            && self.arcs.iter().all(|a| a.count.is_some())
    }

    fn snapshot(&self) -> (Vec<CountState>, Vec<Option<u64>>) {
        (
            self.blocks.iter().map(|b| b.count).collect(),
            self.arcs.iter().map(|a| a.count).collect(),
        )
    }

    fn restore(&mut self, snapshot: &(Vec<CountState>, Vec<Option<u64>>)) {
        for (b, &count) in self.blocks.iter_mut().zip(&snapshot.0) {
            b.count = count;
        }
        for (a, &count) in self.arcs.iter_mut().zip(&snapshot.1) {
            a.count = count;
        }
    }

    /// Apply flow conservation until nothing changes. In guess mode a
    /// block computed below its partial bound is a violation, otherwise it
    /// is only reported.
    fn propagate(&mut self, guessing: bool) -> std::result::Result<(), Violation> {
        loop {
            let mut changed = false;
            for b in 0..self.blocks.len() {
                for side in [Side::In, Side::Out] {
                    let block = &self.blocks[b];
                    let arcs = match side {
                        Side::In if !block.is_source => &block.incoming,
                        Side::Out if !block.is_sink => &block.outgoing,
                        _ => continue,
                    };
                    if arcs.is_empty() {
                        continue;
                    }
                    let known: i64 = arcs
                        .iter()
                        .filter_map(|&a| self.arcs[a].count)
                        .map(|c| c as i64)
                        .sum();
                    let unknown: Vec<usize> = arcs
                        .iter()
                        .copied()
                        .filter(|&a| self.arcs[a].count.is_none())
                        .collect();
                    match (block.count.value(), unknown.as_slice()) {
                        (Some(count), &[a]) => {
                            let derived = count as i64 - known;
                            if derived < 0 {
                                return Err(Violation::Negative {
                                    site: FlowSite::Arc(a),
                                    count: derived,
                                });
                            }
                            self.arcs[a].count = Some(derived as u64);
                            changed = true;
                        }
                        (None, &[]) => {
                            let derived = known as u64;
                            if let Some(bound) = block.initial.lower_bound() {
                                if derived < bound {
                                    if guessing {
                                        return Err(Violation::BelowPartial {
                                            site: FlowSite::Block(block.id),
                                            deficit: bound - derived,
                                        });
                                    }
                                    warn!(
                                        "Block {} computed at {derived}, below its measured {bound}",
                                        block.id
                                    );
                                }
                            }
                            self.blocks[b].count = CountState::Computed(derived);
                            changed = true;
                        }
                        _ => {}
                    }
                }
            }
            if !changed {
                return Ok(());
            }
        }
    }

    /// Next guess seed: the partial block with the highest bound, else the
    /// first block without a count.
    fn pick_seed(&self) -> Option<BlockId> {
        let open = || self.blocks.iter().filter(|b| b.count.value().is_none());
        open()
            .filter_map(|b| b.count.lower_bound().map(|bound| (bound, std::cmp::Reverse(b.id))))
            .max()
            .map(|(_, std::cmp::Reverse(id))| id)
            .or_else(|| open().map(|b| b.id).next())
    }

    /// Fill in every count. A negative count derived from measurements
    /// alone is fatal; once guessing, inconsistencies raise the seed.
    pub fn reconcile(&mut self, config: &SchedulerConfig) -> Result<Reconciled> {
        if let Err(Violation::Negative { site, count }) = self.propagate(false) {
            return Err(Error::NegativeCount { site, count });
        }
        let mut guard = RetryGuard::new(config.max_repeat_failures.max(1));
        let mut guesses = 0;
        while let Some(seed) = self.pick_seed() {
            guesses += 1;
            let snapshot = self.snapshot();
            let mut value = self.blocks[seed.index()].count.lower_bound().unwrap_or(0);
            loop {
                self.restore(&snapshot);
                self.blocks[seed.index()].count = CountState::Guessed(value);
                let Err(violation) = self.propagate(true) else {
                    debug!("Guessed {value} for {seed}");
                    break;
                };
                let imbalance = violation.imbalance(seed);
                debug!(
                    "Guess {value} for {seed} fails at {} by {}",
                    imbalance.site, imbalance.deficit
                );
                match guard.record((imbalance.site, imbalance.deficit)) {
                    Err(RetryStop::Repeated) => return Err(Error::RepeatedFailure(imbalance.site)),
                    Err(RetryStop::Exhausted(n)) => return Err(Error::TooManyFailures(n)),
                    Ok(()) => {}
                }
                value += imbalance.deficit;
            }
        }
        let result = Reconciled {
            guesses,
            failures: guard.failures(),
        };
        if result.guesses > 0 {
            info!(
                "Reconciled counts with {} guesses and {} failures",
                result.guesses, result.failures
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use crate::{BlockGraph, CountState, Error, FlowSite, SchedulerConfig};

    #[test]
    fn test_measured_counts_flow_through() {
        let mut g = BlockGraph::new();
        let entry = g.add_block(CountState::Measured(10), true, false);
        let body = g.add_block(CountState::Unknown, false, false);
        let exit = g.add_block(CountState::Unknown, false, true);
        g.add_arc(entry, body, None);
        g.add_arc(body, exit, None);
        let r = g.reconcile(&SchedulerConfig::default()).unwrap();
        assert_eq!(r.guesses, 0);
        assert_eq!(g.count(exit), CountState::Computed(10));
        assert!(g.is_complete());
    }

    #[test]
    fn test_guess_is_raised_by_deficit() {
        let mut g = BlockGraph::new();
        let s = g.add_block(CountState::Partial(5), true, false);
        let r = g.add_block(CountState::Unknown, false, true);
        let x = g.add_block(CountState::Measured(9), false, true);
        let a0 = g.add_arc(s, r, None);
        let a1 = g.add_arc(s, x, None);
        let result = g.reconcile(&SchedulerConfig::default()).unwrap();
        assert_eq!(result.guesses, 1);
        assert_eq!(result.failures, 1);
        assert_eq!(g.arc_count(a1), Some(9));
        assert_eq!(g.arc_count(a0), Some(0));
        assert_eq!(g.count(s), CountState::Guessed(9));
        assert_eq!(g.count(r), CountState::Computed(0));
    }

    #[test]
    fn test_negative_count_without_guess_is_fatal() {
        let mut g = BlockGraph::new();
        let w = g.add_block(CountState::Unknown, true, false);
        let z = g.add_block(CountState::Unknown, true, false);
        let y = g.add_block(CountState::Measured(2), false, true);
        g.add_arc(w, y, Some(5));
        let zy = g.add_arc(z, y, None);
        assert_eq!(
            g.reconcile(&SchedulerConfig::default()).unwrap_err(),
            Error::NegativeCount {
                site: FlowSite::Arc(zy),
                count: -3
            }
        );
    }

    #[test]
    fn test_partial_violation_only_warns_outside_guessing() {
        let mut g = BlockGraph::new();
        let m = g.add_block(CountState::Measured(3), true, false);
        let p = g.add_block(CountState::Partial(10), false, true);
        g.add_arc(m, p, Some(3));
        let r = g.reconcile(&SchedulerConfig::default()).unwrap();
        assert_eq!(r.guesses, 0);
        assert_eq!(g.count(p), CountState::Computed(3));
    }

    #[test]
    fn test_failures_are_bounded() {
        let config = SchedulerConfig {
            max_repeat_failures: 5,
            ..SchedulerConfig::default()
        };
        let mut g = BlockGraph::new();
        let y = g.add_block(CountState::Measured(4), true, false);
        let s = g.add_block(CountState::Partial(6), false, true);
        let q = g.add_block(CountState::Unknown, false, true);
        g.add_arc(y, s, None);
        g.add_arc(y, q, None);
        assert_eq!(g.reconcile(&config).unwrap_err(), Error::TooManyFailures(5));
    }

    #[test]
    fn test_guess_that_cannot_help_is_fatal() {
        // the seed count enters `join` once directly and once subtracted
        // through `fork`, so raising it leaves the deficit at `rest`
        let mut g = BlockGraph::new();
        let fork = g.add_block(CountState::Measured(5), true, false);
        let seed = g.add_block(CountState::Partial(1), false, false);
        let join = g.add_block(CountState::Measured(2), false, true);
        let other = g.add_block(CountState::Unknown, true, false);
        g.add_arc(fork, seed, None);
        g.add_arc(fork, join, None);
        g.add_arc(seed, join, None);
        let rest = g.add_arc(other, join, None);
        assert_eq!(
            g.reconcile(&SchedulerConfig::default()).unwrap_err(),
            Error::RepeatedFailure(FlowSite::Arc(rest))
        );
    }

    #[test]
    fn test_highest_partial_is_seeded_first() {
        let mut g = BlockGraph::new();
        let a = g.add_block(CountState::Partial(3), true, true);
        let b = g.add_block(CountState::Partial(7), true, true);
        g.add_block(CountState::Unknown, true, true);
        assert_eq!(g.pick_seed(), Some(b));
        let r = g.reconcile(&SchedulerConfig::default()).unwrap();
        assert_eq!(r.guesses, 3);
        assert_eq!(g.count(a), CountState::Guessed(3));
        assert_eq!(g.count(b), CountState::Guessed(7));
    }
}
