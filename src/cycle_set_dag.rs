//! DAG over cycle sets, used to keep the scheduling order of interacting
//! strongly connected regions consistent.
use crate::{Error, Result};
use log::trace;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct DagNode {
    set: u32,
    /// order in which the set was fixed, starting at 1
    fixed: Option<u32>,
    outgoing: Vec<usize>,
    incoming: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DagEdge {
    pub src: u32,
    pub dst: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CycleSetDag {
    nodes: Vec<DagNode>,
    edges: Vec<(usize, usize)>,
    index: BTreeMap<u32, usize>,
    last_fix_id: u32,
    num_fixed: usize,
}

impl CycleSetDag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the node of cycle set `set`.
    pub fn add_cycle_set(&mut self, set: u32) -> usize {
        if let Some(&n) = self.index.get(&set) {
            return n;
        }
        let n = self.nodes.len();
        self.nodes.push(DagNode {
            set,
            fixed: None,
            outgoing: vec![],
            incoming: vec![],
        });
        self.index.insert(set, n);
        n
    }

    pub fn num_sets(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn contains(&self, set: u32) -> bool {
        self.index.contains_key(&set)
    }

    /// Add an ordering edge between two sets, creating the sets on demand.
    /// An edge that would close a loop is rejected.
    pub fn add_edge(&mut self, src: u32, dst: u32) -> Result<DagEdge> {
        let s = self.add_cycle_set(src);
        let d = self.add_cycle_set(dst);
        if self.reaches(d, s) {
            return Err(Error::CycleSetLoop { src, dst });
        }
        let e = self.edges.len();
        self.edges.push((s, d));
        self.nodes[s].outgoing.push(e);
        self.nodes[d].incoming.push(e);
        Ok(DagEdge { src, dst })
    }

    /// Like [`CycleSetDag::add_edge`], but a no-op when the edge exists.
    pub fn add_unique_edge(&mut self, src: u32, dst: u32) -> Result<DagEdge> {
        if let (Some(&s), Some(&d)) = (self.index.get(&src), self.index.get(&dst)) {
            if self.nodes[s].outgoing.iter().any(|&e| self.edges[e].1 == d) {
                return Ok(DagEdge { src, dst });
            }
        }
        self.add_edge(src, dst)
    }

    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![from];
        while let Some(n) = stack.pop() {
            if n == to {
                return true;
            }
            if std::mem::replace(&mut seen[n], true) {
                continue;
            }
            stack.extend(self.nodes[n].outgoing.iter().map(|&e| self.edges[e].1));
        }
        false
    }

    /// Fix `set` and every set reachable from it forward or backward.
    /// Returns how many sets were fixed in addition to `set`.
    pub fn fix_set(&mut self, set: u32) -> usize {
        let n = *self
            .index
            .get(&set)
            .unwrap_or_else(|| panic!("cycle set {set} is not in the DAG"));
        assert!(self.nodes[n].fixed.is_none(), "cycle set {set} is already fixed");
        self.mark(n);
        let extra = self.fix_reachable(n, true) + self.fix_reachable(n, false);
        self.num_fixed += 1 + extra;
        trace!("Fixed cycle set {set} and {extra} more");
        extra
    }

    fn mark(&mut self, n: usize) {
        self.last_fix_id += 1;
        self.nodes[n].fixed = Some(self.last_fix_id);
    }

    fn fix_reachable(&mut self, start: usize, forward: bool) -> usize {
        let mut count = 0;
        let mut stack = vec![start];
        while let Some(n) = stack.pop() {
            let next: Vec<usize> = if forward {
                self.nodes[n].outgoing.iter().map(|&e| self.edges[e].1).collect()
            } else {
                self.nodes[n].incoming.iter().map(|&e| self.edges[e].0).collect()
            };
            for m in next {
                if self.nodes[m].fixed.is_none() {
                    self.mark(m);
                    count += 1;
                    stack.push(m);
                }
            }
        }
        count
    }

    pub fn is_set_fixed(&self, set: u32) -> bool {
        self.index
            .get(&set)
            .is_some_and(|&n| self.nodes[n].fixed.is_some())
    }

    /// Order in which `set` was fixed.
    pub fn fix_order(&self, set: u32) -> Option<u32> {
        self.index.get(&set).and_then(|&n| self.nodes[n].fixed)
    }

    pub fn num_fixed_sets(&self) -> usize {
        self.num_fixed
    }

    pub fn reset_schedule(&mut self) {
        for node in &mut self.nodes {
            node.fixed = None;
        }
        self.last_fix_id = 0;
        self.num_fixed = 0;
    }

    pub fn sets(&self) -> impl Iterator<Item = u32> + '_ {
        self.nodes.iter().map(|n| n.set)
    }
}

#[cfg(test)]
mod tests {
    use crate::CycleSetDag;

    #[test]
    fn test_independent_sets() {
        let mut dag = CycleSetDag::new();
        dag.add_cycle_set(1);
        dag.add_cycle_set(2);
        assert_eq!(dag.fix_set(1), 0);
        assert!(dag.is_set_fixed(1));
        assert!(!dag.is_set_fixed(2));
        assert_eq!(dag.fix_set(2), 0);
        assert_eq!(dag.num_fixed_sets(), 2);
    }

    #[test]
    fn test_fix_propagates_both_ways() {
        let mut dag = CycleSetDag::new();
        // 1 -> 2 -> 3, 4 -> 2, 5 alone
        dag.add_edge(1, 2).unwrap();
        dag.add_edge(2, 3).unwrap();
        dag.add_edge(4, 2).unwrap();
        dag.add_cycle_set(5);
        assert_eq!(dag.fix_set(2), 3);
        assert_eq!(dag.fix_order(2), Some(1));
        for set in [1, 3, 4] {
            assert!(dag.is_set_fixed(set));
        }
        assert!(!dag.is_set_fixed(5));
        assert_eq!(dag.num_fixed_sets(), 4);
        assert!(dag.num_fixed_sets() <= dag.num_sets());

        dag.reset_schedule();
        assert_eq!(dag.num_fixed_sets(), 0);
        assert!(!dag.is_set_fixed(2));
        // from a leaf, the backward walk reaches everything upstream only
        assert_eq!(dag.fix_set(3), 3);
    }

    #[test]
    fn test_unique_edges() {
        let mut dag = CycleSetDag::new();
        dag.add_unique_edge(1, 2).unwrap();
        dag.add_unique_edge(1, 2).unwrap();
        assert_eq!(dag.num_edges(), 1);
        dag.add_edge(1, 2).unwrap();
        assert_eq!(dag.num_edges(), 2);
    }

    #[test]
    fn test_loop_is_rejected() {
        let mut dag = CycleSetDag::new();
        dag.add_edge(1, 2).unwrap();
        dag.add_edge(2, 3).unwrap();
        assert!(dag.add_edge(3, 1).is_err());
        assert!(dag.add_edge(2, 2).is_err());
        assert_eq!(dag.num_edges(), 2);
    }

    #[test]
    #[should_panic]
    fn test_fixing_twice_panics() {
        let mut dag = CycleSetDag::new();
        dag.add_cycle_set(7);
        dag.fix_set(7);
        dag.fix_set(7);
    }
}
