use crate::{Cycle, CycleId, EdgeId, Error, NodeId, Result, SchedDg};
use log::{debug, info, trace};
use std::collections::{BTreeSet, VecDeque};

impl SchedDg {
    /// Register a new cycle (or segment when the walk is open).
    pub fn add_cycle(&mut self, edges: Vec<EdgeId>) -> CycleId {
        let id = self.insert_cycle(edges);
        self.update_longest_cycles();
        id
    }

    /// Like [`SchedDg::add_cycle`] but returns the existing cycle with the
    /// same edges if there is one.
    pub fn add_unique_cycle(&mut self, edges: Vec<EdgeId>) -> CycleId {
        let id = self.insert_unique_cycle(edges);
        self.update_longest_cycles();
        id
    }

    /// Drop a cycle and its membership records.
    pub fn remove_cycle(&mut self, id: CycleId) {
        self.drop_cycle(id);
        self.update_longest_cycles();
    }

    /// Longest cycle values are stale until [`SchedDg::update_longest_cycles`].
    fn insert_cycle(&mut self, edges: Vec<EdgeId>) -> CycleId {
        let id = CycleId(self.next_cycle_id);
        self.next_cycle_id += 1;
        let first = edges.first().map(|e| self.edges[e.index()].src);
        let last = edges.last().map(|e| self.edges[e.index()].dst);
        let is_segment = first != last;
        let mut raw_length = 0;
        let mut iterations = 0;
        for e in &edges {
            let edge = &mut self.edges[e.index()];
            raw_length += edge.latency.unwrap_or(0);
            iterations += edge.distance;
            // segments do not make their edges cyclic
            if is_segment {
                continue;
            }
            edge.cycles.push(id);
            let src = edge.src;
            let node = &mut self.nodes[src.index()];
            if !node.cycles.contains(&id) {
                node.cycles.push(id);
            }
        }
        let mut key = edges.clone();
        key.sort();
        self.cycle_index.insert(key, id);
        let cycle = Cycle {
            id,
            is_segment,
            edges,
            raw_length,
            iterations,
            num_paths: 1,
            latency: None,
        };
        trace!(
            "Cycle {id}: {} edges, raw length {raw_length}, {iterations} iterations",
            cycle.edges.len()
        );
        self.cycles.insert(id, cycle);
        id
    }

    fn insert_unique_cycle(&mut self, edges: Vec<EdgeId>) -> CycleId {
        let mut key = edges.clone();
        key.sort();
        match self.cycle_index.get(&key) {
            Some(&id) => id,
            None => self.insert_cycle(edges),
        }
    }

    fn drop_cycle(&mut self, id: CycleId) {
        let Some(cycle) = self.cycles.remove(&id) else {
            return;
        };
        let mut key = cycle.edges.clone();
        key.sort();
        self.cycle_index.remove(&key);
        for e in &cycle.edges {
            let edge = &mut self.edges[e.index()];
            edge.cycles.retain(|&c| c != id);
            let src = edge.src;
            self.nodes[src.index()].cycles.retain(|&c| c != id);
        }
        self.segments.retain(|_, c| *c != id);
    }

    /// Recompute raw lengths after edge latencies changed.
    pub(crate) fn refresh_cycle_lengths(&mut self) {
        for cycle in self.cycles.values_mut() {
            cycle.raw_length = cycle
                .edges
                .iter()
                .map(|e| self.edges[e.index()].latency.unwrap_or(0))
                .sum();
            cycle.latency = None;
        }
        self.update_longest_cycles();
    }

    /// Propagate the longest cycle latency to member nodes and edges.
    pub(crate) fn update_longest_cycles(&mut self) {
        for node in &mut self.nodes {
            node.longest_cycle = 0;
        }
        for edge in &mut self.edges {
            edge.longest_cycle = 0;
        }
        for cycle in self.cycles.values().filter(|c| !c.is_segment) {
            let latency = cycle.latency();
            for e in &cycle.edges {
                let edge = &mut self.edges[e.index()];
                edge.longest_cycle = edge.longest_cycle.max(latency);
                let node = &mut self.nodes[edge.src.index()];
                node.longest_cycle = node.longest_cycle.max(latency);
            }
        }
        let supers: Vec<EdgeId> = self.subsumed.keys().copied().collect();
        for se in supers {
            self.update_longest_cycle_of_sub_edges(se);
        }
    }

    /// Enumerate dependence cycles over scheduling edges. Sparse components
    /// get every elementary cycle; dense ones, or every component once the
    /// cycle count passes the threshold, only get enough cycles to cover
    /// each of their edges.
    pub fn find_dependency_cycles(&mut self) -> Result<usize> {
        for id in self.cycles.keys().copied().collect::<Vec<_>>() {
            if !self.cycles[&id].is_segment {
                self.drop_cycle(id);
            }
        }
        self.limp_cycles = false;
        let num_sccs = self.compute_sccs();
        let mut members: Vec<Vec<NodeId>> = vec![vec![]; num_sccs as usize];
        for node in self.nodes() {
            if let Some(scc) = node.scc {
                members[scc as usize].push(node.id);
            }
        }

        for (scc, nodes) in members.iter().enumerate() {
            let internal = self.scc_edges(scc as u32);
            if internal.is_empty() {
                continue;
            }
            let density = internal.len() as f64 / nodes.len() as f64;
            if !self.limp_cycles && density > self.config.limp_density_threshold {
                debug!("SCC {scc} has density {density:.2}, covering its edges only");
                self.cover_scc_edges(&internal);
                continue;
            }
            if self.limp_cycles || !self.enumerate_scc_cycles(scc as u32, nodes) {
                self.cover_scc_edges(&internal);
            }
        }

        for cycle in self.cycles.values().filter(|c| !c.is_segment) {
            if cycle.iterations == 0 {
                return Err(Error::ZeroDistanceCycle(cycle.id));
            }
        }
        self.update_longest_cycles();
        self.build_cycle_set_dag()?;
        let count = self.num_cycles();
        info!(
            "Found {count} dependence cycles in {num_sccs} SCCs{}",
            if self.limp_cycles { " (limp mode)" } else { "" }
        );
        Ok(count)
    }

    /// Scheduling edges with both ends in component `scc`.
    fn scc_edges(&self, scc: u32) -> Vec<EdgeId> {
        self.edges()
            .filter(|e| {
                e.is_scheduling_edge()
                    && self.nodes[e.src.index()].scc == Some(scc)
                    && self.nodes[e.dst.index()].scc == Some(scc)
            })
            .map(|e| e.id)
            .collect()
    }

    /// Depth first enumeration of elementary cycles, each rooted at its
    /// lowest numbered node. Returns false when the cycle or step budget ran
    /// out and limp mode took over.
    fn enumerate_scc_cycles(&mut self, scc: u32, nodes: &[NodeId]) -> bool {
        let threshold = self.config.limp_cycle_threshold;
        let step_budget = threshold.saturating_mul(64);
        let mut steps = 0usize;
        let mut found: Vec<Vec<EdgeId>> = vec![];
        let mut sorted: Vec<NodeId> = nodes.to_vec();
        sorted.sort();

        for &start in &sorted {
            let mut path: Vec<EdgeId> = vec![];
            let mut on_path = BTreeSet::from([start]);
            // (node, next outgoing position)
            let mut work: Vec<(NodeId, usize)> = vec![(start, 0)];
            while let Some(top) = work.len().checked_sub(1) {
                let (v, pos) = work[top];
                let outgoing = &self.nodes[v.index()].outgoing;
                if pos >= outgoing.len() {
                    work.pop();
                    on_path.remove(&v);
                    path.pop();
                    continue;
                }
                work[top].1 += 1;
                steps += 1;
                if steps > step_budget {
                    self.limp_cycles = true;
                    break;
                }
                let e = outgoing[pos];
                let edge = &self.edges[e.index()];
                if edge.removed
                    || !edge.is_scheduling_edge()
                    || self.nodes[edge.dst.index()].scc != Some(scc)
                    || edge.dst < start
                {
                    continue;
                }
                if edge.dst == start {
                    let mut cycle = path.clone();
                    cycle.push(e);
                    found.push(cycle);
                    if self.cycles.len() + found.len() >= threshold {
                        self.limp_cycles = true;
                        break;
                    }
                } else if !on_path.contains(&edge.dst) {
                    on_path.insert(edge.dst);
                    path.push(e);
                    work.push((edge.dst, 0));
                }
            }
            if self.limp_cycles {
                break;
            }
        }

        for cycle in found {
            self.insert_unique_cycle(cycle);
        }
        if self.limp_cycles {
            info!("Cycle enumeration switched to limp mode in SCC {scc}");
        }
        !self.limp_cycles
    }

    /// Make sure each edge in `internal` belongs to at least one cycle by
    /// closing it with a shortest path back to its source.
    fn cover_scc_edges(&mut self, internal: &[EdgeId]) {
        let allowed: BTreeSet<EdgeId> = internal.iter().copied().collect();
        for &e in internal {
            if !self.edges[e.index()].cycles.is_empty() {
                continue;
            }
            let (src, dst) = (self.edges[e.index()].src, self.edges[e.index()].dst);
            let mut cycle = vec![e];
            if src != dst {
                match self.shortest_path(dst, src, &allowed) {
                    Some(path) => cycle.extend(path),
                    None => continue,
                }
            }
            self.insert_unique_cycle(cycle);
        }
    }

    /// Fewest-edge path from `from` to `to` using only `allowed` edges.
    fn shortest_path(
        &self,
        from: NodeId,
        to: NodeId,
        allowed: &BTreeSet<EdgeId>,
    ) -> Option<Vec<EdgeId>> {
        let mut parent: Vec<Option<EdgeId>> = vec![None; self.nodes.len()];
        let mut seen = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from([from]);
        seen[from.index()] = true;
        while let Some(v) = queue.pop_front() {
            if v == to {
                let mut path = vec![];
                let mut cur = to;
                while cur != from {
                    let e = parent[cur.index()]?;
                    path.push(e);
                    cur = self.edges[e.index()].src;
                }
                path.reverse();
                return Some(path);
            }
            for &e in &self.nodes[v.index()].outgoing {
                if !allowed.contains(&e) {
                    continue;
                }
                let w = self.edges[e.index()].dst;
                if !seen[w.index()] {
                    seen[w.index()] = true;
                    parent[w.index()] = Some(e);
                    queue.push_back(w);
                }
            }
        }
        None
    }

    /// Cycle sets are SCCs holding at least one cycle; they are ordered by
    /// the scheduling edges that connect them, directly or through nodes
    /// outside any cycle set.
    fn build_cycle_set_dag(&mut self) -> Result<()> {
        self.cycle_dag = crate::CycleSetDag::new();
        let sets: BTreeSet<u32> = self
            .cycles
            .values()
            .filter(|c| !c.is_segment)
            .flat_map(|c| c.edges.iter())
            .filter_map(|e| self.nodes[self.edges[e.index()].src.index()].scc)
            .collect();
        for &set in &sets {
            self.cycle_dag.add_cycle_set(set);
        }
        for &set in &sets {
            let mut seen = vec![false; self.nodes.len()];
            let mut stack: Vec<NodeId> = self
                .nodes()
                .filter(|n| n.scc == Some(set))
                .map(|n| n.id)
                .collect();
            for n in &stack {
                seen[n.index()] = true;
            }
            while let Some(v) = stack.pop() {
                for &e in &self.nodes[v.index()].outgoing {
                    let edge = &self.edges[e.index()];
                    if edge.removed || !edge.is_scheduling_edge() {
                        continue;
                    }
                    let w = edge.dst;
                    if seen[w.index()] {
                        continue;
                    }
                    seen[w.index()] = true;
                    match self.nodes[w.index()].scc {
                        Some(other) if sets.contains(&other) => {
                            self.cycle_dag.add_unique_edge(set, other)?;
                        }
                        _ => stack.push(w),
                    }
                }
            }
        }
        Ok(())
    }

    /// Cycle set of a node, when it belongs to one.
    pub fn cycle_set_of(&self, node: NodeId) -> Option<u32> {
        let scc = self.nodes.get(node.index())?.scc?;
        self.cycle_dag.contains(scc).then_some(scc)
    }

    /// Longest cycle latency per iteration, the dependency-only lower bound.
    pub fn min_length_due_to_dependencies(&self) -> u32 {
        self.cycles
            .values()
            .filter(|c| !c.is_segment)
            .map(|c| c.latency())
            .max()
            .unwrap_or(0)
    }

    /// The cycle that sets the dependency bound.
    pub fn longest_cycle(&self) -> Option<CycleId> {
        self.cycles
            .values()
            .filter(|c| !c.is_segment)
            .max_by_key(|c| (c.latency(), std::cmp::Reverse(c.id)))
            .map(|c| c.id)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        DepDirection, DepType, Error, SchedDg, SchedulerConfig,
        graph::tests::{chain, int_op},
        machine::tests::test_machine,
    };

    #[test]
    fn test_self_loop() {
        let mut dg = SchedDg::new(SchedulerConfig::default());
        let a = dg.add_node(0x10, 0, int_op());
        let e = dg
            .add_dependency(a, a, DepDirection::True, DepType::GpRegister, 1, 0, false, 1.0)
            .unwrap();
        dg.compute_edge_latencies(&test_machine()).unwrap();
        dg.edges[e.index()].latency = Some(4);
        assert_eq!(dg.find_dependency_cycles().unwrap(), 1);
        let cycle = dg.cycles().next().unwrap();
        assert_eq!(cycle.raw_length, 4);
        assert_eq!(cycle.iterations, 1);
        assert_eq!(dg.min_length_due_to_dependencies(), 4);
        assert_eq!(dg.node(a).unwrap().longest_cycle, 4);
    }

    #[test]
    fn test_exhaustive_enumeration() {
        let mut dg = SchedDg::new(SchedulerConfig::default());
        let n = chain(&mut dg, 3);
        // two ways back: 2 -> 0 and 1 -> 0
        let long_back = dg
            .add_dependency(n[2], n[0], DepDirection::True, DepType::GpRegister, 1, 0, false, 1.0)
            .unwrap();
        let short_back = dg
            .add_dependency(n[1], n[0], DepDirection::True, DepType::GpRegister, 2, 0, false, 1.0)
            .unwrap();
        dg.compute_edge_latencies(&test_machine()).unwrap();
        assert_eq!(dg.find_dependency_cycles().unwrap(), 2);
        assert!(!dg.used_limp_cycles());
        // each edge carries the longest cycle through it
        let first = dg.node(n[0]).unwrap().outgoing[0];
        assert_eq!(dg.edge(first).unwrap().longest_cycle, 3);
        assert_eq!(dg.edge(long_back).unwrap().longest_cycle, 3);
        assert_eq!(dg.edge(short_back).unwrap().longest_cycle, 1);
        assert!(n.iter().all(|&v| dg.node(v).unwrap().longest_cycle == 3));
        // 0 -> 1 -> 2 -> 0 has three unit edges over one iteration
        assert_eq!(dg.min_length_due_to_dependencies(), 3);
        // re-running does not duplicate
        assert_eq!(dg.find_dependency_cycles().unwrap(), 2);
        assert_eq!(dg.cycle_set_dag().num_sets(), 1);
    }

    #[test]
    fn test_limp_mode_covers_every_edge() {
        let config = SchedulerConfig {
            limp_cycle_threshold: 1,
            ..SchedulerConfig::default()
        };
        let mut dg = SchedDg::new(config);
        let n = chain(&mut dg, 4);
        for i in 1..4 {
            dg.add_dependency(n[i], n[0], DepDirection::True, DepType::GpRegister, 1, 0, false, 1.0)
                .unwrap();
        }
        dg.compute_edge_latencies(&test_machine()).unwrap();
        let found = dg.find_dependency_cycles().unwrap();
        assert!(dg.used_limp_cycles());
        assert!(found >= 1);
        assert!(dg.edges().all(|e| !e.cycles.is_empty()));
    }

    #[test]
    fn test_zero_distance_cycle_is_fatal() {
        let mut dg = SchedDg::new(SchedulerConfig::default());
        let n = chain(&mut dg, 2);
        dg.add_dependency(n[1], n[0], DepDirection::True, DepType::GpRegister, 0, 0, false, 1.0)
            .unwrap();
        assert!(matches!(
            dg.find_dependency_cycles(),
            Err(Error::ZeroDistanceCycle(_))
        ));
    }

    #[test]
    fn test_removing_edge_invalidates_cycles() {
        let mut dg = SchedDg::new(SchedulerConfig::default());
        let n = chain(&mut dg, 2);
        let back = dg
            .add_dependency(n[1], n[0], DepDirection::True, DepType::GpRegister, 1, 0, false, 1.0)
            .unwrap();
        dg.compute_edge_latencies(&test_machine()).unwrap();
        assert_eq!(dg.find_dependency_cycles().unwrap(), 1);
        dg.remove_edge(back).unwrap();
        assert_eq!(dg.num_cycles(), 0);
        assert!(dg.nodes().all(|n| n.cycles.is_empty() && n.longest_cycle == 0));
        assert_eq!(dg.min_length_due_to_dependencies(), 0);
    }

    #[test]
    fn test_cycle_sets_are_ordered() {
        let mut dg = SchedDg::new(SchedulerConfig::default());
        let n = chain(&mut dg, 3);
        dg.add_dependency(n[0], n[0], DepDirection::True, DepType::GpRegister, 1, 0, false, 1.0)
            .unwrap();
        dg.add_dependency(n[2], n[2], DepDirection::True, DepType::GpRegister, 1, 0, false, 1.0)
            .unwrap();
        dg.compute_edge_latencies(&test_machine()).unwrap();
        assert_eq!(dg.find_dependency_cycles().unwrap(), 2);
        let s0 = dg.cycle_set_of(n[0]).unwrap();
        let s2 = dg.cycle_set_of(n[2]).unwrap();
        assert_eq!(dg.cycle_set_of(n[1]), None);
        assert_eq!(dg.cycle_set_dag().num_edges(), 1);
        let mut dag = dg.cycle_set_dag().clone();
        assert_eq!(dag.fix_set(s0), 1);
        assert!(dag.is_set_fixed(s2));
    }
}
