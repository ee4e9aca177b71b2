//! Compaction of the regions between barrier nodes into super edges.
use crate::{DepDirection, DepType, EdgeId, LatencySplit, NodeId, Result, SchedDg};
use log::{debug, trace};
use std::collections::{BTreeMap, BTreeSet};

/// Shortest and longest same-iteration latency between two barriers.
struct RegionPaths {
    shortest: u32,
    longest: u32,
    longest_path: Vec<EdgeId>,
}

impl SchedDg {
    /// Replace every region bounded by two consecutive barriers with a super
    /// edge. Regions that touch a dependence cycle are only compacted when
    /// `include_cyclic` is set. Returns the number of super edges created.
    pub fn compute_super_structures(&mut self, include_cyclic: bool) -> Result<usize> {
        let mut barriers: Vec<NodeId> = self
            .nodes()
            .filter(|n| n.roles.barrier)
            .map(|n| n.id)
            .collect();
        barriers.sort_by_key(|&b| self.nodes[b.index()].in_order);

        let mut created = 0;
        for pair in barriers.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            let region = self.region_edges(from, to);
            if region.is_empty() {
                continue;
            }
            if self.has_super_edge(from, to) {
                continue;
            }
            let touches_cycle = region
                .iter()
                .any(|e| !self.edges[e.index()].cycles.is_empty());
            if touches_cycle && !include_cyclic {
                trace!("Region {from} -> {to} is part of a cycle, left alone");
                continue;
            }
            let Some(paths) = self.region_paths(from, to, &region) else {
                continue;
            };
            let se = self.add_dependency(
                from,
                to,
                DepDirection::True,
                DepType::SuperEdge,
                0,
                0,
                false,
                1.0,
            )?;
            {
                let edge = &mut self.edges[se.index()];
                edge.min_latency = Some(paths.shortest);
                edge.latency = Some(paths.longest);
                edge.split = LatencySplit {
                    cpu: paths.longest,
                    mem: 0,
                };
            }
            for &e in &region {
                self.edges[e.index()].super_edge = Some(se);
            }
            self.subsumed.insert(se, region);
            let segment = self.add_cycle(paths.longest_path);
            self.segments.insert(se, segment);
            self.update_longest_cycle_of_sub_edges(se);
            debug!(
                "Super edge {se} {from} -> {to}: latency {}..{}",
                paths.shortest, paths.longest
            );
            created += 1;
        }
        Ok(created)
    }

    fn has_super_edge(&self, from: NodeId, to: NodeId) -> bool {
        self.nodes[from.index()].outgoing.iter().any(|&e| {
            let edge = &self.edges[e.index()];
            !edge.removed && edge.dtype == DepType::SuperEdge && edge.dst == to
        })
    }

    /// Same-iteration scheduling edges on some path from `from` to `to`.
    fn region_edges(&self, from: NodeId, to: NodeId) -> Vec<EdgeId> {
        let usable = |e: EdgeId| {
            let edge = &self.edges[e.index()];
            !edge.removed && edge.distance == 0 && edge.is_scheduling_edge() && edge.src != edge.dst
        };
        let reach = |start: NodeId, forward: bool| {
            let mut seen = BTreeSet::from([start]);
            let mut stack = vec![start];
            while let Some(v) = stack.pop() {
                let node = &self.nodes[v.index()];
                let list = if forward { &node.outgoing } else { &node.incoming };
                for &e in list {
                    if !usable(e) {
                        continue;
                    }
                    let edge = &self.edges[e.index()];
                    let w = if forward { edge.dst } else { edge.src };
                    // do not walk through the other barrier
                    if (forward && v == to) || (!forward && v == from) {
                        continue;
                    }
                    if seen.insert(w) {
                        stack.push(w);
                    }
                }
            }
            seen
        };
        let forward = reach(from, true);
        if !forward.contains(&to) {
            return vec![];
        }
        let backward = reach(to, false);
        self.edges()
            .filter(|e| {
                usable(e.id)
                    && e.src != to
                    && e.dst != from
                    && forward.contains(&e.src)
                    && backward.contains(&e.src)
                    && forward.contains(&e.dst)
                    && backward.contains(&e.dst)
            })
            .map(|e| e.id)
            .collect()
    }

    fn region_paths(&self, from: NodeId, to: NodeId, region: &[EdgeId]) -> Option<RegionPaths> {
        let mut out: BTreeMap<NodeId, Vec<EdgeId>> = BTreeMap::new();
        let mut indeg: BTreeMap<NodeId, u32> = BTreeMap::new();
        for &e in region {
            let edge = &self.edges[e.index()];
            out.entry(edge.src).or_default().push(e);
            *indeg.entry(edge.dst).or_default() += 1;
            indeg.entry(edge.src).or_default();
        }
        // (shortest, longest, edge into node on the longest path)
        let mut best: BTreeMap<NodeId, (u32, u32, Option<EdgeId>)> = BTreeMap::new();
        best.insert(from, (0, 0, None));
        let mut ready: Vec<NodeId> = indeg
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        while let Some(v) = ready.pop() {
            let current = best.get(&v).copied();
            for &e in out.get(&v).map(|v| v.as_slice()).unwrap_or(&[]) {
                let edge = &self.edges[e.index()];
                let lat = edge.latency.unwrap_or(0);
                if let Some((s, l, _)) = current {
                    let entry = best.entry(edge.dst).or_insert((u32::MAX, 0, None));
                    entry.0 = entry.0.min(s + lat);
                    if entry.2.is_none() || l + lat > entry.1 {
                        entry.1 = l + lat;
                        entry.2 = Some(e);
                    }
                }
                if let Some(d) = indeg.get_mut(&edge.dst) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(edge.dst);
                    }
                }
            }
        }
        let &(shortest, longest, _) = best.get(&to)?;
        let mut longest_path = vec![];
        let mut cur = to;
        while cur != from {
            let e = best.get(&cur)?.2?;
            longest_path.push(e);
            cur = self.edges[e.index()].src;
        }
        longest_path.reverse();
        Some(RegionPaths {
            shortest,
            longest,
            longest_path,
        })
    }

    /// Edges summarized by a super edge.
    pub fn sub_edges(&self, super_edge: EdgeId) -> &[EdgeId] {
        self.subsumed
            .get(&super_edge)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn num_super_edges(&self) -> usize {
        self.subsumed.len()
    }

    /// Refresh a super edge from its sub edges: its latencies and the
    /// longest cycle any of them belongs to.
    pub fn update_longest_cycle_of_sub_edges(&mut self, super_edge: EdgeId) {
        let Some(subs) = self.subsumed.get(&super_edge) else {
            return;
        };
        let longest = subs
            .iter()
            .map(|e| self.edges[e.index()].longest_cycle)
            .max()
            .unwrap_or(0);
        let (from, to) = {
            let edge = &self.edges[super_edge.index()];
            (edge.src, edge.dst)
        };
        let paths = self.region_paths(from, to, subs);
        let edge = &mut self.edges[super_edge.index()];
        edge.longest_cycle = edge.longest_cycle.max(longest);
        if let Some(paths) = paths {
            edge.min_latency = Some(paths.shortest);
            edge.latency = Some(paths.longest);
            edge.split = LatencySplit {
                cpu: paths.longest,
                mem: 0,
            };
        }
    }

    /// Change the latency of one edge and refresh everything derived from it.
    pub fn set_edge_latency(&mut self, id: EdgeId, latency: u32) -> Result<()> {
        self.edge(id)?;
        {
            let edge = &mut self.edges[id.index()];
            edge.latency = Some(latency);
            let mem = edge.split.mem.min(latency);
            edge.split = LatencySplit {
                cpu: latency - mem,
                mem,
            };
        }
        self.refresh_cycle_lengths();
        if let Some(se) = self.edges[id.index()].super_edge {
            self.update_longest_cycle_of_sub_edges(se);
        }
        Ok(())
    }

    /// Remove a super edge. Its sub edges stay in the graph, disowned.
    pub fn remove_super_edge(&mut self, super_edge: EdgeId) {
        let Some(subs) = self.subsumed.remove(&super_edge) else {
            return;
        };
        for e in subs {
            let edge = &mut self.edges[e.index()];
            if edge.super_edge == Some(super_edge) {
                edge.super_edge = None;
            }
        }
        if let Some(segment) = self.segments.remove(&super_edge) {
            self.remove_cycle(segment);
        }
        let _ = self.remove_edge(super_edge);
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        DepDirection, DepType, SchedDg, SchedulerConfig, graph::tests::chain,
        machine::tests::test_machine,
    };

    #[test]
    fn test_region_becomes_super_edge() {
        let machine = test_machine();
        let mut dg = SchedDg::new(SchedulerConfig::default());
        // 0 -> 1 -> 2 -> 3 plus a shortcut 0 -> 3
        let n = chain(&mut dg, 4);
        dg.add_dependency(n[0], n[3], DepDirection::True, DepType::GpRegister, 0, 0, false, 1.0)
            .unwrap();
        dg.node_mut(n[0]).unwrap().roles.barrier = true;
        dg.node_mut(n[3]).unwrap().roles.barrier = true;
        dg.compute_edge_latencies(&machine).unwrap();
        assert_eq!(dg.compute_super_structures(false).unwrap(), 1);
        let se = dg
            .edges()
            .find(|e| e.dtype == DepType::SuperEdge)
            .map(|e| e.id)
            .unwrap();
        assert_eq!(dg.sub_edges(se).len(), 4);
        assert_eq!(dg.edge(se).unwrap().min_latency, Some(1));
        assert_eq!(dg.edge(se).unwrap().latency, Some(3));
        assert!(dg.edges().filter(|e| e.id != se).all(|e| e.super_edge == Some(se)));
        // the longest path is registered as a segment, not a cycle
        assert_eq!(dg.num_cycles(), 0);
        assert_eq!(dg.cycles().filter(|c| c.is_segment).count(), 1);
        // running again does not duplicate
        assert_eq!(dg.compute_super_structures(false).unwrap(), 0);
    }

    #[test]
    fn test_sub_edge_latency_change_updates_super_edge() {
        let machine = test_machine();
        let mut dg = SchedDg::new(SchedulerConfig::default());
        let n = chain(&mut dg, 3);
        dg.node_mut(n[0]).unwrap().roles.barrier = true;
        dg.node_mut(n[2]).unwrap().roles.barrier = true;
        dg.compute_edge_latencies(&machine).unwrap();
        dg.compute_super_structures(false).unwrap();
        let se = dg.edges().find(|e| e.dtype == DepType::SuperEdge).unwrap().id;
        let first = dg.sub_edges(se)[0];
        dg.set_edge_latency(first, 5).unwrap();
        assert_eq!(dg.edge(se).unwrap().latency, Some(6));
        assert_eq!(dg.edge(se).unwrap().min_latency, Some(6));
    }

    #[test]
    fn test_remove_super_edge_disowns_sub_edges() {
        let machine = test_machine();
        let mut dg = SchedDg::new(SchedulerConfig::default());
        let n = chain(&mut dg, 3);
        dg.node_mut(n[0]).unwrap().roles.barrier = true;
        dg.node_mut(n[2]).unwrap().roles.barrier = true;
        dg.compute_edge_latencies(&machine).unwrap();
        dg.compute_super_structures(false).unwrap();
        let se = dg.edges().find(|e| e.dtype == DepType::SuperEdge).unwrap().id;
        dg.remove_super_edge(se);
        assert_eq!(dg.num_super_edges(), 0);
        assert!(dg.edge(se).unwrap().removed);
        assert!(dg.edges().all(|e| e.super_edge.is_none()));
        assert_eq!(dg.cycles().count(), 0);
        assert_eq!(dg.num_edges(), 2);
    }

    #[test]
    fn test_cyclic_region_needs_opt_in() {
        let machine = test_machine();
        let mut dg = SchedDg::new(SchedulerConfig::default());
        let n = chain(&mut dg, 3);
        dg.add_dependency(n[2], n[1], DepDirection::True, DepType::GpRegister, 1, 0, false, 1.0)
            .unwrap();
        dg.node_mut(n[0]).unwrap().roles.barrier = true;
        dg.node_mut(n[2]).unwrap().roles.barrier = true;
        dg.compute_edge_latencies(&machine).unwrap();
        dg.find_dependency_cycles().unwrap();
        assert_eq!(dg.compute_super_structures(false).unwrap(), 0);
        assert_eq!(dg.compute_super_structures(true).unwrap(), 1);
        // the cycle through 1 -> 2 is still there
        assert_eq!(dg.num_cycles(), 1);
    }
}
