use crate::{
    CycleSetDag, Error, InstrKind, InstructionClass, Machine, Result, RetiredUopType,
    ScheduleTime, SchedulerConfig, TimeAccount,
};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

macro_rules! id_type {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(NodeId, "N");
id_type!(EdgeId, "E");
id_type!(CycleId, "C");

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepDirection {
    Anti,
    Output,
    True,
    Changing,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepType {
    GpRegister,
    AddrRegister,
    Memory,
    Control,
    Structure,
    SuperEdge,
}

/// Roles a micro-op plays in the loop body.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct NodeRoles {
    pub barrier: bool,
    pub loop_condition: bool,
    pub address_calculation: bool,
    pub replicated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneState {
    Live,
    Removed { replacement: Option<NodeId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedStatus {
    Unscheduled,
    Scheduled {
        time: ScheduleTime,
        unit: Option<usize>,
    },
}

#[derive(Debug, Clone)]
pub struct DependenceNode {
    pub id: NodeId,
    pub address: u64,
    /// index of the micro-op inside its native instruction
    pub uop_index: u32,
    pub class: InstructionClass,
    pub roles: NodeRoles,
    pub prune: PruneState,
    pub status: SchedStatus,
    /// extra cycles a load pays in the memory hierarchy
    pub mem_penalty: u32,
    pub latency: u32,
    /// decode order on the path
    pub in_order: u32,
    pub scc: Option<u32>,
    pub cycles: Vec<CycleId>,
    pub longest_cycle: u32,
    /// longest latency path from any root, and to any leaf
    pub depth: u32,
    pub height: u32,
    pub in_degree: u32,
    pub out_degree: u32,
    pub(crate) incoming: Vec<EdgeId>,
    pub(crate) outgoing: Vec<EdgeId>,
}

impl DependenceNode {
    pub fn is_live(&self) -> bool {
        self.prune == PruneState::Live
    }

    pub fn time(&self) -> Option<ScheduleTime> {
        match self.status {
            SchedStatus::Scheduled { time, .. } => Some(time),
            SchedStatus::Unscheduled => None,
        }
    }

    pub fn retired_uop_type(&self) -> RetiredUopType {
        if self.roles.loop_condition {
            return RetiredUopType::LoopCond;
        }
        if self.roles.address_calculation {
            return RetiredUopType::AddrGen;
        }
        match self.class.kind {
            InstrKind::Move => RetiredUopType::RegMove,
            InstrKind::FpArith => RetiredUopType::FpWork,
            InstrKind::IntArith => RetiredUopType::IntWork,
            InstrKind::Load | InstrKind::Store => RetiredUopType::MemWork,
            InstrKind::Branch => RetiredUopType::Branches,
            InstrKind::Prefetch => RetiredUopType::Prefetch,
            InstrKind::Nop => RetiredUopType::Nop,
        }
    }
}

/// Latency of an edge split between core and memory hierarchy.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencySplit {
    pub cpu: u32,
    pub mem: u32,
}

impl LatencySplit {
    pub fn total(&self) -> u32 {
        self.cpu + self.mem
    }
}

#[derive(Debug, Clone)]
pub struct DependenceEdge {
    pub id: EdgeId,
    pub src: NodeId,
    pub dst: NodeId,
    pub direction: DepDirection,
    pub dtype: DepType,
    /// iterations crossed, 0 within one iteration
    pub distance: u32,
    pub level: u32,
    pub overlapped: bool,
    pub probability: f64,
    /// statically derived lower bound
    pub min_latency: Option<u32>,
    /// value used by the current scheduling attempt
    pub latency: Option<u32>,
    pub split: LatencySplit,
    pub removed: bool,
    pub cycles: Vec<CycleId>,
    pub longest_cycle: u32,
    /// super edge that subsumes this edge
    pub super_edge: Option<EdgeId>,
    pub slack_used: u32,
    pub committed: bool,
}

impl DependenceEdge {
    /// Edges that carry a value or order memory take part in cycles.
    pub fn is_scheduling_edge(&self) -> bool {
        !matches!(self.dtype, DepType::Structure | DepType::SuperEdge)
            && (self.dtype == DepType::Memory || self.direction == DepDirection::True)
    }

    /// Latency used when proving an edge redundant.
    fn prune_latency(&self) -> u32 {
        match (self.latency, self.direction) {
            (Some(l), _) => l,
            (None, DepDirection::Anti) => 0,
            (None, _) => 1,
        }
    }
}

/// A closed walk of edges, or an open path for segments.
#[derive(Debug, Clone)]
pub struct Cycle {
    pub id: CycleId,
    pub edges: Vec<EdgeId>,
    pub is_segment: bool,
    /// sum of edge latencies at registration
    pub raw_length: u32,
    pub iterations: u32,
    pub num_paths: u64,
    pub(crate) latency: Option<u32>,
}

impl Cycle {
    /// Cycles needed per iteration, rounded up.
    pub fn latency(&self) -> u32 {
        self.latency.unwrap_or_else(|| {
            if self.iterations == 0 {
                self.raw_length
            } else {
                self.raw_length.div_ceil(self.iterations)
            }
        })
    }
}

/// Dependence graph of one executed path plus everything scheduling
/// derives from it.
#[derive(Debug, Clone)]
pub struct SchedDg {
    pub(crate) config: SchedulerConfig,
    pub(crate) nodes: Vec<DependenceNode>,
    pub(crate) edges: Vec<DependenceEdge>,
    pub(crate) cycles: BTreeMap<CycleId, Cycle>,
    pub(crate) cycle_index: BTreeMap<Vec<EdgeId>, CycleId>,
    pub(crate) next_cycle_id: u32,
    pub(crate) subsumed: HashMap<EdgeId, Vec<EdgeId>>,
    pub(crate) segments: HashMap<EdgeId, CycleId>,
    pub(crate) cycle_dag: CycleSetDag,
    pub(crate) num_sccs: u32,
    pub(crate) limp_cycles: bool,
    pub(crate) latencies_ready: bool,
    pub(crate) level_misses: Vec<(i32, f64)>,
    pub time_stats: TimeAccount,
    pub unit_usage: TimeAccount,
}

impl SchedDg {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            nodes: vec![],
            edges: vec![],
            cycles: BTreeMap::new(),
            cycle_index: BTreeMap::new(),
            next_cycle_id: 0,
            subsumed: HashMap::new(),
            segments: HashMap::new(),
            cycle_dag: CycleSetDag::new(),
            num_sccs: 0,
            limp_cycles: false,
            latencies_ready: false,
            level_misses: vec![],
            time_stats: TimeAccount::new(),
            unit_usage: TimeAccount::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn add_node(&mut self, address: u64, uop_index: u32, class: InstructionClass) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(DependenceNode {
            id,
            address,
            uop_index,
            class,
            roles: NodeRoles::default(),
            prune: PruneState::Live,
            status: SchedStatus::Unscheduled,
            mem_penalty: 0,
            latency: 0,
            in_order: id.0,
            scc: None,
            cycles: vec![],
            longest_cycle: 0,
            depth: 0,
            height: 0,
            in_degree: 0,
            out_degree: 0,
            incoming: vec![],
            outgoing: vec![],
        });
        id
    }

    pub fn node(&self, id: NodeId) -> Result<&DependenceNode> {
        self.nodes.get(id.index()).ok_or(Error::UnknownNode(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut DependenceNode> {
        self.nodes.get_mut(id.index()).ok_or(Error::UnknownNode(id))
    }

    pub fn edge(&self, id: EdgeId) -> Result<&DependenceEdge> {
        self.edges.get(id.index()).ok_or(Error::UnknownEdge(id))
    }

    pub fn cycle(&self, id: CycleId) -> Option<&Cycle> {
        self.cycles.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DependenceNode> {
        self.nodes.iter().filter(|n| n.is_live())
    }

    pub fn edges(&self) -> impl Iterator<Item = &DependenceEdge> {
        self.edges.iter().filter(|e| !e.removed)
    }

    pub fn cycles(&self) -> impl Iterator<Item = &Cycle> {
        self.cycles.values()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes().count()
    }

    pub fn num_edges(&self) -> usize {
        self.edges().count()
    }

    pub fn num_cycles(&self) -> usize {
        self.cycles.values().filter(|c| !c.is_segment).count()
    }

    pub fn cycle_set_dag(&self) -> &CycleSetDag {
        &self.cycle_dag
    }

    pub fn used_limp_cycles(&self) -> bool {
        self.limp_cycles
    }

    /// Miss counts per memory level computed by the memory model.
    pub fn set_level_misses(&mut self, misses: Vec<(i32, f64)>) {
        self.level_misses = misses;
    }

    fn check_live(&self, id: NodeId) -> Result<()> {
        if self.node(id)?.is_live() {
            Ok(())
        } else {
            Err(Error::RemovedNode(id))
        }
    }

    /// Always creates a new edge.
    #[allow(clippy::too_many_arguments)]
    pub fn add_dependency(
        &mut self,
        src: NodeId,
        dst: NodeId,
        direction: DepDirection,
        dtype: DepType,
        distance: u32,
        level: u32,
        overlapped: bool,
        probability: f64,
    ) -> Result<EdgeId> {
        self.check_live(src)?;
        self.check_live(dst)?;
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(DependenceEdge {
            id,
            src,
            dst,
            direction,
            dtype,
            distance,
            level,
            overlapped,
            probability,
            min_latency: None,
            latency: None,
            split: LatencySplit::default(),
            removed: false,
            cycles: vec![],
            longest_cycle: 0,
            super_edge: None,
            slack_used: 0,
            committed: false,
        });
        self.nodes[src.index()].outgoing.push(id);
        self.nodes[dst.index()].incoming.push(id);
        self.nodes[src.index()].out_degree += 1;
        self.nodes[dst.index()].in_degree += 1;
        self.latencies_ready = false;
        Ok(id)
    }

    /// Reuse an existing edge with the same direction, type, distance and
    /// level between the pair if there is one.
    #[allow(clippy::too_many_arguments)]
    pub fn add_unique_dependency(
        &mut self,
        src: NodeId,
        dst: NodeId,
        direction: DepDirection,
        dtype: DepType,
        distance: u32,
        level: u32,
        overlapped: bool,
        probability: f64,
    ) -> Result<EdgeId> {
        self.check_live(src)?;
        self.check_live(dst)?;
        let existing = self.nodes[src.index()].outgoing.iter().copied().find(|&e| {
            let edge = &self.edges[e.index()];
            edge.dst == dst
                && edge.direction == direction
                && edge.dtype == dtype
                && edge.distance == distance
                && edge.level == level
        });
        match existing {
            Some(e) => Ok(e),
            None => self.add_dependency(
                src,
                dst,
                direction,
                dtype,
                distance,
                level,
                overlapped,
                probability,
            ),
        }
    }

    /// Drop an edge, the cycles that use it and its super edge bookkeeping.
    pub fn remove_edge(&mut self, id: EdgeId) -> Result<()> {
        if self.edge(id)?.removed {
            return Ok(());
        }
        let using: Vec<CycleId> = self.edges[id.index()].cycles.clone();
        for c in using {
            self.remove_cycle(c);
        }
        if self.subsumed.contains_key(&id) {
            self.remove_super_edge(id);
        }
        let owner = self.edges[id.index()].super_edge.take();
        if let Some(subs) = owner.and_then(|se| self.subsumed.get_mut(&se)) {
            subs.retain(|&e| e != id);
        }
        let (src, dst) = {
            let e = &mut self.edges[id.index()];
            e.removed = true;
            (e.src, e.dst)
        };
        self.nodes[src.index()].outgoing.retain(|&e| e != id);
        self.nodes[dst.index()].incoming.retain(|&e| e != id);
        self.compute_node_degrees();
        if let Some(se) = owner {
            self.update_longest_cycle_of_sub_edges(se);
        }
        Ok(())
    }

    /// Recount fan-in and fan-out from the live edges.
    pub fn compute_node_degrees(&mut self) {
        for node in &mut self.nodes {
            node.in_degree = 0;
            node.out_degree = 0;
        }
        for edge in self.edges.iter().filter(|e| !e.removed) {
            self.nodes[edge.src.index()].out_degree += 1;
            self.nodes[edge.dst.index()].in_degree += 1;
        }
    }

    /// Remove `old` from the graph, moving its live edges over to `new`.
    pub fn replace_node(&mut self, old: NodeId, new: NodeId) -> Result<()> {
        self.check_live(old)?;
        self.check_live(new)?;
        if old == new {
            return Ok(());
        }
        let mut touched: Vec<EdgeId> = self.nodes[old.index()]
            .incoming
            .iter()
            .chain(self.nodes[old.index()].outgoing.iter())
            .copied()
            .collect();
        touched.sort();
        touched.dedup();
        for e in &touched {
            let using: Vec<CycleId> = self.edges[e.index()].cycles.clone();
            for c in using {
                self.remove_cycle(c);
            }
        }
        for e in touched {
            let edge = &mut self.edges[e.index()];
            if edge.removed {
                continue;
            }
            if edge.src == old {
                edge.src = new;
            }
            if edge.dst == old {
                edge.dst = new;
            }
            let (src, dst, distance) = (edge.src, edge.dst, edge.distance);
            if src == new && dst == new && distance == 0 {
                self.remove_edge(e)?;
                continue;
            }
            let node = &mut self.nodes[new.index()];
            if src == new && !node.outgoing.contains(&e) {
                node.outgoing.push(e);
            }
            if dst == new && !node.incoming.contains(&e) {
                node.incoming.push(e);
            }
        }
        let node = &mut self.nodes[old.index()];
        node.incoming.clear();
        node.outgoing.clear();
        node.prune = PruneState::Removed {
            replacement: Some(new),
        };
        self.compute_node_degrees();
        self.latencies_ready = false;
        debug!("Replaced node {old} with {new}");
        Ok(())
    }

    /// Follow replacements until a live node, if any.
    pub fn replacement_of(&self, id: NodeId) -> Option<NodeId> {
        let mut current = id;
        for _ in 0..=self.nodes.len() {
            match self.nodes.get(current.index())?.prune {
                PruneState::Live => return Some(current),
                PruneState::Removed { replacement } => current = replacement?,
            }
        }
        None
    }

    /// Remove direct edges implied by a chain of two or more edges that
    /// crosses the same number of iterations and is at least as long.
    pub fn prune_dependency_graph(&mut self) -> usize {
        self.prune_redundant(
            |e| !matches!(e.dtype, DepType::SuperEdge | DepType::Control),
            |_| true,
        )
    }

    /// Remove memory ordering edges already enforced by a chain of memory
    /// or true dependencies.
    pub fn prune_memory_dependencies(&mut self) -> usize {
        self.prune_redundant(
            |e| e.dtype == DepType::Memory,
            |e| e.dtype == DepType::Memory || e.direction == DepDirection::True,
        )
    }

    fn prune_redundant<C, P>(&mut self, candidate: C, chain: P) -> usize
    where
        C: Fn(&DependenceEdge) -> bool,
        P: Fn(&DependenceEdge) -> bool,
    {
        let mut removed = 0;
        for i in 0..self.edges.len() {
            let edge = &self.edges[i];
            if edge.removed || edge.src == edge.dst || !candidate(edge) {
                continue;
            }
            if self.has_stricter_chain(edge, &chain) {
                let id = edge.id;
                trace!("Pruning redundant edge {id}");
                // the edge is known to exist
                let _ = self.remove_edge(id);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Pruned {removed} redundant edges");
        }
        removed
    }

    fn has_stricter_chain<P>(&self, direct: &DependenceEdge, chain: &P) -> bool
    where
        P: Fn(&DependenceEdge) -> bool,
    {
        let target = direct.dst;
        let need = direct.prune_latency();
        // (node, hops, distance, latency)
        let mut stack = vec![(direct.src, 0usize, 0u32, 0u32)];
        while let Some((node, hops, distance, latency)) = stack.pop() {
            if node == target && hops >= 2 {
                if distance == direct.distance && latency >= need {
                    return true;
                }
                continue;
            }
            if hops >= self.config.prune_max_depth {
                continue;
            }
            for &e in &self.nodes[node.index()].outgoing {
                let edge = &self.edges[e.index()];
                if e == direct.id || edge.removed || edge.dtype == DepType::SuperEdge {
                    continue;
                }
                if !chain(edge) || distance + edge.distance > direct.distance {
                    continue;
                }
                if edge.dst == direct.src && edge.distance == 0 {
                    continue;
                }
                stack.push((
                    edge.dst,
                    hops + 1,
                    distance + edge.distance,
                    latency + edge.prune_latency(),
                ));
            }
        }
        false
    }

    /// Set node latencies and derive every edge latency from the machine.
    pub fn compute_edge_latencies(&mut self, machine: &Machine) -> Result<()> {
        for node in self.nodes.iter_mut().filter(|n| n.is_live()) {
            node.latency = machine.instruction(&node.class)?.latency;
        }
        let threshold = self.config.high_branch_probability;
        for i in 0..self.edges.len() {
            let edge = &self.edges[i];
            if edge.removed || edge.dtype == DepType::SuperEdge {
                continue;
            }
            let src = &self.nodes[edge.src.index()];
            let dst = &self.nodes[edge.dst.index()];
            let mut split = LatencySplit::default();
            match (edge.direction, edge.dtype) {
                (_, DepType::Structure) => {}
                (_, DepType::Control) => {
                    if edge.probability < threshold {
                        split.cpu = src.latency;
                    }
                }
                (DepDirection::Anti, _) => {}
                (DepDirection::Output, _) => split.cpu = 1,
                (DepDirection::True | DepDirection::Changing, _) => {
                    split.cpu = machine
                        .bypass_latency(src.class.kind, dst.class.kind)
                        .unwrap_or(src.latency);
                    if src.class.kind == InstrKind::Load {
                        split.mem = src.mem_penalty;
                    }
                }
            }
            if edge.overlapped && split.total() > 1 {
                split = LatencySplit {
                    cpu: split.cpu.min(1),
                    mem: 1 - split.cpu.min(1),
                };
            }
            let edge = &mut self.edges[i];
            edge.split = split;
            edge.min_latency = Some(split.total());
            edge.latency = Some(split.total());
        }
        self.latencies_ready = true;
        self.refresh_cycle_lengths();
        Ok(())
    }

    /// Tarjan's algorithm over scheduling edges. Returns the number of SCCs.
    pub fn compute_sccs(&mut self) -> u32 {
        let n = self.nodes.len();
        let mut index = vec![usize::MAX; n];
        let mut low = vec![0usize; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<usize> = vec![];
        let mut next_index = 0;
        let mut next_scc = 0u32;
        for node in &mut self.nodes {
            node.scc = None;
        }

        for root in 0..n {
            if index[root] != usize::MAX || !self.nodes[root].is_live() {
                continue;
            }
            // (node, position in its outgoing list)
            let mut work = vec![(root, 0usize)];
            index[root] = next_index;
            low[root] = next_index;
            next_index += 1;
            stack.push(root);
            on_stack[root] = true;

            while let Some(top) = work.len().checked_sub(1) {
                let (v, pos) = work[top];
                if pos < self.nodes[v].outgoing.len() {
                    work[top].1 += 1;
                    let edge = &self.edges[self.nodes[v].outgoing[pos].index()];
                    if edge.removed || !edge.is_scheduling_edge() {
                        continue;
                    }
                    let w = edge.dst.index();
                    if index[w] == usize::MAX {
                        index[w] = next_index;
                        low[w] = next_index;
                        next_index += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        work.push((w, 0));
                    } else if on_stack[w] {
                        low[v] = low[v].min(index[w]);
                    }
                } else {
                    work.pop();
                    if let Some(&(parent, _)) = work.last() {
                        low[parent] = low[parent].min(low[v]);
                    }
                    if low[v] == index[v] {
                        while let Some(w) = stack.pop() {
                            on_stack[w] = false;
                            self.nodes[w].scc = Some(next_scc);
                            if w == v {
                                break;
                            }
                        }
                        next_scc += 1;
                    }
                }
            }
        }
        self.num_sccs = next_scc;
        next_scc
    }

    /// Longest latency paths over same-iteration edges, from roots (depth)
    /// and to leaves (height).
    pub fn compute_path_lengths(&mut self) {
        let order = self.topological_order();
        for node in &mut self.nodes {
            node.depth = 0;
            node.height = 0;
        }
        for &v in &order {
            for &e in &self.nodes[v.index()].outgoing.clone() {
                let edge = &self.edges[e.index()];
                if edge.removed || edge.distance > 0 || edge.src == edge.dst {
                    continue;
                }
                let d = self.nodes[v.index()].depth + edge.latency.unwrap_or(0);
                let w = &mut self.nodes[edge.dst.index()];
                w.depth = w.depth.max(d);
            }
        }
        for &v in order.iter().rev() {
            let mut h = 0;
            for &e in &self.nodes[v.index()].outgoing {
                let edge = &self.edges[e.index()];
                if edge.removed || edge.distance > 0 || edge.src == edge.dst {
                    continue;
                }
                h = h.max(edge.latency.unwrap_or(0) + self.nodes[edge.dst.index()].height);
            }
            self.nodes[v.index()].height = h;
        }
    }

    /// Live nodes ordered along same-iteration edges; ties and any nodes
    /// left on a loop of such edges follow decode order.
    pub(crate) fn topological_order(&self) -> Vec<NodeId> {
        let mut indeg: Vec<u32> = vec![0; self.nodes.len()];
        for edge in self.edges() {
            if edge.distance == 0 && edge.src != edge.dst {
                indeg[edge.dst.index()] += 1;
            }
        }
        let mut ready: std::collections::BTreeSet<(u32, NodeId)> = self
            .nodes()
            .filter(|n| indeg[n.id.index()] == 0)
            .map(|n| (n.in_order, n.id))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut placed = vec![false; self.nodes.len()];
        loop {
            while let Some((_, v)) = ready.pop_first() {
                placed[v.index()] = true;
                order.push(v);
                for &e in &self.nodes[v.index()].outgoing {
                    let edge = &self.edges[e.index()];
                    if edge.removed || edge.distance > 0 || edge.src == edge.dst {
                        continue;
                    }
                    let w = edge.dst.index();
                    indeg[w] -= 1;
                    if indeg[w] == 0 && !placed[w] {
                        ready.insert((self.nodes[w].in_order, edge.dst));
                    }
                }
            }
            // break a same-iteration loop at its earliest decoded node
            match self
                .nodes()
                .filter(|n| !placed[n.id.index()])
                .min_by_key(|n| n.in_order)
            {
                Some(n) => {
                    indeg[n.id.index()] = 0;
                    ready.insert((n.in_order, n.id));
                }
                None => break,
            }
        }
        order
    }
}
