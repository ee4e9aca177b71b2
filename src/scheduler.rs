//! Lower bounds, the modulo list scheduler and the driver that retries it
//! with longer schedules until one fits.
use crate::{
    ASYNC_UNIT_BASE, Blocker, DEFAULT_UNIT, EdgeId, Error, ExecStyle, InstrKind, Infeasible,
    Machine, NodeId, Result, SchedDg, SchedStatus, ScheduleTime, SchedulerConfig, Template,
    TimeAccount,
    error::{RetryGuard, RetryStop},
};
use bitvec::prelude::*;
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use std::{cmp::Reverse, collections::BinaryHeap};

/// Schedule length implied by unit, async resource and issue rule
/// capacity alone.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ResourceBound {
    pub length: u32,
    /// ledger unit index of the resource that sets `length`
    pub bottleneck: i32,
    /// fractional bound if scalar work were packed into full vectors
    pub vector_bound: f64,
    pub vector_unit: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScheduleOutcome {
    pub schedule_length: u32,
    pub dependency_bound: u32,
    pub resource_bound: u32,
    pub bottleneck: i32,
    pub attempts: u32,
    /// cycles between the first and the last issue of one iteration
    pub span: u32,
}

/// Result of one scheduling attempt: the outer error is fatal, the inner
/// one asks for a retry.
pub type AttemptResult = Result<std::result::Result<(), Infeasible>>;

/// Resources held by one placed node.
#[derive(Debug, Clone, Default)]
struct Placement {
    time: i64,
    /// (unit, slot)
    units: Vec<(usize, usize)>,
    /// (rule index, slot)
    rules: Vec<(usize, usize)>,
    /// (async resource, slot, amount)
    asyncs: Vec<(usize, usize, u32)>,
}

/// Modulo reservation tables for one attempt.
struct Reservations {
    length: usize,
    busy: Vec<BitVec>,
    owner: Vec<Vec<Option<NodeId>>>,
    rules: Vec<Vec<Vec<NodeId>>>,
    asyncs: Vec<Vec<Vec<(NodeId, u32)>>>,
}

impl Reservations {
    fn new(machine: &Machine, length: u32) -> Self {
        let length = length as usize;
        Self {
            length,
            busy: vec![bitvec![0; length]; machine.num_units()],
            owner: vec![vec![None; length]; machine.num_units()],
            rules: vec![vec![vec![]; length]; machine.restrictions().len()],
            asyncs: vec![vec![vec![]; length]; machine.async_resources().len()],
        }
    }

    fn slot(&self, time: i64) -> usize {
        time.rem_euclid(self.length as i64) as usize
    }

    /// Free resources for `kind` issuing at `time` with `template`.
    fn fit(
        &self,
        machine: &Machine,
        kind: InstrKind,
        template: Option<&Template>,
        time: i64,
    ) -> Option<Placement> {
        let mut p = Placement {
            time,
            ..Default::default()
        };
        let issue = self.slot(time);
        if let Some(template) = template {
            for (k, uses) in template.cycles.iter().enumerate() {
                let slot = self.slot(time + k as i64);
                for &(class, need) in uses {
                    let mut got = 0;
                    for unit in machine.units_of_class(class) {
                        if got == need {
                            break;
                        }
                        if !self.busy[unit][slot] && !p.units.contains(&(unit, slot)) {
                            p.units.push((unit, slot));
                            got += 1;
                        }
                    }
                    if got < need {
                        return None;
                    }
                }
            }
            for &(res, amount) in &template.async_usage {
                let used: u32 = self.asyncs[res][issue].iter().map(|(_, n)| n).sum();
                if used + amount > machine.async_resources()[res].count {
                    return None;
                }
                p.asyncs.push((res, issue, amount));
            }
        }
        for rule in machine.restrictions_for(kind) {
            let i = (rule.id - 1) as usize;
            if self.rules[i][issue].len() as u32 >= rule.max_per_cycle {
                return None;
            }
            p.rules.push((i, issue));
        }
        Some(p)
    }

    /// Resources for `kind` at `time` taking them from other nodes when
    /// needed. Returns the placement, the nodes to evict and the last
    /// resource that had to be taken, or `None` when no eviction helps.
    fn force(
        &self,
        machine: &Machine,
        kind: InstrKind,
        template: Option<&Template>,
        time: i64,
    ) -> Option<(Placement, Vec<NodeId>, Option<i32>)> {
        let mut p = Placement {
            time,
            ..Default::default()
        };
        let mut victims = vec![];
        let mut blocker = None;
        let issue = self.slot(time);
        if let Some(template) = template {
            for (k, uses) in template.cycles.iter().enumerate() {
                let slot = self.slot(time + k as i64);
                for &(class, need) in uses {
                    let mut candidates: Vec<usize> = machine
                        .units_of_class(class)
                        .filter(|u| !p.units.contains(&(*u, slot)))
                        .collect();
                    if (candidates.len() as u32) < need {
                        return None;
                    }
                    // free instances first
                    candidates.sort_by_key(|&u| self.busy[u][slot]);
                    for &unit in candidates.iter().take(need as usize) {
                        if let Some(owner) = self.owner[unit][slot] {
                            victims.push(owner);
                            blocker = Some(unit as i32);
                        }
                        p.units.push((unit, slot));
                    }
                }
            }
            for &(res, amount) in &template.async_usage {
                let capacity = machine.async_resources()[res].count;
                if amount > capacity {
                    return None;
                }
                let holders = &self.asyncs[res][issue];
                let mut used: u32 = holders.iter().map(|(_, n)| n).sum();
                for &(holder, n) in holders {
                    if used + amount <= capacity {
                        break;
                    }
                    victims.push(holder);
                    used -= n;
                    blocker = Some(ASYNC_UNIT_BASE + res as i32);
                }
                p.asyncs.push((res, issue, amount));
            }
        }
        for rule in machine.restrictions_for(kind) {
            if rule.max_per_cycle == 0 {
                return None;
            }
            let i = (rule.id - 1) as usize;
            let holders = &self.rules[i][issue];
            if holders.len() as u32 >= rule.max_per_cycle {
                victims.push(holders[0]);
                blocker = Some(-(rule.id as i32));
            }
            p.rules.push((i, issue));
        }
        victims.sort();
        victims.dedup();
        Some((p, victims, blocker))
    }

    fn commit(&mut self, node: NodeId, p: &Placement) {
        for &(unit, slot) in &p.units {
            self.busy[unit].set(slot, true);
            self.owner[unit][slot] = Some(node);
        }
        for &(rule, slot) in &p.rules {
            self.rules[rule][slot].push(node);
        }
        for &(res, slot, amount) in &p.asyncs {
            self.asyncs[res][slot].push((node, amount));
        }
    }

    fn release(&mut self, node: NodeId, p: &Placement) {
        for &(unit, slot) in &p.units {
            if self.owner[unit][slot] == Some(node) {
                self.busy[unit].set(slot, false);
                self.owner[unit][slot] = None;
            }
        }
        for &(rule, slot) in &p.rules {
            self.rules[rule][slot].retain(|&n| n != node);
        }
        for &(res, slot, _) in &p.asyncs {
            self.asyncs[res][slot].retain(|&(n, _)| n != node);
        }
    }
}

/// Node selection order, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Priority {
    fixed_set: bool,
    longest_cycle: u32,
    height: u32,
    resource_score: u32,
    order: Reverse<u32>,
}

/// Share of a scalar operation that an ideal vector unit would spend.
fn vector_scale(kind: InstrKind, style: ExecStyle, width: u16, vector_length: u32) -> f64 {
    let packable = matches!(
        kind,
        InstrKind::FpArith | InstrKind::IntArith | InstrKind::Load | InstrKind::Store | InstrKind::Move
    );
    if style == ExecStyle::Scalar && packable && vector_length > 0 && width > 0 {
        (width as f64 / vector_length as f64).min(1.0)
    } else {
        1.0
    }
}

impl SchedDg {
    /// Everything scheduling needs from the machine: latencies, pruning,
    /// cycles, super structures and path lengths.
    pub fn prepare(&mut self, machine: &Machine) -> Result<()> {
        self.compute_edge_latencies(machine)?;
        self.prune_memory_dependencies();
        self.prune_dependency_graph();
        self.find_dependency_cycles()?;
        self.compute_super_structures(false)?;
        self.compute_path_lengths();
        Ok(())
    }

    /// Reservation templates per node index, empty for removed nodes.
    fn node_templates<'m>(&self, machine: &'m Machine) -> Result<Vec<&'m [Template]>> {
        let mut templates = vec![&[][..]; self.nodes.len()];
        for node in self.nodes() {
            templates[node.id.index()] = machine.instruction(&node.class)?.templates.as_slice();
        }
        Ok(templates)
    }

    pub fn min_length_due_to_resources(&self, machine: &Machine) -> Result<ResourceBound> {
        let templates = self.node_templates(machine)?;
        let classes = machine.unit_classes();
        let mut load = vec![0u64; classes.len()];
        let mut vec_load = vec![0f64; classes.len()];
        let mut async_load = vec![0u64; machine.async_resources().len()];
        let mut rule_load = vec![0u64; machine.restrictions().len()];

        for node in self.nodes() {
            for rule in machine.restrictions_for(node.class.kind) {
                rule_load[(rule.id - 1) as usize] += 1;
            }
            // greedy: the template that keeps the busiest class lowest
            let cost = |t: &Template| {
                classes
                    .iter()
                    .enumerate()
                    .filter(|(c, class)| class.count > 0 && t.demand(*c) > 0)
                    .map(|(c, class)| (load[c] + t.demand(c) as u64) as f64 / class.count as f64)
                    .fold(0.0, f64::max)
            };
            let Some(template) = templates[node.id.index()]
                .iter()
                .min_by(|a, b| cost(*a).total_cmp(&cost(*b)))
            else {
                continue;
            };
            let scale = vector_scale(
                node.class.kind,
                node.class.style,
                node.class.width,
                machine.vector_length,
            );
            for &(c, n) in template.cycles.iter().flatten() {
                load[c] += n as u64;
                vec_load[c] += n as f64 * scale;
            }
            for &(res, n) in &template.async_usage {
                async_load[res] += n as u64;
            }
        }

        let mut bound = ResourceBound {
            length: 0,
            bottleneck: DEFAULT_UNIT,
            vector_bound: 0.0,
            vector_unit: DEFAULT_UNIT,
        };
        for (c, class) in classes.iter().enumerate() {
            if class.count == 0 {
                continue;
            }
            let length = load[c].div_ceil(class.count as u64) as u32;
            if length > bound.length {
                bound.length = length;
                bound.bottleneck = class.first as i32;
            }
            let vector = vec_load[c] / class.count as f64;
            if vector > bound.vector_bound {
                bound.vector_bound = vector;
                bound.vector_unit = class.first as i32;
            }
        }
        for (i, res) in machine.async_resources().iter().enumerate() {
            if res.count == 0 {
                continue;
            }
            let length = async_load[i].div_ceil(res.count as u64) as u32;
            if length > bound.length {
                bound.length = length;
                bound.bottleneck = ASYNC_UNIT_BASE + i as i32;
            }
        }
        for (i, rule) in machine.restrictions().iter().enumerate() {
            if rule.max_per_cycle == 0 {
                continue;
            }
            let length = rule_load[i].div_ceil(rule.max_per_cycle as u64) as u32;
            if length > bound.length {
                bound.length = length;
                bound.bottleneck = -(rule.id as i32);
            }
        }
        debug!(
            "Resource bound {} on {}",
            bound.length,
            machine.ledger_unit_name(bound.bottleneck)
        );
        Ok(bound)
    }

    fn priority(&self, v: NodeId, resource_score: u32, limp: bool) -> Priority {
        let node = &self.nodes[v.index()];
        if limp {
            return Priority {
                fixed_set: false,
                longest_cycle: 0,
                height: node.height,
                resource_score: 0,
                order: Reverse(node.in_order),
            };
        }
        Priority {
            fixed_set: self
                .cycle_set_of(v)
                .is_some_and(|s| self.cycle_dag.is_set_fixed(s)),
            longest_cycle: node.longest_cycle,
            height: node.height,
            resource_score,
            order: Reverse(node.in_order),
        }
    }

    /// Earliest start from placed predecessors and latest start from
    /// placed successors.
    fn window(&self, v: NodeId, placed: &[Option<Placement>], length: u32) -> (Option<i64>, Option<i64>) {
        let len = length as i64;
        let node = &self.nodes[v.index()];
        let mut early = None;
        for &e in &node.incoming {
            let edge = &self.edges[e.index()];
            if edge.removed || edge.src == edge.dst {
                continue;
            }
            if let Some(p) = &placed[edge.src.index()] {
                let t = p.time + edge.latency.unwrap_or(0) as i64 - edge.distance as i64 * len;
                early = Some(early.map_or(t, |x: i64| x.max(t)));
            }
        }
        let mut late = None;
        for &e in &node.outgoing {
            let edge = &self.edges[e.index()];
            if edge.removed || edge.src == edge.dst {
                continue;
            }
            if let Some(p) = &placed[edge.dst.index()] {
                let t = p.time - edge.latency.unwrap_or(0) as i64 + edge.distance as i64 * len;
                late = Some(late.map_or(t, |x: i64| x.min(t)));
            }
        }
        (early, late)
    }

    /// Placed neighbours whose dependence with `v` no longer holds.
    fn violated_neighbours(&self, v: NodeId, placed: &[Option<Placement>], length: u32) -> Vec<NodeId> {
        let len = length as i64;
        let Some(t) = placed[v.index()].as_ref().map(|p| p.time) else {
            return vec![];
        };
        let node = &self.nodes[v.index()];
        let mut out = vec![];
        for &e in &node.outgoing {
            let edge = &self.edges[e.index()];
            if edge.removed || edge.src == edge.dst {
                continue;
            }
            if let Some(p) = &placed[edge.dst.index()] {
                if p.time < t + edge.latency.unwrap_or(0) as i64 - edge.distance as i64 * len {
                    out.push(edge.dst);
                }
            }
        }
        for &e in &node.incoming {
            let edge = &self.edges[e.index()];
            if edge.removed || edge.src == edge.dst {
                continue;
            }
            if let Some(p) = &placed[edge.src.index()] {
                if t < p.time + edge.latency.unwrap_or(0) as i64 - edge.distance as i64 * len {
                    out.push(edge.src);
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// One attempt at fitting every node into a modulo schedule of
    /// `length` cycles. On success node statuses, edge bookkeeping and
    /// `unit_usage` describe the schedule.
    pub fn schedule_attempt(&mut self, machine: &Machine, length: u32, limp: bool) -> AttemptResult {
        let dependency_bound = self.min_length_due_to_dependencies();
        if length < dependency_bound {
            return Ok(Err(Infeasible {
                blocker: self.longest_cycle().map_or(Blocker::Budget, Blocker::Cycle),
                extra_length: dependency_bound - length,
                attempt: 1,
            }));
        }
        let resources = self.min_length_due_to_resources(machine)?;
        if length < resources.length {
            return Ok(Err(Infeasible {
                blocker: Blocker::Unit(resources.bottleneck),
                extra_length: resources.length - length,
                attempt: 1,
            }));
        }
        if length == 0 {
            return Ok(Err(Infeasible {
                blocker: Blocker::Budget,
                extra_length: 1,
                attempt: 1,
            }));
        }
        let templates = self.node_templates(machine)?;
        let classes = machine.unit_classes();

        for node in &mut self.nodes {
            node.status = SchedStatus::Unscheduled;
        }
        for edge in &mut self.edges {
            edge.committed = false;
            edge.slack_used = 0;
        }
        self.cycle_dag.reset_schedule();

        let live: Vec<NodeId> = self.nodes().map(|n| n.id).collect();
        let scores: Vec<u32> = (0..self.nodes.len())
            .map(|i| {
                templates[i].first().map_or(0, |t| {
                    t.cycles
                        .iter()
                        .flatten()
                        .map(|&(c, n)| n * 100 / classes[c].count.max(1))
                        .sum()
                })
            })
            .collect();
        let mut node_heap: BinaryHeap<(Priority, Reverse<NodeId>)> = live
            .iter()
            .map(|&v| (self.priority(v, scores[v.index()], limp), Reverse(v)))
            .collect();
        let mut edge_heap: BinaryHeap<(u32, u32, Reverse<EdgeId>)> = if limp {
            BinaryHeap::new()
        } else {
            self.edges()
                .filter(|e| e.longest_cycle > 0)
                .map(|e| (e.longest_cycle, e.latency.unwrap_or(0), Reverse(e.id)))
                .collect()
        };

        let mut res = Reservations::new(machine, length);
        let mut placed: Vec<Option<Placement>> = vec![None; self.nodes.len()];
        let mut last_time: Vec<Option<i64>> = vec![None; self.nodes.len()];
        let budget = self.config.schedule_budget_ratio.max(1) * live.len();
        let mut spent = 0;

        loop {
            // cycle edges first, then everything else
            let mut next = None;
            while let Some((lc, lat, Reverse(e))) = edge_heap.pop() {
                let edge = &self.edges[e.index()];
                if placed[edge.src.index()].is_none() {
                    next = Some(edge.src);
                    edge_heap.push((lc, lat, Reverse(e)));
                    break;
                }
                if placed[edge.dst.index()].is_none() {
                    next = Some(edge.dst);
                    break;
                }
            }
            if next.is_none() {
                while let Some((_, Reverse(v))) = node_heap.pop() {
                    if placed[v.index()].is_none() {
                        next = Some(v);
                        break;
                    }
                }
            }
            let Some(v) = next else {
                break;
            };

            spent += 1;
            if spent > budget {
                debug!("Placement budget of {budget} exhausted at length {length}");
                return Ok(Err(Infeasible {
                    blocker: Blocker::Budget,
                    extra_length: 1,
                    attempt: 1,
                }));
            }

            let kind = self.nodes[v.index()].class.kind;
            let options: Vec<Option<&Template>> = if templates[v.index()].is_empty() {
                vec![None]
            } else {
                templates[v.index()].iter().map(Some).collect()
            };
            let (early, late) = self.window(v, &placed, length);
            let len = length as i64;
            let candidates: Vec<i64> = match (early, late) {
                (Some(e), Some(l)) => (e..e + len).filter(|&t| t <= l).collect(),
                (Some(e), None) => (e..e + len).collect(),
                (None, Some(l)) => (l - len + 1..=l).rev().collect(),
                (None, None) => (0..len).collect(),
            };
            let found = candidates.iter().find_map(|&t| {
                options
                    .iter()
                    .find_map(|&template| res.fit(machine, kind, template, t))
            });

            let placement = match found {
                Some(p) => p,
                None => {
                    let t = match (early, late) {
                        (Some(e), _) => last_time[v.index()].map_or(e, |prev| e.max(prev + 1)),
                        (None, Some(l)) => l,
                        (None, None) => last_time[v.index()].map_or(0, |prev| prev + 1),
                    };
                    let forced = options
                        .iter()
                        .filter_map(|&template| res.force(machine, kind, template, t))
                        .min_by_key(|(_, victims, _)| victims.len());
                    let Some((p, victims, blocker)) = forced else {
                        return Ok(Err(Infeasible {
                            blocker: Blocker::Node(v),
                            extra_length: 1,
                            attempt: 1,
                        }));
                    };
                    for victim in victims {
                        if let Some(old) = placed[victim.index()].take() {
                            trace!(
                                "{victim} evicted from {} for {v} ({})",
                                old.time,
                                blocker.map_or("dependence".to_string(), |u| machine.ledger_unit_name(u))
                            );
                            res.release(victim, &old);
                            node_heap.push((
                                self.priority(victim, scores[victim.index()], limp),
                                Reverse(victim),
                            ));
                        }
                    }
                    p
                }
            };

            trace!("{v} placed at {}", placement.time);
            res.commit(v, &placement);
            last_time[v.index()] = Some(placement.time);
            placed[v.index()] = Some(placement);
            if let Some(set) = self.cycle_set_of(v) {
                if !self.cycle_dag.is_set_fixed(set) {
                    self.cycle_dag.fix_set(set);
                }
            }
            for victim in self.violated_neighbours(v, &placed, length) {
                if let Some(old) = placed[victim.index()].take() {
                    trace!("{victim} evicted from {} by a dependence on {v}", old.time);
                    res.release(victim, &old);
                    node_heap.push((
                        self.priority(victim, scores[victim.index()], limp),
                        Reverse(victim),
                    ));
                }
            }
        }

        self.commit_schedule(&placed, length);
        debug!("Scheduled {} nodes at length {length} with {spent} placements", live.len());
        Ok(Ok(()))
    }

    /// Write placements back into the graph, shifted by whole iterations
    /// so the earliest node issues in iteration 0.
    fn commit_schedule(&mut self, placed: &[Option<Placement>], length: u32) {
        let len = length as i64;
        let first = placed.iter().flatten().map(|p| p.time).min().unwrap_or(0);
        let shift = -first.div_euclid(len) * len;
        let mut usage = TimeAccount::new();
        for (i, p) in placed.iter().enumerate() {
            let Some(p) = p else {
                continue;
            };
            self.nodes[i].status = SchedStatus::Scheduled {
                time: ScheduleTime::from_cycles(length, p.time + shift),
                unit: p.units.first().map(|&(u, _)| u),
            };
            for &(unit, _) in &p.units {
                usage.add_resource_usage(unit as i32, 1.0);
            }
            for &(rule, _) in &p.rules {
                usage.add_resource_usage(-(rule as i32 + 1), 1.0);
            }
            for &(res, _, amount) in &p.asyncs {
                usage.add_resource_usage(ASYNC_UNIT_BASE + res as i32, amount as f64);
            }
        }
        for edge in self.edges.iter_mut().filter(|e| !e.removed) {
            let (Some(src), Some(dst)) = (&placed[edge.src.index()], &placed[edge.dst.index()]) else {
                continue;
            };
            let ready = src.time + edge.latency.unwrap_or(0) as i64 - edge.distance as i64 * len;
            edge.committed = true;
            edge.slack_used = (dst.time - ready).max(0) as u32;
        }
        self.unit_usage = usage;
    }

    /// Cycles between the first and the last issue of one iteration.
    pub fn schedule_span(&self) -> u32 {
        let times: Vec<i64> = self.nodes().filter_map(|n| n.time()).map(|t| t.cycles()).collect();
        match (times.iter().min(), times.iter().max()) {
            (Some(lo), Some(hi)) => (hi - lo) as u32,
            _ => 0,
        }
    }

    /// Prepare the graph, schedule it at the tightest length that fits and
    /// fill the `time_stats` ledger.
    pub fn compute_schedule(&mut self, machine: &Machine) -> Result<ScheduleOutcome> {
        if self.num_nodes() == 0 {
            return Err(Error::EmptyGraph);
        }
        self.prepare(machine)?;
        let dependency_bound = self.min_length_due_to_dependencies();
        let resources = self.min_length_due_to_resources(machine)?;
        let start = dependency_bound.max(resources.length).max(1);
        info!(
            "Scheduling {} nodes: dependency bound {dependency_bound}, resource bound {}",
            self.num_nodes(),
            resources.length
        );
        let config = self.config.clone();
        let driven = drive(&config, start, |length, limp| {
            self.schedule_attempt(machine, length, limp)
        })?;
        let outcome = ScheduleOutcome {
            schedule_length: driven.length,
            dependency_bound,
            resource_bound: resources.length,
            bottleneck: resources.bottleneck,
            attempts: driven.attempts,
            span: self.schedule_span(),
        };
        self.record_time_stats(machine, &outcome, &resources, driven.last_failure.as_ref());
        info!(
            "Schedule length {} after {} attempts",
            outcome.schedule_length, outcome.attempts
        );
        Ok(outcome)
    }

    fn record_time_stats(
        &mut self,
        machine: &Machine,
        outcome: &ScheduleOutcome,
        resources: &ResourceBound,
        last_failure: Option<&Infeasible>,
    ) {
        let mut stats = TimeAccount::new();
        let floor = outcome.dependency_bound.max(1);
        stats.add_application_minimum_time(floor as f64);
        stats.add_dependency_time(floor as f64);
        stats.add_resources_minimum_time(resources.length.max(1) as f64);
        if resources.length > floor {
            stats.add_resources_time(resources.bottleneck, (resources.length - floor) as f64);
        }
        let bound = floor.max(resources.length);
        if outcome.schedule_length > bound {
            let unit = match last_failure.map(|f| f.blocker) {
                Some(Blocker::Unit(u)) => u,
                _ => DEFAULT_UNIT,
            };
            stats.add_scheduling_time(
                unit,
                (outcome.schedule_length - bound) as f64,
                self.config.verbose_ledger,
            );
        }
        if resources.vector_bound > 0.0 {
            stats.add_ideal_vectorization_time(resources.vector_unit, resources.vector_bound);
        }
        for node in self.nodes() {
            stats.add_retired_uops(node.retired_uop_type(), 1.0);
        }
        for &(level, misses) in &self.level_misses {
            stats.add_miss_count_level(machine, level, misses);
        }
        stats.compute_bandwidth_time(machine);
        self.time_stats = stats;
    }
}

/// What the retry loop settled on.
#[derive(Debug)]
struct Driven {
    length: u32,
    attempts: u32,
    last_failure: Option<Infeasible>,
}

/// Retry `attempt` with growing lengths. The first exhausted placement
/// budget switches to limp mode at the same length; the same blocker at
/// the same length twice in a row is a deadlock.
fn drive<F>(config: &SchedulerConfig, start: u32, mut attempt: F) -> Result<Driven>
where
    F: FnMut(u32, bool) -> AttemptResult,
{
    let mut guard = RetryGuard::new(config.max_repeat_failures.max(1));
    let mut length = start;
    let mut limp = false;
    let mut attempts = 0;
    let mut last_failure = None;
    loop {
        if attempts >= config.max_schedule_attempts {
            return Err(Error::TooManyAttempts(attempts));
        }
        attempts += 1;
        let mut failure = match attempt(length, limp)? {
            Ok(()) => {
                return Ok(Driven {
                    length,
                    attempts,
                    last_failure,
                });
            }
            Err(failure) => failure,
        };
        failure.attempt = attempts;
        debug!(
            "Attempt {attempts} at length {length} blocked by {}, needs {} more",
            failure.blocker, failure.extra_length
        );
        match guard.record((failure.blocker, length, limp)) {
            Err(RetryStop::Repeated) => {
                return Err(Error::Deadlock {
                    blocker: failure.blocker,
                    length,
                });
            }
            Err(RetryStop::Exhausted(n)) => return Err(Error::TooManyAttempts(n)),
            Ok(()) => {}
        }
        if failure.blocker == Blocker::Budget && !limp {
            info!("Switching to limp scheduling at length {length}");
            limp = true;
        } else {
            length += failure.extra_length;
        }
        last_failure = Some(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::drive;
    use crate::{
        Blocker, DepDirection, DepType, Error, ExecStyle, Infeasible, InstrKind,
        InstructionClass, Machine, MachineConfig, SchedDg, SchedulerConfig, TimeCategory,
        TimeKey, UnitType, graph::tests::int_op, machine::tests::test_machine,
    };

    fn vector_fp() -> InstructionClass {
        InstructionClass {
            kind: InstrKind::FpArith,
            style: ExecStyle::Vector,
            unit_type: UnitType::Fp,
            width: 64,
            vec_width: 4,
        }
    }

    fn unbounded_machine() -> Machine {
        let config: MachineConfig = toml::from_str(
            r#"
name = "unbounded"
units = []

[[instructions]]
kind = "IntArith"
latency = 2

[[instructions]]
kind = "FpArith"
latency = 3
"#,
        )
        .unwrap();
        Machine::from_config(config).unwrap()
    }

    fn self_loop(dg: &mut SchedDg) -> crate::NodeId {
        let a = dg.add_node(0x40, 0, vector_fp());
        dg.add_dependency(a, a, DepDirection::True, DepType::GpRegister, 1, 0, false, 1.0)
            .unwrap();
        a
    }

    #[test]
    fn test_chain_without_resource_limits() {
        let machine = unbounded_machine();
        let mut dg = SchedDg::new(SchedulerConfig::default());
        let fp = InstructionClass::scalar(InstrKind::FpArith, UnitType::Fp, 64);
        let a = dg.add_node(0x10, 0, int_op());
        let b = dg.add_node(0x14, 0, fp);
        let c = dg.add_node(0x18, 0, int_op());
        dg.add_dependency(a, b, DepDirection::True, DepType::GpRegister, 0, 0, false, 1.0)
            .unwrap();
        dg.add_dependency(b, c, DepDirection::True, DepType::GpRegister, 0, 0, false, 1.0)
            .unwrap();
        let outcome = dg.compute_schedule(&machine).unwrap();
        assert!(outcome.span >= 5);
        let t = |n| dg.node(n).unwrap().time().unwrap().cycles();
        assert!(t(b) - t(a) >= 2);
        assert!(t(c) - t(b) >= 3);
        assert!(dg.time_stats.iter().all(|(key, _)| !matches!(
            key.category(),
            Some(TimeCategory::LackOfResources | TimeCategory::LackOfResourcesTotal)
        )));
        assert_eq!(dg.time_stats.total_cpu_time(), outcome.schedule_length as f64);
    }

    #[test]
    fn test_self_loop_bounds_the_schedule() {
        let machine = test_machine();
        let mut dg = SchedDg::new(SchedulerConfig::default());
        self_loop(&mut dg);
        let outcome = dg.compute_schedule(&machine).unwrap();
        assert_eq!(dg.num_cycles(), 1);
        assert_eq!(dg.cycles().next().unwrap().raw_length, 4);
        assert_eq!(outcome.dependency_bound, 4);
        assert_eq!(outcome.schedule_length, 4);
        assert!(outcome.schedule_length >= dg.min_length_due_to_dependencies());
    }

    #[test]
    fn test_independent_cycle_sets() {
        let machine = test_machine();
        let mut dg = SchedDg::new(SchedulerConfig::default());
        let a = self_loop(&mut dg);
        let b = self_loop(&mut dg);
        dg.prepare(&machine).unwrap();
        let mut dag = dg.cycle_set_dag().clone();
        assert_eq!(dag.num_sets(), 2);
        assert_eq!(dag.num_edges(), 0);
        assert_eq!(dag.fix_set(dg.cycle_set_of(a).unwrap()), 0);
        assert!(!dag.is_set_fixed(dg.cycle_set_of(b).unwrap()));
        assert_eq!(dag.fix_set(dg.cycle_set_of(b).unwrap()), 0);
    }

    #[test]
    fn test_one_cycle_short_fails_by_one() {
        let machine = test_machine();
        let mut dg = SchedDg::new(SchedulerConfig::default());
        self_loop(&mut dg);
        dg.prepare(&machine).unwrap();
        let failure = dg.schedule_attempt(&machine, 3, false).unwrap().unwrap_err();
        assert_eq!(failure.extra_length, 1);
        assert!(matches!(failure.blocker, Blocker::Cycle(_)));
        assert!(dg.schedule_attempt(&machine, 4, false).unwrap().is_ok());
        assert!(dg.nodes().all(|n| n.time().is_some()));
    }

    /// One unit shared by two ops that use it a cycle apart.
    fn single_unit_machine() -> Machine {
        let config: MachineConfig = toml::from_str(
            r#"
name = "single"

[[units]]
name = "X"
count = 1

[[instructions]]
kind = "IntArith"
latency = 1
[[instructions.templates]]
cycles = [["X"]]

[[instructions]]
kind = "FpArith"
latency = 1
[[instructions.templates]]
cycles = [[], ["X"]]
"#,
        )
        .unwrap();
        Machine::from_config(config).unwrap()
    }

    #[test]
    fn test_exhausted_budget_asks_for_a_longer_schedule() {
        let machine = single_unit_machine();
        let mut dg = SchedDg::new(SchedulerConfig::default());
        let a = dg.add_node(0x10, 0, int_op());
        let b = dg.add_node(0x14, 0, InstructionClass::scalar(InstrKind::FpArith, UnitType::Fp, 64));
        dg.add_dependency(a, b, DepDirection::True, DepType::GpRegister, 0, 0, false, 1.0)
            .unwrap();
        dg.add_dependency(b, a, DepDirection::True, DepType::GpRegister, 1, 0, false, 1.0)
            .unwrap();
        dg.prepare(&machine).unwrap();
        assert_eq!(dg.min_length_due_to_dependencies(), 2);
        assert_eq!(dg.min_length_due_to_resources(&machine).unwrap().length, 2);
        for limp in [false, true] {
            let failure = dg.schedule_attempt(&machine, 2, limp).unwrap().unwrap_err();
            assert!(failure.extra_length >= 1);
        }
        let outcome = dg.compute_schedule(&machine).unwrap();
        assert_eq!(outcome.schedule_length, 3);
    }

    #[test]
    fn test_zero_length_is_infeasible() {
        let machine = unbounded_machine();
        let mut dg = SchedDg::new(SchedulerConfig::default());
        dg.add_node(0x10, 0, int_op());
        dg.prepare(&machine).unwrap();
        let failure = dg.schedule_attempt(&machine, 0, false).unwrap().unwrap_err();
        assert_eq!(failure.extra_length, 1);
        assert!(dg.schedule_attempt(&machine, 1, false).unwrap().is_ok());
    }

    #[test]
    fn test_resource_bound_and_ledger() {
        let machine = test_machine();
        let mut dg = SchedDg::new(SchedulerConfig::default());
        for i in 0..3 {
            dg.add_node(0x10 + 4 * i, 0, InstructionClass::scalar(InstrKind::Load, UnitType::Int, 64));
        }
        dg.prepare(&machine).unwrap();
        let bound = dg.min_length_due_to_resources(&machine).unwrap();
        assert_eq!(bound.length, 3);
        // MEM[0] is global unit 2
        assert_eq!(bound.bottleneck, 2);
        assert!((bound.vector_bound - 0.75).abs() < 1e-9);

        let outcome = dg.compute_schedule(&machine).unwrap();
        assert_eq!(outcome.schedule_length, 3);
        let stats = &dg.time_stats;
        assert_eq!(stats.value(TimeKey::for_unit(TimeCategory::LackOfResources, 2)), 2.0);
        assert_eq!(stats.value(TimeKey::of(TimeCategory::MinimumResources)), 3.0);
        assert_eq!(stats.total_cpu_time(), 3.0);
        assert_eq!(stats.value(TimeKey::of(TimeCategory::RetiredUops)), 3.0);
        assert_eq!(dg.unit_usage.value(TimeKey::for_unit(TimeCategory::ResourceUsage, 2)), 3.0);
        assert_eq!(dg.unit_usage.value(TimeKey::for_unit(TimeCategory::ResourceUsage, -1)), 3.0);
        let mut slots: Vec<i32> = dg.nodes().map(|n| n.time().unwrap().clock_cycle()).collect();
        slots.sort();
        assert_eq!(slots, vec![0, 1, 2]);
    }

    #[test]
    fn test_units_are_shared_per_slot() {
        let machine = test_machine();
        let mut dg = SchedDg::new(SchedulerConfig::default());
        for i in 0..4 {
            dg.add_node(0x10 + 4 * i, 0, int_op());
        }
        let outcome = dg.compute_schedule(&machine).unwrap();
        assert_eq!(outcome.schedule_length, 2);
        for unit in 0..2 {
            assert_eq!(
                dg.unit_usage.value(TimeKey::for_unit(TimeCategory::ResourceUsage, unit)),
                2.0
            );
        }
    }

    #[test]
    fn test_predecessor_placed_before_scheduled_successor() {
        let machine = test_machine();
        let mut dg = SchedDg::new(SchedulerConfig::default());
        let a = dg.add_node(0x10, 0, int_op());
        let c = self_loop(&mut dg);
        dg.add_dependency(a, c, DepDirection::True, DepType::GpRegister, 0, 0, false, 1.0)
            .unwrap();
        let outcome = dg.compute_schedule(&machine).unwrap();
        assert_eq!(outcome.schedule_length, 4);
        let t = |n| dg.node(n).unwrap().time().unwrap();
        assert!(t(c) - t(a) >= 1);
        assert!(t(a).cycles() >= 0);
    }

    #[test]
    fn test_conflicting_successor_is_evicted() {
        let machine = test_machine();
        let mut dg = SchedDg::new(SchedulerConfig::default());
        let a = dg.add_node(0x10, 0, int_op());
        let b = dg.add_node(0x14, 0, int_op());
        let c = self_loop(&mut dg);
        dg.add_dependency(a, b, DepDirection::True, DepType::GpRegister, 0, 0, false, 1.0)
            .unwrap();
        dg.add_dependency(b, c, DepDirection::True, DepType::GpRegister, 0, 0, false, 1.0)
            .unwrap();
        let outcome = dg.compute_schedule(&machine).unwrap();
        assert_eq!(outcome.schedule_length, 4);
        let t = |n| dg.node(n).unwrap().time().unwrap();
        assert!(t(b) - t(a) >= 1);
        assert!(t(c) - t(b) >= 1);
        assert!(dg.edges().all(|e| e.committed));
    }

    #[test]
    fn test_driver_switches_to_limp_then_grows() {
        let config = SchedulerConfig::default();
        let mut calls = vec![];
        let driven = drive(&config, 4, |length, limp| {
            calls.push((length, limp));
            Ok(match calls.len() {
                1 | 2 => Err(Infeasible {
                    blocker: Blocker::Budget,
                    extra_length: 1,
                    attempt: 1,
                }),
                _ => Ok(()),
            })
        })
        .unwrap();
        assert_eq!(calls, vec![(4, false), (4, true), (5, true)]);
        assert_eq!(driven.length, 5);
        assert_eq!(driven.attempts, 3);
        assert_eq!(driven.last_failure.unwrap().attempt, 2);
    }

    #[test]
    fn test_driver_detects_deadlock() {
        let config = SchedulerConfig::default();
        let result = drive(&config, 2, |_, _| {
            Ok(Err(Infeasible {
                blocker: Blocker::Unit(3),
                extra_length: 0,
                attempt: 1,
            }))
        });
        assert_eq!(
            result.unwrap_err(),
            Error::Deadlock {
                blocker: Blocker::Unit(3),
                length: 2
            }
        );
    }

    #[test]
    fn test_driver_gives_up() {
        let config = SchedulerConfig {
            max_schedule_attempts: 3,
            ..SchedulerConfig::default()
        };
        let result = drive(&config, 1, |_, _| {
            Ok(Err(Infeasible {
                blocker: Blocker::Unit(0),
                extra_length: 1,
                attempt: 1,
            }))
        });
        assert_eq!(result.unwrap_err(), Error::TooManyAttempts(3));
    }
}
