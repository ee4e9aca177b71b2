use crate::{
    GraphDescription, InstrKind, Machine, Reconciled, SchedDg, SchedStatus, ScheduleOutcome,
    TimeAccount, TimeKey,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeSchedule {
    pub node: u32,
    pub address: u64,
    pub uop: u32,
    pub kind: InstrKind,
    /// iteration and cycle within it
    pub iteration: i32,
    pub clock_cycle: i32,
    /// unit name, none for nodes that take no unit
    pub unit: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScheduleReport {
    /// path
    pub name: String,
    pub frequency: f64,
    pub avg_iterations: f64,

    /// schedule
    pub outcome: ScheduleOutcome,
    pub nodes: Vec<NodeSchedule>,

    /// cycle attribution for one iteration
    pub time_stats: TimeAccount,
    /// busy cycles per unit for one iteration
    pub unit_usage: TimeAccount,

    /// block count reconciliation, if the path carried block counts
    pub counts: Option<Reconciled>,
}

impl ScheduleReport {
    pub fn new(
        desc: &GraphDescription,
        dg: &SchedDg,
        machine: &Machine,
        outcome: ScheduleOutcome,
        counts: Option<Reconciled>,
    ) -> ScheduleReport {
        let mut nodes = vec![];
        for node in dg.nodes().filter(|n| n.is_live()) {
            let SchedStatus::Scheduled { time, unit } = node.status else {
                continue;
            };
            nodes.push(NodeSchedule {
                node: node.id.0,
                address: node.address,
                uop: node.uop_index,
                kind: node.class.kind,
                iteration: time.iteration(),
                clock_cycle: time.clock_cycle(),
                unit: unit.map(|u| machine.ledger_unit_name(u as i32)),
            });
        }
        nodes.sort_by_key(|n| (n.iteration, n.clock_cycle, n.node));
        ScheduleReport {
            name: desc.name.clone(),
            frequency: desc.frequency,
            avg_iterations: desc.avg_iterations,
            outcome,
            nodes,
            time_stats: dg.time_stats.clone(),
            unit_usage: dg.unit_usage.clone(),
            counts,
        }
    }

    /// Iterations this path accounts for.
    pub fn weight(&self) -> f64 {
        self.frequency * self.avg_iterations
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LedgerRow {
    pub key: TimeKey,
    pub name: String,
    pub value: f64,
}

/// Ledger entries worth showing, with their display values.
pub fn ledger_rows(stats: &TimeAccount, machine: &Machine, verbose: bool) -> Vec<LedgerRow> {
    stats
        .iter()
        .filter(|(key, _)| key.category().is_some_and(|c| c.display_by_default(verbose)))
        .map(|(key, _)| LedgerRow {
            key,
            name: key.long_name(machine),
            value: stats.display_value(key),
        })
        .collect()
}

/// Ledgers of many paths, weighted by how often each path ran.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CombinedReport {
    pub paths: usize,
    pub iterations: f64,
    /// cycles spent over all iterations
    pub total: TimeAccount,
    pub per_iteration: TimeAccount,
}

pub fn combine_reports(reports: &[ScheduleReport]) -> CombinedReport {
    let mut total = TimeAccount::new();
    let mut iterations = 0.0;
    for report in reports {
        let weight = report.weight();
        if weight <= 0.0 {
            log::warn!("Skipping path {} that never ran", report.name);
            continue;
        }
        total += &(report.time_stats.clone() * weight);
        iterations += weight;
    }
    let per_iteration = total.clone() / iterations;
    CombinedReport {
        paths: reports.len(),
        iterations,
        total,
        per_iteration,
    }
}

#[cfg(test)]
mod tests {
    use super::{ScheduleReport, combine_reports, ledger_rows};
    use crate::{
        GraphDescription, ScheduleOutcome, SchedulerConfig, TimeAccount, TimeCategory, TimeKey,
        machine::tests::test_machine,
    };

    const PATH: &str = r#"{
        "name": "sum",
        "frequency": 3.0,
        "avg_iterations": 4.0,
        "nodes": [
            {"address": 16, "class": {"kind": "Load", "style": "Scalar", "unit_type": "Int", "width": 64}},
            {"address": 20, "class": {"kind": "IntArith", "style": "Scalar", "unit_type": "Int", "width": 64}},
            {"address": 24, "class": {"kind": "IntArith", "style": "Scalar", "unit_type": "Int", "width": 64}}
        ],
        "edges": [
            {"src": 0, "dst": 1, "direction": "True", "dtype": "GpRegister"},
            {"src": 1, "dst": 1, "direction": "True", "dtype": "GpRegister", "distance": 1}
        ]
    }"#;

    fn report_with(name: &str, frequency: f64, avg_iterations: f64, cycles: f64) -> ScheduleReport {
        let mut time_stats = TimeAccount::new();
        time_stats.add_execution_time(cycles);
        ScheduleReport {
            name: name.to_string(),
            frequency,
            avg_iterations,
            outcome: ScheduleOutcome {
                schedule_length: cycles as u32,
                dependency_bound: 1,
                resource_bound: 1,
                bottleneck: 0,
                attempts: 1,
                span: 0,
            },
            nodes: vec![],
            time_stats,
            unit_usage: TimeAccount::new(),
            counts: None,
        }
    }

    #[test]
    fn test_report_from_schedule() {
        let machine = test_machine();
        let desc: GraphDescription = serde_json::from_str(PATH).unwrap();
        let mut dg = desc.into_graph(SchedulerConfig::default()).unwrap();
        let outcome = dg.compute_schedule(&machine).unwrap();
        let report = ScheduleReport::new(&desc, &dg, &machine, outcome.clone(), None);
        assert_eq!(report.weight(), 12.0);
        assert_eq!(report.nodes.len(), 3);
        assert_eq!(report.outcome, outcome);
        assert_eq!(report.time_stats.total_cpu_time(), outcome.schedule_length as f64);
        let load = report.nodes.iter().find(|n| n.node == 0).unwrap();
        assert_eq!(load.unit.as_deref(), Some("MEM[0]"));
        let cycles: Vec<(i32, i32)> = report
            .nodes
            .iter()
            .map(|n| (n.iteration, n.clock_cycle))
            .collect();
        let mut sorted = cycles.clone();
        sorted.sort();
        assert_eq!(cycles, sorted);
    }

    #[test]
    fn test_ledger_rows_hide_verbose_entries() {
        let machine = test_machine();
        let mut stats = TimeAccount::new();
        stats.add_scheduling_time(0, 2.0, true);
        stats.add_dependency_time(3.0);
        let quiet = ledger_rows(&stats, &machine, false);
        let verbose = ledger_rows(&stats, &machine, true);
        assert!(quiet.len() < verbose.len());
        let total = quiet
            .iter()
            .find(|r| r.key == TimeKey::of(TimeCategory::SchedulingTotal))
            .unwrap();
        assert_eq!(total.value, 5.0);
    }

    #[test]
    fn test_combine_weights_by_iterations() {
        let reports = vec![
            report_with("a", 10.0, 1.0, 2.0),
            report_with("b", 5.0, 2.0, 4.0),
            report_with("never", 0.0, 1.0, 100.0),
        ];
        let combined = combine_reports(&reports);
        assert_eq!(combined.paths, 3);
        assert_eq!(combined.iterations, 20.0);
        assert_eq!(combined.total.total_cpu_time(), 60.0);
        assert_eq!(combined.per_iteration.total_cpu_time(), 3.0);
    }
}
