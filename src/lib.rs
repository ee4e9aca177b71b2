mod config;
mod counts;
mod cycle_set_dag;
mod cycles;
mod description;
mod error;
mod graph;
mod machine;
mod report;
mod schedule_time;
mod scheduler;
mod structures;
mod time_account;

pub use config::*;
pub use counts::*;
pub use cycle_set_dag::*;
pub use description::*;
pub use error::{Blocker, Error, FlowSite, Imbalance, Infeasible, Result};
pub use graph::*;
pub use machine::*;
pub use report::*;
pub use schedule_time::*;
pub use scheduler::*;
pub use time_account::*;

/// Analyze one executed path: reconcile its block counts, schedule its
/// dependence graph and collect the result.
pub fn analyze_path(
    desc: &GraphDescription,
    machine: &Machine,
    config: &SchedulerConfig,
) -> Result<ScheduleReport> {
    let counts = match desc.block_graph() {
        Some(mut blocks) => Some(blocks.reconcile(config)?),
        None => None,
    };
    let mut dg = desc.into_graph(config.clone())?;
    let outcome = dg.compute_schedule(machine)?;
    Ok(ScheduleReport::new(desc, &dg, machine, outcome, counts))
}
