//! Schedule the dependence graph of one executed path and print where its
//! cycles went
use clap::Parser;
use cli_table::{Cell, Table, print_stdout};
use pathsched::{GraphDescription, Machine, SchedulerConfig, analyze_path, ledger_rows};
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the path description (json)
    #[arg(short, long)]
    graph_path: PathBuf,

    /// Path to the machine description (toml)
    #[arg(short, long)]
    machine_path: PathBuf,

    /// Path to scheduler settings (toml)
    #[arg(short, long)]
    config_path: Option<PathBuf>,

    /// Path to output file
    #[arg(short, long)]
    output_path: Option<PathBuf>,

    /// Show every ledger entry
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Cli::parse();

    println!("Loading machine from {}", args.machine_path.display());
    let machine = Machine::from_file(&args.machine_path)?;
    let mut config = match &args.config_path {
        Some(path) => SchedulerConfig::from_file(path)?,
        None => SchedulerConfig::default(),
    };
    config.verbose_ledger |= args.verbose;

    println!("Loading path from {}", args.graph_path.display());
    let desc = GraphDescription::from_file(&args.graph_path)?;
    let report = analyze_path(&desc, &machine, &config)?;

    if let Some(counts) = &report.counts {
        println!(
            "Block counts reconciled with {} guesses and {} failures",
            counts.guesses, counts.failures
        );
    }

    println!("Schedule of {}:", report.name);
    let mut table = vec![];
    for node in &report.nodes {
        table.push(vec![
            node.node.cell(),
            format!("0x{:08x}.{}", node.address, node.uop).cell(),
            format!("{:?}", node.kind).cell(),
            node.iteration.cell(),
            node.clock_cycle.cell(),
            node.unit.as_deref().unwrap_or("-").cell(),
        ]);
    }
    let table = table.table().title(vec![
        "Node".cell(),
        "Address".cell(),
        "Kind".cell(),
        "Iteration".cell(),
        "Cycle".cell(),
        "Unit".cell(),
    ]);
    print_stdout(table)?;

    let outcome = &report.outcome;
    println!("Overall statistics:");
    println!("- Schedule length: {}", outcome.schedule_length);
    println!("- Dependency bound: {}", outcome.dependency_bound);
    println!(
        "- Resource bound: {} ({})",
        outcome.resource_bound,
        machine.ledger_unit_name(outcome.bottleneck)
    );
    println!("- Span of one iteration: {}", outcome.span);
    println!("- Scheduling attempts: {}", outcome.attempts);

    println!("Time attribution per iteration:");
    let cpu = report.time_stats.total_cpu_time();
    let mut table = vec![];
    for row in ledger_rows(&report.time_stats, &machine, config.verbose_ledger) {
        let percent = match row.key.category() {
            Some(c) if c.computes_percent() && cpu > 0.0 => {
                format!("{:.2}", row.value * 100.0 / cpu)
            }
            _ => "-".to_string(),
        };
        table.push(vec![
            row.name.cell(),
            format!("{:.2}", row.value).cell(),
            percent.cell(),
        ]);
    }
    let table = table.table().title(vec![
        "Entry".cell(),
        "Cycles".cell(),
        "Share (%)".cell(),
    ]);
    print_stdout(table)?;

    if let Some(output_path) = &args.output_path {
        println!("Writing report to {}", output_path.display());
        std::fs::write(output_path, serde_json::to_vec(&report)?)?;
    }
    Ok(())
}
