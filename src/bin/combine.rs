//! Combine schedule reports of the paths of one program
use clap::Parser;
use cli_table::{Cell, Table, print_stdout};
use pathsched::{Machine, ScheduleReport, combine_reports, ledger_rows};
use std::{fs::File, io::BufReader, path::PathBuf};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Paths to schedule reports
    #[arg(short, long, required = true)]
    report_paths: Vec<PathBuf>,

    /// Path to the machine description, used to name ledger entries
    #[arg(short, long)]
    machine_path: PathBuf,

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

    let machine = Machine::from_file(&args.machine_path)?;
    let mut reports: Vec<ScheduleReport> = vec![];
    for report_path in &args.report_paths {
        println!("Loading schedule report from {}", report_path.display());
        reports.push(serde_json::from_reader(BufReader::new(File::open(
            report_path,
        )?))?);
    }

    println!("Top paths by cycles:");
    reports.sort_by(|a, b| {
        let cycles = |r: &ScheduleReport| r.weight() * r.outcome.schedule_length as f64;
        cycles(b).total_cmp(&cycles(a))
    });
    let mut table = vec![];
    for report in reports.iter().take(10) {
        table.push(vec![
            report.name.clone().cell(),
            format!("{:.0}", report.frequency).cell(),
            format!("{:.2}", report.avg_iterations).cell(),
            report.outcome.schedule_length.cell(),
            report.outcome.dependency_bound.cell(),
            report.outcome.resource_bound.cell(),
        ]);
    }
    let table = table.table().title(vec![
        "Path".cell(),
        "Frequency".cell(),
        "Iterations".cell(),
        "Schedule Length".cell(),
        "Dependency Bound".cell(),
        "Resource Bound".cell(),
    ]);
    print_stdout(table)?;

    let combined = combine_reports(&reports);
    println!("Overall statistics:");
    println!("- Paths: {}", combined.paths);
    println!("- Iterations: {:.0}", combined.iterations);
    println!("- Cycles: {:.0}", combined.total.total_cpu_time());

    let mut table = vec![];
    for row in ledger_rows(&combined.per_iteration, &machine, args.verbose) {
        let total = combined.total.display_value(row.key);
        table.push(vec![
            row.name.cell(),
            format!("{:.2}", row.value).cell(),
            format!("{:.0}", total).cell(),
        ]);
    }
    let table = table.table().title(vec![
        "Entry".cell(),
        "Per Iteration".cell(),
        "Total".cell(),
    ]);
    print_stdout(table)?;

    if let Some(output_path) = &args.output_path {
        std::fs::write(output_path, serde_json::to_vec(&combined)?)?;
    }
    Ok(())
}
