use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tuning constants of the scheduling engine.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Retries allowed in the scheduling driver and in count reconciliation
    pub max_repeat_failures: u32,
    /// Hard cap on scheduling attempts for one path
    pub max_schedule_attempts: u32,
    /// Cycles recorded before exhaustive enumeration falls back to limp mode
    pub limp_cycle_threshold: usize,
    /// Scheduling edges per node above which an SCC goes straight to limp mode
    pub limp_density_threshold: f64,
    /// Node placements allowed per attempt, as a multiple of the node count
    pub schedule_budget_ratio: usize,
    /// Longest chain explored when proving an edge redundant
    pub prune_max_depth: usize,
    /// Control edges at least this likely are treated as predicted
    pub high_branch_probability: f64,
    /// Record scheduling extra time per unit instead of as lack of resources
    pub verbose_ledger: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_repeat_failures: 100,
            max_schedule_attempts: 100,
            limp_cycle_threshold: 5000,
            limp_density_threshold: 6.0,
            schedule_budget_ratio: 8,
            prune_max_depth: 8,
            high_branch_probability: 0.75,
            verbose_ledger: false,
        }
    }
}

impl SchedulerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<SchedulerConfig> {
        let config: SchedulerConfig = toml::from_str(&std::fs::read_to_string(path)?)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use crate::SchedulerConfig;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "limp_cycle_threshold = 12").unwrap();
        writeln!(file, "verbose_ledger = true").unwrap();
        let config = SchedulerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.limp_cycle_threshold, 12);
        assert!(config.verbose_ledger);
        assert_eq!(config.max_repeat_failures, 100);
        assert_eq!(config.high_branch_probability, 0.75);
    }

    #[test]
    fn test_bad_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "prune_max_depth = \"deep\"").unwrap();
        assert!(SchedulerConfig::from_file(file.path()).is_err());
        assert!(SchedulerConfig::from_file("/nonexistent/pathsched.toml").is_err());
    }

    #[test]
    fn test_shipped_config() {
        let config = SchedulerConfig::from_file("configs/default.toml").unwrap();
        assert_eq!(config, SchedulerConfig::default());
    }
}
