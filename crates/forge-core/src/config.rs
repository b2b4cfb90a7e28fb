//! Scheduler configuration: one YAML file holding global settings plus one
//! `BranchPolicy` record per managed branch, validated at load time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::BranchPolicy;

/// Top-level configuration for the branchforge scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// SQLite URL for the job ledger, e.g. `sqlite://branchforge.db`.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Directory holding per-branch training data (`<branch>.jsonl`).
    pub data_dir: PathBuf,

    /// Directory where per-job run directories are materialized.
    pub runs_dir: PathBuf,

    /// External training program plus fixed leading arguments. The job's
    /// spec file path is appended as the final argument.
    pub trainer: Vec<String>,

    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// One policy per managed branch.
    pub branches: Vec<BranchPolicy>,
}

fn default_database_url() -> String {
    "sqlite://branchforge.db".to_string()
}
fn default_max_concurrent_jobs() -> usize {
    defaults::MAX_CONCURRENT_JOBS
}
fn default_poll_interval_secs() -> u64 {
    defaults::POLL_INTERVAL_SECS
}
fn default_timeout_secs() -> u64 {
    defaults::JOB_TIMEOUT_SECS
}
fn default_shutdown_grace_secs() -> u64 {
    defaults::SHUTDOWN_GRACE_SECS
}

impl SchedulerConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: SchedulerConfig = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.trainer.is_empty() {
            return Err(Error::Config("trainer command must not be empty".into()));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(Error::Config("max_concurrent_jobs must be at least 1".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(Error::Config("poll_interval_secs must be at least 1".into()));
        }
        if self.default_timeout_secs == 0 {
            return Err(Error::Config("default_timeout_secs must be at least 1".into()));
        }
        if self.branches.is_empty() {
            return Err(Error::Config("at least one branch policy is required".into()));
        }

        let mut seen = HashSet::new();
        for policy in &self.branches {
            validate_policy(policy)?;
            if !seen.insert(policy.branch.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate branch policy: {}",
                    policy.branch
                )));
            }
        }
        Ok(())
    }
}

fn validate_policy(policy: &BranchPolicy) -> Result<()> {
    let branch = &policy.branch;
    if branch.is_empty() {
        return Err(Error::Config("branch id must not be empty".into()));
    }
    // Branch ids become file and directory names.
    if !branch
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Config(format!(
            "{}: branch id may only contain ASCII letters, digits, '-' and '_'",
            branch
        )));
    }
    if policy.base_model.is_empty() {
        return Err(Error::Config(format!("{}: base_model must not be empty", branch)));
    }
    if policy.min_data_points == 0 {
        return Err(Error::Config(format!(
            "{}: min_data_points must be at least 1",
            branch
        )));
    }
    if policy.max_data_points < policy.min_data_points {
        return Err(Error::Config(format!(
            "{}: max_data_points ({}) is below min_data_points ({})",
            branch, policy.max_data_points, policy.min_data_points
        )));
    }
    if policy.lora.rank == 0 || policy.lora.alpha == 0 {
        return Err(Error::Config(format!(
            "{}: lora rank and alpha must be positive",
            branch
        )));
    }
    if !(0.0..1.0).contains(&policy.lora.dropout) {
        return Err(Error::Config(format!(
            "{}: lora dropout must be in [0, 1)",
            branch
        )));
    }
    if policy.lora.learning_rate <= 0.0 {
        return Err(Error::Config(format!(
            "{}: learning_rate must be positive",
            branch
        )));
    }
    if policy.lora.num_epochs == 0 || policy.lora.batch_size == 0 || policy.lora.max_length == 0 {
        return Err(Error::Config(format!(
            "{}: num_epochs, batch_size and max_length must be positive",
            branch
        )));
    }
    if policy.timeout_secs == Some(0) {
        return Err(Error::Config(format!(
            "{}: timeout_secs override must be at least 1",
            branch
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL_YAML: &str = r#"
data_dir: /var/lib/branchforge/data
runs_dir: /var/lib/branchforge/runs
trainer: ["python3", "train_lora.py"]
branches:
  - branch: math
    base_model: base-7b
    min_data_points: 30
    max_data_points: 500
"#;

    fn parse(yaml: &str) -> SchedulerConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config = parse(MINIMAL_YAML);
        config.validate().unwrap();

        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.poll_interval_secs, 300);
        assert_eq!(config.default_timeout_secs, 3600);
        assert_eq!(config.database_url, "sqlite://branchforge.db");
        assert_eq!(config.branches.len(), 1);
        assert_eq!(config.branches[0].cooldown_secs, 3600);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL_YAML.as_bytes()).unwrap();

        let config = SchedulerConfig::load(file.path()).unwrap();
        assert_eq!(config.branches[0].branch, "math");
    }

    #[test]
    fn test_load_missing_file() {
        let err = SchedulerConfig::load(Path::new("/nonexistent/forge.yaml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{{not yaml").unwrap();
        let err = SchedulerConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_empty_trainer() {
        let mut config = parse(MINIMAL_YAML);
        config.trainer.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let mut config = parse(MINIMAL_YAML);
        config.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_no_branches() {
        let mut config = parse(MINIMAL_YAML);
        config.branches.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_branch() {
        let mut config = parse(MINIMAL_YAML);
        let dup = config.branches[0].clone();
        config.branches.push(dup);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate branch"));
    }

    #[test]
    fn test_rejects_unsafe_branch_id() {
        for bad in ["../etc", "a/b", "math lab", "ma.th"] {
            let mut config = parse(MINIMAL_YAML);
            config.branches[0].branch = bad.to_string();
            assert!(config.validate().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_rejects_min_above_max() {
        let mut config = parse(MINIMAL_YAML);
        config.branches[0].min_data_points = 1000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_data_points"));
    }

    #[test]
    fn test_rejects_zero_min_data_points() {
        let mut config = parse(MINIMAL_YAML);
        config.branches[0].min_data_points = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_lora() {
        let mut config = parse(MINIMAL_YAML);
        config.branches[0].lora.rank = 0;
        assert!(config.validate().is_err());

        let mut config = parse(MINIMAL_YAML);
        config.branches[0].lora.dropout = 1.5;
        assert!(config.validate().is_err());

        let mut config = parse(MINIMAL_YAML);
        config.branches[0].lora.learning_rate = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_timeout_override() {
        let mut config = parse(MINIMAL_YAML);
        config.branches[0].timeout_secs = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_accepts_multiple_branches() {
        let mut config = parse(MINIMAL_YAML);
        let mut second = config.branches[0].clone();
        second.branch = "chemistry".to_string();
        second.timeout_secs = Some(600);
        config.branches.push(second);
        config.validate().unwrap();
    }
}
