use std::path::PathBuf;
use std::time::Duration;

use evalrun_core::orchestration::OrchestratorConfig;
use serde::{Deserialize, Serialize};

/// Fully resolved service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub workers: WorkerConfig,
    pub orchestrator: OrchestratorConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
}

/// External commands that execute probe and summarize jobs.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    pub probe: Option<CommandSpec>,
    pub summary: Option<CommandSpec>,
    pub timeout: Duration,
}

impl WorkerConfig {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 10 * 60;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Splits a whitespace separated command line; `None` when blank.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub workers: FileWorkerConfig,
    #[serde(flatten)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileWorkerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe: Option<CommandSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<CommandSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Values read from the process environment.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub database_max_connections: Option<String>,
    pub probe_command: Option<String>,
    pub summary_command: Option<String>,
    pub worker_timeout_secs: Option<String>,
    pub recovery_interval_secs: Option<String>,
    pub stale_threshold_secs: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: std::env::var("EVALRUN_CONFIG").ok().map(PathBuf::from),
            database_url: std::env::var("DATABASE_URL").ok(),
            database_max_connections: std::env::var("DATABASE_MAX_CONNECTIONS").ok(),
            probe_command: std::env::var("EVALRUN_PROBE_COMMAND").ok(),
            summary_command: std::env::var("EVALRUN_SUMMARY_COMMAND").ok(),
            worker_timeout_secs: std::env::var("EVALRUN_WORKER_TIMEOUT_SECS").ok(),
            recovery_interval_secs: std::env::var("EVALRUN_RECOVERY_INTERVAL_SECS").ok(),
            stale_threshold_secs: std::env::var("EVALRUN_STALE_THRESHOLD_SECS").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_lines_split_on_whitespace() {
        let spec = CommandSpec::parse("  python -m workers.probe ").unwrap();
        assert_eq!(spec.program, "python");
        assert_eq!(spec.args, vec!["-m", "workers.probe"]);
        assert!(CommandSpec::parse("   ").is_none());
    }
}
