use once_cell::sync::Lazy;
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

use super::{
    models::{
        CommandSpec, Config, ConfigMetadata, DatabaseConfig, EnvConfig, FileConfig,
        WorkerConfig,
    },
    validation::{self, ConfigWarnings},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("evalrun.toml"),
        PathBuf::from("config/evalrun.toml"),
    ]
});

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file {path} does not exist")]
    MissingConfig { path: PathBuf },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to load .env file: {0}")]
    EnvFile(#[from] dotenvy::Error),
    #[error("DATABASE_URL is not set and no [database].url is configured")]
    MissingDatabaseUrl,
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Loads `.env`, then the TOML file, then environment overrides.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        let mut load = self.load_with_env(EnvConfig::gather())?;
        load.config.metadata.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Composes the configuration from an explicit environment snapshot.
    pub fn load_with_env(&self, env: EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        let mut warnings = ConfigWarnings::default();

        if config_path.is_none() {
            warnings.push_with_hint(
                "No evalrun.toml detected; falling back to environment variables",
                "Set EVALRUN_CONFIG or pass --config to point at a configuration file",
            );
        }

        let config = compose_config(
            file_config.unwrap_or_default(),
            env,
            config_path,
            &mut warnings,
        )?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigLoadError::MissingConfig { path });
                }
                path
            }
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
            {
                Some(found) => found.clone(),
                None => return Ok((None, None)),
            },
        };

        let file_config = read_file_config(&path)?;
        Ok((Some(file_config), Some(path)))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_env<T: FromStr>(key: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigLoadError> {
    match raw {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigLoadError::InvalidValue { key, value }),
    }
}

fn compose_config(
    file: FileConfig,
    env: EnvConfig,
    config_path: Option<PathBuf>,
    warnings: &mut ConfigWarnings,
) -> Result<Config, ConfigLoadError> {
    let FileConfig {
        database: file_database,
        workers: file_workers,
        orchestrator: mut orchestrator,
    } = file;

    let url = env
        .database_url
        .filter(|url| !url.trim().is_empty())
        .or(file_database.url)
        .ok_or(ConfigLoadError::MissingDatabaseUrl)?;
    let max_connections = parse_env::<u32>("DATABASE_MAX_CONNECTIONS", env.database_max_connections)?
        .or(file_database.max_connections)
        .unwrap_or(DatabaseConfig::DEFAULT_MAX_CONNECTIONS)
        .max(1);
    let database = DatabaseConfig {
        url,
        max_connections,
    };

    let probe = match env.probe_command {
        Some(raw) => CommandSpec::parse(&raw),
        None => file_workers.probe,
    };
    let summary = match env.summary_command {
        Some(raw) => CommandSpec::parse(&raw),
        None => file_workers.summary,
    };
    let timeout_secs = parse_env::<u64>("EVALRUN_WORKER_TIMEOUT_SECS", env.worker_timeout_secs)?
        .or(file_workers.timeout_secs)
        .unwrap_or(WorkerConfig::DEFAULT_TIMEOUT_SECS);
    if probe.is_none() {
        warnings.push_with_hint(
            "No probe worker command configured; probe queues will not be consumed by this process",
            "Set [workers.probe] or EVALRUN_PROBE_COMMAND",
        );
    }
    if summary.is_none() {
        warnings.push_with_hint(
            "No summary worker command configured; the summarize queue will not be consumed by this process",
            "Set [workers.summary] or EVALRUN_SUMMARY_COMMAND",
        );
    }
    let workers = WorkerConfig {
        probe,
        summary,
        timeout: Duration::from_secs(timeout_secs.max(1)),
    };

    if let Some(interval) =
        parse_env::<u64>("EVALRUN_RECOVERY_INTERVAL_SECS", env.recovery_interval_secs)?
    {
        orchestrator.recovery.interval_secs = interval;
    }
    if let Some(threshold) =
        parse_env::<u64>("EVALRUN_STALE_THRESHOLD_SECS", env.stale_threshold_secs)?
    {
        orchestrator.recovery.stale_threshold_secs = threshold;
    }
    validation::sanitize_orchestrator(&mut orchestrator, warnings);

    Ok(Config {
        database,
        workers,
        orchestrator,
        metadata: ConfigMetadata {
            config_path,
            env_file_loaded: false,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp config");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    fn env_with_db() -> EnvConfig {
        EnvConfig {
            database_url: Some("postgres://evalrun@localhost/evalrun".into()),
            ..EnvConfig::default()
        }
    }

    #[test]
    fn file_sections_are_read() {
        let file = write_config(
            r#"
[database]
url = "postgres://file@db/evalrun"
max_connections = 4

[workers]
timeout_secs = 30
probe = { program = "python", args = ["-m", "workers.probe"] }
summary = { program = "python", args = ["-m", "workers.summary"] }

[recovery]
interval_secs = 120
stale_threshold_secs = 600

[[providers]]
provider_name = "openai"
max_parallel_requests = 4
requests_per_minute = 240
"#,
        );

        let load = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with_env(EnvConfig::default())
            .expect("config loads");
        let config = load.config;

        assert_eq!(config.database.url, "postgres://file@db/evalrun");
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.workers.timeout, Duration::from_secs(30));
        assert_eq!(
            config.workers.probe.as_ref().map(|c| c.program.as_str()),
            Some("python")
        );
        assert_eq!(config.orchestrator.recovery.interval_secs, 120);
        assert_eq!(config.orchestrator.providers.len(), 1);
        assert_eq!(config.orchestrator.providers[0].max_parallel_requests, 4);
        assert_eq!(config.metadata.config_path.as_deref(), Some(file.path()));
        assert!(load.warnings.is_empty(), "{:?}", load.warnings);
    }

    #[test]
    fn environment_overrides_the_file() {
        let file = write_config(
            r#"
[database]
url = "postgres://file@db/evalrun"

[recovery]
interval_secs = 120
"#,
        );
        let env = EnvConfig {
            database_url: Some("postgres://env@db/evalrun".into()),
            recovery_interval_secs: Some("30".into()),
            probe_command: Some("node probe.js --fast".into()),
            ..EnvConfig::default()
        };

        let config = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with_env(env)
            .expect("config loads")
            .config;

        assert_eq!(config.database.url, "postgres://env@db/evalrun");
        assert_eq!(config.orchestrator.recovery.interval_secs, 30);
        let probe = config.workers.probe.expect("probe command");
        assert_eq!(probe.program, "node");
        assert_eq!(probe.args, vec!["probe.js", "--fast"]);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = ConfigLoader::new()
            .with_config_path(dir.path().join("absent.toml"))
            .load_with_env(env_with_db())
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
    }

    #[test]
    fn database_url_is_required() {
        let file = write_config("[recovery]\ninterval_secs = 60\n");
        let err = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with_env(EnvConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::MissingDatabaseUrl));
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let file = write_config("");
        let env = EnvConfig {
            stale_threshold_secs: Some("soon".into()),
            ..env_with_db()
        };
        let err = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with_env(env)
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::InvalidValue {
                key: "EVALRUN_STALE_THRESHOLD_SECS",
                ..
            }
        ));
    }

    #[test]
    fn missing_workers_produce_warnings() {
        let file = write_config("");
        let load = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with_env(env_with_db())
            .expect("config loads");

        assert!(load.config.workers.probe.is_none());
        assert_eq!(load.warnings.len(), 2);
        assert!(load.warnings.items.iter().all(|w| w.hint.is_some()));
    }

    #[test]
    fn parse_errors_carry_the_path() {
        let file = write_config("[recovery\n");
        let err = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with_env(env_with_db())
            .unwrap_err();
        match err {
            ConfigLoadError::Parse { path, .. } => assert_eq!(path, file.path()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
