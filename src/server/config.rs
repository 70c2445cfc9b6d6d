use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::monitor::coordinator::EngineConfig;
use crate::monitor::dispatch::PoolConfig;
use crate::monitor::models::MonitoredTarget;
use crate::monitor::probe::DEFAULT_PROBE_TIMEOUT;
use crate::store::memory::DEFAULT_HISTORY_RETENTION;

const ENV_PREFIX: &str = "SENTINEL_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file at {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A target definition given in the config file.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TargetSeed {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl TargetSeed {
    pub fn to_target(&self) -> MonitoredTarget {
        let target = MonitoredTarget::new(
            self.id.as_str(),
            self.url.clone(),
            Duration::from_secs(self.interval_secs),
        )
        .with_method(self.method.clone());
        match &self.name {
            Some(name) => target.with_name(name.clone()),
            None => target,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub listen_address: SocketAddr,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub probe_timeout_secs: u64,
    pub settle_delay_secs: u64,
    pub reconcile_interval_secs: u64,
    pub notify_timeout_secs: u64,
    pub notify_on_initial_check: bool,
    pub store_timeout_secs: u64,
    pub check_log_retention: usize,
    pub notification_webhook_url: Option<String>,
    pub notification_body_template: Option<String>,
    pub log_dir: String,
    pub targets: Vec<TargetSeed>,
    /// File the config was read from, if any. Reload re-reads its targets.
    pub source_path: Option<PathBuf>,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialSchedulerConfig {
    listen_address: Option<String>,
    worker_count: Option<usize>,
    queue_capacity: Option<usize>,
    probe_timeout_secs: Option<u64>,
    settle_delay_secs: Option<u64>,
    reconcile_interval_secs: Option<u64>,
    notify_timeout_secs: Option<u64>,
    notify_on_initial_check: Option<bool>,
    store_timeout_secs: Option<u64>,
    check_log_retention: Option<usize>,
    notification_webhook_url: Option<String>,
    notification_body_template: Option<String>,
    log_dir: Option<String>,
    targets: Option<Vec<TargetSeed>>,
}

// Environment variables cannot describe target lists.
#[derive(Deserialize, Default, Debug)]
struct EnvSchedulerConfig {
    listen_address: Option<String>,
    worker_count: Option<usize>,
    queue_capacity: Option<usize>,
    probe_timeout_secs: Option<u64>,
    settle_delay_secs: Option<u64>,
    reconcile_interval_secs: Option<u64>,
    notify_timeout_secs: Option<u64>,
    notify_on_initial_check: Option<bool>,
    store_timeout_secs: Option<u64>,
    check_log_retention: Option<usize>,
    notification_webhook_url: Option<String>,
    notification_body_template: Option<String>,
    log_dir: Option<String>,
}

fn default_listen_address() -> String {
    "0.0.0.0:3003".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_interval_secs() -> u64 {
    300
}

impl SchedulerConfig {
    /// Loads `.env`, then layers the process environment over the optional file.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::load_from(config_path.map(Path::new), std::env::vars())
    }

    /// Layers `env` over the file at `config_path` (a missing file is treated as empty).
    pub fn load_from(
        config_path: Option<&Path>,
        env: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, ConfigError> {
        // 1. Load from file (optional)
        let file_config = match config_path {
            Some(path) if path.exists() => read_partial(path)?,
            _ => PartialSchedulerConfig::default(),
        };

        // 2. Load from environment variables
        let env_config: EnvSchedulerConfig = envy::prefixed(ENV_PREFIX).from_iter(env)?;

        // 3. Merge: environment overrides file
        let listen_address = env_config
            .listen_address
            .or(file_config.listen_address)
            .unwrap_or_else(default_listen_address);
        let listen_address = listen_address.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Invalid(format!("listen_address '{listen_address}' is invalid: {e}"))
        })?;

        let config = SchedulerConfig {
            listen_address,
            worker_count: env_config
                .worker_count
                .or(file_config.worker_count)
                .unwrap_or(10),
            queue_capacity: env_config
                .queue_capacity
                .or(file_config.queue_capacity)
                .unwrap_or(100),
            probe_timeout_secs: env_config
                .probe_timeout_secs
                .or(file_config.probe_timeout_secs)
                .unwrap_or(DEFAULT_PROBE_TIMEOUT.as_secs()),
            settle_delay_secs: env_config
                .settle_delay_secs
                .or(file_config.settle_delay_secs)
                .unwrap_or(5),
            reconcile_interval_secs: env_config
                .reconcile_interval_secs
                .or(file_config.reconcile_interval_secs)
                .unwrap_or(60),
            notify_timeout_secs: env_config
                .notify_timeout_secs
                .or(file_config.notify_timeout_secs)
                .unwrap_or(5),
            notify_on_initial_check: env_config
                .notify_on_initial_check
                .or(file_config.notify_on_initial_check)
                .unwrap_or(false),
            store_timeout_secs: env_config
                .store_timeout_secs
                .or(file_config.store_timeout_secs)
                .unwrap_or(10),
            check_log_retention: env_config
                .check_log_retention
                .or(file_config.check_log_retention)
                .unwrap_or(DEFAULT_HISTORY_RETENTION),
            notification_webhook_url: env_config
                .notification_webhook_url
                .or(file_config.notification_webhook_url)
                .filter(|url| !url.trim().is_empty()),
            notification_body_template: env_config
                .notification_body_template
                .or(file_config.notification_body_template),
            log_dir: env_config
                .log_dir
                .or(file_config.log_dir)
                .unwrap_or_else(default_log_dir),
            targets: file_config.targets.unwrap_or_default(),
            source_path: config_path.map(Path::to_path_buf),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("worker_count", self.worker_count as u64),
            ("queue_capacity", self.queue_capacity as u64),
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("reconcile_interval_secs", self.reconcile_interval_secs),
            ("store_timeout_secs", self.store_timeout_secs),
            ("check_log_retention", self.check_log_retention as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be positive")));
            }
        }
        Ok(())
    }

    /// Re-reads the target list from the file this config came from.
    pub fn reload_targets(&self) -> Result<Vec<TargetSeed>, ConfigError> {
        match &self.source_path {
            Some(path) if path.exists() => Ok(read_partial(path)?.targets.unwrap_or_default()),
            _ => Ok(self.targets.clone()),
        }
    }

    pub fn seed_targets(&self) -> Vec<MonitoredTarget> {
        self.targets.iter().map(TargetSeed::to_target).collect()
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            pool: PoolConfig {
                worker_count: self.worker_count,
                queue_capacity: self.queue_capacity,
            },
            settle_delay: Duration::from_secs(self.settle_delay_secs),
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
            notify_timeout: self.notify_timeout(),
            store_timeout: Duration::from_secs(self.store_timeout_secs),
            notify_on_initial_check: self.notify_on_initial_check,
        }
    }
}

fn read_partial(path: &Path) -> Result<PartialSchedulerConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::models::TargetStatus;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_without_file_or_env() {
        let config = SchedulerConfig::load_from(None, env(&[])).unwrap();
        assert_eq!(config.listen_address, "0.0.0.0:3003".parse::<SocketAddr>().unwrap());
        assert_eq!(config.worker_count, 10);
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.probe_timeout(), Duration::from_secs(10));
        assert_eq!(config.settle_delay_secs, 5);
        assert!(!config.notify_on_initial_check);
        assert_eq!(config.check_log_retention, 1000);
        assert_eq!(config.engine_config().store_timeout, Duration::from_secs(10));
        assert!(config.notification_webhook_url.is_none());
        assert_eq!(config.log_dir, "logs");
        assert!(config.targets.is_empty());
    }

    #[test]
    fn file_values_and_targets_are_read() {
        let file = write_config(
            r#"
worker_count = 3
notification_webhook_url = "http://hooks.example/alerts"

[[targets]]
id = "api"
name = "Public API"
url = "https://api.example/health"
interval_secs = 60

[[targets]]
id = "web"
url = "https://www.example"
method = "HEAD"
"#,
        );
        let config = SchedulerConfig::load_from(Some(file.path()), env(&[])).unwrap();
        assert_eq!(config.worker_count, 3);
        assert_eq!(
            config.notification_webhook_url.as_deref(),
            Some("http://hooks.example/alerts")
        );

        let targets = config.seed_targets();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].name, "Public API");
        assert_eq!(targets[0].interval, Duration::from_secs(60));
        assert_eq!(targets[0].status, TargetStatus::Pending);
        assert_eq!(targets[1].name, "web");
        assert_eq!(targets[1].method, "HEAD");
        assert_eq!(targets[1].interval, Duration::from_secs(300));
    }

    #[test]
    fn environment_overrides_file() {
        let file = write_config("worker_count = 3\nlog_dir = \"/var/log/sentinel\"\n");
        let config = SchedulerConfig::load_from(
            Some(file.path()),
            env(&[
                ("SENTINEL_WORKER_COUNT", "7"),
                ("SENTINEL_NOTIFY_ON_INITIAL_CHECK", "true"),
                ("UNRELATED", "ignored"),
            ]),
        )
        .unwrap();
        assert_eq!(config.worker_count, 7);
        assert!(config.notify_on_initial_check);
        assert_eq!(config.log_dir, "/var/log/sentinel");

        let engine = config.engine_config();
        assert_eq!(engine.pool.worker_count, 7);
        assert!(engine.notify_on_initial_check);
    }

    #[test]
    fn zero_workers_is_invalid() {
        let err = SchedulerConfig::load_from(None, env(&[("SENTINEL_WORKER_COUNT", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("worker_count")));
    }

    #[test]
    fn zero_retention_is_invalid() {
        let err = SchedulerConfig::load_from(None, env(&[("SENTINEL_CHECK_LOG_RETENTION", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("check_log_retention")));
    }

    #[test]
    fn bad_listen_address_is_invalid() {
        let err = SchedulerConfig::load_from(
            None,
            env(&[("SENTINEL_LISTEN_ADDRESS", "not-an-address")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let file = write_config("worker_count = = 3");
        let err = SchedulerConfig::load_from(Some(file.path()), env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn reload_reads_current_file_contents() {
        let mut file = write_config("[[targets]]\nid = \"a\"\nurl = \"http://a.example\"\n");
        let config = SchedulerConfig::load_from(Some(file.path()), env(&[])).unwrap();
        assert_eq!(config.targets.len(), 1);

        file.write_all(b"\n[[targets]]\nid = \"b\"\nurl = \"http://b.example\"\n")
            .unwrap();
        file.flush().unwrap();
        let reloaded = config.reload_targets().unwrap();
        let ids: Vec<&str> = reloaded.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
