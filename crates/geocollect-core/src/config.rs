use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::model::{DataProvider, DataSeries, Job};
use crate::types::InstanceId;

pub const DEFAULT_INSTANCE_ID: u32 = 1;
pub const DEFAULT_MAX_WORKERS: usize = 1; // one dispatcher worker per instance in the common case
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Top-level config (geocollect.toml + GEOCOLLECT_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// This process's identity in the fleet. Only jobs owned by this id run here.
    #[serde(default = "default_instance_id")]
    pub instance_id: InstanceId,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Static job configuration loaded at startup. Runtime changes arrive as
    /// configuration events instead.
    #[serde(default)]
    pub catalog: Catalog,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            database: DatabaseConfig::default(),
            dispatcher: DispatcherConfig::default(),
            catalog: Catalog::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file holding the run log.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Upper bound on concurrently executing pipelines. 1 = sequential.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// How long shutdown waits for in-flight pipelines before abandoning them.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }
}

/// Providers, series and jobs known at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub providers: Vec<DataProvider>,
    #[serde(default)]
    pub series: Vec<DataSeries>,
    #[serde(default)]
    pub jobs: Vec<Job>,
}

impl Catalog {
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty() && self.series.is_empty() && self.jobs.is_empty()
    }
}

fn default_instance_id() -> InstanceId {
    InstanceId(DEFAULT_INSTANCE_ID)
}
fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}
fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.geocollect/runs.db", home)
}

impl CollectorConfig {
    /// Load config from a TOML file with GEOCOLLECT_* env var overrides.
    ///
    /// Nested keys use `__` as separator, so field names keep their single
    /// underscores: `GEOCOLLECT_INSTANCE_ID=3`,
    /// `GEOCOLLECT_DISPATCHER__MAX_WORKERS=4`.
    /// A missing file is not an error; defaults and env vars still apply.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CollectorConfig = Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::CollectorError::Configuration(e.to_string()))?;

        tracing::debug!(
            %path,
            instance_id = %config.instance_id,
            jobs = config.catalog.jobs.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("GEOCOLLECT_").split("__"))
    }

    /// Check values that deserialize fine but cannot work at runtime.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.dispatcher.max_workers == 0 {
            return Err(crate::error::CollectorError::Configuration(
                "dispatcher.max_workers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.geocollect/geocollect.toml", home)
}
