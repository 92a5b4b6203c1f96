//! Typed view of the merged configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dbflow_executor::{ExecutorConfig, TimeoutConfig};
use dbflow_inspector::ClaimPolicy;

use super::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub catalog: CatalogSettings,
    #[serde(default)]
    pub paths: PathSettings,
    pub scheduler: SchedulerSettings,
    pub executor: ExecutorSettings,
    pub inspection: InspectionSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSettings {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl CatalogSettings {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Directory fallbacks used when the catalog's mission row leaves them unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathSettings {
    #[serde(default)]
    pub incoming: Option<PathBuf>,
    #[serde(default)]
    pub errors: Option<PathBuf>,
    /// Parent of the per-cycle build directories; the system temp dir if unset
    #[serde(default)]
    pub build_dir: Option<PathBuf>,
    /// Build logs; `<root>/logs` if unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl PathSettings {
    pub fn incoming_dir(&self, root: &Path, catalog_value: Option<&str>) -> PathBuf {
        pick_dir(catalog_value, self.incoming.as_deref(), root, "incoming")
    }

    pub fn error_dir(&self, root: &Path, catalog_value: Option<&str>) -> PathBuf {
        pick_dir(catalog_value, self.errors.as_deref(), root, "errors")
    }

    pub fn log_dir(&self, root: &Path) -> PathBuf {
        pick_dir(None, self.log_dir.as_deref(), root, "logs")
    }
}

fn pick_dir(catalog: Option<&str>, configured: Option<&Path>, root: &Path, name: &str) -> PathBuf {
    match (catalog, configured) {
        (Some(dir), _) if !dir.is_empty() => PathBuf::from(dir),
        (_, Some(dir)) => dir.to_path_buf(),
        _ => root.join(name),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Batch size for queue writes; never a cap on queue length
    pub max_add: usize,
    pub requeue_failed_inputs: bool,
    pub lease_stale_seconds: u64,
}

impl SchedulerSettings {
    pub fn lease_stale_after(&self) -> Duration {
        Duration::from_secs(self.lease_stale_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    pub overall_seconds: u64,
    #[serde(default)]
    pub idle_log_seconds: Option<u64>,
    pub termination_grace_seconds: u64,
    #[serde(default)]
    pub extra_env: Vec<String>,
}

impl ExecutorSettings {
    pub fn to_executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            timeouts: TimeoutConfig {
                overall_seconds: self.overall_seconds,
                idle_log_seconds: self.idle_log_seconds,
            },
            termination_grace_seconds: self.termination_grace_seconds,
            extra_env: self.extra_env.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectionSettings {
    pub claim_policy: ClaimPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub filter: String,
    pub json: bool,
}

impl Settings {
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let settings: Settings = serde_json::from_value(value)
            .map_err(|e| ConfigError::ParseError(format!("invalid configuration: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.executor
            .to_executor_config()
            .timeouts
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        if self.scheduler.max_add == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.max_add must be at least 1".to_string(),
            ));
        }
        if self.scheduler.lease_stale_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.lease_stale_seconds must be at least 1".to_string(),
            ));
        }
        if self.catalog.path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "catalog.path must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
