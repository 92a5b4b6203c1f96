//! Effective configuration with provenance
//!
//! Records the merged configuration plus where each layer came from.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::defaults::BuiltinDefaults;
use super::merge::merge_layers;
use super::settings::Settings;

/// Origin of a configuration layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    User,
    File,
    Cli,
}

/// A contributing layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 of the raw file bytes (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Merged configuration and its sources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub created_at: DateTime<Utc>,

    /// The merged configuration object
    pub config: Value,

    /// Contributing sources in precedence order
    pub sources: Vec<ConfigSource>,

    #[serde(skip)]
    settings: Option<Settings>,
}

/// `~/.config/dbflow/config.toml`, when `HOME` is set.
pub fn default_user_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".config").join("dbflow").join("config.toml"))
}

impl EffectiveConfig {
    /// Build from layers.
    ///
    /// A missing user file is skipped; a missing `--config` file is an error.
    pub fn build(
        user_config_path: Option<&Path>,
        config_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = vec![BuiltinDefaults::default().to_value()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        if let Some(path) = user_config_path {
            if path.exists() {
                let (value, digest) = Self::load_toml_file(path)?;
                layers.push(value);
                sources.push(ConfigSource {
                    origin: ConfigOrigin::User,
                    path: Some(path.to_string_lossy().to_string()),
                    digest: Some(digest),
                });
            }
        }

        if let Some(path) = config_path {
            let (value, digest) = Self::load_toml_file(path)?;
            layers.push(value);
            sources.push(ConfigSource {
                origin: ConfigOrigin::File,
                path: Some(path.to_string_lossy().to_string()),
                digest: Some(digest),
            });
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let merged = merge_layers(layers);
        let settings = Settings::from_value(merged.clone())?;

        Ok(Self {
            created_at: Utc::now(),
            config: merged,
            sources,
            settings: Some(settings),
        })
    }

    /// The validated, typed settings.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        match &self.settings {
            Some(settings) => Ok(settings.clone()),
            None => Settings::from_value(self.config.clone()),
        }
    }

    /// Load and parse a TOML file, returning the value and digest
    fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
        let bytes = fs::read(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;

        let digest = hex::encode(Sha256::digest(&bytes));

        let contents = String::from_utf8(bytes)
            .map_err(|e| ConfigError::ParseError(format!("invalid UTF-8: {}", e)))?;
        let toml_value: toml::Value = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;

        Ok((toml_to_json(toml_value), digest))
    }

    /// Get a value by dot-separated path
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.config, |current, part| current.get(part))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn toml_to_json(toml: toml::Value) -> Value {
    match toml {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(arr) => Value::Array(arr.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_build_with_defaults_only() {
        let config = EffectiveConfig::build(None, None, None).unwrap();

        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].origin, ConfigOrigin::Builtin);
        assert_eq!(config.get("scheduler.max_add").and_then(Value::as_u64), Some(500));
        assert_eq!(config.settings().unwrap().logging.filter, "info");
    }

    #[test]
    fn test_file_layer_and_digest() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "[catalog]").unwrap();
        writeln!(temp, "path = \"/data/rbsp/catalog.sqlite\"").unwrap();
        writeln!(temp, "[executor]").unwrap();
        writeln!(temp, "extra_env = [\"CDF_LIB\"]").unwrap();

        let config = EffectiveConfig::build(None, Some(temp.path()), None).unwrap();
        let settings = config.settings().unwrap();

        assert_eq!(settings.catalog.path, PathBuf::from("/data/rbsp/catalog.sqlite"));
        assert_eq!(settings.catalog.busy_timeout_ms, 5000);
        assert_eq!(settings.executor.extra_env, vec!["CDF_LIB".to_string()]);
        assert_eq!(config.sources[1].origin, ConfigOrigin::File);
        assert_eq!(config.sources[1].digest.as_ref().map(|d| d.len()), Some(64));
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "[logging]\nfilter = \"debug\"").unwrap();

        let cli = serde_json::json!({"logging": {"filter": "warn"}});
        let config = EffectiveConfig::build(None, Some(temp.path()), Some(cli)).unwrap();
        assert_eq!(config.settings().unwrap().logging.filter, "warn");
    }

    #[test]
    fn test_missing_user_file_skipped() {
        let config =
            EffectiveConfig::build(Some(Path::new("/nonexistent/dbflow.toml")), None, None)
                .unwrap();
        assert_eq!(config.sources.len(), 1);
    }

    #[test]
    fn test_missing_config_file_is_error() {
        let result = EffectiveConfig::build(None, Some(Path::new("/nonexistent/dbflow.toml")), None);
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_validation_error_surfaces() {
        let cli = serde_json::json!({"executor": {"overall_seconds": 0}});
        let err = EffectiveConfig::build(None, None, Some(cli)).unwrap_err();
        assert!(err.to_string().contains("overall_seconds"));
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "[catalog\npath = ").unwrap();
        let err = EffectiveConfig::build(None, Some(temp.path()), None).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
