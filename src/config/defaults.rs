//! Built-in defaults (layer 1)

use serde::{Deserialize, Serialize};

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Catalog database file
    pub catalog_path: String,

    /// SQLite busy timeout in milliseconds (default: 5000)
    pub busy_timeout_ms: u64,

    /// Queue write batch size (default: 500)
    pub max_add: usize,

    /// Re-queue the inputs of a failed build (default: false)
    pub requeue_failed_inputs: bool,

    /// Age after which a lease no longer blocks (default: 21600 = 6 hours)
    pub lease_stale_seconds: u64,

    /// Overall build timeout in seconds (default: 3600)
    pub overall_seconds: u64,

    /// SIGTERM to SIGKILL grace period in seconds (default: 10)
    pub termination_grace_seconds: u64,

    /// Inspector claim policy (default: "first_match")
    pub claim_policy: String,

    /// Log filter directive (default: "info")
    pub log_filter: String,

    /// JSON log lines (default: false)
    pub log_json: bool,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            catalog_path: "dbflow.sqlite".to_string(),
            busy_timeout_ms: 5000,
            max_add: 500,
            requeue_failed_inputs: false,
            lease_stale_seconds: 21_600,
            overall_seconds: 3600,
            termination_grace_seconds: 10,
            claim_policy: "first_match".to_string(),
            log_filter: "info".to_string(),
            log_json: false,
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "catalog": {
                "path": self.catalog_path,
                "busy_timeout_ms": self.busy_timeout_ms
            },
            "paths": {},
            "scheduler": {
                "max_add": self.max_add,
                "requeue_failed_inputs": self.requeue_failed_inputs,
                "lease_stale_seconds": self.lease_stale_seconds
            },
            "executor": {
                "overall_seconds": self.overall_seconds,
                "termination_grace_seconds": self.termination_grace_seconds,
                "extra_env": []
            },
            "inspection": {
                "claim_policy": self.claim_policy
            },
            "logging": {
                "filter": self.log_filter,
                "json": self.log_json
            }
        })
    }
}
