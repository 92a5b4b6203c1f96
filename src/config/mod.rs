//! Layered configuration
//!
//! Layers, lowest precedence first:
//! 1. Built-in defaults
//! 2. User config (~/.config/dbflow/config.toml)
//! 3. File passed with `--config`
//! 4. CLI flags

mod defaults;
mod effective;
mod merge;
mod settings;

pub use defaults::BuiltinDefaults;
pub use effective::{default_user_config_path, ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig};
pub use merge::{deep_merge, merge_layers};
pub use settings::{
    CatalogSettings, ExecutorSettings, InspectionSettings, LoggingSettings, PathSettings,
    SchedulerSettings, Settings,
};
