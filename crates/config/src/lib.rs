//! Launcher configuration with defaults, a JSON config file, environment
//! overrides and explicit builder overrides, applied in that order.

mod loader;
mod settings;

pub use loader::{LauncherConfigLoader, CONFIG_PATH_VAR, ENV_PREFIX};
pub use settings::{ConfigSource, LauncherConfig, LauncherConfigBuilder, WorkerSettings};
