//! Configuration loading with precedence: defaults, config file, environment
use std::path::{Path, PathBuf};
use std::time::Duration;

use tasklaunch_core::{Error, Result, ResultExt};

use crate::settings::{ConfigSource, LauncherConfig};

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "TASKLAUNCH_";

/// Points at an explicit config file, bypassing the XDG lookup
pub const CONFIG_PATH_VAR: &str = "TASKLAUNCH_CONFIG";

/// Configuration loader that handles precedence
pub struct LauncherConfigLoader;

impl LauncherConfigLoader {
    /// Load configuration with full precedence handling
    pub fn load() -> Result<LauncherConfig> {
        let mut config = match Self::config_file_path() {
            Some(path) if path.exists() => Self::load_from_file(&path)?,
            _ => LauncherConfig::default(),
        };
        Self::apply_env(&mut config)?;
        Ok(config)
    }

    /// Load a specific config file on top of the defaults
    pub fn load_from_file(path: &Path) -> Result<LauncherConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::file_system(path, "read config file", e))?;
        let mut config: LauncherConfig = serde_json::from_str(&content)
            .with_context(|| format!("invalid config file '{}'", path.display()))?;
        config.source = ConfigSource::ConfigFile(path.to_path_buf());
        tracing::debug!(path = %path.display(), "loaded launcher config file");
        Ok(config)
    }

    /// Override fields from `TASKLAUNCH_*` environment variables
    pub fn apply_env(config: &mut LauncherConfig) -> Result<()> {
        let mut applied = Vec::new();

        if let Some(value) = Self::var("MAX_LOG_EVENTS") {
            config.max_log_events = Self::parse("MAX_LOG_EVENTS", &value)?;
            applied.push("MAX_LOG_EVENTS");
        }
        if let Some(value) = Self::var("LOG_DIR") {
            config.log_dir = Some(PathBuf::from(value));
            applied.push("LOG_DIR");
        }
        if let Some(value) = Self::var("SHELL") {
            config.shell = value;
            applied.push("SHELL");
        }
        if let Some(value) = Self::var("WORKER_PROGRAM") {
            config.worker.program = Some(PathBuf::from(value));
            applied.push("WORKER_PROGRAM");
        }
        if let Some(value) = Self::var("REGISTRATION_ATTEMPTS") {
            config.worker.registration_attempts = Self::parse("REGISTRATION_ATTEMPTS", &value)?;
            applied.push("REGISTRATION_ATTEMPTS");
        }
        if let Some(value) = Self::var("REGISTRATION_TIMEOUT_MS") {
            config.worker.registration_timeout =
                Duration::from_millis(Self::parse("REGISTRATION_TIMEOUT_MS", &value)?);
            applied.push("REGISTRATION_TIMEOUT_MS");
        }
        if let Some(value) = Self::var("SOCKET_DIR") {
            config.worker.socket_dir = Some(PathBuf::from(value));
            applied.push("SOCKET_DIR");
        }

        if let Some(last) = applied.last() {
            config.source = ConfigSource::EnvironmentVariable(format!("{ENV_PREFIX}{last}"));
            tracing::debug!(overrides = ?applied, "applied environment overrides");
        }
        Ok(())
    }

    /// Get the configuration file path
    fn config_file_path() -> Option<PathBuf> {
        if let Ok(explicit) = std::env::var(CONFIG_PATH_VAR) {
            return Some(PathBuf::from(explicit));
        }
        let config_dir = match std::env::var("XDG_CONFIG_HOME") {
            Ok(xdg_config_home) => PathBuf::from(xdg_config_home),
            Err(_) => dirs::config_dir()?,
        };
        Some(config_dir.join("tasklaunch").join("config.json"))
    }

    fn var(suffix: &str) -> Option<String> {
        std::env::var(format!("{ENV_PREFIX}{suffix}")).ok()
    }

    fn parse<T: std::str::FromStr>(suffix: &str, value: &str) -> Result<T> {
        value.trim().parse().map_err(|_| {
            Error::configuration(format!("{ENV_PREFIX}{suffix} has an invalid value '{value}'"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    const VARS: &[&str] = &[
        "TASKLAUNCH_CONFIG",
        "TASKLAUNCH_MAX_LOG_EVENTS",
        "TASKLAUNCH_SHELL",
        "TASKLAUNCH_REGISTRATION_ATTEMPTS",
        "TASKLAUNCH_REGISTRATION_TIMEOUT_MS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn file_overrides_defaults_and_env_overrides_file() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"shell": "bash", "worker": {"registration_attempts": 4}}"#,
        )
        .unwrap();
        std::env::set_var("TASKLAUNCH_CONFIG", &path);

        let config = LauncherConfigLoader::load().unwrap();
        assert_eq!(config.shell, "bash");
        assert_eq!(config.worker.registration_attempts, 4);
        assert_eq!(config.max_log_events, 10_000);
        assert_eq!(config.source, ConfigSource::ConfigFile(path.clone()));

        std::env::set_var("TASKLAUNCH_REGISTRATION_ATTEMPTS", "7");
        std::env::set_var("TASKLAUNCH_REGISTRATION_TIMEOUT_MS", "150");
        let config = LauncherConfigLoader::load().unwrap();
        assert_eq!(config.shell, "bash");
        assert_eq!(config.worker.registration_attempts, 7);
        assert_eq!(config.worker.registration_timeout, Duration::from_millis(150));
        assert!(matches!(config.source, ConfigSource::EnvironmentVariable(_)));

        clear_env();
    }

    #[test]
    #[serial]
    fn invalid_env_value_is_rejected() {
        clear_env();
        let dir = TempDir::new().unwrap();
        std::env::set_var("TASKLAUNCH_CONFIG", dir.path().join("absent.json"));
        std::env::set_var("TASKLAUNCH_MAX_LOG_EVENTS", "lots");

        let err = LauncherConfigLoader::load().unwrap_err();
        assert!(err.to_string().contains("TASKLAUNCH_MAX_LOG_EVENTS"));

        clear_env();
    }

    #[test]
    #[serial]
    fn malformed_file_is_a_configuration_error() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let err = LauncherConfigLoader::load_from_file(&path).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
