use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use tasklaunch_core::{
    DEFAULT_CLEANUP_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_LOG_EVENTS,
    DEFAULT_REGISTRATION_ATTEMPTS, DEFAULT_REGISTRATION_TIMEOUT, DEFAULT_SHELL,
    DEFAULT_STREAM_JOIN_TIMEOUT, WORKER_BINARY,
};

/// Source of configuration for debugging and precedence tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Default configuration
    Default,
    /// Configuration file
    ConfigFile(PathBuf),
    /// Environment variable
    EnvironmentVariable(String),
    /// Set programmatically through the builder
    Explicit,
}

/// Settings for the dedicated worker process of forked tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker binary, defaults to `tasklaunch-worker` next to the current executable
    pub program: Option<PathBuf>,
    /// How many times the registration wait is retried
    pub registration_attempts: u32,
    /// Wait per registration attempt
    #[serde(with = "duration_ms", rename = "registration_timeout_ms")]
    pub registration_timeout: Duration,
    /// Bound on reading the registration line of a fresh connection
    #[serde(with = "duration_ms", rename = "handshake_timeout_ms")]
    pub handshake_timeout: Duration,
    /// Bound on joining the output drains of a finished worker
    #[serde(with = "duration_ms", rename = "stream_join_timeout_ms")]
    pub stream_join_timeout: Duration,
    /// Bound on asking a worker to shut its nodes down
    #[serde(with = "duration_ms", rename = "cleanup_timeout_ms")]
    pub cleanup_timeout: Duration,
    /// Where registration sockets are created, defaults to the temp dir
    pub socket_dir: Option<PathBuf>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            program: None,
            registration_attempts: DEFAULT_REGISTRATION_ATTEMPTS,
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            stream_join_timeout: DEFAULT_STREAM_JOIN_TIMEOUT,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
            socket_dir: None,
        }
    }
}

impl WorkerSettings {
    /// Worker binary to spawn when a fork environment names none
    #[must_use]
    pub fn resolve_program(&self) -> PathBuf {
        if let Some(program) = &self.program {
            return program.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BINARY)))
            .filter(|candidate| candidate.exists())
            .unwrap_or_else(|| PathBuf::from(WORKER_BINARY))
    }

    #[must_use]
    pub fn resolve_socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Upper bound on the whole registration wait
    #[must_use]
    pub fn registration_budget(&self) -> Duration {
        self.registration_timeout
            .checked_mul(self.registration_attempts)
            .unwrap_or(Duration::MAX)
    }
}

/// Configuration shared by every launcher variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Oldest log lines are dropped beyond this many per task
    pub max_log_events: usize,
    /// When set, each task log is mirrored to `<log_dir>/<task id>.log`
    pub log_dir: Option<PathBuf>,
    /// Interpreter used to run scripts
    pub shell: String,
    pub worker: WorkerSettings,
    #[serde(skip, default = "default_source")]
    pub source: ConfigSource,
}

fn default_source() -> ConfigSource {
    ConfigSource::Default
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            max_log_events: DEFAULT_MAX_LOG_EVENTS,
            log_dir: None,
            shell: DEFAULT_SHELL.to_string(),
            worker: WorkerSettings::default(),
            source: ConfigSource::Default,
        }
    }
}

impl LauncherConfig {
    #[must_use]
    pub fn builder() -> LauncherConfigBuilder {
        LauncherConfigBuilder::new()
    }
}

/// Builder for creating launcher configurations
#[derive(Debug, Clone)]
pub struct LauncherConfigBuilder {
    config: LauncherConfig,
}

impl LauncherConfigBuilder {
    /// Create a new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: LauncherConfig::default(),
        }
    }

    /// Start from an already loaded configuration
    #[must_use]
    pub fn from_config(config: LauncherConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn with_max_log_events(mut self, max: usize) -> Self {
        self.config.max_log_events = max;
        self.config.source = ConfigSource::Explicit;
        self
    }

    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = Some(dir.into());
        self.config.source = ConfigSource::Explicit;
        self
    }

    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.config.shell = shell.into();
        self.config.source = ConfigSource::Explicit;
        self
    }

    #[must_use]
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.config.worker.program = Some(program.into());
        self.config.source = ConfigSource::Explicit;
        self
    }

    /// Set the registration retry budget
    #[must_use]
    pub fn with_registration(mut self, attempts: u32, timeout: Duration) -> Self {
        self.config.worker.registration_attempts = attempts;
        self.config.worker.registration_timeout = timeout;
        self.config.source = ConfigSource::Explicit;
        self
    }

    #[must_use]
    pub fn with_stream_join_timeout(mut self, timeout: Duration) -> Self {
        self.config.worker.stream_join_timeout = timeout;
        self.config.source = ConfigSource::Explicit;
        self
    }

    #[must_use]
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.config.worker.cleanup_timeout = timeout;
        self.config.source = ConfigSource::Explicit;
        self
    }

    #[must_use]
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.worker.socket_dir = Some(dir.into());
        self.config.source = ConfigSource::Explicit;
        self
    }

    /// Build the configuration
    #[must_use]
    pub fn build(self) -> LauncherConfig {
        self.config
    }
}

impl Default for LauncherConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_handshake_constants() {
        let config = LauncherConfig::default();
        assert_eq!(config.worker.registration_attempts, 10);
        assert_eq!(config.worker.registration_timeout, Duration::from_secs(2));
        assert_eq!(config.worker.registration_budget(), Duration::from_secs(20));

        let huge = WorkerSettings {
            registration_attempts: u32::MAX,
            registration_timeout: Duration::MAX,
            ..WorkerSettings::default()
        };
        assert_eq!(huge.registration_budget(), Duration::MAX);
        assert_eq!(config.shell, "sh");
        assert_eq!(config.source, ConfigSource::Default);
    }

    #[test]
    fn builder_marks_explicit_source() {
        let config = LauncherConfig::builder()
            .with_registration(3, Duration::from_millis(100))
            .with_shell("bash")
            .build();
        assert_eq!(config.worker.registration_attempts, 3);
        assert_eq!(config.shell, "bash");
        assert_eq!(config.source, ConfigSource::Explicit);
    }

    #[test]
    fn explicit_program_wins() {
        let settings = WorkerSettings {
            program: Some(PathBuf::from("/opt/worker")),
            ..WorkerSettings::default()
        };
        assert_eq!(settings.resolve_program(), PathBuf::from("/opt/worker"));
    }

    #[test]
    fn durations_serialize_as_millis() {
        let json = serde_json::to_value(WorkerSettings::default()).unwrap();
        assert_eq!(json["registration_timeout_ms"], 2000);
        let back: WorkerSettings =
            serde_json::from_value(serde_json::json!({"registration_timeout_ms": 250})).unwrap();
        assert_eq!(back.registration_timeout, Duration::from_millis(250));
        assert_eq!(back.registration_attempts, 10);
    }
}
