//! Harness configuration -- `bsh.toml` parsing and runtime settings.
//!
//! [`HarnessConfig`] holds the settings of both harness variants. It is not
//! the configuration of the service under test (see
//! [`service_config`](crate::service_config)).
//!
//! # Loading precedence
//! 1. CLI arguments (highest)
//! 2. Environment variables (`BSH_LOCAL_SERVICE_BINARY=/opt/bin/server`)
//! 3. Config file (`bsh.toml`)
//! 4. Defaults (`Default` impls)
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), bsh_core::error::HarnessError> {
//! use bsh_core::config::HarnessConfig;
//!
//! let config = HarnessConfig::load("bsh.toml").await?;
//! let config = HarnessConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, HarnessError};

/// Top-level `bsh.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl HarnessConfig {
    /// Load from a TOML file, apply environment overrides, validate.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file without environment overrides.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HarnessError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                HarnessError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(toml_str: &str) -> Result<Self, HarnessError> {
        toml::from_str(toml_str).map_err(|e| {
            HarnessError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// Environment overrides, named `BSH_{SECTION}_{FIELD}`.
    pub fn apply_env_overrides(&mut self) {
        override_string(&mut self.general.log_level, "BSH_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "BSH_GENERAL_LOG_FORMAT");

        override_path(&mut self.local.service_binary, "BSH_LOCAL_SERVICE_BINARY");
        override_path(&mut self.local.scenario_binary, "BSH_LOCAL_SCENARIO_BINARY");
        override_path(&mut self.local.scenario_root, "BSH_LOCAL_SCENARIO_ROOT");
        override_string(&mut self.local.bind_host, "BSH_LOCAL_BIND_HOST");
        override_csv(&mut self.local.service_args, "BSH_LOCAL_SERVICE_ARGS");
        override_bool(
            &mut self.local.use_in_memory_disks,
            "BSH_LOCAL_USE_IN_MEMORY_DISKS",
        );
        override_u64(&mut self.local.disk_size_mb, "BSH_LOCAL_DISK_SIZE_MB");
        override_string(&mut self.local.artifacts_dir, "BSH_LOCAL_ARTIFACTS_DIR");
        override_u64(
            &mut self.local.startup_timeout_secs,
            "BSH_LOCAL_STARTUP_TIMEOUT_SECS",
        );
        override_u64(
            &mut self.local.readiness_poll_ms,
            "BSH_LOCAL_READINESS_POLL_MS",
        );
        override_u64(
            &mut self.local.shutdown_grace_secs,
            "BSH_LOCAL_SHUTDOWN_GRACE_SECS",
        );
        override_u64(
            &mut self.local.scenario_timeout_secs,
            "BSH_LOCAL_SCENARIO_TIMEOUT_SECS",
        );

        override_string(&mut self.remote.host, "BSH_REMOTE_HOST");
        override_string(&mut self.remote.user, "BSH_REMOTE_USER");
        override_u16(&mut self.remote.ssh_port, "BSH_REMOTE_SSH_PORT");
        override_string(&mut self.remote.identity_file, "BSH_REMOTE_IDENTITY_FILE");
        override_string(&mut self.remote.remote_root, "BSH_REMOTE_REMOTE_ROOT");
        override_u16(&mut self.remote.service_port, "BSH_REMOTE_SERVICE_PORT");
        override_u16(
            &mut self.remote.monitoring_port,
            "BSH_REMOTE_MONITORING_PORT",
        );
        override_string(
            &mut self.remote.service_command,
            "BSH_REMOTE_SERVICE_COMMAND",
        );
        override_string(&mut self.remote.probe_command, "BSH_REMOTE_PROBE_COMMAND");
        override_string(&mut self.remote.stop_command, "BSH_REMOTE_STOP_COMMAND");
        override_string(
            &mut self.remote.scenario_command,
            "BSH_REMOTE_SCENARIO_COMMAND",
        );
        override_string(
            &mut self.remote.min_server_version,
            "BSH_REMOTE_MIN_SERVER_VERSION",
        );
        override_u64(
            &mut self.remote.startup_timeout_secs,
            "BSH_REMOTE_STARTUP_TIMEOUT_SECS",
        );
        override_u64(
            &mut self.remote.readiness_poll_ms,
            "BSH_REMOTE_READINESS_POLL_MS",
        );
        override_u64(
            &mut self.remote.shutdown_grace_secs,
            "BSH_REMOTE_SHUTDOWN_GRACE_SECS",
        );
    }

    /// Validate settings shared by every command. Remote settings are only
    /// checked by [`RemoteConfig::validate`] when a remote run is requested.
    pub fn validate(&self) -> Result<(), HarnessError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        self.local.validate()
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> HarnessError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.into(),
    }
    .into()
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// trace, debug, info, warn, error
    pub log_level: String,
    /// json, pretty
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
        }
    }
}

/// Local harness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Service binary to supervise.
    pub service_binary: PathBuf,
    /// Scenario interpreter binary.
    pub scenario_binary: PathBuf,
    /// Root that built-in scenario descriptors are resolved against.
    pub scenario_root: PathBuf,
    /// Host the service binds and the scenario connects to.
    pub bind_host: String,
    /// Extra arguments appended to the service command line.
    pub service_args: Vec<String>,
    pub use_in_memory_disks: bool,
    /// Size of the disk backing, in MiB.
    pub disk_size_mb: u64,
    /// Where run directories are kept. Empty: system temp, removed on release.
    pub artifacts_dir: String,
    pub startup_timeout_secs: u64,
    pub readiness_poll_ms: u64,
    pub shutdown_grace_secs: u64,
    /// 0 means the scenario may run as long as it likes.
    pub scenario_timeout_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            service_binary: PathBuf::from("blockstore-server"),
            scenario_binary: PathBuf::from("blockstore-loadtest"),
            scenario_root: PathBuf::from("."),
            bind_host: "127.0.0.1".to_owned(),
            service_args: Vec::new(),
            use_in_memory_disks: true,
            disk_size_mb: 1024,
            artifacts_dir: String::new(),
            startup_timeout_secs: 60,
            readiness_poll_ms: 100,
            shutdown_grace_secs: 10,
            scenario_timeout_secs: 0,
        }
    }
}

impl LocalConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn scenario_timeout(&self) -> Option<Duration> {
        (self.scenario_timeout_secs > 0).then(|| Duration::from_secs(self.scenario_timeout_secs))
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.service_binary.as_os_str().is_empty() {
            return Err(invalid("local.service_binary", "must not be empty"));
        }
        if self.scenario_binary.as_os_str().is_empty() {
            return Err(invalid("local.scenario_binary", "must not be empty"));
        }
        if self.bind_host.is_empty() {
            return Err(invalid("local.bind_host", "must not be empty"));
        }
        if self.startup_timeout_secs == 0 {
            return Err(invalid("local.startup_timeout_secs", "must be greater than 0"));
        }
        if self.readiness_poll_ms == 0 {
            return Err(invalid("local.readiness_poll_ms", "must be greater than 0"));
        }
        if self.disk_size_mb == 0 {
            return Err(invalid("local.disk_size_mb", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Remote validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    /// Empty: ssh picks the user.
    pub user: String,
    pub ssh_port: u16,
    /// Empty: ssh agent / default identities.
    pub identity_file: String,
    /// Parent of the per-run directories on the remote host.
    pub remote_root: String,
    /// Client port of the deployed service.
    pub service_port: u16,
    /// Monitoring port of the deployed service.
    pub monitoring_port: u16,
    /// Command launching the service; receives `--config` and `--log-file`.
    pub service_command: String,
    /// Readiness probe; exit status 0 means ready. Empty: `test -s <log>`.
    pub probe_command: String,
    /// Graceful stop command. Empty: SIGTERM to processes started from the run dir.
    pub stop_command: String,
    /// Validation scenario command.
    pub scenario_command: String,
    /// Oldest deployed server version accepted. Empty: no gating.
    pub min_server_version: String,
    pub startup_timeout_secs: u64,
    pub readiness_poll_ms: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: String::new(),
            ssh_port: 22,
            identity_file: String::new(),
            remote_root: "/tmp/bsh".to_owned(),
            service_port: 9766,
            monitoring_port: 8766,
            service_command: "blockstore-server".to_owned(),
            probe_command: String::new(),
            stop_command: String::new(),
            scenario_command: "blockstore-checkpoint-validation".to_owned(),
            min_server_version: String::new(),
            startup_timeout_secs: 120,
            readiness_poll_ms: 1000,
            shutdown_grace_secs: 30,
        }
    }
}

impl RemoteConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.host.is_empty() {
            return Err(invalid("remote.host", "must not be empty for remote runs"));
        }
        if self.ssh_port == 0 {
            return Err(invalid("remote.ssh_port", "must be greater than 0"));
        }
        if self.service_port == 0 || self.monitoring_port == 0 {
            return Err(invalid(
                "remote.service_port",
                "service and monitoring ports must be greater than 0",
            ));
        }
        let version = self.min_server_version.as_str();
        if !version.is_empty()
            && (version.split('.').count() != 3
                || !version
                    .split('.')
                    .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit())))
        {
            return Err(invalid(
                "remote.min_server_version",
                "must look like MAJOR.MINOR.PATCH",
            ));
        }
        if self.remote_root.is_empty() || !self.remote_root.starts_with('/') {
            return Err(invalid("remote.remote_root", "must be an absolute path"));
        }
        if self.service_command.is_empty() {
            return Err(invalid("remote.service_command", "must not be empty"));
        }
        if self.scenario_command.is_empty() {
            return Err(invalid("remote.scenario_command", "must not be empty"));
        }
        if self.startup_timeout_secs == 0 {
            return Err(invalid("remote.startup_timeout_secs", "must be greater than 0"));
        }
        if self.readiness_poll_ms == 0 {
            return Err(invalid("remote.readiness_poll_ms", "must be greater than 0"));
        }
        Ok(())
    }
}

// --- env override helpers ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_path(target: &mut PathBuf, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = PathBuf::from(val);
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_u16(target: &mut u16, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u16>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u16 from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}

fn override_csv(target: &mut Vec<String>, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn default_config_has_sane_values() {
        let config = HarnessConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.log_format, "json");
        assert_eq!(config.local.bind_host, "127.0.0.1");
        assert!(config.local.use_in_memory_disks);
        assert_eq!(config.local.scenario_timeout(), None);
        assert_eq!(config.remote.ssh_port, 22);
    }

    #[test]
    fn default_config_passes_validation() {
        HarnessConfig::default().validate().unwrap();
    }

    #[test]
    fn default_remote_config_requires_host() {
        let err = RemoteConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("remote.host"));
    }

    #[test]
    fn parse_empty_toml_uses_defaults() {
        let config = HarnessConfig::parse("").unwrap();
        assert_eq!(config.local.startup_timeout_secs, 60);
        assert_eq!(config.remote.remote_root, "/tmp/bsh");
    }

    #[test]
    fn parse_partial_toml_merges_with_defaults() {
        let toml = r#"
[local]
service_binary = "/opt/nbs/bin/server"
startup_timeout_secs = 5

[remote]
host = "validation-01"
"#;
        let config = HarnessConfig::parse(toml).unwrap();
        assert_eq!(config.local.service_binary, PathBuf::from("/opt/nbs/bin/server"));
        assert_eq!(config.local.startup_timeout(), Duration::from_secs(5));
        // untouched fields keep their defaults
        assert_eq!(config.local.readiness_poll_ms, 100);
        assert_eq!(config.remote.host, "validation-01");
        config.remote.validate().unwrap();
    }

    #[test]
    fn parse_invalid_toml_returns_error() {
        let err = HarnessConfig::parse("invalid = [[[toml").unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Config(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn validate_rejects_invalid_log_level() {
        let mut config = HarnessConfig::default();
        config.general.log_level = "verbose".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn validate_rejects_zero_startup_timeout() {
        let mut config = HarnessConfig::default();
        config.local.startup_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("startup_timeout_secs"));
    }

    #[test]
    fn remote_validate_rejects_relative_root() {
        let config = RemoteConfig {
            host: "h".to_owned(),
            remote_root: "tmp/bsh".to_owned(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("remote_root"));
    }

    #[test]
    fn remote_validate_checks_min_version_shape() {
        let mut config = RemoteConfig {
            host: "h".to_owned(),
            min_server_version: "1.2".to_owned(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.min_server_version = "1.2.3".to_owned();
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn env_overrides_apply_per_section() {
        // SAFETY: serialized test, no other thread reads the environment.
        unsafe {
            std::env::set_var("BSH_LOCAL_SERVICE_ARGS", "--verbose, --trace-io");
            std::env::set_var("BSH_REMOTE_SSH_PORT", "2222");
            std::env::set_var("BSH_LOCAL_USE_IN_MEMORY_DISKS", "not-a-bool");
        }
        let mut config = HarnessConfig::default();
        config.apply_env_overrides();
        unsafe {
            std::env::remove_var("BSH_LOCAL_SERVICE_ARGS");
            std::env::remove_var("BSH_REMOTE_SSH_PORT");
            std::env::remove_var("BSH_LOCAL_USE_IN_MEMORY_DISKS");
        }

        assert_eq!(config.local.service_args, vec!["--verbose", "--trace-io"]);
        assert_eq!(config.remote.ssh_port, 2222);
        // unparseable value keeps the original
        assert!(config.local.use_in_memory_disks);
    }

    #[test]
    fn env_override_missing_var_keeps_original() {
        let mut val = "original".to_owned();
        override_string(&mut val, "BSH_TEST_NONEXISTENT_12345");
        assert_eq!(val, "original");
    }

    #[test]
    fn config_serialize_roundtrip() {
        let config = HarnessConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = HarnessConfig::parse(&toml_str).unwrap();
        assert_eq!(config.local.service_binary, parsed.local.service_binary);
        assert_eq!(config.remote.scenario_command, parsed.remote.scenario_command);
    }

    #[tokio::test]
    async fn from_file_not_found() {
        let err = HarnessConfig::from_file("/nonexistent/path/bsh.toml")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Config(ConfigError::FileNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn from_file_reads_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bsh.toml");
        std::fs::write(&path, "[general]\nlog_format = \"pretty\"\n").unwrap();
        let config = HarnessConfig::from_file(&path).await.unwrap();
        assert_eq!(config.general.log_format, "pretty");
    }
}
