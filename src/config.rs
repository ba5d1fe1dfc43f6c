//! Channel configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Suffix appended to `ipc_name` to form the request intake socket name.
pub const INTAKE_SUFFIX: &str = ".intake";

/// File name of the bundled echo service executable.
pub const DEFAULT_SERVICE_BINARY: &str = "tether-echo";

fn default_ipc_name() -> String {
    "tether-echo".into()
}

fn default_startup_timeout_ms() -> u64 {
    5000
}

fn default_connect_retry_ms() -> u64 {
    50
}

/// Configuration shared by the service host and the client transport.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ChannelConfig {
    /// Namespaced local socket name of the service's binding socket.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Program launched when the service is not already running.
    ///
    /// Defaults to the `tether-echo` executable next to the current binary.
    #[serde(default)]
    pub service_program: Option<PathBuf>,
    /// Extra arguments passed to the service program.
    #[serde(default)]
    pub service_args: Vec<String>,
    /// Time allowed for a freshly launched service to open its intake socket.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Poll interval while waiting for the intake socket to appear.
    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ipc_name: default_ipc_name(),
            service_program: None,
            service_args: Vec::new(),
            startup_timeout_ms: default_startup_timeout_ms(),
            connect_retry_ms: default_connect_retry_ms(),
        }
    }
}

impl ChannelConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the socket name, re-validating the result.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the new name is invalid.
    pub fn with_ipc_name(mut self, name: impl Into<String>) -> Result<Self> {
        self.ipc_name = name.into();
        self.validate()?;
        Ok(self)
    }

    /// Startup timeout as a [`Duration`].
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Intake poll interval as a [`Duration`].
    #[must_use]
    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    /// Resolve the program to launch for the service.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no program is configured and the
    /// current executable path cannot be determined.
    pub fn resolve_service_program(&self) -> Result<PathBuf> {
        if let Some(ref program) = self.service_program {
            return Ok(program.clone());
        }

        let current = std::env::current_exe()
            .map_err(|err| AppError::Config(format!("cannot locate current executable: {err}")))?;
        let dir = current
            .parent()
            .ok_or_else(|| AppError::Config("current executable has no parent directory".into()))?;
        Ok(dir.join(format!(
            "{DEFAULT_SERVICE_BINARY}{}",
            std::env::consts::EXE_SUFFIX
        )))
    }

    fn validate(&self) -> Result<()> {
        if self.ipc_name.is_empty() {
            return Err(AppError::Config("ipc_name must not be empty".into()));
        }

        if self
            .ipc_name
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_whitespace())
        {
            return Err(AppError::Config(format!(
                "ipc_name '{}' must not contain path separators or whitespace",
                self.ipc_name
            )));
        }

        if self.startup_timeout_ms == 0 {
            return Err(AppError::Config(
                "startup_timeout_ms must be greater than zero".into(),
            ));
        }

        if self.connect_retry_ms == 0 || self.connect_retry_ms > self.startup_timeout_ms {
            return Err(AppError::Config(
                "connect_retry_ms must be between 1 and startup_timeout_ms".into(),
            ));
        }

        Ok(())
    }
}
