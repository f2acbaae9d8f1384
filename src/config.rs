//! Gateway configuration
//!
//! Connection identity comes from the environment:
//! - `CONN_HOST` (required) - the SCVMM management host
//! - `CONN_LOGIN` / `CONN_PASSWORD` (optional) - remoting credentials
//! - `SCVMM_GATEWAY_SETTINGS` (optional) - path of the YAML settings file
//!
//! Everything else lives in the settings file. A missing or unreadable file
//! falls back to defaults; the reasons are collected in `Config::warnings`
//! so they can be logged once tracing is up.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::command::{CommandKind, DispatcherConfig};
use crate::session::{PoolConfig, PwshOptions};

pub const HOST_ENV: &str = "CONN_HOST";
pub const LOGIN_ENV: &str = "CONN_LOGIN";
pub const PASSWORD_ENV: &str = "CONN_PASSWORD";
pub const SETTINGS_ENV: &str = "SCVMM_GATEWAY_SETTINGS";
pub const DEFAULT_SETTINGS_PATH: &str = "settings.yml";

/// Fatal configuration problems
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("CONN_HOST not specified")]
    MissingHost,
}

/// Remoting connection settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionSettings {
    pub port: Option<u16>,
    pub ssl: bool,
    pub auth: Option<String>,
    pub connection_timeout_secs: u64,
    pub operation_timeout_secs: u64,
    pub program: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: None,
            ssl: false,
            auth: None,
            connection_timeout_secs: 30,
            operation_timeout_secs: 20,
            program: "pwsh".to_string(),
        }
    }
}

/// Session pool settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    pub min_sessions: usize,
    pub max_sessions: usize,
    pub idle_timeout_secs: Option<u64>,
    pub supervise_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_sessions: 1,
            max_sessions: 1,
            idle_timeout_secs: None,
            supervise_interval_secs: 5,
        }
    }
}

/// Script file per command kind
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScriptPaths {
    pub list: PathBuf,
    pub start: PathBuf,
    pub save: PathBuf,
    pub shutdown: PathBuf,
    pub poweroff: PathBuf,
}

impl Default for ScriptPaths {
    fn default() -> Self {
        let script = |kind: CommandKind| PathBuf::from(format!("scripts/{}.ps1", kind.as_str()));
        Self {
            list: script(CommandKind::List),
            start: script(CommandKind::Start),
            save: script(CommandKind::Save),
            shutdown: script(CommandKind::Shutdown),
            poweroff: script(CommandKind::PowerOff),
        }
    }
}

impl ScriptPaths {
    pub fn path(&self, kind: CommandKind) -> &Path {
        match kind {
            CommandKind::List => &self.list,
            CommandKind::Start => &self.start,
            CommandKind::Save => &self.save,
            CommandKind::Shutdown => &self.shutdown,
            CommandKind::PowerOff => &self.poweroff,
        }
    }

    pub fn entries(&self) -> Vec<(CommandKind, PathBuf)> {
        CommandKind::ALL
            .iter()
            .map(|&kind| (kind, self.path(kind).to_path_buf()))
            .collect()
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    pub bind: String,
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5555".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSettings {
    pub json: bool,
    pub otlp_endpoint: Option<String>,
}

/// Contents of the YAML settings file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub connection: ConnectionSettings,
    pub pool: PoolSettings,
    pub scripts: ScriptPaths,
    pub server: ServerSettings,
    pub log: LogSettings,
}

impl Settings {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document deserializes as unit, not as an empty mapping.
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    /// Read the settings file, falling back to defaults with a warning
    pub fn load(path: &Path, warnings: &mut Vec<String>) -> Self {
        let parsed = std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|text| Self::from_yaml(&text).map_err(|e| e.to_string()));

        match parsed {
            Ok(settings) => settings,
            Err(e) => {
                warnings.push(format!(
                    "cannot load {}: {}; default settings will be applied",
                    path.display(),
                    e
                ));
                Self::default()
            }
        }
    }
}

/// Remoting credentials
#[derive(Clone, Default, PartialEq)]
pub struct Credentials {
    pub login: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Fully resolved gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub credentials: Credentials,
    pub settings: Settings,
    /// Non-fatal problems found while loading
    pub warnings: Vec<String>,
}

impl Config {
    /// Load from the process environment and the settings file it points at
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.is_empty());
        let mut warnings = Vec::new();

        let settings_path =
            lookup(SETTINGS_ENV).unwrap_or_else(|| DEFAULT_SETTINGS_PATH.to_string());
        let settings = Settings::load(Path::new(&settings_path), &mut warnings);

        let host = lookup(HOST_ENV).ok_or(ConfigError::MissingHost)?;

        let mut optional = |key: &str| {
            let value = lookup(key);
            if value.is_none() {
                warnings.push(format!("{key} not found in environment, no value will be used"));
            }
            value
        };
        let credentials = Credentials {
            login: optional(LOGIN_ENV),
            password: optional(PASSWORD_ENV),
        };

        Ok(Self {
            host,
            credentials,
            settings,
            warnings,
        })
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_sessions: self.settings.pool.min_sessions,
            max_sessions: self.settings.pool.max_sessions,
            idle_timeout: self.settings.pool.idle_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn supervise_interval(&self) -> Duration {
        Duration::from_secs(self.settings.pool.supervise_interval_secs.max(1))
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            request_timeout: Duration::from_secs(self.settings.server.request_timeout_secs),
            operation_timeout: Duration::from_secs(self.settings.connection.operation_timeout_secs),
        }
    }

    pub fn pwsh_options(&self) -> PwshOptions {
        let connection = &self.settings.connection;
        PwshOptions {
            program: connection.program.clone(),
            host: self.host.clone(),
            username: self.credentials.login.clone(),
            password: self.credentials.password.clone(),
            port: connection.port,
            use_ssl: connection.ssl,
            authentication: connection.auth.clone(),
            connect_timeout: Duration::from_secs(connection.connection_timeout_secs),
        }
    }
}
