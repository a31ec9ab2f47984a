/*
   Polar (OSS)

   Copyright 2024 Carnegie Mellon University.

   NO WARRANTY. THIS CARNEGIE MELLON UNIVERSITY AND SOFTWARE ENGINEERING INSTITUTE MATERIAL IS
   FURNISHED ON AN "AS-IS" BASIS. CARNEGIE MELLON UNIVERSITY MAKES NO WARRANTIES OF ANY KIND,
   EITHER EXPRESSED OR IMPLIED, AS TO ANY MATTER INCLUDING, BUT NOT LIMITED TO, WARRANTY OF FITNESS
   FOR PURPOSE OR MERCHANTABILITY, EXCLUSIVITY, OR RESULTS OBTAINED FROM USE OF THE MATERIAL.
   CARNEGIE MELLON UNIVERSITY DOES NOT MAKE ANY WARRANTY OF ANY KIND WITH RESPECT TO FREEDOM FROM
   PATENT, TRADEMARK, OR COPYRIGHT INFRINGEMENT.

   Licensed under a MIT-style license, please see license.txt or contact permission@sei.cmu.edu for
   full terms.

   [DISTRIBUTION STATEMENT A] This material has been approved for public release and unlimited
   distribution.  Please see Copyright notice for non-US Government use and distribution.

   This Software includes and/or makes use of Third-Party Software each subject to its own license.

   DM24-0470
*/

//! Monitor configuration.
//!
//! A [`Config`] is built exactly once per process. The supervisor builds it from its own
//! environment and hands it to the producer as a JSON payload in [`crate::CONFIG_ENV_VAR`];
//! the producer rebuilds the identical value from that payload. Neither side mutates it
//! afterwards, so it is shared as `Arc<Config>`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::{mask, CONFIG_ENV_VAR, MASK_SENTINEL};

pub const HOST_ENV_VAR: &str = "VIGIL_HOST";
pub const PORT_ENV_VAR: &str = "VIGIL_PORT";
pub const RELOAD_ENV_VAR: &str = "VIGIL_RELOAD";
pub const EXCEPTIONS_ENV_VAR: &str = "VIGIL_EXCEPTIONS";
pub const REQUEST_LOGGING_ENV_VAR: &str = "VIGIL_REQUEST_LOGGING";
pub const LOG_LEVEL_ENV_VAR: &str = "VIGIL_LOG_LEVEL";
pub const DB_PATH_ENV_VAR: &str = "VIGIL_DB_PATH";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for environment variable {var}: {reason}")]
    EnvVar { var: &'static str, reason: String },
    #[error("malformed configuration payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Verbosity of the monitor's own logging and the minimum level forwarded from the
/// producer's tracing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// `EnvFilter` directive for this level. tracing has no level above `error`, so
    /// `critical` collapses onto it.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }

    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error | LogLevel::Critical => tracing::Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            other => Err(format!("unknown log level \"{other}\"")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub reload: bool,
    pub reload_dirs: Vec<PathBuf>,

    pub enable_exceptions: bool,
    pub enable_request_logging: bool,
    pub enable_response_body: bool,
    pub enable_runtime_logs: bool,
    pub enable_stats: bool,
    pub enable_persistence: bool,

    pub log_level: LogLevel,
    pub log_to_file: bool,
    pub log_file_path: PathBuf,

    /// Hits kept in memory per endpoint before the oldest is evicted.
    pub max_hits_display: usize,
    /// Log lines and exceptions kept in memory by the consumer.
    pub max_log_lines: usize,

    /// Raw request paths that are never observed. Matching is exact.
    pub exclude_paths: BTreeSet<String>,
    /// Upper-case HTTP methods that are never observed.
    pub exclude_methods: BTreeSet<String>,
    /// Lower-case header names replaced by [`MASK_SENTINEL`].
    pub mask_headers: BTreeSet<String>,
    /// Lower-case body field and variable names replaced by [`MASK_SENTINEL`].
    pub mask_body_fields: BTreeSet<String>,

    pub db_path: PathBuf,
}

fn string_set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".to_string(),
            port: 8000,
            reload: false,
            reload_dirs: vec![PathBuf::from("app")],
            enable_exceptions: true,
            enable_request_logging: true,
            enable_response_body: true,
            enable_runtime_logs: true,
            enable_stats: true,
            enable_persistence: true,
            log_level: LogLevel::Info,
            log_to_file: false,
            log_file_path: PathBuf::from("vigil.log"),
            max_hits_display: 100,
            max_log_lines: 1000,
            exclude_paths: string_set(&["/health", "/healthz", "/ready", "/metrics", "/favicon.ico"]),
            exclude_methods: BTreeSet::new(),
            mask_headers: string_set(&["authorization", "x-api-key", "cookie", "set-cookie"]),
            mask_body_fields: string_set(&[
                "password",
                "secret",
                "token",
                "api_key",
                "apikey",
                "access_token",
                "refresh_token",
            ]),
            db_path: PathBuf::from("vigil_events.db"),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

impl Config {
    /// Builds the configuration for this process.
    ///
    /// A payload in `VIGIL_CONFIG` wins outright; it is how a producer spawned by the
    /// supervisor inherits the exact same value. Otherwise the defaults are overlaid with the
    /// individual `VIGIL_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(payload) = std::env::var(CONFIG_ENV_VAR) {
            return Config::from_payload(&payload);
        }

        let mut config = Config::default();

        if let Ok(host) = std::env::var(HOST_ENV_VAR) {
            config.host = host;
        }
        if let Ok(port) = std::env::var(PORT_ENV_VAR) {
            config.port = port.parse().map_err(|e| ConfigError::EnvVar {
                var: PORT_ENV_VAR,
                reason: format!("{e}"),
            })?;
        }
        if let Ok(v) = std::env::var(RELOAD_ENV_VAR) {
            config.reload = is_truthy(&v);
        }
        if let Ok(v) = std::env::var(EXCEPTIONS_ENV_VAR) {
            config.enable_exceptions = is_truthy(&v);
        }
        if let Ok(v) = std::env::var(REQUEST_LOGGING_ENV_VAR) {
            config.enable_request_logging = is_truthy(&v);
        }
        if let Ok(level) = std::env::var(LOG_LEVEL_ENV_VAR) {
            config.log_level = level
                .parse()
                .map_err(|reason| ConfigError::EnvVar { var: LOG_LEVEL_ENV_VAR, reason })?;
        }
        if let Ok(path) = std::env::var(DB_PATH_ENV_VAR) {
            config.db_path = PathBuf::from(path);
        }

        Ok(config)
    }

    pub fn to_payload(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Whether a request should be captured at all. Runs before any other capture work.
    pub fn should_log_request(&self, path: &str, method: &str) -> bool {
        if self.exclude_paths.contains(path) {
            return false;
        }
        if !self.exclude_methods.is_empty() && self.exclude_methods.contains(&method.to_ascii_uppercase()) {
            return false;
        }
        self.enable_request_logging
    }

    pub fn is_masked(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.mask_headers.contains(&key) || self.mask_body_fields.contains(&key)
    }

    pub fn mask_value(&self, key: &str, value: Value) -> Value {
        if self.is_masked(key) {
            Value::String(MASK_SENTINEL.to_string())
        } else {
            value
        }
    }

    /// Masks every object key in `value` that is configured as sensitive, at any depth.
    pub fn mask_json(&self, value: &mut Value) {
        mask::mask_in_place(value, &|key| self.is_masked(key));
    }
}
