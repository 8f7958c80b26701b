//! pane.toml configuration parser.
//!
//! Values come from three layers, later layers winning: the TOML file, then
//! `PANE_*` environment variables, then whatever the binary applies from its
//! command line. Every field has a default so an empty file is valid.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which state backend the process binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Everything lives in this process.
    Memory,
    /// An external coordination store shared by all workers.
    #[serde(alias = "redis", alias = "shared")]
    SharedExternal,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::SharedExternal => "shared-external",
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, BackendKind::SharedExternal)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "shared-external" | "shared" | "redis" => Ok(BackendKind::SharedExternal),
            other => Err(ConfigError::InvalidValue {
                key: "state.backend".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::InvalidValue {
                key: "server.log_format".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaneConfig {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// State and coordination settings consumed by `pane-state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Multi-worker mode. Implies the shared-external backend unless
    /// `backend` says otherwise.
    pub deploy_mode: bool,
    /// Explicit backend override.
    pub backend: Option<BackendKind>,
    /// Connection string for the shared store (`redis://host:6379/0`).
    pub backend_url: Option<String>,
    /// Prefix applied to every key and channel in the shared store.
    pub key_prefix: String,
    /// Stable worker identity. Generated at startup when absent.
    pub worker_id: Option<String>,
    pub connect_timeout_ms: u64,
    pub op_timeout_ms: u64,
    /// Default widget inactivity TTL. 0 disables expiry.
    pub widget_ttl_secs: u64,
    /// Default session lifetime.
    pub session_ttl_secs: u64,
    /// Lifetime of a route entry between heartbeats.
    pub route_ttl_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            deploy_mode: false,
            backend: None,
            backend_url: None,
            key_prefix: "pane:".to_string(),
            worker_id: None,
            connect_timeout_ms: 5_000,
            op_timeout_ms: 2_000,
            widget_ttl_secs: 0,
            session_ttl_secs: 86_400,
            route_ttl_secs: 30,
            heartbeat_interval_secs: 10,
            sweep_interval_secs: 60,
        }
    }
}

impl StateConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    /// Default widget TTL, `None` when expiry is disabled.
    pub fn widget_ttl(&self) -> Option<Duration> {
        (self.widget_ttl_secs > 0).then(|| Duration::from_secs(self.widget_ttl_secs))
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn route_ttl(&self) -> Duration {
        Duration::from_secs(self.route_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.op_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "backend timeouts must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval_secs == 0 || self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat and sweep intervals must be greater than zero".to_string(),
            ));
        }
        // A route must survive at least one missed heartbeat.
        if self.route_ttl_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "route_ttl_secs ({}) must exceed heartbeat_interval_secs ({})",
                self.route_ttl_secs, self.heartbeat_interval_secs
            )));
        }
        if let Some(id) = &self.worker_id {
            if id.is_empty() || id.contains('|') {
                return Err(ConfigError::InvalidValue {
                    key: "state.worker_id".to_string(),
                    value: id.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Settings for the `paned` daemon surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Outbound frames buffered per socket before new ones are dropped.
    pub send_queue: usize,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            send_queue: 256,
            log_format: LogFormat::Pretty,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_queue == 0 {
            return Err(ConfigError::Invalid(
                "server.send_queue must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl PaneConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.state.validate()?;
        self.server.validate()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from an optional file, then apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PANE_*` overrides from an iterator of variables.
    ///
    /// Unknown variables are ignored; malformed values are an error.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let key = key.as_ref();
            let value = value.as_ref();
            let state = &mut self.state;
            match key {
                "PANE_DEPLOY_MODE" => state.deploy_mode = parse_bool(key, value)?,
                "PANE_STATE_BACKEND" => state.backend = Some(value.parse()?),
                "PANE_BACKEND_URL" | "PANE_REDIS_URL" => {
                    state.backend_url = Some(value.to_string())
                }
                "PANE_KEY_PREFIX" => state.key_prefix = value.to_string(),
                "PANE_WORKER_ID" => state.worker_id = Some(value.to_string()),
                "PANE_CONNECT_TIMEOUT_MS" => state.connect_timeout_ms = parse_num(key, value)?,
                "PANE_OP_TIMEOUT_MS" => state.op_timeout_ms = parse_num(key, value)?,
                "PANE_WIDGET_TTL" => state.widget_ttl_secs = parse_num(key, value)?,
                "PANE_SESSION_TTL" => state.session_ttl_secs = parse_num(key, value)?,
                "PANE_ROUTE_TTL" => state.route_ttl_secs = parse_num(key, value)?,
                "PANE_HEARTBEAT_INTERVAL" => {
                    state.heartbeat_interval_secs = parse_num(key, value)?
                }
                "PANE_SWEEP_INTERVAL" => state.sweep_interval_secs = parse_num(key, value)?,
                "PANE_HOST" => self.server.host = value.to_string(),
                "PANE_PORT" => self.server.port = parse_num(key, value)?,
                "PANE_LOG_FORMAT" => self.server.log_format = value.parse()?,
                _ => {}
            }
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_uses_defaults() {
        let config = PaneConfig::from_toml_str("").unwrap();
        assert!(!config.state.deploy_mode);
        assert_eq!(config.state.key_prefix, "pane:");
        assert_eq!(config.state.widget_ttl(), None);
        assert_eq!(config.server.port, 8765);
        config.state.validate().unwrap();
    }

    #[test]
    fn parse_deploy_section() {
        let toml_str = r#"
[state]
deploy_mode = true
backend = "redis"
backend_url = "redis://cache:6379/2"
widget_ttl_secs = 600

[server]
port = 9000
log_format = "json"
"#;
        let config = PaneConfig::from_toml_str(toml_str).unwrap();
        assert!(config.state.deploy_mode);
        assert_eq!(config.state.backend, Some(BackendKind::SharedExternal));
        assert_eq!(
            config.state.backend_url.as_deref(),
            Some("redis://cache:6379/2")
        );
        assert_eq!(config.state.widget_ttl(), Some(Duration::from_secs(600)));
        assert_eq!(config.server.log_format, LogFormat::Json);
    }

    #[test]
    fn from_file_reads_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[state]\nworker_id = \"worker-a\"").unwrap();
        let config = PaneConfig::from_file(file.path()).unwrap();
        assert_eq!(config.state.worker_id.as_deref(), Some("worker-a"));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = PaneConfig::from_file(Path::new("/nonexistent/pane.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = PaneConfig::default();
        config
            .apply_env([
                ("PANE_DEPLOY_MODE", "yes"),
                ("PANE_REDIS_URL", "redis://localhost:6379"),
                ("PANE_ROUTE_TTL", "45"),
                ("PANE_PORT", "9100"),
                ("HOME", "/root"),
            ])
            .unwrap();
        assert!(config.state.deploy_mode);
        assert_eq!(
            config.state.backend_url.as_deref(),
            Some("redis://localhost:6379")
        );
        assert_eq!(config.state.route_ttl_secs, 45);
        assert_eq!(config.server.port, 9100);
    }

    #[test]
    fn env_rejects_malformed_numbers() {
        let mut config = PaneConfig::default();
        let err = config.apply_env([("PANE_OP_TIMEOUT_MS", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn backend_kind_aliases() {
        assert_eq!("redis".parse::<BackendKind>().unwrap(), BackendKind::SharedExternal);
        assert_eq!("Memory".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert!("etcd".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::SharedExternal.to_string(), "shared-external");
    }

    #[test]
    fn route_ttl_must_exceed_heartbeat() {
        let state = StateConfig {
            route_ttl_secs: 5,
            heartbeat_interval_secs: 5,
            ..StateConfig::default()
        };
        assert!(state.validate().is_err());
    }

    #[test]
    fn zero_send_queue_is_rejected() {
        let config = PaneConfig::from_toml_str("[server]\nsend_queue = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(PaneConfig::default().validate().is_ok());
    }

    #[test]
    fn worker_id_cannot_contain_separator() {
        let state = StateConfig {
            worker_id: Some("a|b".to_string()),
            ..StateConfig::default()
        };
        assert!(state.validate().is_err());
    }
}
