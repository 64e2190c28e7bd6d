//! Server configuration loading.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use smol_str::SmolStr;

use crate::error::NetplotError;

pub const DEFAULT_BASE_PORT: u16 = 9600;
pub const DEFAULT_PORT_COUNT: u16 = 100;
pub const DEFAULT_DEBOUNCE_MS: u64 = 250;
pub const DEFAULT_CONFIG_FILE: &str = "netplot.toml";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_host: SmolStr,
    pub base_port: u16,
    pub port_count: u16,
    pub output_dir: PathBuf,
    pub persistence: PersistenceConfig,
    pub ack_default: bool,
    pub debug: bool,
    pub log_level: SmolStr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceConfig {
    pub debounce: Duration,
    pub max_flush_delay: Option<Duration>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            max_flush_delay: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_host: SmolStr::new("0.0.0.0"),
            base_port: DEFAULT_BASE_PORT,
            port_count: DEFAULT_PORT_COUNT,
            output_dir: PathBuf::from("."),
            persistence: PersistenceConfig::default(),
            ack_default: true,
            debug: false,
            log_level: SmolStr::new("info"),
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, NetplotError> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(DEFAULT_CONFIG_FILE)
            .to_string();
        let text = std::fs::read_to_string(path)
            .map_err(|err| NetplotError::InvalidConfig(format!("{file_name}: {err}").into()))?;
        parse_server_toml_from_text(&text, &file_name)
    }

    /// Loads `path` when it exists, otherwise falls back to defaults.
    pub fn load_optional(path: impl AsRef<Path>) -> Result<Self, NetplotError> {
        let path = path.as_ref();
        if path.is_file() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Number of panel slots, one per listening port.
    #[must_use]
    pub fn max_panels(&self) -> usize {
        usize::from(self.port_count)
    }

    #[must_use]
    pub fn last_port(&self) -> u16 {
        self.base_port.saturating_add(self.port_count.saturating_sub(1))
    }

    /// Re-checks invariants after CLI overrides have been applied.
    pub fn validate(&self) -> Result<(), NetplotError> {
        validate_port_range(self.base_port, self.port_count)?;
        if self.listen_host.trim().is_empty() {
            return Err(NetplotError::InvalidConfig(
                "server.host must not be empty".into(),
            ));
        }
        validate_persistence(&self.persistence)?;
        if self.log_level.trim().is_empty() {
            return Err(NetplotError::InvalidConfig(
                "log.level must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn parse_server_toml_from_text(text: &str, file_name: &str) -> Result<ServerConfig, NetplotError> {
    let raw: ServerToml = toml::from_str(text)
        .map_err(|err| NetplotError::InvalidConfig(format!("{file_name}: {err}").into()))?;
    raw.into_config()
        .map_err(|err| prefix_invalid_config(file_name, err))
}

fn prefix_invalid_config(file_name: &str, err: NetplotError) -> NetplotError {
    match err {
        NetplotError::InvalidConfig(message) => {
            NetplotError::InvalidConfig(format!("{file_name}: {message}").into())
        }
        other => other,
    }
}

fn validate_port_range(base_port: u16, port_count: u16) -> Result<(), NetplotError> {
    if port_count == 0 {
        return Err(NetplotError::InvalidConfig(
            "server.port_count must be >= 1".into(),
        ));
    }
    if u32::from(base_port) + u32::from(port_count) - 1 > u32::from(u16::MAX) {
        return Err(NetplotError::InvalidConfig(
            format!("port range {base_port}+{port_count} exceeds 65535").into(),
        ));
    }
    Ok(())
}

fn validate_persistence(config: &PersistenceConfig) -> Result<(), NetplotError> {
    if config.debounce.is_zero() {
        return Err(NetplotError::InvalidConfig(
            "persistence.debounce_ms must be >= 1".into(),
        ));
    }
    if let Some(max_delay) = config.max_flush_delay {
        if max_delay < config.debounce {
            return Err(NetplotError::InvalidConfig(
                "persistence.max_flush_delay_ms must be >= persistence.debounce_ms".into(),
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerToml {
    server: Option<ServerSection>,
    persistence: Option<PersistenceSection>,
    log: Option<LogSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerSection {
    host: Option<String>,
    base_port: Option<u16>,
    port_count: Option<u16>,
    output_dir: Option<String>,
    ack_default: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PersistenceSection {
    debounce_ms: Option<u64>,
    max_flush_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogSection {
    level: Option<String>,
    debug: Option<bool>,
}

impl ServerToml {
    fn into_config(self) -> Result<ServerConfig, NetplotError> {
        let defaults = ServerConfig::default();
        let server = self.server.unwrap_or_default();
        let persistence = self.persistence.unwrap_or_default();
        let log = self.log.unwrap_or_default();

        let config = ServerConfig {
            listen_host: server
                .host
                .map(SmolStr::new)
                .unwrap_or(defaults.listen_host),
            base_port: server.base_port.unwrap_or(defaults.base_port),
            port_count: server.port_count.unwrap_or(defaults.port_count),
            output_dir: server
                .output_dir
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            persistence: PersistenceConfig {
                debounce: persistence
                    .debounce_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.persistence.debounce),
                max_flush_delay: persistence.max_flush_delay_ms.map(Duration::from_millis),
            },
            ack_default: server.ack_default.unwrap_or(defaults.ack_default),
            debug: log.debug.unwrap_or(defaults.debug),
            log_level: log.level.map(SmolStr::new).unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }
}
