use crate::error::ProxyError;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "proxy_config.json";
pub const DEFAULT_LISTEN: &str = ":61055";
pub const DEFAULT_USERNAME: &str = "username";
pub const DEFAULT_PASSWORD: &str = "password";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

/// Validated proxy settings. Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// `host:port` handed to the listener as is, so host names resolve at bind.
    pub listen_addr: String,
    pub username: String,
    pub password: String,
    /// Dial bound, total deadline for relayed HTTP exchanges, and the
    /// absolute lifetime of a CONNECT tunnel.
    pub timeout: Duration,
    pub private_key: Option<String>,
    pub certificate: Option<String>,
    pub max_header_size: usize,
    pub logging: Option<LoggingConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:61055".to_string(),
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            private_key: None,
            certificate: None,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            logging: None,
        }
    }
}

impl ProxyConfig {
    /// TLS listener is enabled only when both PEM paths are present.
    pub fn tls_paths(&self) -> Option<(&str, &str)> {
        match (&self.private_key, &self.certificate) {
            (Some(key), Some(cert)) => Some((key.as_str(), cert.as_str())),
            _ => None,
        }
    }

    /// The `Proxy-Authorization` value a client must present.
    pub fn connect_authorization(&self) -> String {
        crate::auth::basic_authorization(&self.username, &self.password)
    }
}

/// How the config file was found. Kept until logging is up, since the file
/// itself configures logging.
#[derive(Debug)]
pub enum ConfigSource {
    Loaded(PathBuf),
    Missing(PathBuf),
    Invalid(PathBuf, ProxyError),
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            ConfigSource::Loaded(path) => info!("Loaded config file {}", path.display()),
            ConfigSource::Missing(path) => info!("Config file {} not found, using defaults", path.display()),
            ConfigSource::Invalid(path, e) => {
                warn!("Failed to load config file {}: {}, using defaults", path.display(), e)
            }
        }
    }
}

/// On-disk (and CLI-override) shape of the configuration: every field may
/// be absent or invalid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub max_header_size: Option<usize>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl ConfigFile {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| ProxyError::Config(e.to_string()))
    }

    /// Reads `path`, falling back to an empty file when it is missing or
    /// unusable. Never fails.
    pub fn load(path: impl AsRef<Path>) -> (Self, ConfigSource) {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return (Self::default(), ConfigSource::Missing(path));
        }

        match Self::from_file(&path) {
            Ok(file) => (file, ConfigSource::Loaded(path)),
            Err(e) => (Self::default(), ConfigSource::Invalid(path, e)),
        }
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(self).map_err(|e| ProxyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn sample() -> Self {
        Self {
            port: Some(DEFAULT_LISTEN.to_string()),
            username: Some(DEFAULT_USERNAME.to_string()),
            password: Some(DEFAULT_PASSWORD.to_string()),
            timeout_seconds: Some(DEFAULT_TIMEOUT_SECS as i64),
            private_key: None,
            certificate: None,
            max_header_size: Some(DEFAULT_MAX_HEADER_SIZE),
            logging: Some(LoggingConfig::default()),
        }
    }

    /// Fields set in `overrides` win over the ones in `self`.
    pub fn overlay(self, overrides: ConfigFile) -> Self {
        Self {
            port: overrides.port.or(self.port),
            username: overrides.username.or(self.username),
            password: overrides.password.or(self.password),
            timeout_seconds: overrides.timeout_seconds.or(self.timeout_seconds),
            private_key: overrides.private_key.or(self.private_key),
            certificate: overrides.certificate.or(self.certificate),
            max_header_size: overrides.max_header_size.or(self.max_header_size),
            logging: overrides.logging.or(self.logging),
        }
    }

    /// Field-by-field merge: empty or invalid values take the default.
    pub fn merge_onto(self, defaults: &ProxyConfig) -> ProxyConfig {
        let listen_addr = match self.port.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(port) => normalize_listen_addr(port).unwrap_or_else(|| {
                warn!("Invalid listen address '{}', using {}", port, defaults.listen_addr);
                defaults.listen_addr.clone()
            }),
            None => defaults.listen_addr.clone(),
        };

        let timeout = match self.timeout_seconds {
            Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
            Some(secs) => {
                warn!("Invalid timeout_seconds {}, using {:?}", secs, defaults.timeout);
                defaults.timeout
            }
            None => defaults.timeout,
        };

        ProxyConfig {
            listen_addr,
            username: non_empty(self.username).unwrap_or_else(|| defaults.username.clone()),
            password: non_empty(self.password).unwrap_or_else(|| defaults.password.clone()),
            timeout,
            private_key: non_empty(self.private_key).or_else(|| defaults.private_key.clone()),
            certificate: non_empty(self.certificate).or_else(|| defaults.certificate.clone()),
            max_header_size: self
                .max_header_size
                .filter(|size| *size > 0)
                .unwrap_or(defaults.max_header_size),
            logging: self.logging.or_else(|| defaults.logging.clone()),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Expands the `:port` shorthand to all interfaces. Host names are kept for
/// the listener to resolve; only the port is checked here.
pub fn normalize_listen_addr(value: &str) -> Option<String> {
    let value = value.trim();
    let (host, port) = value.rsplit_once(':')?;
    port.parse::<u16>().ok()?;
    if host.is_empty() {
        Some(format!("0.0.0.0:{}", port))
    } else {
        Some(value.to_string())
    }
}
