// ABOUTME: Configuration loading and validation for aviso clients.
// ABOUTME: Reads AVISO_* environment variables with defaults and checks auth settings.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid {expected}: '{value}'")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("AVISO_ENGINE must be one of etcd_rest, in_memory; got '{0}'")]
    UnknownEngine(String),

    #[error("AVISO_AUTH_TYPE must be one of none, static, etcd; got '{0}'")]
    UnknownAuth(String),

    #[error("AVISO_AUTH_TYPE={auth} requires {var} to be set")]
    MissingCredential { auth: &'static str, var: &'static str },
}

/// Which backing store implementation to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    EtcdRest,
    InMemory,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::EtcdRest => "etcd_rest",
            EngineKind::InMemory => "in_memory",
        }
    }
}

/// How outgoing store requests are authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthConfig {
    None,
    Static { header: String, value: String },
    Etcd { username: String, password: String },
}

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AvisoConfig {
    pub home: PathBuf,
    pub engine: EngineKind,
    pub host: String,
    pub port: u16,
    pub https: bool,
    pub polling_interval: Duration,
    pub timeout: Duration,
    pub retry_delay: Duration,
    pub catchup: bool,
    pub key_ttl: Option<Duration>,
    pub auth: AuthConfig,
    pub schema_path: Option<PathBuf>,
}

impl Default for AvisoConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            engine: EngineKind::EtcdRest,
            host: "localhost".to_string(),
            port: 2379,
            https: false,
            polling_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
            retry_delay: Duration::from_secs(10),
            catchup: true,
            key_ttl: None,
            auth: AuthConfig::None,
            schema_path: None,
        }
    }
}

fn default_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".aviso")
}

impl AvisoConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - AVISO_HOME: state directory (default: ~/.aviso)
    /// - AVISO_ENGINE: etcd_rest | in_memory (default: etcd_rest)
    /// - AVISO_HOST / AVISO_PORT / AVISO_HTTPS: store endpoint (default: localhost:2379, http)
    /// - AVISO_POLLING_INTERVAL: seconds between polls (default: 30)
    /// - AVISO_TIMEOUT: per-request timeout in seconds (default: 60)
    /// - AVISO_RETRY_DELAY: seconds between retries of failed requests (default: 10)
    /// - AVISO_CATCHUP: resume from the last processed revision (default: true)
    /// - AVISO_KEY_TTL: lease seconds for published keys (optional)
    /// - AVISO_AUTH_TYPE: none | static | etcd (default: none)
    /// - AVISO_AUTH_HEADER / AVISO_AUTH_TOKEN: header for static auth
    /// - AVISO_USERNAME / AVISO_PASSWORD: credentials for etcd auth
    /// - AVISO_SCHEMA: path of the event schema YAML (optional)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let engine = match lookup("AVISO_ENGINE").as_deref() {
            None | Some("etcd_rest") => EngineKind::EtcdRest,
            Some("in_memory") => EngineKind::InMemory,
            Some(other) => return Err(ConfigError::UnknownEngine(other.to_string())),
        };

        let port = match lookup("AVISO_PORT") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                var: "AVISO_PORT",
                expected: "port number",
                value: v,
            })?,
            None => defaults.port,
        };

        let auth = match lookup("AVISO_AUTH_TYPE").as_deref() {
            None | Some("none") => AuthConfig::None,
            Some("static") => AuthConfig::Static {
                header: lookup("AVISO_AUTH_HEADER").unwrap_or_else(|| "Authorization".to_string()),
                value: lookup("AVISO_AUTH_TOKEN").ok_or(ConfigError::MissingCredential {
                    auth: "static",
                    var: "AVISO_AUTH_TOKEN",
                })?,
            },
            Some("etcd") => AuthConfig::Etcd {
                username: lookup("AVISO_USERNAME").ok_or(ConfigError::MissingCredential {
                    auth: "etcd",
                    var: "AVISO_USERNAME",
                })?,
                password: lookup("AVISO_PASSWORD").ok_or(ConfigError::MissingCredential {
                    auth: "etcd",
                    var: "AVISO_PASSWORD",
                })?,
            },
            Some(other) => return Err(ConfigError::UnknownAuth(other.to_string())),
        };

        let key_ttl = lookup("AVISO_KEY_TTL")
            .map(|v| parse_seconds("AVISO_KEY_TTL", v))
            .transpose()?;

        Ok(Self {
            home: lookup("AVISO_HOME").map(PathBuf::from).unwrap_or(defaults.home),
            engine,
            host: lookup("AVISO_HOST").unwrap_or(defaults.host),
            port,
            https: lookup("AVISO_HTTPS").map(|v| is_truthy(&v)).unwrap_or(defaults.https),
            polling_interval: seconds_or(&lookup, "AVISO_POLLING_INTERVAL", defaults.polling_interval)?,
            timeout: seconds_or(&lookup, "AVISO_TIMEOUT", defaults.timeout)?,
            retry_delay: seconds_or(&lookup, "AVISO_RETRY_DELAY", defaults.retry_delay)?,
            catchup: lookup("AVISO_CATCHUP").map(|v| is_truthy(&v)).unwrap_or(defaults.catchup),
            key_ttl,
            auth,
            schema_path: lookup("AVISO_SCHEMA").map(PathBuf::from),
        })
    }

    /// Directory holding per-endpoint cursor files.
    pub fn state_dir(&self) -> PathBuf {
        self.home.join("state")
    }

    /// Base URL of the store's REST gateway.
    pub fn base_url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_seconds(var: &'static str, value: String) -> Result<Duration, ConfigError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
        .ok_or(ConfigError::Invalid {
            var,
            expected: "number of seconds",
            value,
        })
}

fn seconds_or<F>(lookup: &F, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(v) => parse_seconds(var, v),
        None => Ok(default),
    }
}
