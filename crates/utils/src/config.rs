use std::{
    fmt::{self, Display},
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

/// Top-level configuration for the SMTP relay.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub overwrite: OverwriteConfig,
}

/// Local SMTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_address")]
    pub address: String,

    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Name announced in the greeting, also used as the Message-ID domain.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Maximum accepted message size in bytes, `0` disables the limit.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Idle timeout in seconds while waiting for a client command or data.
    #[serde(default = "default_listen_timeout")]
    pub timeout: u64,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            port: default_listen_port(),
            hostname: default_hostname(),
            max_message_size: default_max_message_size(),
            max_recipients: default_max_recipients(),
            timeout: default_listen_timeout(),
        }
    }
}

/// Upstream SMTP server configuration.
#[derive(Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub tls: TlsMode,

    /// Timeout in seconds for each SMTP command sent upstream.
    #[serde(default = "default_upstream_timeout")]
    pub timeout: u64,
}

impl UpstreamConfig {
    /// Returns whether credentials are sent upstream, which needs a user
    /// name. A password on its own is ignored.
    pub fn has_auth(&self) -> bool {
        !self.user.is_empty()
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            user: String::new(),
            password: String::new(),
            tls: TlsMode::default(),
            timeout: default_upstream_timeout(),
        }
    }
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("tls", &self.tls)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Sender rewrite configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OverwriteConfig {
    /// When non-empty, replaces the envelope sender of every relayed message.
    #[serde(default)]
    pub sender: String,
}

/// How the connection to the upstream server is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plain connection upgraded with a mandatory `STARTTLS`.
    #[default]
    Starttls,
    /// TLS from the first byte (SMTPS, usually port 465).
    Implicit,
    /// `STARTTLS` when the server offers it, plain text otherwise.
    Opportunistic,
    /// No TLS at all.
    None,
}

impl FromStr for TlsMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "starttls" => Ok(TlsMode::Starttls),
            "implicit" => Ok(TlsMode::Implicit),
            "opportunistic" => Ok(TlsMode::Opportunistic),
            "none" => Ok(TlsMode::None),
            _ => Err(ConfigError::InvalidTlsMode(value.to_string())),
        }
    }
}

impl Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TlsMode::Starttls => "starttls",
            TlsMode::Implicit => "implicit",
            TlsMode::Opportunistic => "opportunistic",
            TlsMode::None => "none",
        };
        f.write_str(name)
    }
}

/// Values coming from command line flags or environment variables, they
/// take precedence over the configuration file.
#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub listen_address: Option<String>,
    pub listen_port: Option<u16>,
    pub upstream_host: Option<String>,
    pub upstream_port: Option<u16>,
    pub upstream_user: Option<String>,
    pub upstream_password: Option<String>,
    pub upstream_tls: Option<TlsMode>,
    pub overwrite_sender: Option<String>,
}

impl Config {
    /// Applies the given overrides on top of the current values.
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(address) = overrides.listen_address {
            self.listen.address = address;
        }
        if let Some(port) = overrides.listen_port {
            self.listen.port = port;
        }
        if let Some(host) = overrides.upstream_host {
            self.upstream.host = host;
        }
        if let Some(port) = overrides.upstream_port {
            self.upstream.port = port;
        }
        if let Some(user) = overrides.upstream_user {
            self.upstream.user = user;
        }
        if let Some(password) = overrides.upstream_password {
            self.upstream.password = password;
        }
        if let Some(tls) = overrides.upstream_tls {
            self.upstream.tls = tls;
        }
        if let Some(sender) = overrides.overwrite_sender {
            self.overwrite.sender = sender;
        }
    }

    /// Ensures the configuration is usable, the upstream host and port
    /// are mandatory.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.host.trim().is_empty() || self.upstream.port == 0 {
            return Err(ConfigError::MissingUpstream);
        }
        Ok(())
    }

    /// Returns the configured sender overwrite, `None` when empty.
    pub fn overwrite_sender(&self) -> Option<&str> {
        let sender = self.overwrite.sender.trim();
        (!sender.is_empty()).then_some(sender)
    }

    /// Returns the `address:port` pair the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen.address, self.listen.port)
    }
}

/// Loads configuration from a TOML file.
///
/// A missing file is not an error, the defaults are returned so that the
/// relay can be configured through flags and environment only.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Config::default());
        }
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    let config = toml::from_str(&content).map_err(ConfigError::Parse)?;
    info!(path = %path.display(), "Using config file");
    Ok(config)
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An I/O error occurred reading the file.
    #[error("Config I/O error reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A parse error occurred deserializing TOML.
    #[error("Config parse error: {0}")]
    Parse(#[source] toml::de::Error),

    /// Upstream host or port were not provided.
    #[error(
        "Please specify the upstream SMTP host and port (flags: --upstream-host and \
         --upstream-port, env: SMTP_RELAY_UPSTREAM_HOST/PORT, or config file)"
    )]
    MissingUpstream,

    /// Unknown TLS mode name.
    #[error("Invalid TLS mode {0:?}, expected one of starttls, implicit, opportunistic, none")]
    InvalidTlsMode(String),
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    25
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_max_message_size() -> usize {
    25 * 1024 * 1024
}

fn default_max_recipients() -> usize {
    100
}

fn default_listen_timeout() -> u64 {
    300
}

fn default_upstream_timeout() -> u64 {
    60
}
