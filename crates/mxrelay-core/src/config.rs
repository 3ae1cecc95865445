//! Process configuration.
//!
//! Loaded once at startup from a TOML file and shared read-only as
//! `Arc<Config>`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Environment variable overriding the configuration file location.
pub const CONFIG_ENV: &str = "MXRELAY_CONFIG";

/// Runtime configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Domain we accept mail for; everything else requires relay rights.
    pub domain: String,
    /// Name we announce in EHLO and in Received traces.
    pub mx_domain: String,
    /// Root of the local mailbox tree.
    pub mailbox_dir: PathBuf,
    /// PEM certificate chain for STARTTLS and implicit TLS.
    pub cert_file: PathBuf,
    /// PEM private key matching `cert_file`.
    pub key_file: PathBuf,
    /// Text of the 220 greeting.
    pub banner: String,
    /// Plaintext (STARTTLS-capable) listeners.
    pub listen: Vec<SocketAddr>,
    /// Implicit TLS listener.
    pub tls_listen: Option<SocketAddr>,
    /// Port used when connecting to remote exchangers.
    pub relay_port: u16,
    /// Outbound TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Inbound read timeout in seconds, 0 to wait forever.
    pub idle_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            mx_domain: "localhost".to_string(),
            mailbox_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mxrelay")
                .join("mailboxes"),
            cert_file: PathBuf::new(),
            key_file: PathBuf::new(),
            banner: format!("mxrelay v{}", env!("CARGO_PKG_VERSION")),
            listen: vec![
                SocketAddr::from(([0, 0, 0, 0], 25)),
                SocketAddr::from(([0, 0, 0, 0], 587)),
            ],
            tls_listen: Some(SocketAddr::from(([0, 0, 0, 0], 465))),
            relay_port: 25,
            connect_timeout_secs: 300,
            idle_timeout_secs: 600,
        }
    }
}

impl Config {
    /// Parses a configuration document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML or a value has
    /// the wrong type.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration from [`Config::default_path`], writing a
    /// default file first if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if no location can be determined, or the file
    /// cannot be created, read or parsed.
    pub fn load() -> Result<Self> {
        let path = Self::default_path()
            .ok_or_else(|| Error::Config("cannot determine config directory".into()))?;
        Self::load_from(&path)
    }

    /// Loads the configuration from `path`, writing defaults if it is
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created, read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            Self::default().save(path)?;
            info!(path = %path.display(), "wrote default configuration");
        }

        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        info!(path = %path.display(), domain = %config.domain, "configuration loaded");
        Ok(config)
    }

    /// Writes this configuration as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// `$MXRELAY_CONFIG`, else `<config dir>/mxrelay/config.toml`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("mxrelay").join("config.toml"))
    }

    /// Outbound connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Inbound idle timeout, `None` when disabled.
    #[must_use]
    pub const fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_secs))
        }
    }

    /// Returns true if `domain` is the one we deliver locally.
    #[must_use]
    pub fn is_local(&self, domain: &str) -> bool {
        self.domain.eq_ignore_ascii_case(domain)
    }

    fn validate(&self) -> Result<()> {
        if self.domain.is_empty() {
            return Err(Error::Config("domain must not be empty".into()));
        }
        if self.mx_domain.is_empty() {
            return Err(Error::Config("mx_domain must not be empty".into()));
        }
        Ok(())
    }
}
