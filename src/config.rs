use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Complete server configuration, constructed once at startup and handed by
/// value into each protocol server. There is no global configuration state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub tls: TlsConfig,
    pub smtp: SmtpConfig,
    pub pop3: Pop3Config,
    pub imap: ImapConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Domain presented in greetings and EHLO responses.
    pub hostname: String,
    /// Node name echoed in POP3 greeting/sign-off lines.
    pub node_name: String,
    /// Seconds to wait for in-flight sessions on shutdown.
    pub shutdown_grace: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "mail.ironpost.local".to_string(),
            node_name: "ironpost-node01".to_string(),
            shutdown_grace: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
    pub ca_bundle_path: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: "certs/server.crt".to_string(),
            key_path: "certs/server.key".to_string(),
            ca_bundle_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub bind_address: String,
    pub port: u16,
    pub tls_port: u16,
    /// Seconds a connection may block on a single command read.
    pub read_timeout: u64,
    pub max_message_size: usize,
    pub dnsbl_enabled: bool,
    pub dnsbl_zone: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 25,
            tls_port: 465,
            read_timeout: 15,
            max_message_size: 25 * 1024 * 1024,
            dnsbl_enabled: false,
            dnsbl_zone: "zen.spamhaus.org".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Pop3Config {
    pub bind_address: String,
    pub port: u16,
    pub tls_port: u16,
    pub read_timeout: u64,
    pub max_line_length: usize,
}

impl Default for Pop3Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 110,
            tls_port: 995,
            read_timeout: 15,
            max_line_length: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapConfig {
    pub bind_address: String,
    pub port: u16,
    pub tls_port: u16,
    pub read_timeout: u64,
    pub max_line_length: usize,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 143,
            tls_port: 993,
            read_timeout: 1800,
            max_line_length: 8192,
        }
    }
}

impl Config {
    /// Loads the configuration from a toml file, writing out the defaults
    /// first when the file does not exist yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let config = Config::default();
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| Error::Configuration(e.to_string()))?;
            std::fs::write(path, rendered)?;
            return Ok(config);
        }

        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Configuration(e.to_string()))
    }
}
