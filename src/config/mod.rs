//! Process-wide configuration, loaded from a JSON document at startup.
//!
//! Loading follows the validate-with-context style of `MailLaser`'s
//! `Config::from_env` (clear, logged messages per missing/invalid field),
//! adapted from environment variables to a JSON file since the wire format
//! is now a structured document.

pub mod diff;

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Log verbosity, matching the config document's wire strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
    Panic,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn to_log_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warning => log::LevelFilter::Warn,
            LogLevel::Error | LogLevel::Fatal | LogLevel::Panic => log::LevelFilter::Error,
        }
    }
}

/// Client certificate requirement for a server's TLS listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthType {
    #[default]
    None,
    Request,
    Require,
}

/// The special `AllowedHosts` value meaning "accept mail for any host".
pub const ACCEPT_ALL_HOSTS: &str = ".";

/// One listener's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `host:port`; unique across `AppConfig.servers`, acts as identity key.
    pub listen_interface: String,
    #[serde(default = "default_host_name")]
    pub host_name: String,
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub private_key_file: Option<String>,
    #[serde(default)]
    pub public_key_file: Option<String>,
    #[serde(default)]
    pub start_tls_on: bool,
    #[serde(default)]
    pub tls_always_on: bool,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub ciphers: Vec<String>,
    #[serde(default)]
    pub client_auth_type: ClientAuthType,
    #[serde(default)]
    pub root_cas: Option<String>,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

fn default_host_name() -> String {
    "mail.example.com".to_string()
}
fn default_max_size() -> u64 {
    10 * 1024 * 1024
}
fn default_max_clients() -> usize {
    200
}
fn default_timeout() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// `true` if this server requires cert/key material to load (either
    /// `tls_always_on` or `start_tls_on`).
    pub fn requires_tls_material(&self) -> bool {
        self.tls_always_on || self.start_tls_on
    }

    pub fn has_tls_material(&self) -> bool {
        self.private_key_file.is_some() && self.public_key_file.is_some()
    }

    /// Whether any field the TLS config is built from changed between two
    /// server configs (used by the diff to emit `ConfigServerTLS`).
    pub fn tls_fields_eq(&self, other: &ServerConfig) -> bool {
        self.private_key_file == other.private_key_file
            && self.public_key_file == other.public_key_file
            && self.start_tls_on == other.start_tls_on
            && self.tls_always_on == other.tls_always_on
            && self.protocols == other.protocols
            && self.ciphers == other.ciphers
            && self.client_auth_type == other.client_auth_type
            && self.root_cas == other.root_cas
    }
}

/// The recipient-domain allowlist, held independently behind its own
/// `ArcSwap` by each running server so a reload can swap it without
/// touching the rest of `AppConfig`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllowedHosts(HashSet<String>);

impl AllowedHosts {
    pub fn new(hosts: HashSet<String>) -> AllowedHosts {
        AllowedHosts(hosts)
    }

    /// Lower-cased membership check; `.` accepts any host.
    pub fn is_allowed(&self, host: &str) -> bool {
        if self.0.contains(ACCEPT_ALL_HOSTS) {
            return true;
        }
        let host = host.to_lowercase();
        self.0.iter().any(|h| h.to_lowercase() == host)
    }
}

/// Process-wide configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub allowed_hosts: HashSet<String>,
    #[serde(default)]
    pub backend_config: serde_json::Map<String, serde_json::Value>,
    pub servers: Vec<ServerConfig>,
}

fn default_pid_file() -> String {
    "/var/run/maild.pid".to_string()
}
fn default_log_file() -> String {
    "stderr".to_string()
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
        let path_ref = path.as_ref();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.display().to_string(),
            source,
        })?;
        Self::from_str(&text, &path_ref.display().to_string())
    }

    pub fn from_str(text: &str, path_for_errors: &str) -> Result<AppConfig, ConfigError> {
        let config: AppConfig = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: path_for_errors.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Lower-cased host membership check; `.` in `allowed_hosts` accepts any
    /// host.
    pub fn is_host_allowed(&self, host: &str) -> bool {
        self.allowed_hosts_snapshot().is_allowed(host)
    }

    pub fn allowed_hosts_snapshot(&self) -> AllowedHosts {
        AllowedHosts::new(self.allowed_hosts.clone())
    }

    /// Validates the invariants required before the daemon starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.servers.iter().any(|s| s.is_enabled) {
            return Err(ConfigError::NoEnabledServers);
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.listen_interface.clone()) {
                return Err(ConfigError::DuplicateListenInterface(
                    server.listen_interface.clone(),
                ));
            }
            if server.tls_always_on && !server.has_tls_material() {
                return Err(ConfigError::TlsAlwaysOnMissingMaterial(
                    server.listen_interface.clone(),
                ));
            }
            if server.start_tls_on && !server.has_tls_material() {
                return Err(ConfigError::StartTlsMissingMaterial(
                    server.listen_interface.clone(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_server(iface: &str) -> ServerConfig {
        ServerConfig {
            listen_interface: iface.to_string(),
            host_name: "mail.test.com".into(),
            max_size: 1024 * 1024,
            max_clients: 10,
            timeout: 30,
            private_key_file: None,
            public_key_file: None,
            start_tls_on: false,
            tls_always_on: false,
            protocols: vec![],
            ciphers: vec![],
            client_auth_type: ClientAuthType::None,
            root_cas: None,
            log_file: None,
            is_enabled: true,
        }
    }

    #[test]
    fn parses_minimal_document() {
        let json = r#"{
            "allowed_hosts": ["grr.la"],
            "servers": [{"listen_interface": "127.0.0.1:2525"}]
        }"#;
        let config = AppConfig::from_str(json, "test").unwrap();
        assert_eq!(config.servers.len(), 1);
        assert!(config.is_host_allowed("grr.la"));
        assert!(config.is_host_allowed("GRR.LA"));
        assert!(!config.is_host_allowed("notallowed.example"));
    }

    #[test]
    fn accept_all_dot_host() {
        let json = r#"{"allowed_hosts": ["."], "servers": [{"listen_interface": "127.0.0.1:2525"}]}"#;
        let config = AppConfig::from_str(json, "test").unwrap();
        assert!(config.is_host_allowed("anything.example"));
    }

    #[test]
    fn rejects_no_enabled_servers() {
        let mut server = minimal_server("127.0.0.1:2525");
        server.is_enabled = false;
        let config = AppConfig {
            pid_file: default_pid_file(),
            log_file: default_log_file(),
            log_level: LogLevel::Info,
            allowed_hosts: HashSet::new(),
            backend_config: Default::default(),
            servers: vec![server],
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NoEnabledServers)
        ));
    }

    #[test]
    fn rejects_duplicate_listen_interface() {
        let config = AppConfig {
            pid_file: default_pid_file(),
            log_file: default_log_file(),
            log_level: LogLevel::Info,
            allowed_hosts: HashSet::new(),
            backend_config: Default::default(),
            servers: vec![minimal_server("127.0.0.1:2525"), minimal_server("127.0.0.1:2525")],
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateListenInterface(_))
        ));
    }

    #[test]
    fn rejects_tls_always_on_without_material() {
        let mut server = minimal_server("127.0.0.1:2525");
        server.tls_always_on = true;
        let config = AppConfig {
            pid_file: default_pid_file(),
            log_file: default_log_file(),
            log_level: LogLevel::Info,
            allowed_hosts: HashSet::new(),
            backend_config: Default::default(),
            servers: vec![server],
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TlsAlwaysOnMissingMaterial(_))
        ));
    }
}
