//! Builds a `rustls::ServerConfig` from a `ServerConfig`'s PEM cert/key
//! files, protocol range, and cipher allowlist, for STARTTLS and
//! always-on TLS listeners.
//!
//! `rustls` only implements TLS 1.2 and 1.3 — there is no running TLS 1.0
//! or 1.1 stack to select, in this crate or the pack it was grounded on.
//! Configured protocol strings for 1.0/1.1 are accepted for config
//! compatibility and logged as ignored rather than rejected; see
//! DESIGN.md.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;

use crate::config::{ClientAuthType, ServerConfig};
use crate::error::ConfigError;

/// Builds a server-side `rustls::ServerConfig` for one listener.
pub fn build_server_config(server: &ServerConfig) -> Result<Arc<rustls::ServerConfig>, ConfigError> {
    let certs = load_certs(server.public_key_file.as_deref().ok_or_else(|| {
        ConfigError::StartTlsMissingMaterial(server.listen_interface.clone())
    })?)?;
    let key = load_private_key(server.private_key_file.as_deref().ok_or_else(|| {
        ConfigError::StartTlsMissingMaterial(server.listen_interface.clone())
    })?)?;

    let provider = Arc::new(select_cipher_suites(&server.ciphers));
    let versions = select_protocol_versions(&server.protocols);

    let builder = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&versions)
        .map_err(|e| tls_config_error(server, e))?;

    let mut config = match server.client_auth_type {
        ClientAuthType::None => builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| tls_config_error(server, e))?,
        ClientAuthType::Request | ClientAuthType::Require => {
            let roots = load_root_cas(server.root_cas.as_deref())?;
            let mut verifier_builder = WebPkiClientVerifier::builder(Arc::new(roots));
            if server.client_auth_type == ClientAuthType::Request {
                verifier_builder = verifier_builder.allow_unauthenticated();
            }
            let verifier = verifier_builder
                .build()
                .map_err(|e| tls_config_error(server, e))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
                .map_err(|e| tls_config_error(server, e))?
        }
    };

    config.alpn_protocols = vec![];
    Ok(Arc::new(config))
}

fn tls_config_error(server: &ServerConfig, err: impl std::fmt::Display) -> ConfigError {
    ConfigError::Io {
        path: server.listen_interface.clone(),
        source: std::io::Error::other(err.to_string()),
    }
}

fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })
}

fn load_private_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?
        .ok_or_else(|| ConfigError::Io {
            path: path.to_string(),
            source: std::io::Error::other("no private key found in file"),
        })
}

fn load_root_cas(path: Option<&str>) -> Result<RootCertStore, ConfigError> {
    let mut store = RootCertStore::empty();
    if let Some(path) = path {
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let mut reader = BufReader::new(file);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|source| ConfigError::Io {
                path: path.to_string(),
                source,
            })?;
            store.add(cert).map_err(|e| ConfigError::Io {
                path: path.to_string(),
                source: std::io::Error::other(e.to_string()),
            })?;
        }
    }
    Ok(store)
}

/// Picks `TLS12`/`TLS13` from the configured protocol-name list. Entries
/// for TLS 1.0/1.1 are silently dropped — rustls does not implement them.
/// An empty list means "rustls' full supported range".
fn select_protocol_versions(names: &[String]) -> Vec<&'static rustls::SupportedProtocolVersion> {
    if names.is_empty() {
        return rustls::DEFAULT_VERSIONS.to_vec();
    }
    let mut versions = Vec::new();
    for name in names {
        match normalize_protocol_name(name).as_str() {
            "tls1.2" => versions.push(&rustls::version::TLS12),
            "tls1.3" => versions.push(&rustls::version::TLS13),
            _ => {} // tls1.0 / tls1.1 / unrecognized: no rustls implementation to select.
        }
    }
    if versions.is_empty() {
        rustls::DEFAULT_VERSIONS.to_vec()
    } else {
        versions
    }
}

fn normalize_protocol_name(name: &str) -> String {
    name.to_lowercase().replace(['_', ' '], "")
}

/// Filters the default crypto provider's cipher suites down to the
/// configured IANA-name allowlist (case-insensitive substring match). An
/// empty list keeps the provider's full default set.
fn select_cipher_suites(names: &[String]) -> rustls::crypto::CryptoProvider {
    let base = rustls::crypto::aws_lc_rs::default_provider();
    if names.is_empty() {
        return base;
    }
    let wanted: Vec<String> = names.iter().map(|n| n.to_lowercase()).collect();
    let filtered: Vec<_> = base
        .cipher_suites
        .iter()
        .filter(|suite| {
            let suite_name = format!("{:?}", suite.suite()).to_lowercase();
            wanted.iter().any(|w| suite_name.contains(w.as_str()))
        })
        .cloned()
        .collect();

    rustls::crypto::CryptoProvider {
        cipher_suites: if filtered.is_empty() {
            base.cipher_suites.clone()
        } else {
            filtered
        },
        ..base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_protocol_list_keeps_default_range() {
        let versions = select_protocol_versions(&[]);
        assert_eq!(versions.len(), rustls::DEFAULT_VERSIONS.len());
    }

    #[test]
    fn tls10_and_tls11_are_dropped() {
        let versions = select_protocol_versions(&["TLS1.0".to_string(), "TLS1.1".to_string()]);
        assert_eq!(versions.len(), rustls::DEFAULT_VERSIONS.len());
    }

    #[test]
    fn tls12_only_selects_one_version() {
        let versions = select_protocol_versions(&["tls1.2".to_string()]);
        assert_eq!(versions.len(), 1);
    }

    #[test]
    fn missing_cert_file_is_a_config_error() {
        let server = ServerConfig {
            listen_interface: "127.0.0.1:2525".into(),
            host_name: "mail.test.com".into(),
            max_size: 1024,
            max_clients: 10,
            timeout: 30,
            private_key_file: Some("/nonexistent/key.pem".into()),
            public_key_file: Some("/nonexistent/cert.pem".into()),
            start_tls_on: true,
            tls_always_on: false,
            protocols: vec![],
            ciphers: vec![],
            client_auth_type: ClientAuthType::None,
            root_cas: None,
            log_file: None,
            is_enabled: true,
        };
        assert!(build_server_config(&server).is_err());
    }
}
