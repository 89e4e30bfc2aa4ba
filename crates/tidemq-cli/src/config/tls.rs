//! TLS configuration for the broker connection.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tidemq_net::tls::build_client_config;
use tidemq_net::{TlsConfig as NetTlsConfig, TlsSetup};

/// TLS configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Connect with TLS.
    pub enabled: bool,
    /// PEM file with CA certificates (default: web PKI roots).
    pub ca_cert: Option<PathBuf>,
    /// PEM client certificate for mutual TLS.
    pub client_cert: Option<PathBuf>,
    /// PEM private key for `client_cert`.
    pub client_key: Option<PathBuf>,
    /// Name to verify the broker certificate against (default: broker host).
    pub server_name: Option<String>,
    /// Skip certificate verification. Testing only.
    pub accept_invalid_certs: bool,
}

impl TlsConfig {
    /// Validate the TLS configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        self.to_net().validate().map_err(|e| format!("tls: {}", e))
    }

    fn to_net(&self) -> NetTlsConfig {
        NetTlsConfig {
            ca_cert: self.ca_cert.clone(),
            client_cert: self.client_cert.clone(),
            client_key: self.client_key.clone(),
            server_name: self.server_name.clone(),
            accept_invalid_certs: self.accept_invalid_certs,
        }
    }

    /// Handshake setup for connecting to `broker`, or `None` when disabled.
    pub fn setup(&self, broker: &str) -> tidemq_net::Result<Option<TlsSetup>> {
        if !self.enabled {
            return Ok(None);
        }
        let config = build_client_config(&self.to_net())?;
        let server_name = match &self.server_name {
            Some(name) => name.as_str(),
            None => host(broker),
        };
        TlsSetup::client(Arc::new(config), server_name).map(Some)
    }
}

/// Host part of `host:port`, without IPv6 brackets.
fn host(address: &str) -> &str {
    let host = address
        .rsplit_once(':')
        .map_or(address, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_is_valid() {
        assert!(TlsConfig::default().validate().is_ok());
    }

    #[test]
    fn test_cert_without_key_fails() {
        let config = TlsConfig {
            enabled: true,
            client_cert: Some(PathBuf::from("/path/to/cert.pem")),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disabled_has_no_setup() {
        assert!(TlsConfig::default().setup("localhost:8883").unwrap().is_none());
    }

    #[test]
    fn test_host() {
        assert_eq!(host("broker.example.com:8883"), "broker.example.com");
        assert_eq!(host("[::1]:8883"), "::1");
        assert_eq!(host("localhost"), "localhost");
    }

    #[test]
    fn test_insecure_setup() {
        let config = TlsConfig {
            enabled: true,
            accept_invalid_certs: true,
            ..Default::default()
        };
        assert!(config.setup("localhost:8883").unwrap().is_some());
    }
}
