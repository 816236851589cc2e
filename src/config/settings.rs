//! Proxy server configuration settings

use crate::proxy::ForwardConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration for the proxy server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Server listening address
    pub listen_addr: SocketAddr,

    /// Log level configuration
    pub log_level: String,

    /// Certificate authority configuration
    pub ca: CaConfig,

    /// Upstream connection configuration
    pub upstream: UpstreamConfig,
}

/// Certificate authority configuration. When both paths are set the CA is
/// loaded from disk, or generated and saved there on first run; without
/// paths a fresh CA lives only for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaConfig {
    pub key_path: Option<String>,
    pub cert_path: Option<String>,

    pub country: String,
    pub state: String,
    pub locality: String,
    pub organization: String,
    pub common_name: String,
}

/// Upstream connection configuration, timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub dns_timeout: u64,
    pub connect_timeout: u64,
    pub tls_handshake_timeout: u64,
    pub idle_read_timeout: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".parse().unwrap(),
            log_level: "info".to_string(),
            ca: CaConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            key_path: None,
            cert_path: None,
            country: "FR".to_string(),
            state: "Ile-de-France".to_string(),
            locality: "Paris".to_string(),
            organization: "HTTPS Intercept Proxy".to_string(),
            common_name: "HTTPS Intercept Proxy CA".to_string(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            dns_timeout: 10,
            connect_timeout: 10,
            tls_handshake_timeout: 10,
            idle_read_timeout: 60,
        }
    }
}

impl UpstreamConfig {
    pub fn forward_config(&self) -> ForwardConfig {
        ForwardConfig {
            dns_timeout: Duration::from_secs(self.dns_timeout),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            tls_handshake_timeout: Duration::from_secs(self.tls_handshake_timeout),
            idle_read_timeout: Duration::from_secs(self.idle_read_timeout),
        }
    }
}
