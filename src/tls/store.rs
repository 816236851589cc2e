//! Dynamic TLS certificate store
//!
//! Owns the CA and a monotonically growing cache of leaf certificates keyed
//! by normalized hostname. Issuance is single-flight per hostname: concurrent
//! connections to the same host share one leaf, different hosts issue in
//! parallel. Entries never expire for the lifetime of the process.

use crate::error::{Error, Result};
use crate::http::ParseError;
use crate::tls::cert_gen::{self, CaMaterial, CaSubject, LeafHost};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// The shared TLS store. The CA material is read-only after construction;
/// the leaf cache is the only mutable state and is safe to share across
/// connection tasks behind an `Arc`.
pub struct TlsStore {
    ca: CaMaterial,
    leaves: Mutex<HashMap<String, Arc<OnceCell<Arc<ServerConfig>>>>>,
}

impl TlsStore {
    /// Generate a fresh CA with default subject fields and an empty cache.
    pub fn new() -> Result<Self> {
        Self::with_subject(CaSubject::default())
    }

    /// Generate a fresh CA with a caller-supplied subject.
    pub fn generate_ca(
        country: &str,
        state: &str,
        locality: &str,
        organization: &str,
        common_name: &str,
    ) -> Result<Self> {
        Self::with_subject(CaSubject {
            country: country.to_string(),
            state: state.to_string(),
            locality: locality.to_string(),
            organization: organization.to_string(),
            common_name: common_name.to_string(),
        })
    }

    fn with_subject(subject: CaSubject) -> Result<Self> {
        let ca = cert_gen::generate_ca(&subject)?;
        info!("generated interception CA: CN={}", subject.common_name);
        Ok(Self {
            ca,
            leaves: Mutex::new(HashMap::new()),
        })
    }

    /// Adopt an existing CA. Both key and certificate are required; the key
    /// must be EC P-256 and the certificate must carry `CA:TRUE`.
    pub fn load_ca(key_pem: &[u8], cert_pem: &[u8]) -> Result<Self> {
        let ca = cert_gen::load_ca(key_pem, cert_pem)?;
        info!("loaded interception CA from PEM material");
        Ok(Self {
            ca,
            leaves: Mutex::new(HashMap::new()),
        })
    }

    /// Serialize the CA key (PKCS#8 PEM) and certificate (PEM) to disk.
    pub fn save_ca(&self, key_path: impl AsRef<Path>, cert_path: impl AsRef<Path>) -> Result<()> {
        let key_path = key_path.as_ref();
        let cert_path = cert_path.as_ref();
        for path in [key_path, cert_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(key_path, self.ca.cert.serialize_private_key_pem())?;
        std::fs::write(cert_path, self.ca_cert_pem())?;
        info!(
            "saved CA key to {} and certificate to {}",
            key_path.display(),
            cert_path.display()
        );
        Ok(())
    }

    /// The CA certificate in PEM form, for installing into client trust
    /// stores.
    pub fn ca_cert_pem(&self) -> String {
        cert_gen::pem_encode("CERTIFICATE", &self.ca.cert_der)
    }

    /// The CA certificate in DER form.
    pub fn ca_cert_der(&self) -> &[u8] {
        &self.ca.cert_der
    }

    /// Returns a TLS server configuration presenting a leaf for `hostname`,
    /// issuing and caching it on first use.
    pub async fn server_config_for(&self, hostname: &str) -> Result<Arc<ServerConfig>> {
        let (key, host) = normalize_host(hostname)?;

        let cell = {
            let mut leaves = self.leaves.lock().unwrap();
            leaves
                .entry(key)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let config = cell
            .get_or_try_init(|| async { self.issue(&host) })
            .await?;
        Ok(config.clone())
    }

    /// Number of cached leaf certificates.
    pub fn cached_leaves(&self) -> usize {
        self.leaves.lock().unwrap().len()
    }

    fn issue(&self, host: &LeafHost) -> Result<Arc<ServerConfig>> {
        debug!("issuing leaf certificate for {host:?}");
        let leaf = cert_gen::issue_leaf(&self.ca, host)?;
        let chain = vec![
            rustls::Certificate(leaf.cert_der),
            rustls::Certificate(self.ca.cert_der.clone()),
        ];
        let key = rustls::PrivateKey(leaf.key_der);
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        Ok(Arc::new(config))
    }
}

/// Lowercases and IDNA-normalizes a hostname into a cache key and SAN form.
/// IP literals (with or without brackets already stripped) become IP SANs.
fn normalize_host(hostname: &str) -> Result<(String, LeafHost)> {
    if let Ok(addr) = hostname.parse::<IpAddr>() {
        return Ok((addr.to_string(), LeafHost::Ip(addr)));
    }
    match url::Host::parse(&hostname.to_ascii_lowercase()) {
        Ok(url::Host::Domain(domain)) => Ok((domain.clone(), LeafHost::Dns(domain))),
        Ok(url::Host::Ipv4(addr)) => Ok((addr.to_string(), LeafHost::Ip(IpAddr::V4(addr)))),
        Ok(url::Host::Ipv6(addr)) => Ok((addr.to_string(), LeafHost::Ip(IpAddr::V6(addr)))),
        Err(_) => Err(Error::ClientParse(ParseError::InvalidRequestLine(
            hostname.to_string(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeated_requests_share_one_leaf() {
        let store = TlsStore::new().unwrap();
        let first = store.server_config_for("example.test").await.unwrap();
        let second = store.server_config_for("example.test").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.cached_leaves(), 1);
    }

    #[tokio::test]
    async fn hostname_lookup_is_case_insensitive() {
        let store = TlsStore::new().unwrap();
        let lower = store.server_config_for("example.test").await.unwrap();
        let upper = store.server_config_for("EXAMPLE.test").await.unwrap();
        assert!(Arc::ptr_eq(&lower, &upper));
        assert_eq!(store.cached_leaves(), 1);
    }

    #[tokio::test]
    async fn different_hosts_get_different_leaves() {
        let store = TlsStore::new().unwrap();
        let a = store.server_config_for("a.test").await.unwrap();
        let b = store.server_config_for("b.test").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(store.cached_leaves(), 2);
    }

    #[tokio::test]
    async fn ip_literals_are_accepted() {
        let store = TlsStore::new().unwrap();
        store.server_config_for("127.0.0.1").await.unwrap();
        store.server_config_for("::1").await.unwrap();
        assert_eq!(store.cached_leaves(), 2);
    }

    #[tokio::test]
    async fn concurrent_requests_single_flight() {
        let store = Arc::new(TlsStore::new().unwrap());
        let mut tasks = Vec::new();
        for _ in 0..100 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.server_config_for("example.test").await.unwrap()
            }));
        }
        let mut configs = Vec::new();
        for task in tasks {
            configs.push(task.await.unwrap());
        }
        assert!(configs.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(store.cached_leaves(), 1);
    }

    #[tokio::test]
    async fn save_and_load_preserve_the_ca() {
        let store = TlsStore::new().unwrap();
        let dir = std::env::temp_dir().join(format!("intercept-proxy-ca-{}", std::process::id()));
        let key_path = dir.join("ca.key");
        let cert_path = dir.join("ca.pem");
        store.save_ca(&key_path, &cert_path).unwrap();

        let key_pem = std::fs::read(&key_path).unwrap();
        let cert_pem = std::fs::read(&cert_path).unwrap();
        let loaded = TlsStore::load_ca(&key_pem, &cert_pem).unwrap();
        assert_eq!(loaded.ca_cert_der(), store.ca_cert_der());
        loaded.server_config_for("example.test").await.unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn ca_pem_contains_the_der() {
        let store = TlsStore::new().unwrap();
        let pem = store.ca_cert_pem();
        let parsed = rustls_pemfile::certs(&mut pem.as_bytes()).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0], store.ca_cert_der());
    }
}
