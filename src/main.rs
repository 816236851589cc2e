//! Main entry point for the HTTPS intercept proxy

use https_intercept_proxy::{
    config::{CaConfig, ProxyConfig},
    init_logger_with_env,
    proxy::{start_proxy_server, ForwardHandler, TcpUpstreamTransport},
    tls::TlsStore,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Load configuration from environment variables with fallback to defaults
fn load_config_from_env() -> ProxyConfig {
    use std::env;

    let mut config = ProxyConfig::default();

    if let Ok(addr_str) = env::var("PROXY_LISTEN_ADDR") {
        if let Ok(addr) = addr_str.parse() {
            config.listen_addr = addr;
        }
    }

    if let Ok(log_level) = env::var("RUST_LOG") {
        config.log_level = log_level;
    }

    if let Ok(key_path) = env::var("CA_KEY_PATH") {
        config.ca.key_path = Some(key_path);
    }

    if let Ok(cert_path) = env::var("CA_CERT_PATH") {
        config.ca.cert_path = Some(cert_path);
    }

    if let Ok(organization) = env::var("CA_ORGANIZATION") {
        config.ca.organization = organization;
    }

    if let Ok(common_name) = env::var("CA_COMMON_NAME") {
        config.ca.common_name = common_name;
    }

    if let Ok(timeout) = env::var("UPSTREAM_DNS_TIMEOUT") {
        if let Ok(value) = timeout.parse() {
            config.upstream.dns_timeout = value;
        }
    }

    if let Ok(timeout) = env::var("UPSTREAM_CONNECT_TIMEOUT") {
        if let Ok(value) = timeout.parse() {
            config.upstream.connect_timeout = value;
        }
    }

    if let Ok(timeout) = env::var("UPSTREAM_TLS_TIMEOUT") {
        if let Ok(value) = timeout.parse() {
            config.upstream.tls_handshake_timeout = value;
        }
    }

    if let Ok(timeout) = env::var("UPSTREAM_IDLE_TIMEOUT") {
        if let Ok(value) = timeout.parse() {
            config.upstream.idle_read_timeout = value;
        }
    }

    config
}

/// Load the CA from configured paths, generating (and persisting) one when
/// the files are missing. Without paths the CA is ephemeral.
fn build_tls_store(ca: &CaConfig) -> anyhow::Result<Arc<TlsStore>> {
    if let (Some(key_path), Some(cert_path)) = (&ca.key_path, &ca.cert_path) {
        if Path::new(key_path).exists() && Path::new(cert_path).exists() {
            let key_pem = std::fs::read(key_path)?;
            let cert_pem = std::fs::read(cert_path)?;
            info!("using CA from {cert_path}");
            return Ok(Arc::new(TlsStore::load_ca(&key_pem, &cert_pem)?));
        }
        let store = generate_store(ca)?;
        store.save_ca(key_path, cert_path)?;
        info!("generated new CA, saved to {cert_path}");
        return Ok(Arc::new(store));
    }
    info!("no CA paths configured, using an ephemeral CA");
    Ok(Arc::new(generate_store(ca)?))
}

fn generate_store(ca: &CaConfig) -> anyhow::Result<TlsStore> {
    Ok(TlsStore::generate_ca(
        &ca.country,
        &ca.state,
        &ca.locality,
        &ca.organization,
        &ca.common_name,
    )?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger_with_env();

    let config = load_config_from_env();
    info!("starting HTTPS intercept proxy on {}", config.listen_addr);

    let tls_store = build_tls_store(&config.ca)?;

    // One transport for all connections; building the trust store per
    // connection would hit the disk on every request.
    let forward_config = config.upstream.forward_config();
    let transport = Arc::new(TcpUpstreamTransport::with_config(forward_config.clone()));

    let server = start_proxy_server(
        move || {
            ForwardHandler::with_transport_and_config(transport.clone(), forward_config.clone())
        },
        &config.listen_addr.ip().to_string(),
        config.listen_addr.port(),
        tls_store.clone(),
    )
    .await?;

    info!(
        "test with: curl --proxy http://{} --cacert <ca.pem> https://example.com/",
        server.local_addr()
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    server.shutdown().await;

    Ok(())
}
