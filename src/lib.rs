//! HTTPS Intercept Proxy - an embeddable HTTPS forward proxy with
//! transparent TLS interception.
//!
//! The proxy accepts HTTP/1.1 client connections, handles ordinary proxied
//! requests and CONNECT tunnels, terminates TLS inside the tunnel with a
//! per-host leaf certificate minted from a local CA, and hands the parsed
//! request to an application-defined [`ProxyHandler`]. The bundled
//! [`ForwardHandler`] completes the MITM loop by relaying requests upstream
//! and streaming responses back through user hooks.

pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod proxy;
pub mod tls;
pub mod utils;

// Re-export commonly used items
pub use config::ProxyConfig;
pub use error::{Error, Result};
pub use http::{Headers, HttpRequest, HttpResponse, Scheme};
pub use logging::{init_logger, init_logger_with_env};
pub use proxy::{
    forward_http_request, start_proxy_server, Connection, ForwardConfig, ForwardHandler,
    ProxyHandler, ProxyServer, TcpUpstreamTransport, UpstreamTransport,
};
pub use tls::TlsStore;
