//! Proxy connection handling

pub mod forward;
pub mod handler;
pub mod server;

pub use forward::{
    forward_http_request, ForwardConfig, ForwardHandler, TcpUpstreamTransport, UpstreamIo,
    UpstreamTransport,
};
pub use handler::{serve_connection, Connection, ProxyHandler};
pub use server::{start_proxy_server, ProxyServer};
