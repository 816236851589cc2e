//! Error handling module for the proxy

use crate::http::ParseError;
use thiserror::Error;

/// Custom error type for the proxy. Every variant corresponds to a failure
/// class with a fixed response policy, see [`Error::response_status`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed client request: {0}")]
    ClientParse(#[from] ParseError),

    #[error("TLS handshake with client failed: {0}")]
    TlsHandshake(#[source] std::io::Error),

    #[error("failed to resolve upstream host {host}: {source}")]
    UpstreamResolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to upstream {host}:{port}: {source}")]
    UpstreamConnect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream TLS handshake with {host} failed: {source}")]
    UpstreamTls {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed upstream response: {0}")]
    UpstreamProtocol(#[source] ParseError),

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("handler error: {0}")]
    UserHandler(#[source] anyhow::Error),

    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::RcgenError),

    #[error("invalid CA material: {0}")]
    InvalidCa(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(#[from] rustls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for the proxy
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The status line to answer the client with, or `None` when the
    /// connection is closed without a response (handshake failures and
    /// disconnects, where a response can no longer reach the client).
    pub fn response_status(&self) -> Option<(u16, &'static str)> {
        match self {
            Error::ClientParse(_) => Some((400, "Bad Request")),
            Error::UpstreamResolve { .. }
            | Error::UpstreamConnect { .. }
            | Error::UpstreamTls { .. }
            | Error::UpstreamProtocol(_) => Some((502, "Bad Gateway")),
            Error::Timeout { .. } => Some((504, "Gateway Timeout")),
            Error::UserHandler(_)
            | Error::Certificate(_)
            | Error::InvalidCa(_)
            | Error::TlsConfig(_) => Some((500, "Internal Server Error")),
            Error::TlsHandshake(_) | Error::ClientDisconnected | Error::Io(_) => None,
        }
    }

    /// Recovers a typed proxy error that crossed a user-hook boundary as
    /// `anyhow::Error`; anything else counts as a handler failure.
    pub(crate) fn from_hook(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(err) => err,
            Err(other) => Error::UserHandler(other),
        }
    }
}
