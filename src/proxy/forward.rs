//! Forwarding proxy handler
//!
//! Completes the MITM picture: opens an upstream connection through a
//! pluggable transport, relays the request with hop-by-hop headers stripped,
//! and streams the response back through the response-processing hooks.

use crate::error::{Error, Result};
use crate::http::{
    encode_chunk, is_hop_by_hop_header, read_response, BodyFraming, BodyReader, ParseError,
    LAST_CHUNK,
};
use crate::proxy::handler::{Connection, ProxyHandler};
use async_trait::async_trait;
use rustls::{ClientConfig, RootCertStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Stream type produced by upstream transports.
pub trait UpstreamIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> UpstreamIo for T {}

/// Timeouts the forward handler applies to upstream operations.
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub dns_timeout: Duration,
    pub connect_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub idle_read_timeout: Duration,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            dns_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            tls_handshake_timeout: Duration::from_secs(10),
            idle_read_timeout: Duration::from_secs(60),
        }
    }
}

/// Abstract upstream connector: given an endpoint, produce a byte stream.
///
/// The built-in [`TcpUpstreamTransport`] speaks raw TCP plus rustls with the
/// system trust store. Substituting a transport is how callers control the
/// upstream TLS fingerprint, retries, or routing; the client's own TLS
/// fingerprint is never preserved.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn connect(&self, host: &str, port: u16, tls: bool) -> Result<Box<dyn UpstreamIo>>;
}

/// Default transport: DNS resolution, TCP connect and an optional TLS client
/// handshake, each under its own timeout.
pub struct TcpUpstreamTransport {
    tls_config: Arc<ClientConfig>,
    config: ForwardConfig,
}

impl TcpUpstreamTransport {
    pub fn new() -> Self {
        Self::with_config(ForwardConfig::default())
    }

    pub fn with_config(config: ForwardConfig) -> Self {
        Self {
            tls_config: Arc::new(system_trust_config()),
            config,
        }
    }

    /// Uses a caller-supplied rustls client configuration, e.g. with a
    /// custom verifier or extra trust anchors.
    pub fn with_tls_config(tls_config: Arc<ClientConfig>, config: ForwardConfig) -> Self {
        Self { tls_config, config }
    }
}

impl Default for TcpUpstreamTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// A rustls client config rooted in the system trust store. An empty store
/// is tolerated so the proxy still runs in minimal environments; upstream
/// TLS connections will then fail per-connection instead.
fn system_trust_config() -> ClientConfig {
    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let mut added = 0;
            for cert in certs {
                if roots.add(&rustls::Certificate(cert.0)).is_ok() {
                    added += 1;
                }
            }
            debug!("loaded {added} system root certificates");
        }
        Err(err) => {
            warn!("could not load system root certificates: {err}");
        }
    }
    ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

#[async_trait]
impl UpstreamTransport for TcpUpstreamTransport {
    async fn connect(&self, host: &str, port: u16, tls: bool) -> Result<Box<dyn UpstreamIo>> {
        let addrs: Vec<SocketAddr> = timeout(self.config.dns_timeout, lookup_host((host, port)))
            .await
            .map_err(|_| Error::Timeout {
                operation: "upstream DNS resolution",
            })?
            .map_err(|source| Error::UpstreamResolve {
                host: host.to_string(),
                source,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(Error::UpstreamResolve {
                host: host.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "hostname resolved to no addresses",
                ),
            });
        }

        let stream = timeout(self.config.connect_timeout, connect_any(&addrs))
            .await
            .map_err(|_| Error::Timeout {
                operation: "upstream connect",
            })?
            .map_err(|source| Error::UpstreamConnect {
                host: host.to_string(),
                port,
                source,
            })?;

        if !tls {
            return Ok(Box::new(stream));
        }

        let server_name = rustls::ServerName::try_from(host).map_err(|_| Error::UpstreamTls {
            host: host.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid server name"),
        })?;
        let connector = TlsConnector::from(self.tls_config.clone());
        let tls_stream = timeout(
            self.config.tls_handshake_timeout,
            connector.connect(server_name, stream),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: "upstream TLS handshake",
        })?
        .map_err(|source| Error::UpstreamTls {
            host: host.to_string(),
            source,
        })?;
        Ok(Box::new(tls_stream))
    }
}

async fn connect_any(addrs: &[SocketAddr]) -> std::io::Result<TcpStream> {
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_error = Some(err),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses to connect to")
    }))
}

/// Ready-made forwarding handler: its `on_request_received` dispatches the
/// request upstream. Handlers that want forwarding combined with their own
/// hooks call [`forward_http_request`] from their `on_request_received`.
pub struct ForwardHandler {
    transport: Arc<dyn UpstreamTransport>,
    config: ForwardConfig,
}

impl ForwardHandler {
    /// A handler with the built-in TCP transport. Building the system trust
    /// store is not free; prefer constructing one transport per proxy and
    /// sharing it through [`ForwardHandler::with_transport`].
    pub fn new() -> Self {
        Self::with_transport(Arc::new(TcpUpstreamTransport::new()))
    }

    pub fn with_transport(transport: Arc<dyn UpstreamTransport>) -> Self {
        Self {
            transport,
            config: ForwardConfig::default(),
        }
    }

    pub fn with_transport_and_config(
        transport: Arc<dyn UpstreamTransport>,
        config: ForwardConfig,
    ) -> Self {
        Self { transport, config }
    }
}

impl Default for ForwardHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyHandler for ForwardHandler {
    async fn on_request_received(&mut self, conn: &mut Connection) -> anyhow::Result<()> {
        let transport = self.transport.clone();
        let config = self.config.clone();
        forward_http_request(self, conn, transport.as_ref(), &config).await?;
        Ok(())
    }
}

/// Forwards the connection's request through `transport` and streams the
/// response back, invoking the handler's response hooks.
///
/// `on_response_complete` fires exactly once, on success and on failure.
pub async fn forward_http_request<H>(
    handler: &mut H,
    conn: &mut Connection,
    transport: &dyn UpstreamTransport,
    config: &ForwardConfig,
) -> Result<()>
where
    H: ProxyHandler + ?Sized,
{
    let result = forward_inner(handler, conn, transport, config).await;
    let completion = handler
        .on_response_complete()
        .await
        .map_err(Error::from_hook);
    result.and(completion)
}

async fn forward_inner<H>(
    handler: &mut H,
    conn: &mut Connection,
    transport: &dyn UpstreamTransport,
    config: &ForwardConfig,
) -> Result<()>
where
    H: ProxyHandler + ?Sized,
{
    let (host, port, tls) = {
        let request = conn.request();
        (request.host.clone(), request.port, request.scheme.is_tls())
    };
    debug!(
        "forwarding {} {} to {host}:{port} (tls={tls})",
        conn.request().method,
        conn.request().origin_form()
    );

    let upstream = transport.connect(&host, port, tls).await?;
    let (upstream_read, upstream_write) = tokio::io::split(upstream);
    let mut upstream_reader = BufReader::new(upstream_read);
    let mut upstream_writer = upstream_write;

    let upstream_gone = |source: std::io::Error| Error::UpstreamConnect {
        host: host.clone(),
        port,
        source,
    };

    // Request head: origin-form request line plus headers with hop-by-hop
    // fields stripped. A chunked client body is re-framed, so the chunked
    // declaration is restored after the strip and any Content-Length the
    // client sent alongside it is dropped (RFC 7230 §3.3.3).
    let request_chunked = matches!(conn.request().body_framing(), BodyFraming::Chunked);
    let mut head = format!(
        "{} {} HTTP/1.1\r\n",
        conn.request().method,
        conn.request().origin_form()
    )
    .into_bytes();
    {
        let headers = &conn.request().headers;
        for (name, value) in headers.iter() {
            if is_hop_by_hop_header(name, headers) {
                continue;
            }
            if request_chunked && name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
    }
    if request_chunked {
        head.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
    }
    head.extend_from_slice(b"\r\n");
    upstream_writer.write_all(&head).await.map_err(upstream_gone)?;

    while let Some(chunk) = conn.read_request_body().await? {
        if request_chunked {
            upstream_writer
                .write_all(&encode_chunk(&chunk))
                .await
                .map_err(upstream_gone)?;
        } else {
            upstream_writer.write_all(&chunk).await.map_err(upstream_gone)?;
        }
    }
    if request_chunked {
        upstream_writer
            .write_all(LAST_CHUNK)
            .await
            .map_err(upstream_gone)?;
    }
    upstream_writer.flush().await.map_err(upstream_gone)?;

    // Response head.
    let mut response = timeout(config.idle_read_timeout, read_response(&mut upstream_reader))
        .await
        .map_err(|_| Error::Timeout {
            operation: "upstream response read",
        })?
        .map_err(upstream_parse_error)?;
    debug!("upstream response: {} {}", response.status, response.reason);

    handler
        .on_response_received(&mut response)
        .await
        .map_err(Error::from_hook)?;

    // Framing towards the client: declared framing is preserved unless the
    // handler announced a length-changing chunk hook, which forces chunked.
    let upstream_framing = response.body_framing();
    let rewrite = handler.rewrites_response_body()
        && !matches!(upstream_framing, BodyFraming::Empty);
    let client_chunked = rewrite || matches!(upstream_framing, BodyFraming::Chunked);

    let mut head = response.status_line().into_bytes();
    {
        let headers = &response.headers;
        for (name, value) in headers.iter() {
            if is_hop_by_hop_header(name, headers) {
                continue;
            }
            if client_chunked && name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
    }
    if client_chunked {
        head.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
    }
    head.extend_from_slice(b"\r\n");
    conn.write_response(&head);
    conn.flush_response().await?;
    conn.set_response(response);

    // Body: decode per upstream framing, run every chunk through the hook,
    // re-emit per client framing. Writes are flushed per chunk so a slow
    // client backpressures the upstream read.
    let mut body = BodyReader::new(upstream_framing);
    loop {
        let chunk = timeout(
            config.idle_read_timeout,
            body.next_chunk(&mut upstream_reader),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: "upstream body read",
        })?
        .map_err(upstream_parse_error)?;
        let Some(chunk) = chunk else { break };

        let processed = handler
            .on_response_chunk(chunk)
            .await
            .map_err(Error::from_hook)?;
        if processed.is_empty() {
            continue;
        }
        if client_chunked {
            conn.write_response(&encode_chunk(&processed));
        } else {
            conn.write_response(&processed);
        }
        conn.flush_response().await?;
    }
    if client_chunked {
        conn.write_response(LAST_CHUNK);
    }
    conn.flush_response().await?;

    let _ = upstream_writer.shutdown().await;
    Ok(())
}

/// Upstream protocol violations and torn connections both map to 502.
fn upstream_parse_error(err: ParseError) -> Error {
    Error::UpstreamProtocol(err)
}
