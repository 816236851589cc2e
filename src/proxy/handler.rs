//! Per-connection proxy state machine and handler hooks
//!
//! Each accepted client socket is driven by [`serve_connection`]: it reads
//! the first request, distinguishes absolute-form requests from CONNECT
//! tunnels, performs the MITM TLS upgrade for the latter, and hands the
//! effective request to a user-supplied [`ProxyHandler`]. The handler only
//! supplies hooks; the state machine owns the sockets and closes them on
//! every exit path.

use crate::error::{Error, Result};
use crate::http::{read_request, BodyReader, HttpRequest, HttpResponse, ParseError, Scheme};
use crate::tls::TlsStore;
use crate::utils::PrefixedStream;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error};

/// Lifecycle hooks for one proxied connection. All methods default to no-ops
/// so implementers override only what they need; an error returned from any
/// hook aborts the connection through the user-handler error policy.
#[async_trait]
pub trait ProxyHandler: Send {
    /// Called once per connection as soon as the outer request is parsed,
    /// before any TLS upgrade.
    async fn on_client_connected(&mut self, request: &HttpRequest) -> anyhow::Result<()> {
        let _ = request;
        Ok(())
    }

    /// Called once the effective request is available: the outer request for
    /// plain proxying, the decrypted inner request for CONNECT tunnels.
    ///
    /// The base implementation does not forward anything; write a response
    /// through [`Connection::write_response`] or use
    /// [`crate::proxy::forward_http_request`].
    async fn on_request_received(&mut self, conn: &mut Connection) -> anyhow::Result<()> {
        let _ = conn;
        Ok(())
    }

    /// Called with the parsed upstream response head before it is serialized
    /// to the client. Header mutations here are reflected on the wire.
    async fn on_response_received(&mut self, response: &mut HttpResponse) -> anyhow::Result<()> {
        let _ = response;
        Ok(())
    }

    /// Called for every upstream body chunk; the returned bytes are written
    /// to the client. Returning an empty buffer emits nothing.
    async fn on_response_chunk(&mut self, chunk: Bytes) -> anyhow::Result<Bytes> {
        Ok(chunk)
    }

    /// Handlers whose [`Self::on_response_chunk`] may change the body length
    /// must return `true` so the response is re-framed as chunked before the
    /// first chunk is written.
    fn rewrites_response_body(&self) -> bool {
        false
    }

    /// Called exactly once per forwarded exchange, after the response has
    /// been fully relayed or forwarding has failed.
    async fn on_response_complete(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once for any error that terminates the connection.
    async fn on_error(&mut self, error: &Error) {
        error!("connection error: {error}");
    }
}

/// One client connection with its effective request parsed. Owns both stream
/// halves for the lifetime of the connection; dropping it closes the socket.
pub struct Connection {
    reader: Box<dyn AsyncBufRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    request: HttpRequest,
    response: Option<HttpResponse>,
    body: BodyReader,
    write_buf: Vec<u8>,
    response_started: bool,
}

impl Connection {
    fn new(
        reader: Box<dyn AsyncBufRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        request: HttpRequest,
    ) -> Self {
        let body = BodyReader::new(request.body_framing());
        Self {
            reader,
            writer,
            request,
            response: None,
            body,
            write_buf: Vec::new(),
            response_started: false,
        }
    }

    /// The effective request being served.
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut HttpRequest {
        &mut self.request
    }

    /// The upstream response head, once the forward handler has parsed it.
    pub fn response(&self) -> Option<&HttpResponse> {
        self.response.as_ref()
    }

    pub(crate) fn set_response(&mut self, response: HttpResponse) {
        self.response = Some(response);
    }

    pub fn host(&self) -> &str {
        &self.request.host
    }

    pub fn scheme(&self) -> Scheme {
        self.request.scheme
    }

    /// Yields the next chunk of the request body, `None` at its end. The
    /// body is a single-pass stream and cannot be restarted.
    pub async fn read_request_body(&mut self) -> Result<Option<Bytes>> {
        self.body
            .next_chunk(&mut self.reader)
            .await
            .map_err(client_stream_error)
    }

    /// Buffers response bytes; nothing reaches the socket until
    /// [`Self::flush_response`] runs.
    pub fn write_response(&mut self, data: &[u8]) {
        self.write_buf.extend_from_slice(data);
    }

    /// Writes the buffered response bytes to the socket and flushes it.
    pub async fn flush_response(&mut self) -> Result<()> {
        if !self.write_buf.is_empty() {
            self.response_started = true;
            let buf = std::mem::take(&mut self.write_buf);
            self.writer.write_all(&buf).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Whether any response bytes have already reached the wire.
    pub fn response_started(&self) -> bool {
        self.response_started
    }

    /// Replaces any pending unflushed output with the minimal response for
    /// `error`, when its policy assigns one.
    fn stage_error_response(&mut self, error: &Error) {
        if let Some(bytes) = render_error_response(error) {
            self.write_buf.clear();
            self.write_buf.extend_from_slice(&bytes);
        }
    }

    async fn finish(&mut self) {
        let _ = self.flush_response().await;
        let _ = self.writer.shutdown().await;
    }
}

/// Serves one accepted client stream to completion. All errors are caught
/// here: the error policy response is written when applicable, `on_error`
/// fires once, and the sockets are closed before the task ends.
pub async fn serve_connection<H, S>(mut handler: H, stream: S, tls: Arc<TlsStore>)
where
    H: ProxyHandler,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    if let Err(error) = drive(&mut handler, stream, &tls).await {
        handler.on_error(&error).await;
    }
}

async fn drive<H, S>(handler: &mut H, stream: S, tls: &TlsStore) -> Result<()>
where
    H: ProxyHandler + ?Sized,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut stream = BufReader::new(stream);

    let outer = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(err) => {
            let error = client_stream_error(err);
            respond_and_close(&mut stream, &error).await;
            return Err(error);
        }
    };
    debug!("client request: {} {}", outer.method, outer.target);

    if let Err(err) = handler.on_client_connected(&outer).await {
        let error = Error::from_hook(err);
        respond_and_close(&mut stream, &error).await;
        return Err(error);
    }

    let mut conn = if outer.is_connect() {
        // The 200 goes out before any TLS, even if the handshake then fails.
        accept_tunnel(stream, &outer, tls).await?
    } else {
        let leftover = stream.buffer().to_vec();
        let inner = stream.into_inner();
        let (read_half, write_half) = tokio::io::split(PrefixedStream::new(leftover, inner));
        Connection::new(Box::new(BufReader::new(read_half)), Box::new(write_half), outer)
    };

    match handler.on_request_received(&mut conn).await {
        Ok(()) => {
            conn.finish().await;
            Ok(())
        }
        Err(err) => {
            let error = Error::from_hook(err);
            if !conn.response_started() {
                conn.stage_error_response(&error);
            }
            conn.finish().await;
            Err(error)
        }
    }
}

/// CONNECT branch: acknowledge the tunnel, terminate TLS with a leaf minted
/// for the CONNECT host, and parse the request inside the tunnel.
async fn accept_tunnel<S>(
    mut stream: BufReader<S>,
    outer: &HttpRequest,
    tls: &TlsStore,
) -> Result<Connection>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    stream.flush().await?;

    let config = tls.server_config_for(&outer.host).await?;
    let leftover = stream.buffer().to_vec();
    let inner = stream.into_inner();
    let acceptor = TlsAcceptor::from(config);
    let tls_stream = acceptor
        .accept(PrefixedStream::new(leftover, inner))
        .await
        .map_err(Error::TlsHandshake)?;
    debug!("TLS established inside tunnel to {}", outer.host);

    let (read_half, write_half) = tokio::io::split(tls_stream);
    let mut reader: Box<dyn AsyncBufRead + Send + Unpin> = Box::new(BufReader::new(read_half));
    let mut writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);

    let mut request = match read_request(&mut *reader).await {
        Ok(request) => request,
        Err(err) => {
            let error = client_stream_error(err);
            if let Some(bytes) = render_error_response(&error) {
                let _ = writer.write_all(&bytes).await;
                let _ = writer.flush().await;
            }
            let _ = writer.shutdown().await;
            return Err(error);
        }
    };
    request.mark_tunneled(outer.port);
    Ok(Connection::new(reader, writer, request))
}

/// Maps parse failures on the client stream: stream teardown becomes
/// `ClientDisconnected`, protocol violations stay parse errors.
pub(crate) fn client_stream_error(err: ParseError) -> Error {
    match err {
        ParseError::Io(source) => Error::Io(source),
        ParseError::ConnectionClosed | ParseError::UnexpectedEof => Error::ClientDisconnected,
        other => Error::ClientParse(other),
    }
}

/// The minimal wire response for an error, when its policy assigns a status.
fn render_error_response(error: &Error) -> Option<Vec<u8>> {
    let (status, reason) = error.response_status()?;
    let body = format!("{reason}\r\n");
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    );
    Some(response.into_bytes())
}

async fn respond_and_close<W: AsyncWrite + Unpin>(writer: &mut W, error: &Error) {
    if let Some(bytes) = render_error_response(error) {
        let _ = writer.write_all(&bytes).await;
        let _ = writer.flush().await;
    }
    let _ = writer.shutdown().await;
}
