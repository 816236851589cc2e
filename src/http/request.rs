//! HTTP/1.1 request reader

use crate::http::body::framing_from_headers;
use crate::http::{
    read_crlf_line, read_header_block, BodyFraming, Headers, LineError, ParseError,
    MAX_LINE_BYTES,
};
use std::fmt;
use tokio::io::AsyncBufRead;
use url::Url;

/// Empty lines tolerated before the request line (RFC 7230 §3.5).
const MAX_LEADING_EMPTY_LINES: usize = 32;

/// The scheme a request is effectively served under, derived from how it
/// reached the proxy: plain absolute-form requests are `http`, anything
/// inside a CONNECT tunnel is `https`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Scheme::Https)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed HTTP/1.1 request. Headers are frozen once body streaming begins;
/// the body itself is consumed through the owning connection, at most once.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    /// The request target exactly as it appeared on the request line.
    pub target: String,
    pub version: String,
    pub headers: Headers,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    origin_form: String,
    framing: BodyFraming,
}

impl HttpRequest {
    /// The origin-form target (`/path?query`) used when forwarding upstream.
    pub fn origin_form(&self) -> &str {
        if self.origin_form.is_empty() {
            "/"
        } else {
            &self.origin_form
        }
    }

    pub fn body_framing(&self) -> BodyFraming {
        self.framing
    }

    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    /// Reconstructs the absolute URL of the request from scheme, host and
    /// origin-form target. The port is omitted when it is the scheme default.
    pub fn url(&self) -> String {
        if self.port == self.scheme.default_port() {
            format!("{}://{}{}", self.scheme, self.host, self.origin_form())
        } else {
            format!(
                "{}://{}:{}{}",
                self.scheme,
                self.host,
                self.port,
                self.origin_form()
            )
        }
    }

    /// Rebinds a request parsed inside a CONNECT tunnel to the tunnel's
    /// endpoint: the scheme becomes `https` and the port is inherited from
    /// the CONNECT authority.
    pub(crate) fn mark_tunneled(&mut self, port: u16) {
        self.scheme = Scheme::Https;
        self.port = port;
    }
}

/// Parses a request line and header block from `reader` and derives body
/// framing. The body bytes are left unread on the stream.
pub async fn read_request<R>(reader: &mut R) -> Result<HttpRequest, ParseError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let line = read_request_line(reader).await?;
    let line = String::from_utf8(line)
        .map_err(|err| ParseError::InvalidRequestLine(err.to_string()))?;

    let mut parts = line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(method), Some(target), Some(version), None) => (method, target, version),
        _ => return Err(ParseError::InvalidRequestLine(line.clone())),
    };
    if !super::headers::is_token(method) {
        return Err(ParseError::InvalidRequestLine(line.clone()));
    }
    if version != "HTTP/1.1" {
        return Err(ParseError::UnsupportedVersion(version.to_string()));
    }

    let headers = read_header_block(reader).await?;
    if headers.all("host").count() > 1 {
        return Err(ParseError::DuplicateHost);
    }

    let (scheme, host, port, origin_form) = resolve_target(method, target, &headers)?;
    let framing = framing_from_headers(&headers)?;

    Ok(HttpRequest {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
        scheme,
        host,
        port,
        origin_form,
        framing,
    })
}

async fn read_request_line<R>(reader: &mut R) -> Result<Vec<u8>, ParseError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    for _ in 0..=MAX_LEADING_EMPTY_LINES {
        let line = match read_crlf_line(reader, MAX_LINE_BYTES).await {
            Ok(Some(line)) => line,
            Ok(None) => return Err(ParseError::ConnectionClosed),
            Err(LineError::TooLong) => return Err(ParseError::RequestTooLarge),
            Err(LineError::Eof) => return Err(ParseError::ConnectionClosed),
            Err(LineError::Io(err)) => return Err(ParseError::Io(err)),
        };
        if !line.is_empty() {
            return Ok(line);
        }
    }
    Err(ParseError::InvalidRequestLine(
        "too many leading empty lines".to_string(),
    ))
}

fn resolve_target(
    method: &str,
    target: &str,
    headers: &Headers,
) -> Result<(Scheme, String, u16, String), ParseError> {
    if method == "CONNECT" {
        let (host, port) = split_host_port(target)
            .ok_or_else(|| ParseError::InvalidRequestLine(target.to_string()))?;
        if host.is_empty() {
            return Err(ParseError::InvalidRequestLine(target.to_string()));
        }
        return Ok((
            Scheme::Https,
            host.to_string(),
            port.unwrap_or(Scheme::Https.default_port()),
            String::new(),
        ));
    }

    // Origin-form first: a target starting with '/' is never absolute-form,
    // even when a query parameter carries a literal "://".
    if target.starts_with('/') || target == "*" {
        let authority = headers.first("host").ok_or(ParseError::MissingHost)?;
        let (host, port) = split_host_port(authority)
            .ok_or_else(|| ParseError::InvalidHeaderLine(authority.to_string()))?;
        if host.is_empty() {
            return Err(ParseError::InvalidHeaderLine(authority.to_string()));
        }
        return Ok((
            Scheme::Http,
            host.to_string(),
            port.unwrap_or(Scheme::Http.default_port()),
            target.to_string(),
        ));
    }

    if target.contains("://") {
        let url = Url::parse(target)
            .map_err(|_| ParseError::InvalidRequestLine(target.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| ParseError::InvalidRequestLine(target.to_string()))?
            .to_string();
        let port = url.port().unwrap_or(Scheme::Http.default_port());
        let mut origin_form = url.path().to_string();
        if let Some(query) = url.query() {
            origin_form.push('?');
            origin_form.push_str(query);
        }
        return Ok((Scheme::Http, host, port, origin_form));
    }

    Err(ParseError::InvalidRequestLine(target.to_string()))
}

/// Splits `host[:port]`, accepting bracketed IPv6 literals. A bare IPv6
/// address without brackets is treated as a host with no port.
fn split_host_port(authority: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let after = &rest[end + 1..];
        if after.is_empty() {
            return Some((host, None));
        }
        let port = after.strip_prefix(':')?.parse().ok()?;
        return Some((host, Some(port)));
    }
    match authority.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => Some((authority, None)),
        Some((host, port)) => {
            let port = port.parse().ok()?;
            Some((host, Some(port)))
        }
        None => Some((authority, None)),
    }
}
