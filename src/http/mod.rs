//! HTTP/1.1 wire handling: header collection, request/response readers and
//! body framing. Everything here operates on buffered async byte streams and
//! surfaces typed parse failures; policy lives in the proxy layer.

pub mod body;
pub mod headers;
pub mod request;
pub mod response;

pub use body::{encode_chunk, BodyFraming, BodyReader, LAST_CHUNK};
pub use headers::{is_hop_by_hop_header, Headers};
pub use request::{read_request, HttpRequest, Scheme};
pub use response::{read_response, HttpResponse};

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Hard cap on a single request or status line.
pub const MAX_LINE_BYTES: usize = 8 * 1024;
/// Hard cap on an entire header block.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Typed parse failure. All parse failures terminate the connection.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("request line exceeds {MAX_LINE_BYTES} bytes")]
    RequestTooLarge,

    #[error("header block exceeds {MAX_HEADER_BYTES} bytes")]
    HeadersTooLarge,

    #[error("unsupported protocol version {0:?}")]
    UnsupportedVersion(String),

    #[error("invalid request line {0:?}")]
    InvalidRequestLine(String),

    #[error("invalid status line {0:?}")]
    InvalidStatusLine(String),

    #[error("invalid header line {0:?}")]
    InvalidHeaderLine(String),

    #[error("duplicate Host header")]
    DuplicateHost,

    #[error("request has no Host header")]
    MissingHost,

    #[error("invalid Content-Length value {0:?}")]
    InvalidContentLength(String),

    #[error("conflicting Content-Length values")]
    ConflictingContentLength,

    #[error("invalid chunk framing: {0}")]
    InvalidChunk(String),

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("connection closed before a message was received")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) enum LineError {
    TooLong,
    /// Stream ended in the middle of a line.
    Eof,
    Io(std::io::Error),
}

/// Reads one CRLF-terminated line, without the terminator. A bare LF is
/// accepted as a terminator too. Returns `None` on a clean EOF before any
/// byte of the line was read.
pub(crate) async fn read_crlf_line<R>(
    reader: &mut R,
    limit: usize,
) -> Result<Option<Vec<u8>>, LineError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line: Vec<u8> = Vec::new();
    loop {
        let available = match reader.fill_buf().await {
            Ok(buf) => buf,
            Err(err) => return Err(LineError::Io(err)),
        };
        if available.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(LineError::Eof);
        }
        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            line.extend_from_slice(&available[..pos]);
            reader.consume(pos + 1);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.len() > limit {
                return Err(LineError::TooLong);
            }
            return Ok(Some(line));
        }
        line.extend_from_slice(available);
        let consumed = available.len();
        reader.consume(consumed);
        if line.len() > limit {
            return Err(LineError::TooLong);
        }
    }
}

/// Reads header lines until the empty line that terminates the block.
///
/// Handles obsolete line folding by appending the folded content to the
/// previous value with a single space. The total size of the block is capped
/// at [`MAX_HEADER_BYTES`].
pub(crate) async fn read_header_block<R>(reader: &mut R) -> Result<Headers, ParseError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut headers = Headers::new();
    let mut total = 0usize;
    loop {
        let budget = MAX_HEADER_BYTES - total;
        let line = match read_crlf_line(reader, budget).await {
            Ok(Some(line)) => line,
            Ok(None) => return Err(ParseError::UnexpectedEof),
            Err(LineError::TooLong) => return Err(ParseError::HeadersTooLarge),
            Err(LineError::Eof) => return Err(ParseError::UnexpectedEof),
            Err(LineError::Io(err)) => return Err(ParseError::Io(err)),
        };
        if line.is_empty() {
            return Ok(headers);
        }
        total += line.len() + 2;
        if total > MAX_HEADER_BYTES {
            return Err(ParseError::HeadersTooLarge);
        }

        let line = String::from_utf8(line)
            .map_err(|err| ParseError::InvalidHeaderLine(err.to_string()))?;

        if line.starts_with(' ') || line.starts_with('\t') {
            // Obsolete line folding: continuation of the previous value.
            let folded = line.trim_matches(|c| c == ' ' || c == '\t');
            match headers.last_value_mut() {
                Some(value) => {
                    value.push(' ');
                    value.push_str(folded);
                }
                None => return Err(ParseError::InvalidHeaderLine(line)),
            }
            continue;
        }

        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value),
            None => return Err(ParseError::InvalidHeaderLine(line)),
        };
        if !headers::is_token(name) {
            return Err(ParseError::InvalidHeaderLine(line.clone()));
        }
        let value = value.trim_matches(|c| c == ' ' || c == '\t');
        headers.append(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    fn reader(data: &[u8]) -> BufReader<Cursor<Vec<u8>>> {
        BufReader::new(Cursor::new(data.to_vec()))
    }

    #[tokio::test]
    async fn reads_crlf_and_bare_lf_lines() {
        let mut r = reader(b"first\r\nsecond\nthird");
        assert_eq!(
            read_crlf_line(&mut r, 64).await.ok().flatten(),
            Some(b"first".to_vec())
        );
        assert_eq!(
            read_crlf_line(&mut r, 64).await.ok().flatten(),
            Some(b"second".to_vec())
        );
        assert!(matches!(
            read_crlf_line(&mut r, 64).await,
            Err(LineError::Eof)
        ));
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let mut r = reader(b"");
        assert!(read_crlf_line(&mut r, 64).await.ok().flatten().is_none());
    }

    #[tokio::test]
    async fn line_limit_is_enforced() {
        let mut r = reader(&[b'a'; 128]);
        assert!(matches!(
            read_crlf_line(&mut r, 64).await,
            Err(LineError::TooLong)
        ));
    }

    #[tokio::test]
    async fn header_block_roundtrip() {
        let wire = b"Host: example.test\r\nAccept: */*\r\n\r\n";
        let mut r = reader(wire);
        let headers = read_header_block(&mut r).await.unwrap();
        assert_eq!(headers.to_wire(), wire.to_vec());
    }

    #[tokio::test]
    async fn folded_header_lines_are_joined() {
        let mut r = reader(b"X-Long: first\r\n  second\r\n\tthird\r\n\r\n");
        let headers = read_header_block(&mut r).await.unwrap();
        assert_eq!(headers.first("x-long"), Some("first second third"));
    }

    #[tokio::test]
    async fn header_without_colon_is_rejected() {
        let mut r = reader(b"not-a-header\r\n\r\n");
        assert!(matches!(
            read_header_block(&mut r).await,
            Err(ParseError::InvalidHeaderLine(_))
        ));
    }

    #[tokio::test]
    async fn header_name_with_space_is_rejected() {
        let mut r = reader(b"Bad Name: value\r\n\r\n");
        assert!(matches!(
            read_header_block(&mut r).await,
            Err(ParseError::InvalidHeaderLine(_))
        ));
    }
}
