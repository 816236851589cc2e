//! HTTP response reader for upstream replies

use crate::http::body::framing_from_headers;
use crate::http::{
    read_crlf_line, read_header_block, BodyFraming, Headers, LineError, ParseError,
    MAX_LINE_BYTES,
};
use tokio::io::AsyncBufRead;

/// A parsed upstream response head. The body is streamed separately through
/// a [`crate::http::BodyReader`] built from [`HttpResponse::body_framing`].
#[derive(Debug)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    framing: BodyFraming,
}

impl HttpResponse {
    pub fn body_framing(&self) -> BodyFraming {
        self.framing
    }

    /// The status line in wire form, including the trailing CRLF.
    pub fn status_line(&self) -> String {
        if self.reason.is_empty() {
            format!("{} {}\r\n", self.version, self.status)
        } else {
            format!("{} {} {}\r\n", self.version, self.status, self.reason)
        }
    }
}

/// Parses a status line and header block from the upstream stream.
///
/// `HTTP/1.0` responses are accepted; a response with neither
/// `Content-Length` nor chunked framing downgrades to read-until-EOF.
pub async fn read_response<R>(reader: &mut R) -> Result<HttpResponse, ParseError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let line = match read_crlf_line(reader, MAX_LINE_BYTES).await {
        Ok(Some(line)) => line,
        Ok(None) => return Err(ParseError::ConnectionClosed),
        Err(LineError::TooLong) => {
            return Err(ParseError::InvalidStatusLine("status line too long".to_string()))
        }
        Err(LineError::Eof) => return Err(ParseError::UnexpectedEof),
        Err(LineError::Io(err)) => return Err(ParseError::Io(err)),
    };
    let line = String::from_utf8(line)
        .map_err(|err| ParseError::InvalidStatusLine(err.to_string()))?;

    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| ParseError::InvalidStatusLine(line.clone()))?;
    let code = parts
        .next()
        .ok_or_else(|| ParseError::InvalidStatusLine(line.clone()))?;
    let reason = parts.next().unwrap_or("").to_string();

    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(ParseError::UnsupportedVersion(version.to_string()));
    }
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidStatusLine(line.clone()));
    }
    let status: u16 = code
        .parse()
        .map_err(|_| ParseError::InvalidStatusLine(line.clone()))?;

    let headers = read_header_block(reader).await?;

    let framing = match framing_from_headers(&headers)? {
        BodyFraming::Empty if body_forbidden(status) => BodyFraming::Empty,
        BodyFraming::Empty => BodyFraming::UntilEof,
        framing => framing,
    };

    Ok(HttpResponse {
        version: version.to_string(),
        status,
        reason,
        headers,
        framing,
    })
}

fn body_forbidden(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    async fn parse(data: &[u8]) -> Result<HttpResponse, ParseError> {
        let mut reader = BufReader::new(Cursor::new(data.to_vec()));
        read_response(&mut reader).await
    }

    #[tokio::test]
    async fn fixed_length_response() {
        let response = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi")
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.reason, "OK");
        assert_eq!(response.body_framing(), BodyFraming::ContentLength(2));
        assert_eq!(response.status_line(), "HTTP/1.1 200 OK\r\n");
    }

    #[tokio::test]
    async fn reason_phrase_may_contain_spaces() {
        let response = parse(b"HTTP/1.1 404 Not Found\r\n\r\n").await.unwrap();
        assert_eq!(response.reason, "Not Found");
    }

    #[tokio::test]
    async fn missing_reason_is_accepted() {
        let response = parse(b"HTTP/1.1 200\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(response.reason, "");
        assert_eq!(response.status_line(), "HTTP/1.1 200\r\n");
    }

    #[tokio::test]
    async fn http_10_without_framing_reads_until_eof() {
        let response = parse(b"HTTP/1.0 200 OK\r\n\r\nrest").await.unwrap();
        assert_eq!(response.body_framing(), BodyFraming::UntilEof);
    }

    #[tokio::test]
    async fn no_content_statuses_have_empty_bodies() {
        let response = parse(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        assert_eq!(response.body_framing(), BodyFraming::Empty);
        let response = parse(b"HTTP/1.1 304 Not Modified\r\n\r\n").await.unwrap();
        assert_eq!(response.body_framing(), BodyFraming::Empty);
    }

    #[tokio::test]
    async fn chunked_response_framing() {
        let response = parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(response.body_framing(), BodyFraming::Chunked);
    }

    #[tokio::test]
    async fn unsupported_version_is_rejected() {
        assert!(matches!(
            parse(b"HTTP/2 200 OK\r\n\r\n").await,
            Err(ParseError::UnsupportedVersion(_))
        ));
    }

    #[tokio::test]
    async fn garbage_status_line_is_rejected() {
        assert!(matches!(
            parse(b"HTTP/1.1 2x0 OK\r\n\r\n").await,
            Err(ParseError::InvalidStatusLine(_))
        ));
    }
}
