//! Message body framing: lazy, single-pass chunk decoding and chunked
//! re-encoding shared by the request and response paths.

use crate::http::{read_crlf_line, Headers, LineError, ParseError, MAX_LINE_BYTES};
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound on a single decoded body chunk handed to consumers.
pub const MAX_CHUNK_SIZE: usize = 4096;

/// The terminating chunk of a chunked stream, with no trailers.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// How the remaining bytes of a message body are delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the header block.
    Empty,
    /// Exactly this many bytes follow.
    ContentLength(u64),
    /// A chunked stream terminated by a zero-sized chunk.
    Chunked,
    /// Bytes until the peer closes the connection (HTTP/1.0 style).
    UntilEof,
}

/// Determines request-style framing: chunked wins, then a consistent
/// `Content-Length`, otherwise no body.
pub(crate) fn framing_from_headers(headers: &Headers) -> Result<BodyFraming, ParseError> {
    let chunked = headers
        .all("transfer-encoding")
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Ok(BodyFraming::Chunked);
    }

    let mut declared: Option<u64> = None;
    for value in headers.all("content-length") {
        for piece in value.split(',') {
            let piece = piece.trim();
            if piece.is_empty() || !piece.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::InvalidContentLength(piece.to_string()));
            }
            let length = piece
                .parse::<u64>()
                .map_err(|_| ParseError::InvalidContentLength(piece.to_string()))?;
            match declared {
                Some(previous) if previous != length => {
                    return Err(ParseError::ConflictingContentLength)
                }
                _ => declared = Some(length),
            }
        }
    }
    Ok(match declared {
        Some(length) => BodyFraming::ContentLength(length),
        None => BodyFraming::Empty,
    })
}

/// Encodes one chunk of a chunked transfer: hex size line, payload, CRLF.
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

#[derive(Debug)]
enum State {
    Fixed { remaining: u64 },
    ChunkHeader,
    ChunkData { remaining: u64 },
    Eof,
    Done,
}

/// Decodes a message body from a buffered stream as a sequence of byte
/// chunks. Single-pass and not restartable: once `next_chunk` returns
/// `None` the body is fully consumed.
#[derive(Debug)]
pub struct BodyReader {
    state: State,
}

impl BodyReader {
    pub fn new(framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::Empty | BodyFraming::ContentLength(0) => State::Done,
            BodyFraming::ContentLength(length) => State::Fixed { remaining: length },
            BodyFraming::Chunked => State::ChunkHeader,
            BodyFraming::UntilEof => State::Eof,
        };
        Self { state }
    }

    /// Whether the body has been drained to its end marker.
    pub fn is_consumed(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Yields the next decoded chunk, at most [`MAX_CHUNK_SIZE`] bytes, or
    /// `None` at the end of the body. Chunked trailers are consumed and
    /// discarded.
    pub async fn next_chunk<R>(&mut self, reader: &mut R) -> Result<Option<Bytes>, ParseError>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        loop {
            match self.state {
                State::Done => return Ok(None),
                State::Fixed { remaining } => {
                    let chunk = read_capped(reader, remaining).await?;
                    let remaining = remaining - chunk.len() as u64;
                    self.state = if remaining == 0 {
                        State::Done
                    } else {
                        State::Fixed { remaining }
                    };
                    return Ok(Some(chunk));
                }
                State::ChunkHeader => {
                    let size = self.read_chunk_size(reader).await?;
                    if size == 0 {
                        self.drain_trailers(reader).await?;
                        self.state = State::Done;
                        return Ok(None);
                    }
                    self.state = State::ChunkData { remaining: size };
                }
                State::ChunkData { remaining } => {
                    let chunk = read_capped(reader, remaining).await?;
                    let remaining = remaining - chunk.len() as u64;
                    if remaining == 0 {
                        let mut crlf = [0u8; 2];
                        reader.read_exact(&mut crlf).await.map_err(|err| {
                            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                                ParseError::UnexpectedEof
                            } else {
                                ParseError::Io(err)
                            }
                        })?;
                        if &crlf != b"\r\n" {
                            return Err(ParseError::InvalidChunk(
                                "chunk data not terminated by CRLF".to_string(),
                            ));
                        }
                        self.state = State::ChunkHeader;
                    } else {
                        self.state = State::ChunkData { remaining };
                    }
                    return Ok(Some(chunk));
                }
                State::Eof => {
                    let available = reader.fill_buf().await?;
                    if available.is_empty() {
                        self.state = State::Done;
                        return Ok(None);
                    }
                    let take = available.len().min(MAX_CHUNK_SIZE);
                    let chunk = Bytes::copy_from_slice(&available[..take]);
                    reader.consume(take);
                    return Ok(Some(chunk));
                }
            }
        }
    }

    async fn read_chunk_size<R>(&mut self, reader: &mut R) -> Result<u64, ParseError>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        let line = match read_crlf_line(reader, MAX_LINE_BYTES).await {
            Ok(Some(line)) => line,
            Ok(None) | Err(LineError::Eof) => return Err(ParseError::UnexpectedEof),
            Err(LineError::TooLong) => {
                return Err(ParseError::InvalidChunk("chunk size line too long".to_string()))
            }
            Err(LineError::Io(err)) => return Err(ParseError::Io(err)),
        };
        let line = String::from_utf8_lossy(&line);
        // Chunk extensions after ';' are ignored.
        let size = line.split(';').next().unwrap_or("").trim();
        u64::from_str_radix(size, 16)
            .map_err(|_| ParseError::InvalidChunk(format!("bad chunk size {size:?}")))
    }

    async fn drain_trailers<R>(&mut self, reader: &mut R) -> Result<(), ParseError>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        loop {
            match read_crlf_line(reader, MAX_LINE_BYTES).await {
                Ok(Some(line)) if line.is_empty() => return Ok(()),
                Ok(Some(_)) => continue,
                Ok(None) | Err(LineError::Eof) => return Err(ParseError::UnexpectedEof),
                Err(LineError::TooLong) => {
                    return Err(ParseError::InvalidChunk("trailer line too long".to_string()))
                }
                Err(LineError::Io(err)) => return Err(ParseError::Io(err)),
            }
        }
    }
}

/// Reads up to `min(remaining, MAX_CHUNK_SIZE)` bytes without blocking past
/// what the stream already has. Errors on EOF because callers only invoke it
/// with bytes still owed by the peer.
async fn read_capped<R>(reader: &mut R, remaining: u64) -> Result<Bytes, ParseError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let available = reader.fill_buf().await?;
    if available.is_empty() {
        return Err(ParseError::UnexpectedEof);
    }
    let cap = remaining.min(MAX_CHUNK_SIZE as u64) as usize;
    let take = available.len().min(cap);
    let chunk = Bytes::copy_from_slice(&available[..take]);
    reader.consume(take);
    Ok(chunk)
}
