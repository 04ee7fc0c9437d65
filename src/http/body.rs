//! Message body framing.
//!
//! A body is decoded from one connection chunk by chunk and re-encoded onto
//! the other, so at most one chunk per direction is ever held in memory.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::http::headers::HeaderMap;
use crate::http::parser::ParseError;
use crate::http::request::{Method, RequestHead};
use crate::http::response::ResponseHead;
use crate::http::stream::{HttpStream, MAX_HEAD_SIZE, READ_CHUNK};

const MAX_CHUNK_LINE: usize = 4096;

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body at all.
    Empty,
    /// Exactly this many bytes (`Content-Length`).
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Everything until the sender closes the connection (responses only).
    CloseDelimited,
}

impl Framing {
    /// Whether the end of the body can be found without closing the
    /// connection.
    pub fn is_self_delimiting(&self) -> bool {
        !matches!(self, Framing::CloseDelimited)
    }
}

/// Determines request body framing.
///
/// Requests carrying both `Transfer-Encoding` and `Content-Length`, more than
/// one distinct length, or a transfer coding other than a final `chunked` are
/// rejected.
pub fn request_framing(head: &RequestHead) -> Result<Framing, ParseError> {
    if head.headers.contains("Transfer-Encoding") {
        if head.headers.contains("Content-Length") || !is_chunked_final(&head.headers) {
            return Err(ParseError::InvalidTransferEncoding);
        }
        return Ok(Framing::Chunked);
    }

    match content_length(&head.headers)? {
        Some(n) => Ok(Framing::Length(n)),
        None => Ok(Framing::Empty),
    }
}

/// Determines response body framing given the method of the request that
/// produced it.
pub fn response_framing(method: &Method, head: &ResponseHead) -> Result<Framing, ParseError> {
    if *method == Method::HEAD || head.status.is_bodyless() {
        return Ok(Framing::Empty);
    }

    if head.headers.contains("Transfer-Encoding") {
        return Ok(if is_chunked_final(&head.headers) {
            Framing::Chunked
        } else {
            Framing::CloseDelimited
        });
    }

    match content_length(&head.headers)? {
        Some(n) => Ok(Framing::Length(n)),
        None => Ok(Framing::CloseDelimited),
    }
}

/// A `Transfer-Encoding` value that is not UTF-8 never counts as chunked.
fn is_chunked_final(headers: &HeaderMap) -> bool {
    let all_utf8 = headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("Transfer-Encoding"))
        .all(|(_, v)| std::str::from_utf8(v).is_ok());
    let last = headers
        .get_all("Transfer-Encoding")
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .last();
    all_utf8 && last.is_some_and(|t| t.eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ParseError> {
    let mut length = None;
    let values = headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
        .map(|(_, v)| std::str::from_utf8(v).map_err(|_| ParseError::InvalidContentLength))
        .collect::<Result<Vec<_>, _>>()?;
    for value in values.iter().flat_map(|v| v.split(',')) {
        let value = value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidContentLength);
        }
        let n = value
            .parse::<u64>()
            .map_err(|_| ParseError::InvalidContentLength)?;
        match length {
            Some(prev) if prev != n => return Err(ParseError::InvalidContentLength),
            _ => length = Some(n),
        }
    }
    Ok(length)
}

#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("i/o error while reading body: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed before the body was complete")]
    UnexpectedEof,
    #[error("malformed chunked encoding: {0}")]
    Malformed(&'static str),
}

#[derive(Debug)]
enum ChunkedState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

#[derive(Debug)]
enum DecoderState {
    Length(u64),
    Chunked(ChunkedState),
    Eof,
    Done,
}

/// Incremental body reader; the cursor of a message body on a connection.
#[derive(Debug)]
pub struct BodyDecoder {
    framing: Framing,
    state: DecoderState,
    trailers: BytesMut,
    received: u64,
}

impl BodyDecoder {
    pub fn new(framing: Framing) -> Self {
        let state = match framing {
            Framing::Empty | Framing::Length(0) => DecoderState::Done,
            Framing::Length(n) => DecoderState::Length(n),
            Framing::Chunked => DecoderState::Chunked(ChunkedState::Size),
            Framing::CloseDelimited => DecoderState::Eof,
        };
        Self {
            framing,
            state,
            trailers: BytesMut::new(),
            received: 0,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, DecoderState::Done)
    }

    /// Body bytes handed out so far, excluding chunk framing.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Raw trailer section of a chunked body (each line CRLF terminated),
    /// available once the body is done.
    pub fn trailers(&self) -> Option<&[u8]> {
        (!self.trailers.is_empty()).then_some(&self.trailers[..])
    }

    /// Next piece of body data, or `None` once the body is complete.
    pub async fn next_chunk<S>(&mut self, io: &mut HttpStream<S>) -> Result<Option<Bytes>, BodyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            match &mut self.state {
                DecoderState::Done => return Ok(None),

                DecoderState::Length(remaining) => {
                    if io.buffered().is_empty() && io.fill_buf().await? == 0 {
                        return Err(BodyError::UnexpectedEof);
                    }
                    let take = (*remaining).min(READ_CHUNK as u64) as usize;
                    let data = io.take(take);
                    *remaining -= data.len() as u64;
                    if *remaining == 0 {
                        self.state = DecoderState::Done;
                    }
                    self.received += data.len() as u64;
                    return Ok(Some(data));
                }

                DecoderState::Eof => {
                    if io.buffered().is_empty() && io.fill_buf().await? == 0 {
                        self.state = DecoderState::Done;
                        return Ok(None);
                    }
                    let data = io.take(READ_CHUNK);
                    self.received += data.len() as u64;
                    return Ok(Some(data));
                }

                DecoderState::Chunked(ChunkedState::Size) => {
                    let line = read_line(io, MAX_CHUNK_LINE).await?;
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        DecoderState::Chunked(ChunkedState::Trailers)
                    } else {
                        DecoderState::Chunked(ChunkedState::Data(size))
                    };
                }

                DecoderState::Chunked(ChunkedState::Data(remaining)) => {
                    if io.buffered().is_empty() && io.fill_buf().await? == 0 {
                        return Err(BodyError::UnexpectedEof);
                    }
                    let take = (*remaining).min(READ_CHUNK as u64) as usize;
                    let data = io.take(take);
                    *remaining -= data.len() as u64;
                    if *remaining == 0 {
                        self.state = DecoderState::Chunked(ChunkedState::DataEnd);
                    }
                    self.received += data.len() as u64;
                    return Ok(Some(data));
                }

                DecoderState::Chunked(ChunkedState::DataEnd) => {
                    let line = read_line(io, 2).await?;
                    if !line.is_empty() {
                        return Err(BodyError::Malformed("missing CRLF after chunk data"));
                    }
                    self.state = DecoderState::Chunked(ChunkedState::Size);
                }

                DecoderState::Chunked(ChunkedState::Trailers) => {
                    let line = read_line(io, MAX_CHUNK_LINE).await?;
                    if line.is_empty() {
                        self.state = DecoderState::Done;
                        return Ok(None);
                    }
                    if self.trailers.len() + line.len() > MAX_HEAD_SIZE {
                        return Err(BodyError::Malformed("trailer section too large"));
                    }
                    self.trailers.extend_from_slice(&line);
                    self.trailers.extend_from_slice(b"\r\n");
                }
            }
        }
    }
}

/// Reads one CRLF-terminated line, returning it without the terminator.
async fn read_line<S>(io: &mut HttpStream<S>, max: usize) -> Result<Bytes, BodyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if let Some(pos) = io.buffered().windows(2).position(|w| w == b"\r\n") {
            if pos > max {
                return Err(BodyError::Malformed("line too long"));
            }
            let line = io.take(pos);
            io.consume(2);
            return Ok(line);
        }
        if io.buffered().len() > max + 2 {
            return Err(BodyError::Malformed("line too long"));
        }
        if io.fill_buf().await? == 0 {
            return Err(BodyError::UnexpectedEof);
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, BodyError> {
    let size = line.split(|&b| b == b';').next().unwrap_or_default();
    let size = std::str::from_utf8(size)
        .map_err(|_| BodyError::Malformed("chunk size is not ASCII"))?
        .trim_matches([' ', '\t']);
    // from_str_radix alone would also take a leading sign.
    if size.is_empty() || size.len() > 16 || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(BodyError::Malformed("bad chunk size"));
    }
    u64::from_str_radix(size, 16).map_err(|_| BodyError::Malformed("bad chunk size"))
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("i/o error while writing body: {0}")]
    Io(#[from] io::Error),
    #[error("body does not match its declared length of {declared} bytes")]
    LengthMismatch { declared: u64 },
}

/// Writes body data onto a connection with a given framing.
///
/// A length-framed encoder refuses data past the declared length before
/// writing any of it, and refuses to finish short of it.
#[derive(Debug)]
pub struct BodyEncoder {
    framing: Framing,
    written: u64,
}

impl BodyEncoder {
    pub fn new(framing: Framing) -> Self {
        Self { framing, written: 0 }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write_chunk<S>(&mut self, io: &mut HttpStream<S>, data: &[u8]) -> Result<(), EncodeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if data.is_empty() {
            return Ok(());
        }

        match self.framing {
            Framing::Empty => return Err(EncodeError::LengthMismatch { declared: 0 }),
            Framing::Length(declared) => {
                if self.written + data.len() as u64 > declared {
                    return Err(EncodeError::LengthMismatch { declared });
                }
                io.write_all(data).await?;
            }
            Framing::Chunked => {
                let size_line = format!("{:X}\r\n", data.len());
                let mut frame = Vec::with_capacity(size_line.len() + data.len() + 2);
                frame.extend_from_slice(size_line.as_bytes());
                frame.extend_from_slice(data);
                frame.extend_from_slice(b"\r\n");
                io.write_all(&frame).await?;
            }
            Framing::CloseDelimited => io.write_all(data).await?,
        }

        self.written += data.len() as u64;
        Ok(())
    }

    /// Terminates the body. Trailers are only emitted for chunked bodies.
    pub async fn finish<S>(&mut self, io: &mut HttpStream<S>, trailers: Option<&[u8]>) -> Result<(), EncodeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.framing {
            Framing::Length(declared) if self.written != declared => {
                return Err(EncodeError::LengthMismatch { declared });
            }
            Framing::Chunked => {
                io.write_all(b"0\r\n").await?;
                if let Some(trailers) = trailers {
                    io.write_all(trailers).await?;
                }
                io.write_all(b"\r\n").await?;
            }
            _ => {}
        }
        io.flush().await?;
        Ok(())
    }
}
