//! Buffered transport shared by the client and upstream sides.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::http::parser::ParseError;

/// Read granularity; also the largest body chunk held in memory per hop.
pub const READ_CHUNK: usize = 8192;

/// Upper bound on a request or response head.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HeadError {
    #[error("i/o error while reading message head: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed in the middle of a message head")]
    Truncated,
    #[error("message head exceeds {MAX_HEAD_SIZE} bytes")]
    TooLarge,
    #[error("{0}")]
    Parse(ParseError),
}

/// A byte stream with a read buffer in front of it.
///
/// Bytes read past the end of one message stay buffered for the next one, so
/// a single `HttpStream` carries a whole keep-alive connection.
#[derive(Debug)]
pub struct HttpStream<S> {
    io: S,
    read_buf: BytesMut,
}

impl<S> HttpStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.io
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.read_buf
    }

    /// Reads whatever is available into the buffer. `Ok(0)` means EOF.
    ///
    /// Cancel safe: an interrupted read loses no data.
    pub async fn fill_buf(&mut self) -> io::Result<usize> {
        self.read_buf.reserve(READ_CHUNK);
        self.io.read_buf(&mut self.read_buf).await
    }

    /// Removes up to `max` buffered bytes.
    pub fn take(&mut self, max: usize) -> Bytes {
        let n = max.min(self.read_buf.len());
        self.read_buf.split_to(n).freeze()
    }

    pub fn consume(&mut self, n: usize) {
        let _ = self.read_buf.split_to(n.min(self.read_buf.len()));
    }

    /// Reads until `parse` yields a complete head.
    ///
    /// Returns `Ok(None)` when the peer closed the connection before sending
    /// a single byte of a new message.
    pub async fn read_head<T>(
        &mut self,
        parse: fn(&[u8]) -> Result<(T, usize), ParseError>,
    ) -> Result<Option<T>, HeadError> {
        loop {
            if !self.read_buf.is_empty() {
                match parse(&self.read_buf) {
                    Ok((head, consumed)) => {
                        self.consume(consumed);
                        return Ok(Some(head));
                    }
                    Err(ParseError::Incomplete) => {
                        if self.read_buf.len() > MAX_HEAD_SIZE {
                            return Err(HeadError::TooLarge);
                        }
                    }
                    Err(e) => return Err(HeadError::Parse(e)),
                }
            }

            if self.fill_buf().await? == 0 {
                return if self.read_buf.is_empty() {
                    Ok(None)
                } else {
                    Err(HeadError::Truncated)
                };
            }
        }
    }

    /// Resolves once the peer has closed its side of the connection or the
    /// connection failed.
    ///
    /// Anything the peer sends meanwhile (a pipelined request) is kept in the
    /// buffer. Once [`MAX_HEAD_SIZE`] bytes are waiting the stream stops
    /// reading and this future never resolves.
    pub async fn closed(&mut self) {
        loop {
            if self.read_buf.len() >= MAX_HEAD_SIZE {
                std::future::pending::<()>().await;
            }
            match self.fill_buf().await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.io.write_all(buf).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.io.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.io.shutdown().await
    }
}
