//! Minimal async client for both dispatch conventions.
//!
//! A client owns one stream and performs strictly sequential exchanges:
//! one request frame out, one reply frame in. Once an exchange fails after
//! its request may have reached the wire, the reply stream can no longer be
//! matched to requests and every later call fails with
//! [`ClientError::Broken`].

use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::{ClientError, FrameError};
use crate::protocol::{read_message, write_message, Header, RequestEnvelope, ResponseEnvelope, CODE_SUCCESS};
use crate::runtime::buffer::{BufferPool, PooledReader, PooledWriter};
use crate::runtime::deadline::deadline_after;

const CLIENT_BUFFER_SIZE: usize = 4 * 1024;

/// Client over any byte stream.
pub struct Client<S> {
    reader: PooledReader<ReadHalf<S>>,
    writer: PooledWriter<WriteHalf<S>>,
    timeout: Duration,
    broken: bool,
}

impl Client<TcpStream> {
    /// Connect over TCP.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wrap an established stream.
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let pool = BufferPool::new(0, CLIENT_BUFFER_SIZE);
        Self {
            reader: pool.reader(read_half),
            writer: pool.writer(write_half),
            timeout: Duration::ZERO,
            broken: false,
        }
    }

    /// Bound each exchange by `timeout`. Zero disables the deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Call a path-addressed handler.
    ///
    /// An `ERR` envelope becomes [`ClientError::Remote`] carrying the header
    /// code: `0` when the handler itself failed, a status code when the
    /// server rejected the request.
    pub async fn call(&mut self, path: &str, req: impl Into<Bytes>) -> Result<Bytes, ClientError> {
        let body = RequestEnvelope::new(path, req).encode()?;
        let (header, rsp) = self.exchange(CODE_SUCCESS, &body).await?;

        match ResponseEnvelope::decode(&rsp)? {
            ResponseEnvelope::Ok(bytes) => Ok(bytes),
            ResponseEnvelope::Err(message) => Err(ClientError::Remote {
                code: header.code,
                message,
            }),
        }
    }

    /// Call a code-addressed handler. Returns the reply's header code and body.
    pub async fn call_code(&mut self, code: u16, body: &[u8]) -> Result<(u16, Bytes), ClientError> {
        let (header, rsp) = self.exchange(code, body).await?;
        Ok((header.code, rsp))
    }

    /// Whether a failed exchange left the stream unusable.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Shut down the write side, signalling the server that no more requests follow.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn exchange(&mut self, code: u16, body: &[u8]) -> Result<(Header, Bytes), ClientError> {
        if self.broken {
            return Err(ClientError::Broken);
        }

        let deadline = deadline_after(self.timeout);
        match write_message(&mut self.writer, Header::new(code, 0), body, deadline).await {
            Ok(()) => {}
            // Rejected before any byte was written
            Err(e @ FrameError::TooLarge(_)) => return Err(e.into()),
            Err(e) => {
                self.broken = true;
                return Err(e.into());
            }
        }

        match read_message(&mut self.reader, deadline).await {
            Ok(frame) => Ok(frame),
            Err(e) => {
                self.broken = true;
                // A request is outstanding, so a reply timeout is never idle
                let e = match e {
                    FrameError::Idle => FrameError::Timeout,
                    e => e,
                };
                Err(e.into())
            }
        }
    }
}
