//! Shared buffer pool and the pooled stream wrappers it lends out.
//!
//! Connections borrow one read buffer and one write buffer for their whole
//! lifetime and hand them back on close. Released buffers are cleared before
//! reuse, and an empty pool falls back to a fresh allocation, so the pool
//! never blocks and never changes what goes over the wire.

use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::sync::{Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::Header;

/// Minimum free space requested from the stream on each read.
const READ_CHUNK: usize = 4 * 1024;

/// Process-wide pool of reusable byte buffers.
///
/// The free list is the only structure in the server that many connection
/// tasks mutate concurrently; it sits behind a mutex held only for a push or pop.
pub struct BufferPool {
    /// Stack of cleared buffers (LIFO for cache locality).
    free_list: Mutex<Vec<BytesMut>>,
    /// Initial capacity of freshly allocated buffers.
    buffer_size: usize,
    /// Maximum number of idle buffers retained.
    capacity: usize,
}

impl BufferPool {
    /// Create an empty pool.
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of idle buffers kept for reuse
    /// * `buffer_size` - Capacity of each newly allocated buffer
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            free_list: Mutex::new(Vec::with_capacity(capacity)),
            buffer_size,
            capacity,
        }
    }

    /// Take a buffer from the pool, allocating if none is idle.
    pub fn acquire(&self) -> BytesMut {
        let reused = self
            .free_list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        reused.unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size))
    }

    /// Return a buffer to the pool.
    ///
    /// The buffer is cleared first. Buffers that grew far past the configured
    /// size, or that arrive while the pool is full, are dropped.
    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() > self.buffer_size.saturating_mul(4) {
            return;
        }
        let mut free_list = self.free_list.lock().unwrap_or_else(PoisonError::into_inner);
        if free_list.len() < self.capacity {
            free_list.push(buf);
        }
    }

    /// Lend a buffered reader over `inner`.
    pub fn reader<R>(&self, inner: R) -> PooledReader<R> {
        PooledReader {
            inner,
            buf: self.acquire(),
        }
    }

    /// Lend a buffered writer over `inner`.
    pub fn writer<W>(&self, inner: W) -> PooledWriter<W> {
        PooledWriter {
            inner,
            buf: self.acquire(),
        }
    }

    /// Take back a reader's buffer, detaching it from its stream.
    ///
    /// Unconsumed bytes are discarded.
    pub fn reclaim_reader<R>(&self, reader: PooledReader<R>) -> R {
        self.release(reader.buf);
        reader.inner
    }

    /// Take back a writer's buffer, detaching it from its stream.
    pub fn reclaim_writer<W>(&self, writer: PooledWriter<W>) -> W {
        self.release(writer.buf);
        writer.inner
    }

    /// Initial capacity of freshly allocated buffers.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Maximum number of idle buffers retained.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of idle buffers ready for reuse.
    pub fn available(&self) -> usize {
        self.free_list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Buffered reader backed by a pooled buffer.
///
/// All reads are cancel safe: bytes pulled from the stream stay in the
/// buffer until a complete request for them can be satisfied, so dropping a
/// read future on a deadline never loses data.
pub struct PooledReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> PooledReader<R> {
    /// Number of bytes read from the stream but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Wait until at least one byte is available, without consuming it.
    ///
    /// End of stream is reported as [`io::ErrorKind::UnexpectedEof`].
    pub async fn peek(&mut self) -> io::Result<&[u8]> {
        if self.buf.is_empty() {
            self.fill().await?;
        }
        Ok(&self.buf[..])
    }

    /// Fill `dst` completely, consuming exactly `dst.len()` bytes.
    pub async fn read_exact(&mut self, dst: &mut [u8]) -> io::Result<()> {
        while self.buf.len() < dst.len() {
            self.fill().await?;
        }
        dst.copy_from_slice(&self.buf[..dst.len()]);
        self.buf.advance(dst.len());
        Ok(())
    }

    /// Consume exactly `len` bytes into an owned buffer.
    ///
    /// The bytes are copied out so the pooled allocation stays with the reader.
    pub async fn read_bytes(&mut self, len: usize) -> io::Result<Bytes> {
        while self.buf.len() < len {
            self.fill().await?;
        }
        let out = Bytes::copy_from_slice(&self.buf[..len]);
        self.buf.advance(len);
        Ok(out)
    }

    async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(READ_CHUNK);
        let n = self.inner.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed by peer",
            ));
        }
        Ok(n)
    }
}

/// Buffered writer backed by a pooled buffer.
pub struct PooledWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> PooledWriter<W> {
    /// Write one header and body as a single buffered write, then flush.
    pub async fn write_frame(&mut self, header: &Header, body: &[u8]) -> io::Result<()> {
        self.buf.clear();
        header.encode_into(&mut self.buf);
        self.buf.extend_from_slice(body);
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await
    }

    /// Shut down the write side of the stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
