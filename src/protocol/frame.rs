//! Reading and writing whole frames.
//!
//! A frame is a [`Header`] followed by exactly `header.length` body bytes.
//! Failures are classified with [`FrameError::is_broken`]: only a deadline that
//! expires before any byte of a new message arrived leaves the stream usable.

use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use super::header::{Header, HEADER_SIZE, MAX_BODY_SIZE};
use crate::error::FrameError;
use crate::runtime::buffer::{PooledReader, PooledWriter};
use crate::runtime::deadline::with_deadline;

/// Read one complete frame.
///
/// The header is validated before any body byte is consumed, so a foreign
/// header never causes body bytes to be reinterpreted as a new frame.
pub async fn read_message<R>(
    reader: &mut PooledReader<R>,
    deadline: Option<Instant>,
) -> Result<(Header, Bytes), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_SIZE];
    let read = with_deadline(deadline, reader.read_exact(&mut raw)).await;
    match read {
        Ok(result) => result.map_err(classify_io)?,
        Err(_) if reader.buffered() == 0 => return Err(FrameError::Idle),
        Err(_) => return Err(FrameError::Timeout),
    }

    let header = Header::decode(&raw)?;

    let read = with_deadline(deadline, reader.read_bytes(header.length as usize)).await;
    let body = match read {
        Ok(result) => result.map_err(classify_io)?,
        Err(_) => return Err(FrameError::Timeout),
    };

    Ok((header, body))
}

/// Write one frame and flush it.
///
/// `header.length` is taken from `body`. Bodies over [`MAX_BODY_SIZE`] are
/// rejected before anything is written; any other failure is broken.
pub async fn write_message<W>(
    writer: &mut PooledWriter<W>,
    header: Header,
    body: &[u8],
    deadline: Option<Instant>,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_BODY_SIZE {
        return Err(FrameError::TooLarge(body.len()));
    }
    let header = Header {
        length: body.len() as u16,
        ..header
    };

    match with_deadline(deadline, writer.write_frame(&header, body)).await {
        Ok(result) => result.map_err(classify_io),
        Err(_) => Err(FrameError::Timeout),
    }
}

fn classify_io(e: io::Error) -> FrameError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => FrameError::Closed,
        _ => FrameError::Io(e),
    }
}
