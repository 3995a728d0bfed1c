//! Error types shared by the framing, dispatch and client layers.
//!
//! Two families live here:
//! - [`Status`]: message-level failures that are reported back to the peer
//!   with a stable numeric code. They never close the connection on their own.
//! - [`FrameError`]: stream-level failures raised while reading or writing a
//!   frame. [`FrameError::is_broken`] tells the connection loop whether the
//!   byte stream is still usable.

use std::io;
use thiserror::Error;

/// Reserved status reported to the peer.
///
/// Numeric codes are part of the wire contract. Code `0` is never a status;
/// it always means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Status {
    /// The path-addressed envelope could not be decoded.
    #[error("invalid request")]
    InvalidRequest,
    /// No handler is registered for the requested path.
    #[error("invalid path")]
    InvalidPath,
    /// No handler is registered for the requested code.
    #[error("invalid action")]
    InvalidAction,
    /// The handler panicked.
    #[error("internal error")]
    Internal,
    /// The handler produced more bytes than a single frame can carry.
    #[error("response too large")]
    ResponseTooLarge,
}

impl Status {
    /// Every defined status, in code order.
    pub const ALL: [Status; 5] = [
        Status::InvalidRequest,
        Status::InvalidPath,
        Status::InvalidAction,
        Status::Internal,
        Status::ResponseTooLarge,
    ];

    /// Stable wire code for this status.
    pub const fn code(self) -> u16 {
        match self {
            Status::InvalidRequest => 1001,
            Status::InvalidPath => 1002,
            Status::InvalidAction => 1003,
            Status::Internal => 1004,
            Status::ResponseTooLarge => 1005,
        }
    }

    /// Look up a status by its wire code.
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Human-readable message sent alongside the code.
    pub fn message(self) -> &'static str {
        match self {
            Status::InvalidRequest => "invalid request",
            Status::InvalidPath => "invalid path",
            Status::InvalidAction => "invalid action",
            Status::Internal => "internal error",
            Status::ResponseTooLarge => "response too large",
        }
    }
}

/// Failure while reading or writing a single frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Underlying stream failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Peer closed the stream before a full frame arrived.
    #[error("peer closed the stream")]
    Closed,

    /// Deadline expired before any byte of a new message arrived.
    #[error("timed out waiting for a message")]
    Idle,

    /// Deadline expired after a message had started arriving, or during a write.
    #[error("timed out mid-frame")]
    Timeout,

    /// Header carried a foreign magic or an unsupported version.
    #[error("malformed header (magic {magic:#010x}, version {version})")]
    MalformedHeader {
        /// Magic received.
        magic: u32,
        /// Version received.
        version: u16,
    },

    /// Body does not fit in the 16-bit length field. Nothing was written.
    #[error("body of {0} bytes exceeds the frame limit")]
    TooLarge(usize),
}

impl FrameError {
    /// Whether the stream is desynchronized or gone and must be closed.
    ///
    /// Only an idle timeout (no bytes of a new message seen) and an oversized
    /// outgoing body (rejected before any byte hit the wire) leave the stream
    /// intact.
    pub fn is_broken(&self) -> bool {
        !matches!(self, FrameError::Idle | FrameError::TooLarge(_))
    }
}

/// Errors surfaced by [`crate::client::Client`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// Stream setup failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Frame exchange failed.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Request envelope could not be encoded.
    #[error("envelope encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Response envelope could not be decoded.
    #[error("envelope decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// An earlier exchange failed mid-flight; replies can no longer be
    /// matched to requests.
    #[error("connection broken by an earlier failed call, reconnect")]
    Broken,

    /// Server answered with an error.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Header-level code (`0` when the handler itself failed).
        code: u16,
        /// Error text from the response envelope.
        message: String,
    },
}

impl ClientError {
    /// The reserved status carried by a remote error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            ClientError::Remote { code, .. } => Status::from_code(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(Status::InvalidRequest.code(), 1001);
        assert_eq!(Status::InvalidPath.code(), 1002);
        assert_eq!(Status::InvalidAction.code(), 1003);
        assert_eq!(Status::Internal.code(), 1004);
        assert_eq!(Status::ResponseTooLarge.code(), 1005);
    }

    #[test]
    fn test_status_from_code() {
        for status in Status::ALL {
            assert_eq!(Status::from_code(status.code()), Some(status));
        }
        assert_eq!(Status::from_code(0), None);
        assert_eq!(Status::from_code(42), None);
    }

    #[test]
    fn test_status_display_matches_message() {
        assert_eq!(Status::InvalidPath.to_string(), "invalid path");
        for status in Status::ALL {
            assert_eq!(status.to_string(), status.message());
        }
    }

    #[test]
    fn test_broken_classification() {
        assert!(!FrameError::Idle.is_broken());
        assert!(!FrameError::TooLarge(70_000).is_broken());
        assert!(FrameError::Closed.is_broken());
        assert!(FrameError::Timeout.is_broken());
        assert!(FrameError::MalformedHeader {
            magic: 0,
            version: 0
        }
        .is_broken());
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(FrameError::from(reset).is_broken());
    }
}
