//! Request dispatch strategies.
//!
//! The connection loop is written once against [`Dispatch`]; the two wire
//! conventions plug in underneath it:
//! - [`PathDispatch`]: the body is a [`RequestEnvelope`] and the handler is
//!   selected by its `path`. Every outcome, including lookup failures, is
//!   reported inside a [`ResponseEnvelope`].
//! - [`CodeDispatch`]: the header `code` selects the handler and bodies pass
//!   through untouched. Failures are reported with a status code in the header.
//!
//! Unknown keys are never fatal: they produce a status reply and the
//! connection carries on.

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::error::Status;
use crate::handler::{CodeRegistry, PathRegistry};
use crate::protocol::{Header, RequestEnvelope, ResponseEnvelope, CODE_SUCCESS};

/// What to send back for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Header code: `0` for success, a [`Status`] code otherwise.
    pub code: u16,
    /// Response body.
    pub body: Bytes,
}

impl Reply {
    /// Reply with an explicit header code.
    pub fn new(code: u16, body: impl Into<Bytes>) -> Self {
        Self {
            code,
            body: body.into(),
        }
    }

    /// Successful reply.
    pub fn success(body: impl Into<Bytes>) -> Self {
        Self::new(CODE_SUCCESS, body)
    }

    /// Whether this reply carries the success marker.
    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }
}

/// Strategy that turns one request frame into one reply.
pub trait Dispatch: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Resolve and invoke the handler for a request.
    fn dispatch(&self, header: &Header, body: Bytes) -> Reply;

    /// Report `status` to the peer the way this convention does.
    fn status(&self, status: Status) -> Reply;

    /// Reply to send after a handler panicked, or `None` to close the connection.
    fn recover(&self) -> Option<Reply> {
        None
    }
}

/// Path-addressed dispatch over MessagePack envelopes.
pub struct PathDispatch {
    registry: PathRegistry,
}

impl PathDispatch {
    /// Create a dispatcher over `registry`.
    pub fn new(registry: PathRegistry) -> Self {
        Self { registry }
    }

    fn envelope(code: u16, envelope: ResponseEnvelope) -> Reply {
        match envelope.encode() {
            Ok(bytes) => Reply::new(code, bytes),
            Err(e) => {
                error!(error = %e, "failed to encode response envelope");
                Reply::new(
                    Status::Internal.code(),
                    Bytes::from_static(Status::Internal.message().as_bytes()),
                )
            }
        }
    }
}

impl Dispatch for PathDispatch {
    fn name(&self) -> &'static str {
        "path"
    }

    fn dispatch(&self, _header: &Header, body: Bytes) -> Reply {
        let request = match RequestEnvelope::decode(&body) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "undecodable request envelope");
                return self.status(Status::InvalidRequest);
            }
        };

        let Some(handler) = self.registry.get(&request.path) else {
            warn!(path = %request.path, "no handler for path");
            return self.status(Status::InvalidPath);
        };

        let result = handler(&request.req[..]).map(Bytes::from);
        Self::envelope(CODE_SUCCESS, result.into())
    }

    fn status(&self, status: Status) -> Reply {
        Self::envelope(
            status.code(),
            ResponseEnvelope::Err(status.message().to_string()),
        )
    }

    fn recover(&self) -> Option<Reply> {
        Some(self.status(Status::Internal))
    }
}

/// Code-addressed dispatch over raw bodies.
pub struct CodeDispatch {
    registry: CodeRegistry,
}

impl CodeDispatch {
    /// Create a dispatcher over `registry`.
    pub fn new(registry: CodeRegistry) -> Self {
        Self { registry }
    }
}

impl Dispatch for CodeDispatch {
    fn name(&self) -> &'static str {
        "code"
    }

    fn dispatch(&self, header: &Header, body: Bytes) -> Reply {
        match self.registry.get(header.code) {
            Some(handler) => Reply::success(handler(header.code, &body[..])),
            None => {
                warn!(code = header.code, "no handler for code");
                self.status(Status::InvalidAction)
            }
        }
    }

    fn status(&self, status: Status) -> Reply {
        Reply::new(
            status.code(),
            Bytes::from_static(status.message().as_bytes()),
        )
    }
}
