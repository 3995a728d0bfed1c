//! Handler registries for both dispatch conventions.
//!
//! Registries are filled before the server starts and are read-only while
//! connections are being served.
//!
//! # Example
//!
//! ```
//! use vsock_serve::handler::{CodeRegistry, PathRegistry};
//!
//! let mut paths = PathRegistry::new();
//! paths.register("/echo", |req: &[u8]| Ok(req.to_vec()));
//! assert!(paths.get("/echo").is_some());
//!
//! let mut codes = CodeRegistry::new();
//! codes.register(7, |_code, body: &[u8]| body.to_vec());
//! assert!(codes.get(7).is_some());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

/// Error returned by a path handler. Its `Display` is sent to the peer.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for path handlers.
pub type HandlerResult = Result<Vec<u8>, HandlerError>;

/// Path-addressed handler: request bytes in, response bytes or error out.
pub type PathHandler = Arc<dyn Fn(&[u8]) -> HandlerResult + Send + Sync>;

/// Code-addressed handler: header code and body in, raw response bytes out.
pub type CodeHandler = Arc<dyn Fn(u16, &[u8]) -> Vec<u8> + Send + Sync>;

/// Registry mapping paths to handlers.
#[derive(Default, Clone)]
pub struct PathRegistry {
    handlers: HashMap<String, PathHandler>,
}

impl PathRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `path`.
    pub fn register<F>(&mut self, path: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&[u8]) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers.insert(path.into(), Arc::new(handler));
        self
    }

    /// Look up the handler for `path`.
    pub fn get(&self, path: &str) -> Option<&PathHandler> {
        self.handlers.get(path)
    }

    /// Registered paths, in no particular order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Registry mapping header codes to handlers.
///
/// Code `0` is the success marker and cannot be used as a dispatch key.
#[derive(Default, Clone)]
pub struct CodeRegistry {
    handlers: HashMap<u16, CodeHandler>,
}

impl CodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `code`.
    ///
    /// Registrations for code `0` are ignored.
    pub fn register<F>(&mut self, code: u16, handler: F) -> &mut Self
    where
        F: Fn(u16, &[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        if code == crate::protocol::CODE_SUCCESS {
            tracing::warn!("ignoring handler registered for reserved code 0");
            return self;
        }
        self.handlers.insert(code, Arc::new(handler));
        self
    }

    /// Look up the handler for `code`.
    pub fn get(&self, code: u16) -> Option<&CodeHandler> {
        self.handlers.get(&code)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
