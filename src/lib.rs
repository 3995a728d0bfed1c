//! vsock-serve: a length-prefixed binary protocol server core.
//!
//! Every message is a fixed 10-byte header followed by a body of at most
//! 65535 bytes. Requests are routed either by a string path carried in a
//! MessagePack envelope ([`runtime::PathDispatch`]) or by the header code
//! ([`runtime::CodeDispatch`]).
//!
//! Each accepted stream runs its own [`runtime::Connection`] state machine
//! with independent idle, read and write deadlines; a failing or panicking
//! handler never takes down another connection.

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod protocol;
pub mod runtime;
pub mod server;

pub use client::Client;
pub use error::{ClientError, FrameError, Status};
pub use handler::{CodeRegistry, PathRegistry};
pub use server::{bind, Server, ServerConfig};
