//! Connection runtime.
//!
//! Building blocks shared by every connection:
//! - `BufferPool`: process-wide pool of read/write buffers
//! - `Dispatch`: strategy turning one request frame into one reply
//! - `Connection`: per-stream state machine driving reads, dispatch and writes
//! - deadline helpers used for idle, read and write timeouts

pub mod buffer;
pub mod connection;
pub mod deadline;
pub mod dispatch;

pub use buffer::BufferPool;
pub use connection::{CloseReason, ConnState, Connection};
pub use dispatch::{CodeDispatch, Dispatch, PathDispatch, Reply};

use std::any::Any;
use std::backtrace::Backtrace;
use tracing::error;

/// Route panics through `tracing` before the previously installed hook runs.
///
/// Handler panics are also caught at the connection boundary; this hook
/// records where they happened, with a backtrace regardless of
/// `RUST_BACKTRACE`.
pub fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        error!(
            location = %location,
            payload = panic_message(panic_info.payload()),
            backtrace = %Backtrace::force_capture(),
            "panic"
        );

        default_hook(panic_info);
    }));
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
