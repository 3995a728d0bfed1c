//! Deadline helpers.
//!
//! Timeouts are configured as durations where zero means "no deadline".
//! They are turned into absolute instants at the point the connection loop
//! arms them, so a deadline armed before dispatch keeps counting while the
//! handler runs.

use std::future::Future;
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::{timeout_at, Instant};

/// Absolute deadline `timeout` from now, or `None` when `timeout` is zero.
pub fn deadline_after(timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() {
        None
    } else {
        Some(Instant::now() + timeout)
    }
}

/// Run `fut` to completion, failing with [`Elapsed`] if `deadline` passes first.
pub async fn with_deadline<F: Future>(
    deadline: Option<Instant>,
    fut: F,
) -> Result<F::Output, Elapsed> {
    match deadline {
        Some(at) => timeout_at(at, fut).await,
        None => Ok(fut.await),
    }
}
