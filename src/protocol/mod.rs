//! Wire protocol: fixed header, whole-frame I/O and path envelopes.

pub mod envelope;
pub mod frame;
pub mod header;

pub use envelope::{RequestEnvelope, ResponseEnvelope, STATUS_ERR, STATUS_OK};
pub use frame::{read_message, write_message};
pub use header::{Header, CODE_SUCCESS, HEADER_SIZE, MAGIC, MAX_BODY_SIZE, VERSION};
