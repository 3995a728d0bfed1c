//! Request and response envelopes for the path-addressed convention.
//!
//! Envelopes are MessagePack maps with named fields:
//! ```text
//! request:  { "path": str, "req": bin }
//! response: { "code": 0 (OK) | 1 (ERR), "rsp": bin | nil, "err": str | nil }
//! ```
//!
//! Always encoded with `to_vec_named` so structs travel as maps, which keeps
//! them readable by non-Rust peers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Envelope status meaning the handler succeeded.
pub const STATUS_OK: u8 = 0;

/// Envelope status meaning the request failed.
pub const STATUS_ERR: u8 = 1;

/// Path-addressed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Handler key.
    pub path: String,
    /// Opaque request body.
    pub req: Bytes,
}

impl RequestEnvelope {
    /// Build a request for `path`.
    pub fn new(path: impl Into<String>, req: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            req: req.into(),
        }
    }

    /// Encode to MessagePack.
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Decode from MessagePack.
    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Path-addressed response: either a body or an error message, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireResponse", try_from = "WireResponse")]
pub enum ResponseEnvelope {
    /// Handler succeeded.
    Ok(Bytes),
    /// Handler or server failed.
    Err(String),
}

impl ResponseEnvelope {
    /// Encode to MessagePack.
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Decode from MessagePack.
    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }

    /// Envelope status code.
    pub fn code(&self) -> u8 {
        match self {
            ResponseEnvelope::Ok(_) => STATUS_OK,
            ResponseEnvelope::Err(_) => STATUS_ERR,
        }
    }

    /// Convert into a standard result.
    pub fn into_result(self) -> Result<Bytes, String> {
        match self {
            ResponseEnvelope::Ok(rsp) => Ok(rsp),
            ResponseEnvelope::Err(err) => Err(err),
        }
    }
}

impl<E: std::fmt::Display> From<Result<Bytes, E>> for ResponseEnvelope {
    fn from(result: Result<Bytes, E>) -> Self {
        match result {
            Ok(rsp) => ResponseEnvelope::Ok(rsp),
            Err(e) => ResponseEnvelope::Err(e.to_string()),
        }
    }
}

/// On-the-wire shape of a response.
#[derive(Serialize, Deserialize)]
struct WireResponse {
    code: u8,
    #[serde(default)]
    rsp: Option<Bytes>,
    #[serde(default)]
    err: Option<String>,
}

impl From<ResponseEnvelope> for WireResponse {
    fn from(envelope: ResponseEnvelope) -> Self {
        match envelope {
            ResponseEnvelope::Ok(rsp) => WireResponse {
                code: STATUS_OK,
                rsp: Some(rsp),
                err: None,
            },
            ResponseEnvelope::Err(err) => WireResponse {
                code: STATUS_ERR,
                rsp: None,
                err: Some(err),
            },
        }
    }
}

impl TryFrom<WireResponse> for ResponseEnvelope {
    type Error = String;

    fn try_from(wire: WireResponse) -> Result<Self, Self::Error> {
        match (wire.code, wire.rsp, wire.err) {
            (STATUS_OK, Some(rsp), _) => Ok(ResponseEnvelope::Ok(rsp)),
            (STATUS_OK, None, _) => Err("OK response without rsp".to_string()),
            (STATUS_ERR, _, Some(err)) => Ok(ResponseEnvelope::Err(err)),
            (STATUS_ERR, _, None) => Err("ERR response without err".to_string()),
            (code, _, _) => Err(format!("unknown response code {code}")),
        }
    }
}
