//! Control protocol wire format.
//!
//! Newline-delimited JSON over a unix stream. One request frame gets exactly
//! one response frame, matched by `id`:
//!
//! ```text
//! -> {"id":1,"method":"stop","body":{}}
//! <- {"status":"ok","id":1,"body":{}}
//! <- {"status":"error","id":1,"message":"..."}
//! ```

use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LinesCodec};

use crate::error::ProtocolError;

/// Upper bound for a single frame. Control messages are tiny.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Control operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Stop,
    Wait,
}

/// Message with no fields, used as both argument and result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: Method,
    #[serde(default)]
    pub body: Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Ok { id: u64, body: Empty },
    Error { id: u64, message: String },
}

impl Response {
    pub fn ok(id: u64) -> Self {
        Response::Ok { id, body: Empty {} }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Response::Error {
            id,
            message: message.into(),
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Response::Ok { id, .. } | Response::Error { id, .. } => *id,
        }
    }
}

/// Wrap a unix stream in the line framing used by both ends.
pub fn framed(stream: UnixStream) -> Framed<UnixStream, LinesCodec> {
    Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN))
}

pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a request frame.
///
/// On failure the error still carries the request id when the frame was
/// valid JSON with a numeric `id`, so the reply can be matched by the caller.
pub fn decode_request(line: &str) -> Result<Request, ProtocolError> {
    serde_json::from_str(line).map_err(|source| {
        let id = serde_json::from_str::<serde_json::Value>(line)
            .ok()
            .and_then(|value| value.get("id").and_then(serde_json::Value::as_u64))
            .unwrap_or(0);
        ProtocolError::Malformed { id, source }
    })
}

pub fn decode_response(line: &str) -> Result<Response, ProtocolError> {
    Ok(serde_json::from_str(line)?)
}
