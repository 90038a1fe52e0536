//! Wire protocol: command and reply envelopes.
//!
//! Envelope shape (JSON, one per transport message):
//! `{ "id": "...", "type": "CREATE_REQUEST", "payload": { ... } }`
//!
//! `id` is an opaque caller token echoed verbatim on the reply; it means
//! nothing to this process. `INITIALIZED` carries no id. Parsing is
//! best-effort by design: a malformed envelope becomes an error reply that
//! carries the original text, never a panic across the boundary.

pub mod dispatcher;
pub mod readiness;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Error markers carried in error reply envelopes.
pub mod error_marker {
    pub const NOT_READY: &str = "NOT_READY";
    pub const PROTOCOL_DECODE_ERROR: &str = "PROTOCOL_DECODE_ERROR";
    pub const ENGINE_ERROR: &str = "ENGINE_ERROR";
    pub const UNKNOWN_COMMAND: &str = "UNKNOWN_COMMAND";
    pub const ENVELOPE_PARSE_ERROR: &str = "ENVELOPE_PARSE_ERROR";
    /// Uncaught process fault forwarded as a diagnostic envelope.
    pub const FATAL: &str = "FATAL";
}

/// Client role, first phase: the plaintext grid to encrypt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequestPayload {
    pub grid: Vec<String>,
}

/// Server role: the client's encoded request plus the server's own grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResponsePayload {
    pub request: String,
    pub grid: Vec<String>,
}

/// Client role, second phase: everything needed to finish the handshake.
/// The private key comes back from the caller because this process keeps
/// no session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeIntersectionPayload {
    pub key: String,
    pub response: String,
    pub setup: String,
}

/// A parsed inbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Initialized,
    CreateRequest {
        id: String,
        payload: ClientRequestPayload,
    },
    CreateResponse {
        id: String,
        payload: ServerResponsePayload,
    },
    ComputeIntersection {
        id: String,
        payload: ComputeIntersectionPayload,
    },
}

/// Envelope parse failures, keeping whatever context was extractable.
#[derive(Debug, Error)]
pub enum CommandParseError {
    #[error("malformed envelope: {detail}")]
    Envelope { detail: String },

    #[error("{kind} command is missing its correlation id")]
    MissingId { kind: String },

    #[error("unknown command type: {kind}")]
    UnknownType { kind: String, id: Option<String> },

    #[error("malformed {kind} payload: {detail}")]
    Payload {
        kind: String,
        id: String,
        detail: String,
    },
}

#[derive(Deserialize)]
struct RawEnvelope {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    payload: Option<serde_json::Value>,
}

impl Command {
    /// Parse a raw transport message into a command.
    pub fn parse(raw: &str) -> Result<Command, CommandParseError> {
        let envelope: RawEnvelope =
            serde_json::from_str(raw).map_err(|e| CommandParseError::Envelope {
                detail: e.to_string(),
            })?;
        let kind = envelope.kind.ok_or_else(|| CommandParseError::Envelope {
            detail: "missing type field".to_string(),
        })?;

        match kind.as_str() {
            "INITIALIZED" => Ok(Command::Initialized),
            "CREATE_REQUEST" => {
                let (id, payload) = typed_payload(&kind, envelope.id, envelope.payload)?;
                Ok(Command::CreateRequest { id, payload })
            }
            "CREATE_RESPONSE" => {
                let (id, payload) = typed_payload(&kind, envelope.id, envelope.payload)?;
                Ok(Command::CreateResponse { id, payload })
            }
            "COMPUTE_INTERSECTION" => {
                let (id, payload) = typed_payload(&kind, envelope.id, envelope.payload)?;
                Ok(Command::ComputeIntersection { id, payload })
            }
            _ => Err(CommandParseError::UnknownType {
                kind,
                id: envelope.id,
            }),
        }
    }
}

fn typed_payload<T: DeserializeOwned>(
    kind: &str,
    id: Option<String>,
    payload: Option<serde_json::Value>,
) -> Result<(String, T), CommandParseError> {
    let id = id.ok_or_else(|| CommandParseError::MissingId {
        kind: kind.to_string(),
    })?;
    let value = payload.unwrap_or(serde_json::Value::Null);
    let payload = serde_json::from_value(value).map_err(|e| CommandParseError::Payload {
        kind: kind.to_string(),
        id: id.clone(),
        detail: e.to_string(),
    })?;
    Ok((id, payload))
}

/// Readiness notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializedNotice {
    pub initialized: bool,
}

/// `CreateRequest` result. `context_id` is bookkeeping metadata the caller
/// can use to look up the private key when the server's response arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequestResult {
    pub context_id: String,
    pub private_key: String,
    pub client_request: String,
}

/// `CreateResponse` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerResponseResult {
    pub server_response: String,
    pub server_setup: String,
}

/// `ComputeIntersection` result: indices into the client's original grid,
/// strictly ascending, no duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntersectionResult {
    pub intersection: Vec<u64>,
}

/// Structured error payload for error replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    /// One of the [`error_marker`] constants.
    pub error: String,
    pub message: String,
    /// Original message text, echoed when it could not be parsed at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original: Option<String>,
}

/// An outbound reply envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Reply {
    #[serde(rename = "INITIALIZED")]
    Initialized { payload: InitializedNotice },

    #[serde(rename = "CREATE_REQUEST")]
    CreateRequest {
        id: String,
        payload: ClientRequestResult,
    },

    #[serde(rename = "CREATE_RESPONSE")]
    CreateResponse {
        id: String,
        payload: ServerResponseResult,
    },

    #[serde(rename = "COMPUTE_INTERSECTION")]
    ComputeIntersection {
        id: String,
        payload: IntersectionResult,
    },

    #[serde(rename = "ERROR")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        payload: ErrorNotice,
    },
}

impl Reply {
    /// The readiness notification. Carries no id.
    pub fn initialized() -> Self {
        Reply::Initialized {
            payload: InitializedNotice { initialized: true },
        }
    }

    /// Serialize for transport. Reply envelopes must always make it out, so
    /// a serializer failure degrades to a minimal error envelope instead of
    /// propagating.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({
                "type": "ERROR",
                "payload": {
                    "error": error_marker::FATAL,
                    "message": format!("failed to serialize reply: {}", e),
                }
            })
            .to_string()
        })
    }
}
