//! The envelope: unit exchanged over the cross-context transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PostlinkError, Result, WireError};
use crate::origin::ContextId;

/// Message kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MsgKind {
    /// Delivery confirmation for an id; stops the sender's retry loop.
    Ack,
    /// Named operation invocation.
    Request,
    /// Successful result for a REQUEST or, with no data, a bare completion.
    Response,
    /// Failure result; `data` carries a [`WireError`].
    ErrorResponse,
    /// Remote function invocation (token + args); not routed through the
    /// listener registry.
    Call,
    /// Successful result for a CALL.
    CallResponse,
}

/// Relay metadata stamped on envelopes that travel through a bridge.
///
/// The sender sets `target`; the relay overwrites `origin_context` and
/// `origin_domain` with the identity it observed on the transport, so the
/// final recipient validates against the true original sender rather than
/// the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeMeta {
    /// Final destination the relay should forward to.
    pub target: ContextId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_context: Option<ContextId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_domain: Option<String>,
}

/// The unit exchanged over the transport.
///
/// `id` is unique within the lifetime of the process that generated it;
/// responses always echo the `id` of the request they answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    pub id: String,
    pub kind: MsgKind,
    /// Operation name; present for REQUEST.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Structured payload; may contain function-reference tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Origin claimed by the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_domain: Option<String>,
    /// Whether the receiver should confirm delivery with an ACK.
    #[serde(default)]
    pub ack_requested: bool,
    /// Present when the envelope is (to be) relayed through a bridge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_meta: Option<BridgeMeta>,
}

impl Envelope {
    /// Delivery confirmation for `id`. ACKs are never themselves acked.
    pub fn ack(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            kind: MsgKind::Ack,
            name: None,
            data: None,
            source_domain: None,
            ack_requested: false,
            bridge_meta: None,
        }
    }

    /// Failure answer for `id`, carrying the reduced error descriptor.
    pub fn error_response(id: &str, err: &WireError) -> Self {
        let data = serde_json::to_value(err).unwrap_or(Value::Null);
        Self {
            id: id.to_owned(),
            kind: MsgKind::ErrorResponse,
            name: None,
            data: Some(data),
            source_domain: None,
            ack_requested: true,
            bridge_meta: None,
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| PostlinkError::Internal(format!("envelope encode failed: {e}")))
    }

    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| PostlinkError::BadEnvelope(e.to_string()))
    }

    /// Parse the [`WireError`] out of an ERROR_RESPONSE payload. A payload
    /// that does not parse is reported as an internal error rather than
    /// trusted blindly.
    pub fn wire_error(&self) -> PostlinkError {
        match &self.data {
            Some(v) => match serde_json::from_value::<WireError>(v.clone()) {
                Ok(w) => w.into(),
                Err(e) => {
                    tracing::warn!(id = %self.id, "unparseable error response payload");
                    PostlinkError::Internal(format!("unparseable error response: {e}"))
                }
            },
            None => PostlinkError::Internal("empty error response".into()),
        }
    }
}
