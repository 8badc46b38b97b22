//! Client frame parsing and the bridge-to-client envelope.
//!
//! Clients speak JSON text: every inbound frame is an object carrying a
//! `type` and an `address`, and every outbound delivery is wrapped in an
//! [`Envelope`]. Parsing keeps the raw JSON object alongside the typed
//! view because authorisation forwards the original frame verbatim.

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors fatal to a single client frame.
///
/// A frame error never tears down the session by itself; the transport
/// adapter decides whether to surface it and carry on or disconnect.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload was not valid JSON.
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload was valid JSON but not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,

    /// A mandatory field was absent or null.
    #[error("{0} must be specified for message")]
    MissingField(&'static str),

    /// The `type` field named an unknown operation.
    #[error("invalid type: {0}")]
    InvalidType(String),
}

/// Fields shared by `send` and `publish` frames.
#[derive(Debug)]
pub struct SendFrame {
    /// Destination bus address.
    pub address: String,
    /// Message body. Mandatory on the wire, but its presence is enforced
    /// after the send/publish hook has run, so it is optional here.
    pub body: Option<Value>,
    /// Address the client expects the reply envelope on (`send` only).
    pub reply_address: Option<String>,
    /// Session identifier for rules that require authorisation.
    pub session_id: Option<String>,
}

/// A parsed client frame.
#[derive(Debug)]
pub enum ClientFrame {
    /// Point-to-point message onto the bus.
    Send(SendFrame),
    /// Broadcast message onto the bus.
    Publish(SendFrame),
    /// Subscribe the socket to a bus address.
    Register {
        /// Address to subscribe to.
        address: String,
    },
    /// Drop the socket's subscription to a bus address.
    Unregister {
        /// Address to unsubscribe from.
        address: String,
    },
}

impl ClientFrame {
    /// Parse a raw client frame.
    ///
    /// Returns the typed operation together with the raw JSON object so the
    /// authorisation path can forward the client's frame unmodified.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when the payload is not a JSON object,
    /// `type` or `address` is missing, or `type` is unrecognised.
    pub fn parse(data: &[u8]) -> Result<(Self, Value), ProtocolError> {
        let raw: Value = serde_json::from_slice(data)?;
        let object = raw.as_object().ok_or(ProtocolError::NotAnObject)?;

        let frame_type = mandatory_str(object, "type")?;
        let address = mandatory_str(object, "address")?.to_owned();

        let frame = match frame_type {
            "send" | "publish" => {
                let fields = SendFrame {
                    address,
                    body: object.get("body").filter(|v| !v.is_null()).cloned(),
                    reply_address: optional_str(object, "replyAddress"),
                    session_id: optional_str(object, "sessionID"),
                };
                if frame_type == "send" {
                    Self::Send(fields)
                } else {
                    Self::Publish(fields)
                }
            }
            "register" => Self::Register { address },
            "unregister" => Self::Unregister { address },
            other => return Err(ProtocolError::InvalidType(other.to_owned())),
        };
        Ok((frame, raw))
    }
}

fn mandatory_str<'a>(
    object: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, ProtocolError> {
    object
        .get(field)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField(field))
}

fn optional_str(object: &Map<String, Value>, field: &str) -> Option<String> {
    object.get(field).and_then(Value::as_str).map(str::to_owned)
}

/// Envelope written to the client for deliveries, replies, and denials.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    /// Address the message was delivered on.
    pub address: &'a str,
    /// Message body.
    pub body: &'a Value,
    /// Reply address the client may answer on, when the message expects one.
    #[serde(rename = "replyAddress", skip_serializing_if = "Option::is_none")]
    pub reply_address: Option<&'a str>,
}

impl Envelope<'_> {
    /// Serialize the envelope to its wire form.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if the body cannot be serialized.
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}
