//! Phoenix Channels V2 wire envelope.
//!
//! Every message on the socket is one text frame carrying a JSON array:
//! `[join_ref, ref, topic, event, payload]`. Absent refs are `null`.
//!
//! Reserved events:
//! - `phx_join`: Join a channel topic
//! - `phx_leave`: Leave a channel topic
//! - `phx_reply`: Server reply to a client request
//! - `phx_close`: Channel closed by the server
//! - `phx_error`: Channel crashed on the server
//! - `heartbeat`: Keep connection alive (topic: "phoenix")

use crate::error::ChannelError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

/// Join a topic.
pub const EVENT_JOIN: &str = "phx_join";
/// Leave a topic.
pub const EVENT_LEAVE: &str = "phx_leave";
/// Reply to a request, correlated by message ref.
pub const EVENT_REPLY: &str = "phx_reply";
/// The server closed the channel.
pub const EVENT_CLOSE: &str = "phx_close";
/// The channel process crashed on the server.
pub const EVENT_ERROR: &str = "phx_error";
/// Socket-level keepalive.
pub const EVENT_HEARTBEAT: &str = "heartbeat";
/// Topic used for heartbeats.
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// Status carried by a `phx_reply` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    /// `"ok"`
    Ok,
    /// `"error"`
    Error,
    /// Any other status string.
    Other(String),
}

/// A decoded V2 protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Join reference for correlating messages within a channel.
    pub join_ref: Option<String>,
    /// Message reference for request/reply correlation.
    pub msg_ref: Option<String>,
    /// The topic (e.g., "room:lobby").
    pub topic: String,
    /// The event name (e.g., "phx_join", "new_msg").
    pub event: String,
    /// The payload as JSON.
    pub payload: Value,
}

impl Envelope {
    /// Create a new envelope with no refs.
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            join_ref: None,
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Set the join reference.
    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = Some(join_ref.into());
        self
    }

    /// Set the message reference.
    pub fn with_msg_ref(mut self, msg_ref: impl Into<String>) -> Self {
        self.msg_ref = Some(msg_ref.into());
        self
    }

    /// Parse from an already decoded JSON array.
    pub fn from_json(value: &Value) -> Result<Self, ChannelError> {
        let arr = value
            .as_array()
            .ok_or_else(|| ChannelError::Decode("frame is not an array".into()))?;
        if arr.len() != 5 {
            return Err(ChannelError::Decode(format!(
                "expected 5 elements, got {}",
                arr.len()
            )));
        }

        Ok(Envelope {
            join_ref: parse_ref(&arr[0], "join_ref")?,
            msg_ref: parse_ref(&arr[1], "ref")?,
            topic: parse_name(&arr[2], "topic")?,
            event: parse_name(&arr[3], "event")?,
            payload: arr[4].clone(),
        })
    }

    /// Serialize to the V2 JSON array.
    pub fn to_json(&self) -> Value {
        json!([
            self.join_ref,
            self.msg_ref,
            self.topic,
            self.event,
            self.payload
        ])
    }

    /// Reply status if this is a `phx_reply`.
    pub fn reply_status(&self) -> Option<ReplyStatus> {
        if self.event != EVENT_REPLY {
            return None;
        }
        let status = self.payload.get("status")?.as_str()?;
        Some(match status {
            "ok" => ReplyStatus::Ok,
            "error" => ReplyStatus::Error,
            other => ReplyStatus::Other(other.to_string()),
        })
    }

    /// The `response` field of a reply payload.
    pub fn response(&self) -> Option<&Value> {
        self.payload.get("response")
    }

    /// Reason the server gave for an error reply.
    ///
    /// Uses `response.reason` when it is a string, otherwise the JSON text of
    /// the whole response.
    pub fn rejection_reason(&self) -> String {
        match self.response() {
            Some(response) => match response.get("reason").and_then(Value::as_str) {
                Some(reason) => reason.to_string(),
                None => response.to_string(),
            },
            None => self.payload.to_string(),
        }
    }

    /// Deserialize the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ChannelError::Decode(e.to_string()))
    }

    /// Returns `true` for frames addressed to the socket rather than a channel.
    pub fn is_heartbeat_topic(&self) -> bool {
        self.topic == HEARTBEAT_TOPIC
    }
}

fn parse_ref(value: &Value, field: &str) -> Result<Option<String>, ChannelError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        // Some servers echo refs back as numbers.
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(ChannelError::Decode(format!(
            "{} must be a string or null, got {}",
            field, other
        ))),
    }
}

fn parse_name(value: &Value, field: &str) -> Result<String, ChannelError> {
    match value.as_str() {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        Some(_) => Err(ChannelError::Decode(format!("{} is empty", field))),
        None => Err(ChannelError::Decode(format!("{} must be a string", field))),
    }
}

/// Encode an envelope as a text frame.
pub fn encode(envelope: &Envelope) -> Result<String, ChannelError> {
    serde_json::to_string(&envelope.to_json()).map_err(|e| ChannelError::Encode(e.to_string()))
}

/// Decode a text frame into an envelope.
pub fn decode(text: &str) -> Result<Envelope, ChannelError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ChannelError::Decode(format!("invalid JSON: {}", e)))?;
    Envelope::from_json(&value)
}

/// Convert any serializable payload into JSON.
pub fn to_payload<T: Serialize + ?Sized>(payload: &T) -> Result<Value, ChannelError> {
    serde_json::to_value(payload).map_err(|e| ChannelError::Encode(e.to_string()))
}
