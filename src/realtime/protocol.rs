//! Realtime Wire Protocol
//!
//! Single responsibility: decode inbound DDP frames and build outbound ones.
//!
//! # Wire Format
//!
//! Every frame is one JSON object in one WebSocket text message, tagged by `msg`.
//!
//! ## Inbound
//! ```text
//! {"msg": "result", "id": "<correlation id>", "result": ..., "error": ...}
//! {"msg": "changed", "collection": ..., "fields": {"eventName": "<stream key>", "args": [...]}}
//! {"msg": "ready" | "connected" | "added" | "updated" | "nosub", ...}
//! {"msg": "ping"}
//! {"msg": "error", "reason": ...}
//! ```
//!
//! ## Outbound
//! ```text
//! {"msg": "connect", "version": "1", "support": ["1"]}
//! {"msg": "method", "method": "<name>", "params": [...], "id": "<correlation id>"}
//! {"msg": "sub", "name": "<stream>", "params": ["<stream key>", ...], "id": "<subscription id>"}
//! {"msg": "unsub", "id": "<subscription id>"}
//! {"msg": "pong"}
//! ```

use serde_json::{json, Value};

use crate::error::RealtimeError;

/// Lifecycle frames that need no action from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Ready,
    Connected,
    Added,
    Updated,
    NoSub,
}

/// One decoded inbound frame, classified by what the dispatcher does with it.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingFrame {
    /// Response to a correlated call
    Result { id: String, frame: Value },
    /// Push notification for a subscribed stream
    Changed { event_name: String, frame: Value },
    Lifecycle(Lifecycle),
    /// Keepalive request, answered with a pong
    Ping,
    /// Application-level error reported by the server
    Error(Value),
    /// Anything the dispatcher cannot route
    Unknown(Value),
}

impl IncomingFrame {
    /// Decode one text frame.
    ///
    /// Only text that is not a JSON object is an error. Objects with an unknown
    /// tag, no tag, or a missing routing field decode to [`IncomingFrame::Unknown`].
    pub fn decode(text: &str) -> Result<Self, RealtimeError> {
        let frame: Value = serde_json::from_str(text)?;
        if !frame.is_object() {
            return Err(RealtimeError::Decode(format!(
                "Frame is not a JSON object: {}",
                text
            )));
        }
        Ok(Self::classify(frame))
    }

    fn classify(frame: Value) -> Self {
        let Some(tag) = frame.get("msg").and_then(Value::as_str) else {
            return IncomingFrame::Unknown(frame);
        };

        match tag {
            "result" => match frame.get("id").and_then(Value::as_str) {
                Some(id) => IncomingFrame::Result {
                    id: id.to_string(),
                    frame,
                },
                None => IncomingFrame::Unknown(frame),
            },
            "changed" => match event_name(&frame) {
                Some(name) => IncomingFrame::Changed {
                    event_name: name.to_string(),
                    frame,
                },
                None => IncomingFrame::Unknown(frame),
            },
            "ready" => IncomingFrame::Lifecycle(Lifecycle::Ready),
            "connected" => IncomingFrame::Lifecycle(Lifecycle::Connected),
            "added" => IncomingFrame::Lifecycle(Lifecycle::Added),
            "updated" => IncomingFrame::Lifecycle(Lifecycle::Updated),
            "nosub" => IncomingFrame::Lifecycle(Lifecycle::NoSub),
            "ping" => IncomingFrame::Ping,
            "error" => IncomingFrame::Error(frame),
            _ => IncomingFrame::Unknown(frame),
        }
    }
}

fn event_name(frame: &Value) -> Option<&str> {
    frame.get("fields")?.get("eventName")?.as_str()
}

/// The DDP handshake request.
pub fn connect_request() -> Value {
    json!({
        "msg": "connect",
        "version": "1",
        "support": ["1"],
    })
}

/// A correlated remote method call.
pub fn method_call(id: &str, method: &str, params: Value) -> Value {
    json!({
        "msg": "method",
        "method": method,
        "id": id,
        "params": params,
    })
}

/// A subscription request. `params[0]` is conventionally the stream key.
pub fn subscription_request(id: &str, name: &str, params: Value) -> Value {
    json!({
        "msg": "sub",
        "id": id,
        "name": name,
        "params": params,
    })
}

/// Cancel a subscription by the id it was created with.
pub fn unsubscription_request(id: &str) -> Value {
    json!({
        "msg": "unsub",
        "id": id,
    })
}

/// Keepalive reply.
pub fn pong() -> Value {
    json!({"msg": "pong"})
}
