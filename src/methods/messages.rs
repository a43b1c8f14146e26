//! Messages, reactions, typing indicators, and room message subscriptions

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::warn;

use super::{invoke, new_id, parse_date, push_arg, required_str, subscribe_stream};
use crate::error::RealtimeError;
use crate::realtime::Dispatcher;

/// A message pushed on a room's message stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub sender_username: Option<String>,
    pub text: String,
    /// Parent message id when posted in a thread
    pub thread_id: Option<String>,
    /// System message type (`uj`, `ul`, `room_changed_topic`, ...); `None` for
    /// ordinary user messages
    pub qualifier: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub edited_at: Option<DateTime<Utc>>,
}

impl ChannelMessage {
    /// Build from a message object.
    pub fn from_message(message: &Value) -> Result<Self, RealtimeError> {
        let sender = message
            .get("u")
            .ok_or_else(|| RealtimeError::Parse("Message without sender".into()))?;
        Ok(Self {
            id: required_str(message, "_id")?.to_string(),
            channel_id: required_str(message, "rid")?.to_string(),
            sender_id: required_str(sender, "_id")?.to_string(),
            sender_username: optional_str(sender, "username"),
            text: message
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            thread_id: optional_str(message, "tmid"),
            qualifier: optional_str(message, "t"),
            timestamp: message.get("ts").and_then(parse_date),
            edited_at: message.get("editedAt").and_then(parse_date),
        })
    }

    /// Build from a `changed` frame of `stream-room-messages`.
    pub fn from_frame(frame: &Value) -> Result<Self, RealtimeError> {
        let message = push_arg(frame, 0)
            .ok_or_else(|| RealtimeError::Parse("Message push without args".into()))?;
        Self::from_message(message)
    }
}

fn optional_str(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(str::to_string)
}

fn message_params(text: &str, message_id: &str, channel_id: &str, thread_id: Option<&str>) -> Value {
    let mut message = Map::new();
    message.insert("_id".into(), json!(message_id));
    message.insert("rid".into(), json!(channel_id));
    message.insert("msg".into(), json!(text));
    if let Some(thread_id) = thread_id {
        message.insert("tmid".into(), json!(thread_id));
    }
    json!([message])
}

/// Post `text` to a room, optionally inside a thread. Returns the new message id.
pub async fn send_message(
    dispatcher: &Dispatcher,
    text: &str,
    channel_id: &str,
    thread_id: Option<&str>,
) -> Result<String, RealtimeError> {
    let message_id = new_id();
    invoke(
        dispatcher,
        "sendMessage",
        message_params(text, &message_id, channel_id, thread_id),
    )
    .await?;
    Ok(message_id)
}

/// Replace the text of a message sent earlier.
pub async fn update_message(
    dispatcher: &Dispatcher,
    text: &str,
    message_id: &str,
    channel_id: &str,
    thread_id: Option<&str>,
) -> Result<(), RealtimeError> {
    invoke(
        dispatcher,
        "updateMessage",
        message_params(text, message_id, channel_id, thread_id),
    )
    .await?;
    Ok(())
}

/// Toggle an emoji reaction (e.g. `:thumbsup:`) on a message.
pub async fn send_reaction(
    dispatcher: &Dispatcher,
    message_id: &str,
    emoji: &str,
) -> Result<(), RealtimeError> {
    invoke(dispatcher, "setReaction", json!([emoji, message_id])).await?;
    Ok(())
}

/// Start or stop the "is typing" indicator for `username` in a room.
pub async fn send_typing_event(
    dispatcher: &Dispatcher,
    is_typing: bool,
    channel_id: &str,
    username: &str,
    thread_id: Option<&str>,
) -> Result<(), RealtimeError> {
    let activity = if is_typing { json!(["user-typing"]) } else { json!([]) };
    let mut params = vec![
        json!(format!("{}/user-activity", channel_id)),
        json!(username),
        activity,
    ];
    if let Some(thread_id) = thread_id {
        params.push(json!({"tmid": thread_id}));
    }
    invoke(dispatcher, "stream-notify-room", Value::Array(params)).await?;
    Ok(())
}

/// Receive every new or edited message in a room.
///
/// Returns the subscription id; the stream key is the room id.
pub async fn subscribe_to_channel_messages(
    dispatcher: &Dispatcher,
    channel_id: &str,
    mut callback: impl FnMut(ChannelMessage) + Send + 'static,
) -> Result<String, RealtimeError> {
    subscribe_stream(dispatcher, "stream-room-messages", channel_id, move |frame| {
        match ChannelMessage::from_frame(&frame) {
            Ok(message) => callback(message),
            Err(e) => warn!(error = %e, "Skipping malformed room message"),
        }
    })
    .await
}

/// Like [`subscribe_to_channel_messages`], but the callback receives the
/// message object exactly as the server sent it.
pub async fn subscribe_to_channel_messages_raw(
    dispatcher: &Dispatcher,
    channel_id: &str,
    mut callback: impl FnMut(Value) + Send + 'static,
) -> Result<String, RealtimeError> {
    subscribe_stream(dispatcher, "stream-room-messages", channel_id, move |mut frame| {
        match frame
            .get_mut("fields")
            .and_then(|f| f.get_mut("args"))
            .and_then(|a| a.get_mut(0))
        {
            Some(message) => callback(message.take()),
            None => warn!("Skipping room message push without args"),
        }
    })
    .await
}
