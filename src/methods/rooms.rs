//! Channel listing and channel change subscriptions

use serde_json::{json, Value};
use tracing::warn;

use super::{invoke, push_arg, required_str, subscribe_stream};
use crate::error::RealtimeError;
use crate::realtime::Dispatcher;

/// Room type, from the `t` field of a room object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// `c`
    Public,
    /// `p`
    Private,
    /// `d`
    Direct,
    /// `l`
    Livechat,
    Other(String),
}

impl ChannelType {
    pub fn from_code(code: &str) -> Self {
        match code {
            "c" => ChannelType::Public,
            "p" => ChannelType::Private,
            "d" => ChannelType::Direct,
            "l" => ChannelType::Livechat,
            other => ChannelType::Other(other.to_string()),
        }
    }
}

/// A room the user belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSummary {
    pub id: String,
    pub kind: ChannelType,
}

impl ChannelSummary {
    fn from_room(room: &Value) -> Result<Self, RealtimeError> {
        Ok(Self {
            id: required_str(room, "_id")?.to_string(),
            kind: ChannelType::from_code(required_str(room, "t")?),
        })
    }
}

/// One event from the `rooms-changed` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelChange {
    /// `inserted`, `updated` or `removed`
    pub action: String,
    pub channel_id: String,
    pub kind: ChannelType,
}

impl ChannelChange {
    /// Build from a `changed` frame of `stream-notify-user`.
    pub fn from_frame(frame: &Value) -> Result<Self, RealtimeError> {
        let action = push_arg(frame, 0)
            .and_then(Value::as_str)
            .ok_or_else(|| RealtimeError::Parse("Room change without action".into()))?;
        let room = push_arg(frame, 1)
            .ok_or_else(|| RealtimeError::Parse("Room change without room".into()))?;
        let summary = ChannelSummary::from_room(room)?;
        Ok(Self {
            action: action.to_string(),
            channel_id: summary.id,
            kind: summary.kind,
        })
    }
}

/// Every room the user is a member of, as returned by the server.
pub async fn get_channels_raw(dispatcher: &Dispatcher) -> Result<Vec<Value>, RealtimeError> {
    let mut result = invoke(dispatcher, "rooms/get", json!([{"$date": 0}])).await?;
    match result.get_mut("update").map(Value::take) {
        Some(Value::Array(rooms)) => Ok(rooms),
        _ => Err(RealtimeError::Parse(
            "rooms/get result has no 'update' list".into(),
        )),
    }
}

/// Every room the user is a member of, as (id, type) pairs.
pub async fn get_channels(dispatcher: &Dispatcher) -> Result<Vec<ChannelSummary>, RealtimeError> {
    get_channels_raw(dispatcher)
        .await?
        .iter()
        .map(ChannelSummary::from_room)
        .collect()
}

/// Be told whenever one of the user's rooms is created, changed, or left.
///
/// Returns the subscription id.
pub async fn subscribe_to_channel_changes(
    dispatcher: &Dispatcher,
    user_id: &str,
    mut callback: impl FnMut(ChannelChange) + Send + 'static,
) -> Result<String, RealtimeError> {
    subscribe_to_channel_changes_raw_frames(dispatcher, user_id, move |frame| {
        match ChannelChange::from_frame(&frame) {
            Ok(change) => callback(change),
            Err(e) => warn!(error = %e, "Skipping malformed room change"),
        }
    })
    .await
}

/// Like [`subscribe_to_channel_changes`], but the callback receives the room
/// object exactly as the server sent it.
pub async fn subscribe_to_channel_changes_raw(
    dispatcher: &Dispatcher,
    user_id: &str,
    mut callback: impl FnMut(Value) + Send + 'static,
) -> Result<String, RealtimeError> {
    subscribe_to_channel_changes_raw_frames(dispatcher, user_id, move |mut frame| {
        match frame
            .get_mut("fields")
            .and_then(|f| f.get_mut("args"))
            .and_then(|a| a.get_mut(1))
        {
            Some(room) => callback(room.take()),
            None => warn!("Skipping room change without room"),
        }
    })
    .await
}

async fn subscribe_to_channel_changes_raw_frames(
    dispatcher: &Dispatcher,
    user_id: &str,
    callback: impl FnMut(Value) + Send + 'static,
) -> Result<String, RealtimeError> {
    let stream_key = rooms_changed_key(user_id);
    subscribe_stream(dispatcher, "stream-notify-user", &stream_key, callback).await
}

/// Stream key of a user's room change notifications.
pub(crate) fn rooms_changed_key(user_id: &str) -> String {
    format!("{}/rooms-changed", user_id)
}
