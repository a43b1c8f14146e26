//! Remote Operations
//!
//! Each operation builds a DDP document with a fresh correlation id, hands it to
//! the [`Dispatcher`], and turns the raw response (or push frame) into a typed
//! value. This is the only layer that knows what individual Rocket.Chat methods
//! and streams mean.
//!
//! | Module     | Operations                                                      |
//! |------------|-----------------------------------------------------------------|
//! | `auth`     | handshake, password login, token resume                         |
//! | `rooms`    | channel listing, channel change subscriptions                   |
//! | `messages` | send/update messages, reactions, typing, message subscriptions  |
//!
//! A `result` frame carrying an `error` object fails with
//! [`RealtimeError::Method`]; a result missing the fields an operation needs
//! fails with [`RealtimeError::Parse`].

mod auth;
mod messages;
mod rooms;

pub use auth::{connect, login, resume, LoginResult};
pub use messages::{
    send_message, send_reaction, send_typing_event, subscribe_to_channel_messages,
    subscribe_to_channel_messages_raw, update_message, ChannelMessage,
};
pub use rooms::{
    get_channels, get_channels_raw, subscribe_to_channel_changes,
    subscribe_to_channel_changes_raw, ChannelChange, ChannelSummary, ChannelType,
};
pub(crate) use rooms::rooms_changed_key;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::RealtimeError;
use crate::realtime::protocol::{method_call, subscription_request, unsubscription_request};
use crate::realtime::Dispatcher;

/// A fresh correlation / subscription id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Cancel a subscription and stop routing its stream to the callback.
///
/// `stream_key` is the key the subscription was registered under (the room id
/// for message subscriptions). If a newer subscription has since taken over
/// that key, only the server side of this one is cancelled.
pub async fn unsubscribe(
    dispatcher: &Dispatcher,
    subscription_id: &str,
    stream_key: &str,
) -> Result<(), RealtimeError> {
    dispatcher
        .send(&unsubscription_request(subscription_id))
        .await?;
    let removed = dispatcher
        .remove_subscription(stream_key, subscription_id)
        .await;
    debug!(
        subscription_id = %subscription_id,
        stream_key = %stream_key,
        removed,
        "Unsubscribed"
    );
    Ok(())
}

/// Call `method` and return the `result` member of its response.
pub(crate) async fn invoke(
    dispatcher: &Dispatcher,
    method: &str,
    params: Value,
) -> Result<Value, RealtimeError> {
    let id = new_id();
    let frame = dispatcher
        .request(&method_call(&id, method, params), &id)
        .await?;
    method_result(method, frame)
}

/// Subscribe to `stream` keyed by `stream_key`. Returns the subscription id.
pub(crate) async fn subscribe_stream(
    dispatcher: &Dispatcher,
    stream: &str,
    stream_key: &str,
    callback: impl FnMut(Value) + Send + 'static,
) -> Result<String, RealtimeError> {
    let id = new_id();
    let params = json!([stream_key, {"useCollection": false, "args": []}]);
    dispatcher
        .subscribe(
            &subscription_request(&id, stream, params),
            &id,
            stream_key,
            callback,
        )
        .await?;
    Ok(id)
}

/// Extract `result` from a result frame, or the server's error.
pub(crate) fn method_result(method: &str, mut frame: Value) -> Result<Value, RealtimeError> {
    if let Some(error) = frame.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .or_else(|| error.get("reason"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(RealtimeError::Method {
            method: method.to_string(),
            message,
        });
    }
    Ok(frame
        .get_mut("result")
        .map(Value::take)
        .unwrap_or(Value::Null))
}

/// Element `index` of a push frame's `fields.args`.
pub(crate) fn push_arg(frame: &Value, index: usize) -> Option<&Value> {
    frame.get("fields")?.get("args")?.get(index)
}

/// Read a required string field.
pub(crate) fn required_str<'a>(value: &'a Value, field: &str) -> Result<&'a str, RealtimeError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| RealtimeError::Parse(format!("Missing string field '{}'", field)))
}

/// Parse an EJSON date (`{"$date": <millis>}`).
pub(crate) fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    let millis = value.get("$date")?.as_i64()?;
    DateTime::from_timestamp_millis(millis)
}
