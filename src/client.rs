//! Rocket.Chat Client
//!
//! The application-facing API: one [`Session`] plus the remote operations
//! bound to it.
//!
//! ```ignore
//! let chat = RocketChat::start(config, "bot", "secret").await?;
//!
//! for channel in chat.get_channels().await? {
//!     chat.subscribe_to_channel_messages(&channel.id, |message| {
//!         println!("{}: {}", message.sender_id, message.text);
//!     })
//!     .await?;
//! }
//!
//! // Returns SessionClosed once the connection drops; reconnect and
//! // resubscribe from here.
//! let closed = chat.run_forever().await;
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::RealtimeError;
use crate::methods::{self, ChannelChange, ChannelMessage, ChannelSummary};
use crate::realtime::session::{Credentials, Session, SessionConfig};

/// A connected, authenticated Rocket.Chat user.
pub struct RocketChat {
    session: Session,
    /// Subscription id → stream key, for unsubscribe
    subscriptions: Mutex<HashMap<String, String>>,
}

impl RocketChat {
    /// Connect and log in with a password.
    pub async fn start(
        config: SessionConfig,
        username: &str,
        password: &str,
    ) -> Result<Self, RealtimeError> {
        Ok(Self::from_session(
            Session::start(config, username, password).await?,
        ))
    }

    /// Connect and authenticate with a resume token.
    pub async fn resume(
        config: SessionConfig,
        username: &str,
        token: &str,
    ) -> Result<Self, RealtimeError> {
        Ok(Self::from_session(
            Session::resume(config, username, token).await?,
        ))
    }

    /// Connect with either kind of credentials.
    pub async fn establish(
        config: SessionConfig,
        credentials: Credentials,
    ) -> Result<Self, RealtimeError> {
        Ok(Self::from_session(
            Session::establish(config, credentials).await?,
        ))
    }

    pub fn from_session(session: Session) -> Self {
        Self {
            session,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn user_id(&self) -> &str {
        self.session.user_id()
    }

    pub fn username(&self) -> &str {
        self.session.username()
    }

    /// Token for [`RocketChat::resume`] on a later connection.
    pub fn auth_token(&self) -> &str {
        self.session.auth_token()
    }

    pub fn token_expires(&self) -> Option<DateTime<Utc>> {
        self.session.token_expires()
    }

    /// Wait until the connection is lost. Returns `SessionClosed`.
    pub async fn run_forever(&self) -> RealtimeError {
        self.session.closed().await
    }

    /// Rooms the user is a member of.
    pub async fn get_channels(&self) -> Result<Vec<ChannelSummary>, RealtimeError> {
        methods::get_channels(self.session.dispatcher()).await
    }

    /// Rooms the user is a member of, as returned by the server.
    pub async fn get_channels_raw(&self) -> Result<Vec<Value>, RealtimeError> {
        methods::get_channels_raw(self.session.dispatcher()).await
    }

    /// Post a message. Returns the new message id.
    pub async fn send_message(
        &self,
        text: &str,
        channel_id: &str,
        thread_id: Option<&str>,
    ) -> Result<String, RealtimeError> {
        methods::send_message(self.session.dispatcher(), text, channel_id, thread_id).await
    }

    /// Edit a message sent earlier.
    pub async fn update_message(
        &self,
        text: &str,
        message_id: &str,
        channel_id: &str,
        thread_id: Option<&str>,
    ) -> Result<(), RealtimeError> {
        methods::update_message(
            self.session.dispatcher(),
            text,
            message_id,
            channel_id,
            thread_id,
        )
        .await
    }

    /// Toggle an emoji reaction on a message.
    pub async fn send_reaction(&self, message_id: &str, emoji: &str) -> Result<(), RealtimeError> {
        methods::send_reaction(self.session.dispatcher(), message_id, emoji).await
    }

    /// Show or clear this user's typing indicator in a room.
    pub async fn send_typing_event(
        &self,
        is_typing: bool,
        channel_id: &str,
        thread_id: Option<&str>,
    ) -> Result<(), RealtimeError> {
        methods::send_typing_event(
            self.session.dispatcher(),
            is_typing,
            channel_id,
            self.username(),
            thread_id,
        )
        .await
    }

    /// Receive every message posted in a room. Returns the subscription id.
    pub async fn subscribe_to_channel_messages(
        &self,
        channel_id: &str,
        callback: impl FnMut(ChannelMessage) + Send + 'static,
    ) -> Result<String, RealtimeError> {
        let id =
            methods::subscribe_to_channel_messages(self.session.dispatcher(), channel_id, callback)
                .await?;
        self.remember(&id, channel_id).await;
        Ok(id)
    }

    /// Receive every message posted in a room, unparsed. Returns the
    /// subscription id.
    pub async fn subscribe_to_channel_messages_raw(
        &self,
        channel_id: &str,
        callback: impl FnMut(Value) + Send + 'static,
    ) -> Result<String, RealtimeError> {
        let id = methods::subscribe_to_channel_messages_raw(
            self.session.dispatcher(),
            channel_id,
            callback,
        )
        .await?;
        self.remember(&id, channel_id).await;
        Ok(id)
    }

    /// Be told when this user's rooms change. Returns the subscription id.
    pub async fn subscribe_to_channel_changes(
        &self,
        callback: impl FnMut(ChannelChange) + Send + 'static,
    ) -> Result<String, RealtimeError> {
        let id = methods::subscribe_to_channel_changes(
            self.session.dispatcher(),
            self.user_id(),
            callback,
        )
        .await?;
        self.remember(&id, &methods::rooms_changed_key(self.user_id()))
            .await;
        Ok(id)
    }

    /// Be told when this user's rooms change, with the raw room object.
    /// Returns the subscription id.
    pub async fn subscribe_to_channel_changes_raw(
        &self,
        callback: impl FnMut(Value) + Send + 'static,
    ) -> Result<String, RealtimeError> {
        let id = methods::subscribe_to_channel_changes_raw(
            self.session.dispatcher(),
            self.user_id(),
            callback,
        )
        .await?;
        self.remember(&id, &methods::rooms_changed_key(self.user_id()))
            .await;
        Ok(id)
    }

    /// Cancel a subscription. Its callback receives nothing further.
    ///
    /// A newer subscription on the same room or stream keeps receiving. If the
    /// `unsub` frame cannot be sent the id stays known and may be retried.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<(), RealtimeError> {
        let Some(stream_key) = self.subscriptions.lock().await.remove(subscription_id) else {
            return Err(RealtimeError::Config(format!(
                "Unknown subscription id: {}",
                subscription_id
            )));
        };

        let outcome =
            methods::unsubscribe(self.session.dispatcher(), subscription_id, &stream_key).await;
        if outcome.is_err() {
            self.remember(subscription_id, &stream_key).await;
        }
        outcome
    }

    async fn remember(&self, subscription_id: &str, stream_key: &str) {
        self.subscriptions
            .lock()
            .await
            .insert(subscription_id.to_string(), stream_key.to_string());
    }
}
