//! Realtime Session
//!
//! Single responsibility: an authenticated, ready-to-use realtime connection.
//!
//! # The Key Abstraction
//!
//! A `Session` can ONLY be created via `Session::establish()` (or
//! `establish_over()` for a transport you opened yourself), which:
//! 1. Opens the WebSocket
//! 2. Starts the dispatcher's receive loop under a supervisor task
//! 3. Sends the DDP handshake
//! 4. Logs in with a password or resumes with a token
//! 5. Only THEN returns a Session
//!
//! If you have a `Session`, you can make calls.
//!
//! # States
//!
//! ```text
//! Disconnected ─▶ Connecting ─▶ Authenticating ─▶ Ready ─▶ Closed
//!                      │              │
//!                      └──────────────┴──────────────────▶ Closed
//! ```
//!
//! Any failure before `Ready` is returned from `establish()` as
//! `RealtimeError::BootstrapFailed`. Once ready, loss of the connection is
//! reported by `closed()` as `RealtimeError::SessionClosed`. Sessions do NOT
//! reconnect; the caller decides whether to establish a new one and
//! resubscribe.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::dispatcher::{Dispatcher, DEFAULT_SUBSCRIPTION_BUFFER};
use super::transport::{FrameReceiver, FrameSender, Transport};
use crate::error::RealtimeError;
use crate::methods::{self, LoginResult};

/// Configuration for establishing a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Realtime API endpoint, e.g. `wss://chat.example.org/websocket`
    pub url: String,
    /// Per-subscription delivery queue capacity
    pub subscription_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3000/websocket".to_string(),
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
        }
    }
}

/// How the session authenticates after the handshake.
#[derive(Clone)]
pub enum Credentials {
    Password { username: String, password: String },
    /// Resume token from an earlier login
    Token { username: String, token: String },
}

impl Credentials {
    pub fn username(&self) -> &str {
        match self {
            Credentials::Password { username, .. } | Credentials::Token { username, .. } => {
                username
            }
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Credentials::Password { .. } => "Password",
            Credentials::Token { .. } => "Token",
        };
        f.debug_struct(kind)
            .field("username", &self.username())
            .finish_non_exhaustive()
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closed,
}

/// An authenticated session with the realtime API.
///
/// Dropping the session stops its receive loop.
pub struct Session {
    dispatcher: Dispatcher,
    username: String,
    identity: LoginResult,
    state: watch::Receiver<SessionState>,
    close_reason: Arc<OnceLock<RealtimeError>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("username", &self.username)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connect to `config.url` and authenticate.
    ///
    /// Blocks until the session is ready. Every error is
    /// `RealtimeError::BootstrapFailed`.
    pub async fn establish(
        config: SessionConfig,
        credentials: Credentials,
    ) -> Result<Self, RealtimeError> {
        info!(
            url = %config.url,
            username = %credentials.username(),
            "Establishing realtime session"
        );

        let state = Arc::new(watch::channel(SessionState::Disconnected).0);
        state.send_replace(SessionState::Connecting);

        let transport = match Transport::connect(&config.url).await {
            Ok(transport) => transport,
            Err(e) => {
                state.send_replace(SessionState::Closed);
                error!(error = %e, "Could not open realtime connection");
                return Err(RealtimeError::bootstrap(e));
            }
        };
        let (sender, receiver) = transport.split();

        Self::bootstrap(config, credentials, sender, receiver, state).await
    }

    /// Log in with a password.
    pub async fn start(
        config: SessionConfig,
        username: &str,
        password: &str,
    ) -> Result<Self, RealtimeError> {
        let credentials = Credentials::Password {
            username: username.to_string(),
            password: password.to_string(),
        };
        Self::establish(config, credentials).await
    }

    /// Authenticate with a resume token from an earlier session.
    pub async fn resume(
        config: SessionConfig,
        username: &str,
        token: &str,
    ) -> Result<Self, RealtimeError> {
        let credentials = Credentials::Token {
            username: username.to_string(),
            token: token.to_string(),
        };
        Self::establish(config, credentials).await
    }

    /// Run the bootstrap over an already-open connection.
    ///
    /// `config.url` is not used.
    pub async fn establish_over(
        sender: impl FrameSender,
        receiver: impl FrameReceiver,
        credentials: Credentials,
        config: SessionConfig,
    ) -> Result<Self, RealtimeError> {
        let state = Arc::new(watch::channel(SessionState::Connecting).0);
        Self::bootstrap(config, credentials, sender, receiver, state).await
    }

    async fn bootstrap(
        config: SessionConfig,
        credentials: Credentials,
        sender: impl FrameSender,
        receiver: impl FrameReceiver,
        state: Arc<watch::Sender<SessionState>>,
    ) -> Result<Self, RealtimeError> {
        let dispatcher = Dispatcher::new(sender, config.subscription_buffer);
        let state_rx = state.subscribe();
        state.send_replace(SessionState::Authenticating);

        let close_reason = Arc::new(OnceLock::new());
        supervise(
            dispatcher.run(receiver),
            Arc::clone(&state),
            Arc::clone(&close_reason),
        );
        let guard = BootstrapGuard::new(&dispatcher);

        let identity = match authenticate(&dispatcher, &credentials).await {
            Ok(identity) => identity,
            Err(e) => {
                error!(error = %e, "Realtime bootstrap failed");
                return Err(RealtimeError::bootstrap(e));
            }
        };

        let became_ready = state.send_if_modified(|current| {
            if *current == SessionState::Authenticating {
                *current = SessionState::Ready;
                true
            } else {
                false
            }
        });
        if !became_ready {
            let cause = close_reason.get().cloned().unwrap_or_else(|| {
                RealtimeError::Internal("Connection closed during bootstrap".into())
            });
            return Err(RealtimeError::bootstrap(cause));
        }

        info!(
            user_id = %identity.user_id,
            username = %credentials.username(),
            "Realtime session established"
        );

        // Session's Drop owns shutdown from here
        guard.disarm();
        Ok(Self {
            dispatcher,
            username: credentials.username().to_string(),
            identity,
            state: state_rx,
            close_reason,
        })
    }

    /// The dispatcher for issuing calls and subscriptions on this session.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Token for [`Session::resume`] on a later connection.
    pub fn auth_token(&self) -> &str {
        &self.identity.token
    }

    pub fn token_expires(&self) -> Option<DateTime<Utc>> {
        self.identity.token_expires
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the connection is lost.
    ///
    /// Always returns `RealtimeError::SessionClosed` wrapping the error that
    /// ended the receive loop. Subscriptions deliver nothing after this.
    pub async fn closed(&self) -> RealtimeError {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;

        let cause = self.close_reason.get().cloned().unwrap_or_else(|| {
            RealtimeError::Internal("Session supervisor ended without a reason".into())
        });
        RealtimeError::session_closed(cause)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
        debug!("Session dropped, receive loop stopping");
    }
}

async fn authenticate(
    dispatcher: &Dispatcher,
    credentials: &Credentials,
) -> Result<LoginResult, RealtimeError> {
    methods::connect(dispatcher).await?;
    match credentials {
        Credentials::Password { username, password } => {
            methods::login(dispatcher, username, password).await
        }
        Credentials::Token { token, .. } => methods::resume(dispatcher, token).await,
    }
}

/// Stops the receive loop if bootstrap returns early or its future is dropped.
struct BootstrapGuard {
    dispatcher: Option<Dispatcher>,
}

impl BootstrapGuard {
    fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            dispatcher: Some(dispatcher.clone()),
        }
    }

    fn disarm(mut self) {
        self.dispatcher = None;
    }
}

impl Drop for BootstrapGuard {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            debug!("Bootstrap did not complete, stopping receive loop");
            dispatcher.shutdown();
        }
    }
}

/// Watch the receive loop and publish its end.
fn supervise(
    receive_loop: JoinHandle<RealtimeError>,
    state: Arc<watch::Sender<SessionState>>,
    close_reason: Arc<OnceLock<RealtimeError>>,
) {
    tokio::spawn(async move {
        let cause = match receive_loop.await {
            Ok(cause) => cause,
            Err(e) => RealtimeError::Internal(format!("Receive loop did not complete: {}", e)),
        };

        let was_ready = *state.borrow() == SessionState::Ready;
        let _ = close_reason.set(cause.clone());
        state.send_replace(SessionState::Closed);

        if was_ready {
            error!(error = %cause, "Realtime session closed");
        } else {
            debug!(error = %cause, "Connection ended before session was ready");
        }
    });
}
