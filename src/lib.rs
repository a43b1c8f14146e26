//! Rocket.Chat Realtime - async client for the Rocket.Chat realtime API
//!
//! One WebSocket per user session carries every method call and stream
//! subscription; a single receive loop demultiplexes what comes back.
//!
//! ## Architecture
//!
//! | Layer | Does |
//! |-------|------|
//! | `realtime::transport` | WebSocket text frames in and out |
//! | `realtime::dispatcher` | Correlates results, routes stream pushes, answers pings |
//! | `realtime::session` | Handshake + login, then ready |
//! | `methods` | Rocket.Chat operations on top of a dispatcher |
//! | `client` | `RocketChat`: a session with the operations bound to it |
//!
//! ## Failure model
//!
//! ```text
//! establish() ──fails──▶ BootstrapFailed(cause)
//!      │
//!      ▼ ready
//! run_forever() ──connection lost──▶ SessionClosed(cause)
//! ```
//!
//! Nothing reconnects on its own.

pub mod client;
pub mod config;
pub mod error;
pub mod methods;
pub mod realtime;

// Re-exports
pub use client::RocketChat;
pub use config::Config;
pub use error::RealtimeError;
pub use methods::{ChannelChange, ChannelMessage, ChannelSummary, ChannelType, LoginResult};
pub use realtime::{Credentials, Dispatcher, Session, SessionConfig, SessionState};
