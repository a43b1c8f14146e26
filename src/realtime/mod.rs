//! Realtime Connection Module
//!
//! One WebSocket to the Rocket.Chat realtime API, shared by any number of
//! concurrent calls and subscriptions.
//!
//! # Architecture
//!
//! | Module       | Responsibility                                         |
//! |--------------|--------------------------------------------------------|
//! | `transport`  | WebSocket connect/send/receive, in-memory test pair    |
//! | `protocol`   | DDP frame decoding and outbound document builders      |
//! | `dispatcher` | Correlating results, routing pushes, answering pings   |
//! | `session`    | Connect, handshake, authenticate, supervise            |
//!
//! # Key Design Principles
//!
//! ## One reader
//!
//! Only the dispatcher's receive loop reads the connection. Everyone else
//! writes through the dispatcher, which serializes frames.
//!
//! ## Nobody waits forever on a dead connection
//!
//! When the receive loop dies, every pending call fails with the error that
//! killed it, and calls made afterwards fail immediately.
//!
//! ## Ready is a type
//!
//! `Session::establish()` returns only once the handshake and login have
//! completed. Failure before that point is `BootstrapFailed`; a ready session
//! that later breaks reports `SessionClosed` from `Session::closed()`.
//!
//! # Usage
//!
//! ```ignore
//! use rocketchat_realtime::realtime::{Credentials, Session, SessionConfig};
//!
//! let session = Session::establish(
//!     SessionConfig::default(),
//!     Credentials::Password { username: "bot".into(), password: "secret".into() },
//! )
//! .await?;
//!
//! let channels = rocketchat_realtime::methods::get_channels(session.dispatcher()).await?;
//!
//! // Resolves once the connection drops
//! let closed = session.closed().await;
//! ```

pub mod dispatcher;
pub mod protocol;
pub mod session;
pub mod transport;

pub use dispatcher::{Dispatcher, DEFAULT_SUBSCRIPTION_BUFFER};
pub use protocol::{IncomingFrame, Lifecycle};
pub use session::{Credentials, Session, SessionConfig, SessionState};
pub use transport::{memory_pair, FrameReceiver, FrameSender, MemoryPeer, Transport};
