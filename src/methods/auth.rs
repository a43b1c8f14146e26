//! Handshake and authentication
//!
//! A realtime connection must send the DDP `connect` handshake before anything
//! else, then authenticate once with either a password or a previously issued
//! resume token. Both forms of authentication are the `login` method with
//! different params and yield the same [`LoginResult`].

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{invoke, parse_date, required_str};
use crate::error::RealtimeError;
use crate::realtime::protocol::connect_request;
use crate::realtime::Dispatcher;

/// Identity established by a successful login or resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResult {
    pub user_id: String,
    /// Token accepted by [`resume`] on a later connection
    pub token: String,
    pub token_expires: Option<DateTime<Utc>>,
}

/// Send the DDP handshake. The server answers with a `connected` frame, which
/// the dispatcher ignores, so this does not wait for it.
pub async fn connect(dispatcher: &Dispatcher) -> Result<(), RealtimeError> {
    debug!("Sending DDP handshake");
    dispatcher.send(&connect_request()).await
}

/// Log in with a username (or email address) and password.
///
/// Only the SHA-256 digest of the password is sent.
pub async fn login(
    dispatcher: &Dispatcher,
    username: &str,
    password: &str,
) -> Result<LoginResult, RealtimeError> {
    let user = if username.contains('@') {
        json!({"email": username})
    } else {
        json!({"username": username})
    };
    let params = json!([{
        "user": user,
        "password": {
            "digest": password_digest(password),
            "algorithm": "sha-256",
        },
    }]);

    let result = parse_login(&invoke(dispatcher, "login", params).await?)?;
    info!(user_id = %result.user_id, "Logged in");
    Ok(result)
}

/// Authenticate with a resume token from an earlier login.
pub async fn resume(dispatcher: &Dispatcher, token: &str) -> Result<LoginResult, RealtimeError> {
    let params = json!([{"resume": token}]);

    let result = parse_login(&invoke(dispatcher, "login", params).await?)?;
    info!(user_id = %result.user_id, "Resumed session");
    Ok(result)
}

fn password_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn parse_login(result: &Value) -> Result<LoginResult, RealtimeError> {
    Ok(LoginResult {
        user_id: required_str(result, "id")?.to_string(),
        token: required_str(result, "token")?.to_string(),
        token_expires: result.get("tokenExpires").and_then(parse_date),
    })
}
