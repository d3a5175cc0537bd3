//! Handshake authentication.
//!
//! Credential issuance lives elsewhere; the gateway only asks an
//! [`Authenticator`] to map an opaque credential to a user id while the
//! HTTP upgrade is still pending.

use std::collections::HashMap;

use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

use tether_protocol::UserId;
use tether_protocol::constants::{QUERY_ATTEMPT, QUERY_TOKEN};

/// Why a credential was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,

    #[error("invalid credential")]
    Invalid,
}

/// Validates handshake credentials.
///
/// Called synchronously from inside the WebSocket upgrade callback, so
/// implementations must not block for long.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, credential: &str) -> Result<UserId, AuthError>;
}

/// Authenticator backed by a fixed token → user table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, UserId>) -> Self {
        Self { tokens }
    }

    /// Adds a token, replacing any previous owner.
    pub fn with_token(mut self, token: impl Into<String>, user: impl Into<UserId>) -> Self {
        self.tokens.insert(token.into(), user.into());
        self
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, credential: &str) -> Result<UserId, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::Missing);
        }
        // Compare against every entry so timing does not leak which one matched.
        let mut found = None;
        for (token, user) in &self.tokens {
            if tokens_match(credential, token) {
                found = Some(user.clone());
            }
        }
        found.ok_or(AuthError::Invalid)
    }
}

/// Constant-time string comparison.
fn tokens_match(received: &str, expected: &str) -> bool {
    if received.len() != expected.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in received.bytes().zip(expected.bytes()) {
        diff |= a ^ b;
    }
    diff == 0
}

/// What the client put on the upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct HandshakeParams {
    pub credential: Option<String>,
    /// The client's reconnect counter; 0 when absent or malformed.
    pub attempt: u32,
}

/// Extracts the credential (query `token`, else `Authorization: Bearer`)
/// and the reconnect attempt hint from an upgrade request.
pub(crate) fn handshake_params(req: &Request) -> HandshakeParams {
    let mut params = HandshakeParams::default();

    if let Some(query) = req.uri().query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match &*key {
                QUERY_TOKEN if !value.is_empty() => params.credential = Some(value.into_owned()),
                QUERY_ATTEMPT => params.attempt = value.parse().unwrap_or(0),
                _ => {}
            }
        }
    }

    if params.credential.is_none() {
        params.credential = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
    }

    params
}
