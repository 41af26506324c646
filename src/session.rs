//! Stateless signed session tokens.
//!
//! Token format: `base64url(JSON(payload)) "." base64url(HMAC-SHA256(key, encoded_payload))`.
//!
//! - The payload carries the user identity, role and an absolute expiry (`exp`, unix seconds).
//! - Verification recomputes the MAC over the received encoded payload and compares it in
//!   constant time, then rejects tokens whose `exp` is at or before the current instant.
//! - There is no revocation list. Rotating `SESSION_SECRET` invalidates every outstanding token.

use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::KEY_LENGTH;

type HmacSha256 = Hmac<Sha256>;

/// Name of the cookie carrying the session token.
pub const SESSION_COOKIE_NAME: &str = "totp_session";

/// Account role carried inside the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Viewer => "viewer",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "viewer" => Ok(Role::Viewer),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Claims round-tripped inside a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    pub user_id: i64,
    pub username: String,
    pub role: Role,
    /// Absolute expiry, unix seconds
    pub exp: i64,
}

impl SessionPayload {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Issues and verifies session tokens with a fixed signing key.
#[derive(Clone)]
pub struct SessionService {
    key: [u8; KEY_LENGTH],
    ttl: Duration,
}

impl SessionService {
    pub fn new(key: [u8; KEY_LENGTH], ttl: Duration) -> Self {
        Self { key, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token that expires `ttl` from now.
    pub fn issue(&self, user_id: i64, username: &str, role: Role) -> String {
        self.issue_at(user_id, username, role, chrono::Utc::now().timestamp())
    }

    pub fn issue_at(&self, user_id: i64, username: &str, role: Role, now: i64) -> String {
        let payload = SessionPayload {
            user_id,
            username: username.to_string(),
            role,
            exp: now.saturating_add(self.ttl.as_secs() as i64),
        };
        // Serializing a struct of plain fields cannot fail.
        let json = serde_json::to_vec(&payload).unwrap_or_default();
        let encoded = BASE64URL.encode(json);
        let signature = BASE64URL.encode(self.mac(&encoded).finalize().into_bytes());
        format!("{}.{}", encoded, signature)
    }

    /// Verify a token against the current time. Any defect yields `None`.
    pub fn verify(&self, token: &str) -> Option<SessionPayload> {
        self.verify_at(token, chrono::Utc::now().timestamp())
    }

    pub fn verify_at(&self, token: &str, now: i64) -> Option<SessionPayload> {
        let (encoded, signature) = token.split_once('.')?;
        if encoded.is_empty() || signature.contains('.') {
            return None;
        }

        let signature = BASE64URL.decode(signature).ok()?;
        // `verify_slice` compares in constant time.
        self.mac(encoded).verify_slice(&signature).ok()?;

        let json = BASE64URL.decode(encoded).ok()?;
        let payload: SessionPayload = serde_json::from_slice(&json).ok()?;
        if payload.exp <= now {
            return None;
        }
        Some(payload)
    }

    /// `Set-Cookie` value carrying a freshly issued token.
    pub fn session_cookie(&self, token: &str, secure: bool) -> String {
        build_cookie(token, self.ttl.as_secs(), secure)
    }

    /// `Set-Cookie` value that clears the session cookie.
    pub fn clear_cookie(&self, secure: bool) -> String {
        build_cookie("", 0, secure)
    }

    fn mac(&self, encoded: &str) -> HmacSha256 {
        // HMAC accepts keys of any length; a 32-byte key never fails.
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(encoded.as_bytes());
        mac
    }
}

fn build_cookie(value: &str, max_age: u64, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}",
        SESSION_COOKIE_NAME, value, max_age
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Extract the session token from a `Cookie` request header value.
pub fn token_from_cookie_header(header: &str) -> Option<&str> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE_NAME)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}
