//! Session credential storage and validation

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Tokens are treated as expired this many seconds early.
const EXPIRY_MARGIN_SECS: u64 = 30;

/// Stored bearer credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub expires_at: Option<u64>,
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<u64>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl Credential {
    pub fn new(token: String, expires_in_secs: Option<u64>) -> Self {
        let expires_at = expires_in_secs.map(|secs| unix_now() + secs);
        Self { token, expires_at }
    }

    /// Build a credential from a bearer token, taking the expiry from the
    /// `exp` claim when the token is a JWT.
    pub fn from_token(token: String) -> Self {
        let expires_at = jwt_claims(&token).and_then(|c| c.exp);
        Self { token, expires_at }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => unix_now() + EXPIRY_MARGIN_SECS >= exp,
            None => false,
        }
    }

    /// Non-empty, printable, and if it has JWT shape, a decodable payload.
    pub fn is_well_formed(&self) -> bool {
        let token = self.token.as_str();
        if token.is_empty() || token.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return false;
        }
        if token.split('.').count() == 3 {
            return jwt_claims(token).is_some();
        }
        true
    }

    pub fn is_valid(&self) -> bool {
        self.is_well_formed() && !self.is_expired()
    }
}

/// Decode the payload segment of a JWT. No signature check: the server
/// is the authority, this only reads the expiry.
fn jwt_claims(token: &str) -> Option<Claims> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}
