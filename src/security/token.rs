//! Signed session tokens.
//!
//! Tokens are compact three-segment strings,
//! `base64url(header) "." base64url(payload) "." base64url(hmac)`, signed
//! with HMAC-SHA256 over `header.payload`. The payload carries the session
//! id, login, mail, comma-separated roles and an absolute expiry in epoch
//! seconds. Validation recomputes the signature and applies a strict
//! `now < exp` check; any mismatch yields "invalid" with no partial data.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Once;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, warn};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// Authenticated identity attached to a request after a successful
/// security check.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserInfo {
    pub sid: String,
    pub login: String,
    pub mail: String,
    /// Comma-separated role labels.
    pub roles: String,
    /// Expiry as absolute epoch seconds.
    pub exp: i64,
}

impl UserInfo {
    /// Whether the user holds at least one of the given roles.
    pub fn has_any_role(&self, roles: &[String]) -> bool {
        self.roles
            .split(',')
            .map(str::trim)
            .any(|r| !r.is_empty() && roles.iter().any(|want| want == r))
    }
}

/// Issues and validates session tokens with a shared secret.
pub struct TokenService {
    secret: String,
    duration_secs: u64,
}

static EMPTY_SECRET_ONCE: Once = Once::new();

impl TokenService {
    pub fn new(secret: impl Into<String>, duration_secs: u64) -> Self {
        Self {
            secret: secret.into(),
            duration_secs,
        }
    }

    /// Issue a token for the session. An empty secret is a fatal
    /// misconfiguration; it is reported once, at first issuance.
    pub fn issue(&self, sid: &str, login: &str, mail: &str, roles: &str) -> String {
        if self.secret.is_empty() {
            EMPTY_SECRET_ONCE.call_once(|| {
                error!(target: "jwt", "environment variable CPP_JWT_SECRET not defined");
            });
        }
        let exp = now_epoch() + self.duration_secs as i64;
        let payload = serde_json::json!({
            "sid": sid,
            "login": login,
            "mail": mail,
            "roles": roles,
            "exp": exp,
        })
        .to_string();
        let mut token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(TOKEN_HEADER),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let signature = self.sign(&token);
        token.push('.');
        token.push_str(&signature);
        token
    }

    /// Validate a token against the secret and the clock. Returns the
    /// embedded identity only when both the signature and the expiry hold.
    pub fn validate(&self, token: &str) -> Option<UserInfo> {
        self.validate_at(token, now_epoch())
    }

    fn validate_at(&self, token: &str, now: i64) -> Option<UserInfo> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature)) =
            (parts.next(), parts.next(), parts.next())
        else {
            warn!(target: "jwt", "invalid token format");
            return None;
        };
        if parts.next().is_some() {
            warn!(target: "jwt", "invalid token format");
            return None;
        }
        let signed = format!("{header}.{payload}");
        if self.sign(&signed) != signature {
            warn!(target: "jwt", "invalid signature");
            return None;
        }
        let payload_bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
        let user: UserInfo = serde_json::from_slice(&payload_bytes).ok()?;
        if now < user.exp {
            Some(user)
        } else {
            warn!(target: "jwt", login = %user.login, "token expired");
            None
        }
    }

    fn sign(&self, message: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(message.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
