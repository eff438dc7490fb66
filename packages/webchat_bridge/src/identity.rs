//! Signed widget token verification.
//!
//! Tokens look like `base64url(payload).base64url(hmac_sha256(secret, payload_b64))`
//! where the payload is a JSON object carrying `iat` (unix seconds) and the
//! site's view of the visitor (`clientId`, `name`, `email`, `loggedIn`).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use regex::Regex;
use serde_json::Value;
use sha2::Sha256;
use std::sync::LazyLock;

type HmacSha256 = Hmac<Sha256>;

const MAX_TOKEN_LEN: usize = 2048;
/// Clock skew tolerated for tokens issued "in the future"
const MAX_FUTURE_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("missing token")]
    MissingToken,
    #[error("widget secret not configured")]
    MissingSecret,
    #[error("token is not in payload.signature form")]
    InvalidFormat,
    #[error("signature mismatch")]
    InvalidSignature,
    #[error("payload is not a JSON object")]
    InvalidPayload,
    #[error("payload has no iat")]
    MissingIat,
    #[error("iat is in the future")]
    IatInFuture,
    #[error("token expired")]
    Expired,
}

impl IdentityError {
    pub fn code(&self) -> &'static str {
        match self {
            IdentityError::MissingToken => "missing_token",
            IdentityError::MissingSecret => "missing_secret",
            IdentityError::InvalidFormat => "invalid_format",
            IdentityError::InvalidSignature => "invalid_signature",
            IdentityError::InvalidPayload => "invalid_payload",
            IdentityError::MissingIat => "missing_iat",
            IdentityError::IatInFuture => "iat_in_future",
            IdentityError::Expired => "token_expired",
        }
    }
}

/// Identity payload after signature and freshness checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub client_id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub logged_in: bool,
    pub iat: i64,
}

impl VerifiedIdentity {
    /// The client id, only when the site vouches the visitor is logged in.
    pub fn authenticated_client_id(&self) -> Option<&str> {
        if self.logged_in {
            self.client_id.as_deref()
        } else {
            None
        }
    }
}

static SURROUNDING_QUOTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^['"]+|['"]+$"#).expect("valid regex"));
static ENCODED_PERIOD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)&amp;period;|&period;|&amp;#0*46;?|&#0*46;?|&amp;#x0*2e;?|&#x0*2e;?|%2e")
        .expect("valid regex")
});

/// Undo the mangling CMS templates and URL encoders apply to tokens.
pub fn normalize_token(raw: &str) -> String {
    let t = raw.trim();
    if t.is_empty() {
        return String::new();
    }
    let t = SURROUNDING_QUOTES.replace_all(t, "");
    let t = ENCODED_PERIOD.replace_all(&t, ".");
    let first = t.split_whitespace().next().unwrap_or_default();
    first.chars().take(MAX_TOKEN_LEN).collect::<String>().trim().to_string()
}

/// Accepts both base64 alphabets, padded or not.
fn decode_base64url(input: &str) -> Option<Vec<u8>> {
    let cleaned: String = input
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    URL_SAFE_NO_PAD.decode(cleaned).ok()
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int_field(payload: &Value, key: &str) -> Option<i64> {
    match payload.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty() && s != "false" && s != "0",
        _ => false,
    }
}

/// Verify a widget token at time `now_secs`.
pub fn verify_widget_token(
    token: &str,
    secret: Option<&str>,
    max_age_secs: i64,
    now_secs: i64,
) -> Result<VerifiedIdentity, IdentityError> {
    let token = normalize_token(token);
    if token.is_empty() {
        return Err(IdentityError::MissingToken);
    }
    let secret = secret
        .filter(|s| !s.is_empty())
        .ok_or(IdentityError::MissingSecret)?;

    let parts: Vec<&str> = token.split('.').collect();
    let [payload_b64, sig_b64] = parts.as_slice() else {
        return Err(IdentityError::InvalidFormat);
    };

    let provided = decode_base64url(sig_b64).ok_or(IdentityError::InvalidSignature)?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| IdentityError::MissingSecret)?;
    mac.update(payload_b64.as_bytes());
    mac.verify_slice(&provided)
        .map_err(|_| IdentityError::InvalidSignature)?;

    let raw = decode_base64url(payload_b64).ok_or(IdentityError::InvalidPayload)?;
    let payload: Value = serde_json::from_slice(&raw).map_err(|_| IdentityError::InvalidPayload)?;
    if !payload.is_object() {
        return Err(IdentityError::InvalidPayload);
    }

    let iat = int_field(&payload, "iat")
        .filter(|iat| *iat != 0)
        .ok_or(IdentityError::MissingIat)?;
    if iat > now_secs.saturating_add(MAX_FUTURE_SKEW_SECS) {
        return Err(IdentityError::IatInFuture);
    }
    if now_secs.saturating_sub(iat) > max_age_secs {
        return Err(IdentityError::Expired);
    }

    Ok(VerifiedIdentity {
        client_id: string_field(&payload, "clientId"),
        name: string_field(&payload, "name"),
        email: string_field(&payload, "email"),
        logged_in: truthy(payload.get("loggedIn")),
        iat,
    })
}

/// Verifier bound to the configured secret and max age.
#[derive(Clone, Debug)]
pub struct TokenVerifier {
    secret: Option<String>,
    max_age_secs: i64,
}

impl TokenVerifier {
    pub fn new(secret: Option<String>, max_age_secs: i64) -> Self {
        Self {
            secret,
            max_age_secs,
        }
    }

    pub fn verify(&self, token: &str) -> Result<VerifiedIdentity, IdentityError> {
        verify_widget_token(
            token,
            self.secret.as_deref(),
            self.max_age_secs,
            chrono::Utc::now().timestamp(),
        )
    }
}
