//! Session record and authentication payload parsing.
//!
//! Login and refresh both answer with
//! `{ "success": bool, "data": { "access_token", "user", "expires_in" } }`.
//! `expires_in` arrives in several shapes; [`resolve_expiry`] normalises all
//! of them to an absolute instant that is guaranteed to be in the future.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Upper bound on a relative lifetime, in seconds (ten years).
const MAX_RELATIVE_SECS: f64 = 10.0 * 365.0 * 24.0 * 3600.0;

/// The authenticated user, as returned by the API.
///
/// Well-known fields are typed; anything else is preserved in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserRecord {
    /// Best label for display: username, then email, then id.
    pub fn display_name(&self) -> String {
        self.username
            .clone()
            .or_else(|| self.email.clone())
            .or_else(|| self.id.as_ref().map(|v| v.to_string()))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// The persisted session: who is logged in, with which token, until when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub user: UserRecord,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthSession {
    /// Whether the absolute expiry has passed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left until absolute expiry, zero once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }
}

/// A successful login/refresh answer, before it becomes a session.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthGrant {
    pub token: String,
    pub user: Option<UserRecord>,
    pub expires_in: Option<Value>,
}

impl AuthGrant {
    /// Parse an auth response body.
    ///
    /// Fails with the server's message when `success` is false or no token
    /// is present.
    pub fn from_body(body: &Value) -> std::result::Result<Self, String> {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("authentication rejected")
            .to_string();

        if body.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(message);
        }

        let data = body.get("data").unwrap_or(body);
        let token = data
            .get("access_token")
            .or_else(|| data.get("token"))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| "response carried no access token".to_string())?;

        let user = match data.get("user") {
            Some(Value::Null) | None => None,
            Some(v) => Some(
                serde_json::from_value(v.clone())
                    .map_err(|e| format!("malformed user record: {e}"))?,
            ),
        };

        Ok(Self {
            token: token.to_string(),
            user,
            expires_in: data.get("expires_in").cloned(),
        })
    }

    /// Build the session to persist.
    ///
    /// `previous_user` is kept when the response omits the user.
    pub fn into_session(
        self,
        previous_user: Option<UserRecord>,
        now: DateTime<Utc>,
        default_horizon: std::time::Duration,
    ) -> AuthSession {
        AuthSession {
            expires_at: resolve_expiry(self.expires_in.as_ref(), now, default_horizon),
            user: self.user.or(previous_user).unwrap_or_default(),
            token: self.token,
        }
    }
}

/// Turn an `expires_in` value into an absolute instant after `now`.
///
/// - number, or numeric string: seconds from `now`
/// - RFC 3339 string: absolute instant
/// - object with `date` / `$date`: absolute instant (string, or epoch millis)
///
/// Anything missing, malformed or not in the future yields
/// `now + default_horizon`.
pub fn resolve_expiry(
    raw: Option<&Value>,
    now: DateTime<Utc>,
    default_horizon: std::time::Duration,
) -> DateTime<Utc> {
    let fallback = now
        + Duration::from_std(default_horizon).unwrap_or_else(|_| Duration::hours(1));

    let candidate = match raw {
        Some(Value::Number(n)) => n.as_f64().and_then(|secs| relative(now, secs)),
        Some(Value::String(s)) => parse_string(s, now),
        Some(Value::Object(obj)) => obj
            .get("date")
            .or_else(|| obj.get("$date"))
            .and_then(absolute),
        _ => None,
    };

    match candidate {
        Some(at) if at > now => at,
        _ => fallback,
    }
}

fn relative(now: DateTime<Utc>, secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs <= 0.0 || secs > MAX_RELATIVE_SECS {
        return None;
    }
    now.checked_add_signed(Duration::milliseconds((secs * 1000.0) as i64))
}

fn parse_string(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        return relative(now, secs);
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn absolute(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}
