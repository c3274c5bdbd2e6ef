//! Logout reasons and the hooks that act on them.

use std::fmt;

use tracing::info;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogoutReason {
    /// No user activity for longer than the idle timeout.
    IdleTimeout,
    /// The absolute expiry passed before a refresh could happen.
    SessionExpired,
    /// The refresh endpoint refused the token.
    RefreshRejected,
    /// A request was still unauthorized after a successful refresh.
    Unauthorized,
    /// Another process ended the session.
    ExternalLogout,
    /// The user asked to log out.
    UserInitiated,
}

impl LogoutReason {
    /// Stable identifier, suitable for a login-page query parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogoutReason::IdleTimeout => "idle_timeout",
            LogoutReason::SessionExpired => "session_expired",
            LogoutReason::RefreshRejected => "refresh_rejected",
            LogoutReason::Unauthorized => "unauthorized",
            LogoutReason::ExternalLogout => "external_logout",
            LogoutReason::UserInitiated => "user_initiated",
        }
    }
}

impl fmt::Display for LogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Takes the user to the login entry point.
///
/// Implemented by whatever shell hosts the session: a UI router, a CLI that
/// prints a hint, a test recorder.
pub trait Navigator: Send + Sync {
    fn redirect_to_login(&self, reason: LogoutReason);
}

/// Navigator that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNavigator;

impl Navigator for NoopNavigator {
    fn redirect_to_login(&self, reason: LogoutReason) {
        info!(%reason, "Login required");
    }
}

/// The single place a session is torn down.
///
/// Components below the facade hold this as a `Weak` so the facade can own
/// them without a reference cycle.
pub trait SessionTerminator: Send + Sync {
    fn force_logout(&self, reason: LogoutReason);
}
