//! Client-side session and request layer.
//!
//! This crate sits between an application and a remote HTTP API:
//! - keeps the auth token in durable storage and shares it across processes
//! - expires sessions after user inactivity
//! - refreshes the token once, however many requests hit a 401 together
//! - refreshes proactively shortly before the token expires
//! - retries transient failures with bounded exponential backoff
//! - caches idempotent reads for a short TTL
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_session::{SessionFacade, SessionSettings};
//!
//! let session = SessionFacade::builder()
//!     .settings(SessionSettings::new().with_api_base("https://api.example.com"))
//!     .build()?;
//!
//! session.login(&serde_json::json!({ "username": "ada", "password": "..." })).await?;
//! session.start_proactive_refresh();
//!
//! let widgets: Vec<Widget> = session.executor().get("/widgets").await?;
//! ```

mod activity;
mod api_base;
mod cache;
mod clock;
mod config;
mod error;
mod executor;
mod facade;
mod navigator;
mod refresh;
mod retry;
mod storage;
mod store;
mod token;
mod transport;
mod watcher;

#[cfg(test)]
mod test_support;

pub use activity::{ActivityEvent, ActivityTracker};
pub use api_base::resolve_api_base;
pub use cache::{CacheEntry, ResponseCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::SessionSettings;
pub use error::{Error, Result};
pub use executor::{CacheMode, CallOptions, MultipartOptions, RequestExecutor};
pub use facade::{SessionFacade, SessionFacadeBuilder};
pub use navigator::{LogoutReason, Navigator, NoopNavigator, SessionTerminator};
pub use refresh::{RefreshCoordinator, RefreshOutcome, ScheduleDecision};
pub use retry::{RetryPolicy, is_retryable_status, with_retry};
pub use storage::{ACTIVITY_KEY, FileStorage, MemoryStorage, SESSION_KEY, SharedStorage, Storage};
pub use store::{ChangeOrigin, SessionChange, TokenStore};
pub use token::{AuthGrant, AuthSession, UserRecord, resolve_expiry};
pub use transport::{
    FormPart, HttpRequest, HttpResponse, HttpTransport, MultipartForm, ReqwestTransport,
    RequestBody, TransportError, join_url,
};
pub use watcher::{DEFAULT_DEBOUNCE, StorageWatcher};
