//! Token refresh coordination.
//!
//! Two jobs live here:
//!
//! - **Single flight.** However many callers ask for a refresh at once, one
//!   request goes to the refresh endpoint and every caller observes its
//!   outcome. The in-flight refresh is a shared future; the slot holding it
//!   is emptied when it resolves.
//! - **Proactive refresh.** After every successful login or refresh a timer
//!   is armed to fire `refresh_lookahead` before expiry. Timers carry a
//!   generation number so a superseded one can never act; at most one is
//!   live.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::Method;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::ActivityTracker;
use crate::clock::SharedClock;
use crate::config::SessionSettings;
use crate::navigator::{LogoutReason, SessionTerminator};
use crate::retry::{is_retryable_status, with_retry};
use crate::store::TokenStore;
use crate::token::AuthGrant;
use crate::transport::{HttpRequest, HttpTransport, RequestBody, join_url};

/// Result of a refresh attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new token is stored.
    Refreshed(String),
    /// The server refused; the session was terminated.
    Rejected,
    /// The server could not be reached or failed transiently; the session
    /// is untouched.
    Unavailable,
    /// The user was idle too long; the session was terminated without a
    /// network call.
    IdleExpired,
}

impl RefreshOutcome {
    /// The new token, if the refresh succeeded.
    pub fn token(&self) -> Option<&str> {
        match self {
            RefreshOutcome::Refreshed(token) => Some(token),
            _ => None,
        }
    }

    pub fn is_refreshed(&self) -> bool {
        matches!(self, RefreshOutcome::Refreshed(_))
    }
}

/// What [`RefreshCoordinator::schedule_next`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// A timer will fire at `fire_at`.
    Armed { fire_at: DateTime<Utc> },
    /// Already inside the refresh window; a refresh was started.
    RefreshNow,
    /// Already past expiry; the session was terminated.
    Expired,
}

type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct TimerSlot {
    generation: u64,
    fire_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

struct CoordinatorInner {
    settings: SessionSettings,
    store: TokenStore,
    activity: ActivityTracker,
    transport: Arc<dyn HttpTransport>,
    clock: SharedClock,
    terminator: Weak<dyn SessionTerminator>,
    in_flight: Mutex<Option<SharedRefresh>>,
    timer: Mutex<Option<TimerSlot>>,
    generation: AtomicU64,
}

impl Drop for CoordinatorInner {
    fn drop(&mut self) {
        if let Some(slot) = self.timer.get_mut().take() {
            slot.handle.abort();
        }
    }
}

/// Serializes token refreshes and owns the proactive refresh timer.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("refreshing", &self.is_refreshing())
            .field("scheduled_at", &self.scheduled_at())
            .finish()
    }
}

impl RefreshCoordinator {
    /// Create a coordinator.
    ///
    /// `terminator` is called whenever a refresh decides the session is
    /// over. If it is gone, the coordinator clears the store and activity
    /// record itself.
    pub fn new(
        settings: SessionSettings,
        store: TokenStore,
        activity: ActivityTracker,
        transport: Arc<dyn HttpTransport>,
        clock: SharedClock,
        terminator: Weak<dyn SessionTerminator>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                settings,
                store,
                activity,
                transport,
                clock,
                terminator,
                in_flight: Mutex::new(None),
                timer: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Obtain a fresh token, joining the refresh already in flight if any.
    pub async fn refresh(&self) -> RefreshOutcome {
        let shared = {
            let mut slot = self.inner.in_flight.lock();
            match slot.as_ref() {
                Some(existing) => {
                    debug!("Joining in-flight refresh");
                    existing.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let handle = tokio::spawn(async move {
                        let outcome = inner.clone().run_refresh().await;
                        *inner.in_flight.lock() = None;
                        outcome
                    });
                    let shared = async move {
                        handle.await.unwrap_or_else(|e| {
                            warn!(error = %e, "Refresh task failed");
                            RefreshOutcome::Unavailable
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(shared.clone());
                    shared
                }
            }
        };
        shared.await
    }

    /// Whether a refresh is in flight.
    pub fn is_refreshing(&self) -> bool {
        self.inner.in_flight.lock().is_some()
    }

    /// Arm the proactive refresh for a session expiring at `expires_at`.
    ///
    /// Any pending timer is cancelled first. Must be called from within a
    /// tokio runtime.
    pub fn schedule_next(&self, expires_at: DateTime<Utc>) -> ScheduleDecision {
        self.cancel();

        let now = self.inner.clock.now();
        if now >= expires_at {
            info!(%expires_at, "Session already expired");
            self.inner.terminate(LogoutReason::SessionExpired);
            return ScheduleDecision::Expired;
        }

        let lookahead = chrono::Duration::from_std(self.inner.settings.refresh_lookahead)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let window = expires_at - lookahead;
        if now >= window {
            debug!(%expires_at, "Inside refresh window, refreshing now");
            arm(&self.inner, now, Duration::ZERO, expires_at);
            return ScheduleDecision::RefreshNow;
        }

        let delay = (window - now).to_std().unwrap_or_default();
        arm(&self.inner, window, delay, expires_at);
        debug!(fire_at = %window, "Proactive refresh armed");
        ScheduleDecision::Armed { fire_at: window }
    }

    /// Cancel the pending timer, if any.
    ///
    /// A timer whose refresh is already in flight is not aborted, but it
    /// will not re-arm itself afterwards.
    pub fn cancel(&self) {
        let mut timer = self.inner.timer.lock();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(slot) = timer.take() {
            debug!(generation = slot.generation, "Refresh timer cancelled");
            slot.handle.abort();
        }
    }

    /// When the pending timer fires, if one is armed.
    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.inner.timer.lock().as_ref().map(|slot| slot.fire_at)
    }
}

/// Spawn a timer into the slot, replacing whatever was there.
fn arm(
    inner: &Arc<CoordinatorInner>,
    fire_at: DateTime<Utc>,
    delay: Duration,
    expires_at: DateTime<Utc>,
) {
    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let weak = Arc::downgrade(inner);

    let mut slot = inner.timer.lock();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };

        {
            let mut slot = inner.timer.lock();
            match slot.as_ref() {
                Some(current) if current.generation == generation => *slot = None,
                _ => return,
            }
        }

        if inner.clock.now() >= expires_at {
            info!(%expires_at, "Session expired before refresh");
            inner.terminate(LogoutReason::SessionExpired);
            return;
        }

        let coordinator = RefreshCoordinator { inner };
        let outcome = coordinator.refresh().await;
        // A reschedule or cancel while the refresh was in flight owns the
        // timer slot now.
        if coordinator.inner.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "Timer superseded during refresh");
            return;
        }
        if outcome == RefreshOutcome::Unavailable && coordinator.inner.store.load().is_some() {
            coordinator.schedule_retry(expires_at);
        }
    });

    if let Some(previous) = slot.replace(TimerSlot {
        generation,
        fire_at,
        handle,
    }) {
        previous.handle.abort();
    }
}

impl RefreshCoordinator {
    /// Re-arm after a transient failure, never past `expires_at`.
    fn schedule_retry(&self, expires_at: DateTime<Utc>) {
        let now = self.inner.clock.now();
        let retry = chrono::Duration::from_std(self.inner.settings.refresh_retry)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let fire_at = (now + retry).min(expires_at);
        let delay = (fire_at - now).to_std().unwrap_or_default();
        info!(%fire_at, "Refresh unavailable, retrying later");
        arm(&self.inner, fire_at, delay, expires_at);
    }
}

impl CoordinatorInner {
    fn terminate(&self, reason: LogoutReason) {
        match self.terminator.upgrade() {
            Some(terminator) => terminator.force_logout(reason),
            None => {
                warn!(%reason, "No session owner, clearing session directly");
                {
                    let mut timer = self.timer.lock();
                    self.generation.fetch_add(1, Ordering::SeqCst);
                    if let Some(slot) = timer.take() {
                        slot.handle.abort();
                    }
                }
                if let Err(e) = self.store.clear() {
                    warn!(error = %e, "Failed to clear session");
                }
                self.activity.clear();
            }
        }
    }

    async fn run_refresh(self: Arc<Self>) -> RefreshOutcome {
        if self.activity.is_idle_expired() {
            info!("Idle timeout reached, not refreshing");
            self.terminate(LogoutReason::IdleTimeout);
            return RefreshOutcome::IdleExpired;
        }

        let Some(session) = self.store.load() else {
            info!("No session to refresh");
            self.terminate(LogoutReason::RefreshRejected);
            return RefreshOutcome::Rejected;
        };

        let url = match join_url(&self.settings.api_base, &self.settings.refresh_endpoint) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Invalid refresh URL");
                return RefreshOutcome::Unavailable;
            }
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        match HeaderValue::from_str(&format!("Bearer {}", session.token)) {
            Ok(value) => {
                headers.insert(AUTHORIZATION, value);
            }
            Err(_) => {
                warn!("Stored token is not a valid header value");
                self.terminate(LogoutReason::RefreshRejected);
                return RefreshOutcome::Rejected;
            }
        }
        let request = HttpRequest {
            method: Method::POST,
            url,
            headers,
            body: RequestBody::Empty,
        };

        debug!("Refreshing token");
        let outcome = with_retry(&self.settings.retry, "refresh", || {
            self.transport.send(request.clone())
        })
        .await;

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Refresh endpoint unreachable");
                return RefreshOutcome::Unavailable;
            }
        };

        if is_retryable_status(response.status) {
            warn!(status = response.status, "Refresh endpoint failed transiently");
            return RefreshOutcome::Unavailable;
        }

        let grant = if response.is_success() {
            response
                .json()
                .map_err(|e| format!("malformed refresh response: {e}"))
                .and_then(|body| AuthGrant::from_body(&body))
        } else {
            Err(format!("refresh endpoint answered {}", response.status))
        };

        // Someone else logged out or replaced the session while we waited.
        match self.store.token() {
            Some(current) if current == session.token => {}
            Some(current) => {
                debug!("Session changed during refresh, discarding result");
                return RefreshOutcome::Refreshed(current);
            }
            None => {
                debug!("Logged out during refresh, discarding result");
                return RefreshOutcome::Rejected;
            }
        }

        let grant = match grant {
            Ok(grant) => grant,
            Err(reason) => {
                warn!(status = response.status, %reason, "Token refresh rejected");
                self.terminate(LogoutReason::RefreshRejected);
                return RefreshOutcome::Rejected;
            }
        };

        let renewed = grant.into_session(
            Some(session.user),
            self.clock.now(),
            self.settings.default_session,
        );
        if let Err(e) = self.store.save(&renewed) {
            warn!(error = %e, "Failed to persist refreshed session");
            return RefreshOutcome::Unavailable;
        }
        self.activity.touch();
        info!(expires_at = %renewed.expires_at, "Token refreshed");

        let expires_at = renewed.expires_at;
        let token = renewed.token;
        RefreshCoordinator { inner: self }.schedule_next(expires_at);
        RefreshOutcome::Refreshed(token)
    }
}
