//! The session as the application sees it.
//!
//! [`SessionFacade`] owns every session component and is the only place a
//! session is torn down: the coordinator and executor reach
//! [`SessionFacade::force_logout`] through a weak [`SessionTerminator`]
//! handle.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::Method;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::ActivityTracker;
use crate::cache::ResponseCache;
use crate::clock::{SharedClock, SystemClock};
use crate::config::SessionSettings;
use crate::error::{Error, Result};
use crate::executor::{RequestExecutor, into_error};
use crate::navigator::{LogoutReason, Navigator, NoopNavigator, SessionTerminator};
use crate::refresh::{RefreshCoordinator, RefreshOutcome, ScheduleDecision};
use crate::retry::with_retry;
use crate::storage::{FileStorage, MemoryStorage, SharedStorage};
use crate::store::{ChangeOrigin, SessionChange, TokenStore};
use crate::token::{AuthGrant, AuthSession, UserRecord};
use crate::transport::{HttpRequest, HttpTransport, ReqwestTransport, RequestBody, join_url};
use crate::watcher::StorageWatcher;

struct FacadeInner {
    settings: SessionSettings,
    clock: SharedClock,
    store: TokenStore,
    activity: ActivityTracker,
    cache: ResponseCache,
    refresh: RefreshCoordinator,
    executor: RequestExecutor,
    transport: Arc<dyn HttpTransport>,
    navigator: Arc<dyn Navigator>,
    validity: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<StorageWatcher>>,
}

impl Drop for FacadeInner {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}

impl SessionTerminator for FacadeInner {
    fn force_logout(&self, reason: LogoutReason) {
        info!(%reason, "Ending session");
        self.refresh.cancel();
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear stored session");
        }
        self.activity.stop_heartbeat();
        self.activity.clear();
        self.cache.clear();

        let was_valid = self.validity.send_replace(false);
        if was_valid {
            self.navigator.redirect_to_login(reason);
        }
    }
}

impl FacadeInner {
    /// React to a session change made by another process.
    fn on_change(&self, change: SessionChange) {
        if change.origin() == ChangeOrigin::Local {
            return;
        }
        match change {
            SessionChange::Saved { session, .. } => {
                debug!(expires_at = %session.expires_at, "Adopting session from another process");
                self.cache.clear();
                self.activity.reload_external();
                self.validity.send_replace(true);
                self.refresh.schedule_next(session.expires_at);
            }
            SessionChange::Cleared { .. } => {
                info!("Logged out by another process");
                // Storage is already clear; only drop local state.
                self.refresh.cancel();
                self.cache.clear();
                self.activity.stop_heartbeat();
                self.activity.forget();
                if self.validity.send_replace(false) {
                    self.navigator.redirect_to_login(LogoutReason::ExternalLogout);
                }
            }
        }
    }
}

/// Lifecycle controls and validity signal for one session.
#[derive(Clone)]
pub struct SessionFacade {
    inner: Arc<FacadeInner>,
}

impl std::fmt::Debug for SessionFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFacade")
            .field("authenticated", &self.is_authenticated())
            .field("api_base", &self.inner.settings.api_base)
            .finish()
    }
}

impl SessionFacade {
    /// Start building a facade.
    pub fn builder() -> SessionFacadeBuilder {
        SessionFacadeBuilder::default()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Arm the refresh timer for the stored session, start the activity
    /// heartbeat, and begin following changes made by other processes.
    ///
    /// Returns what was scheduled, or `None` when logged out.
    pub fn start_proactive_refresh(&self) -> Option<ScheduleDecision> {
        {
            let mut listener = self.inner.listener.lock();
            if listener.as_ref().is_none_or(|h| h.is_finished()) {
                *listener = Some(spawn_listener(&self.inner));
            }
        }

        let session = self.inner.store.load()?;
        self.inner.activity.start_heartbeat();
        Some(self.inner.refresh.schedule_next(session.expires_at))
    }

    /// Cancel the refresh timer, the heartbeat and the change listener.
    pub fn stop_proactive_refresh(&self) {
        self.inner.refresh.cancel();
        self.inner.activity.stop_heartbeat();
        if let Some(handle) = self.inner.listener.lock().take() {
            handle.abort();
        }
    }

    /// End the session: clear token, activity and cache, cancel timers,
    /// signal invalidity and redirect to login. Safe to call repeatedly.
    pub fn force_logout(&self, reason: LogoutReason) {
        self.inner.force_logout(reason);
    }

    /// Refresh the token now, as an error-returning call.
    ///
    /// Joins a refresh already in flight.
    pub async fn refresh_now(&self) -> Result<String> {
        match self.inner.refresh.refresh().await {
            RefreshOutcome::Refreshed(token) => Ok(token),
            RefreshOutcome::Rejected => Err(Error::RefreshFailed(
                "the server did not renew the session".to_string(),
            )),
            RefreshOutcome::Unavailable => Err(Error::Transient {
                status: None,
                message: "token refresh unavailable".to_string(),
            }),
            RefreshOutcome::IdleExpired => Err(Error::SessionExpired),
        }
    }

    /// Time until the stored session's absolute expiry; zero when logged out.
    pub fn remaining_session_time(&self) -> Duration {
        self.inner
            .store
            .load()
            .map(|s| s.remaining_at(self.inner.clock.now()))
            .unwrap_or_default()
    }

    /// Time until idle expiry, if there is an activity record.
    pub fn remaining_idle_time(&self) -> Option<Duration> {
        self.inner.activity.idle_remaining()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Authentication
    // ─────────────────────────────────────────────────────────────────────

    /// Exchange credentials for a session.
    ///
    /// On success the session is stored, activity is recorded and the
    /// proactive refresh is armed.
    pub async fn login<C: Serialize + ?Sized>(&self, credentials: &C) -> Result<AuthSession> {
        let inner = &self.inner;
        let url = join_url(&inner.settings.api_base, &inner.settings.login_endpoint)?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let request = HttpRequest {
            method: Method::POST,
            url,
            headers,
            body: RequestBody::Json(serde_json::to_value(credentials)?),
        };

        let response = with_retry(&inner.settings.retry, "login", || {
            inner.transport.send(request.clone())
        })
        .await
        .map_err(|e| Error::Transient {
            status: None,
            message: e.to_string(),
        })?;
        if !response.is_success() {
            return Err(into_error(&response));
        }

        let grant = AuthGrant::from_body(&response.json()?).map_err(|message| {
            Error::Authentication {
                status: response.status,
                message,
            }
        })?;
        let session = grant.into_session(None, inner.clock.now(), inner.settings.default_session);

        inner.cache.clear();
        inner.store.save(&session)?;
        inner.activity.touch();
        inner.activity.start_heartbeat();
        inner.validity.send_replace(true);
        inner.refresh.schedule_next(session.expires_at);

        info!(user = %session.user.display_name(), expires_at = %session.expires_at, "Logged in");
        Ok(session)
    }

    /// Log out at the user's request.
    ///
    /// The server is told on a best-effort basis; local state is cleared
    /// regardless.
    pub async fn logout(&self) {
        if let Some(token) = self.inner.store.token() {
            self.notify_logout(&token).await;
        }
        self.force_logout(LogoutReason::UserInitiated);
    }

    async fn notify_logout(&self, token: &str) {
        let settings = &self.inner.settings;
        let Ok(url) = join_url(&settings.api_base, &settings.logout_endpoint) else {
            return;
        };
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert(AUTHORIZATION, value);
        }

        let request = HttpRequest {
            method: Method::POST,
            url,
            headers,
            body: RequestBody::Empty,
        };
        match self.inner.transport.send(request).await {
            Ok(response) if response.is_success() => debug!("Server acknowledged logout"),
            Ok(response) => debug!(status = response.status, "Server logout not acknowledged"),
            Err(e) => debug!(error = %e, "Server logout unreachable"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // State
    // ─────────────────────────────────────────────────────────────────────

    /// Whether a stored session exists and has not passed its expiry.
    pub fn is_authenticated(&self) -> bool {
        self.inner
            .store
            .load()
            .is_some_and(|s| !s.is_expired_at(self.inner.clock.now()))
    }

    /// The logged-in user.
    pub fn current_user(&self) -> Option<UserRecord> {
        self.inner.store.load().map(|s| s.user)
    }

    /// The stored session.
    pub fn session(&self) -> Option<AuthSession> {
        self.inner.store.load()
    }

    /// Receiver that flips to `false` whenever the session ends.
    pub fn watch_validity(&self) -> watch::Receiver<bool> {
        self.inner.validity.subscribe()
    }

    /// Follow another process's writes to a file-backed storage directory.
    pub fn watch_storage(&self, storage: &FileStorage, debounce: Duration) -> Result<()> {
        let watcher = StorageWatcher::start(
            storage,
            self.inner.store.clone(),
            self.inner.activity.clone(),
            debounce,
        )?;
        *self.inner.watcher.lock() = Some(watcher);
        Ok(())
    }

    /// The watched storage directory, if any.
    pub fn watched_dir(&self) -> Option<std::path::PathBuf> {
        self.inner
            .watcher
            .lock()
            .as_ref()
            .map(|w| w.dir().to_path_buf())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Components
    // ─────────────────────────────────────────────────────────────────────

    pub fn executor(&self) -> &RequestExecutor {
        &self.inner.executor
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.inner.activity
    }

    pub fn refresh_coordinator(&self) -> &RefreshCoordinator {
        &self.inner.refresh
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.inner.store
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.inner.cache
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }
}

fn spawn_listener(inner: &Arc<FacadeInner>) -> JoinHandle<()> {
    let mut rx = inner.store.subscribe();
    let weak: Weak<FacadeInner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        loop {
            let change = match rx.recv().await {
                Ok(change) => change,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session change listener lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.on_change(change);
        }
    })
}

/// Builder for [`SessionFacade`].
///
/// Everything is optional: settings default to [`SessionSettings::default`],
/// storage to memory, the transport to `reqwest`, the navigator to a
/// logging no-op and the clock to the system clock.
#[derive(Default)]
pub struct SessionFacadeBuilder {
    settings: Option<SessionSettings>,
    storage: Option<SharedStorage>,
    transport: Option<Arc<dyn HttpTransport>>,
    navigator: Option<Arc<dyn Navigator>>,
    clock: Option<SharedClock>,
}

impl SessionFacadeBuilder {
    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn storage(mut self, storage: SharedStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Wire the components together.
    pub fn build(self) -> Result<SessionFacade> {
        let settings = self.settings.unwrap_or_default();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(settings.request_timeout)?),
        };
        let navigator = self.navigator.unwrap_or_else(|| Arc::new(NoopNavigator));

        let store = TokenStore::new(storage.clone());
        let activity = ActivityTracker::new(storage, clock.clone(), &settings);
        let cache = ResponseCache::new(clock.clone(), settings.cache_ttl);
        let valid = store
            .load()
            .is_some_and(|s| !s.is_expired_at(clock.now()));
        let (validity, _) = watch::channel(valid);

        let inner = Arc::new_cyclic(|weak: &Weak<FacadeInner>| {
            let terminator: Weak<dyn SessionTerminator> = weak.clone();
            let refresh = RefreshCoordinator::new(
                settings.clone(),
                store.clone(),
                activity.clone(),
                transport.clone(),
                clock.clone(),
                terminator.clone(),
            );
            let executor = RequestExecutor::new(
                settings.clone(),
                store.clone(),
                activity.clone(),
                cache.clone(),
                refresh.clone(),
                transport.clone(),
                terminator,
            );
            FacadeInner {
                settings,
                clock,
                store,
                activity,
                cache,
                refresh,
                executor,
                transport,
                navigator,
                validity,
                listener: Mutex::new(None),
                watcher: Mutex::new(None),
            }
        });

        Ok(SessionFacade { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::retry::RetryPolicy;
    use crate::test_support::{Recorder, ScriptedTransport};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    struct Harness {
        facade: SessionFacade,
        transport: ScriptedTransport,
        storage: SharedStorage,
        clock: ManualClock,
        navigator: Arc<Recorder>,
    }

    fn harness_with(storage: SharedStorage) -> Harness {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        let transport = ScriptedTransport::new();
        let navigator = Recorder::new();
        let facade = SessionFacade::builder()
            .settings(
                SessionSettings::new()
                    .with_api_base("http://api.test")
                    .with_retry(RetryPolicy::none()),
            )
            .storage(storage.clone())
            .transport(Arc::new(transport.clone()))
            .navigator(navigator.clone())
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        Harness {
            facade,
            transport,
            storage,
            clock,
            navigator,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemoryStorage::new()))
    }

    fn grant(token: &str) -> serde_json::Value {
        json!({
            "success": true,
            "data": {"access_token": token, "user": {"username": "ada"}, "expires_in": 3600}
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_stores_session_and_arms_timer() {
        let h = harness();
        h.transport.reply("/login", 200, grant("t1"));
        let validity = h.facade.watch_validity();
        assert!(!*validity.borrow());

        let session = h
            .facade
            .login(&json!({"username": "ada", "password": "pw"}))
            .await
            .unwrap();

        assert_eq!(session.expires_at, h.clock.now() + chrono::Duration::seconds(3600));
        assert!(h.facade.is_authenticated());
        assert_eq!(h.facade.current_user().unwrap().display_name(), "ada");
        assert!(*validity.borrow());

        let fire_at = h.facade.refresh_coordinator().scheduled_at().unwrap();
        assert!(fire_at < session.expires_at);
        assert_eq!(h.facade.remaining_session_time(), Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_rejected() {
        let h = harness();
        h.transport
            .reply("/login", 200, json!({"success": false, "message": "bad password"}));

        let err = h.facade.login(&json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Authentication { ref message, .. } if message == "bad password"));
        assert!(!h.facade.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_logout_is_idempotent() {
        let h = harness();
        h.transport.reply("/login", 200, grant("t1"));
        h.facade.login(&json!({})).await.unwrap();
        h.facade.cache().set("k", json!(1));

        h.facade.force_logout(LogoutReason::IdleTimeout);
        h.facade.force_logout(LogoutReason::IdleTimeout);

        assert!(h.facade.session().is_none());
        assert!(h.facade.activity().last_activity().is_none());
        assert!(h.facade.refresh_coordinator().scheduled_at().is_none());
        assert!(h.facade.cache().is_empty());
        assert!(!*h.facade.watch_validity().borrow());
        assert_eq!(h.navigator.reasons(), vec![LogoutReason::IdleTimeout]);
        assert_eq!(h.facade.remaining_session_time(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_notifies_server() {
        let h = harness();
        h.transport.reply("/login", 200, grant("t1"));
        h.transport.reply("/logout", 500, json!({}));
        h.facade.login(&json!({})).await.unwrap();

        h.facade.logout().await;

        assert_eq!(h.transport.count("/logout"), 1);
        assert!(!h.facade.is_authenticated());
        assert_eq!(h.navigator.reasons(), vec![LogoutReason::UserInitiated]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_proactive_refresh() {
        let h = harness();
        assert!(h.facade.start_proactive_refresh().is_none());

        h.transport.reply("/login", 200, grant("t1"));
        h.facade.login(&json!({})).await.unwrap();
        let decision = h.facade.start_proactive_refresh().unwrap();
        assert!(matches!(decision, ScheduleDecision::Armed { .. }));
        assert!(h.facade.activity().heartbeat_running());

        h.facade.stop_proactive_refresh();
        assert!(h.facade.refresh_coordinator().scheduled_at().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_logout_clears_local_state() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let h = harness_with(storage.clone());
        h.transport.reply("/login", 200, grant("t1"));
        h.facade.login(&json!({})).await.unwrap();
        h.facade.start_proactive_refresh();

        // Another process over the same storage logs out.
        let other = TokenStore::new(storage);
        other.clear().unwrap();
        h.facade.token_store().reload_external().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(!h.facade.is_authenticated());
        assert!(h.facade.refresh_coordinator().scheduled_at().is_none());
        assert_eq!(h.navigator.reasons(), vec![LogoutReason::ExternalLogout]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_login_reschedules() {
        let h = harness();
        h.facade.start_proactive_refresh();

        let other = TokenStore::new(h.storage.clone());
        let expires_at = h.clock.now() + chrono::Duration::hours(2);
        other
            .save(&AuthSession {
                user: UserRecord::default(),
                token: "elsewhere".to_string(),
                expires_at,
            })
            .unwrap();
        h.facade.token_store().reload_external().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(h.facade.is_authenticated());
        assert!(*h.facade.watch_validity().borrow());
        assert_eq!(
            h.facade.refresh_coordinator().scheduled_at(),
            Some(expires_at - chrono::Duration::minutes(5))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_now_maps_outcomes() {
        let h = harness();
        h.transport.reply("/login", 200, grant("t1"));
        h.facade.login(&json!({})).await.unwrap();

        h.transport
            .reply("/refresh-token", 200, grant("t2"))
            .reply("/refresh-token", 401, json!({"message": "revoked"}));
        assert_eq!(h.facade.refresh_now().await.unwrap(), "t2");

        let err = h.facade.refresh_now().await.unwrap_err();
        assert!(matches!(err, Error::RefreshFailed(_)));
        assert!(err.is_auth_error());
        assert!(!h.facade.is_authenticated());
        assert_eq!(h.navigator.reasons(), vec![LogoutReason::RefreshRejected]);
    }
}
