//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tether_session::{
    AuthSession, LogoutReason, ManualClock, MemoryStorage, Navigator, ReqwestTransport,
    RetryPolicy, SessionFacade, SessionSettings, SharedStorage,
};

/// Navigator that remembers every redirect.
#[derive(Default)]
pub struct RecordingNavigator {
    reasons: Mutex<Vec<LogoutReason>>,
}

impl RecordingNavigator {
    pub fn reasons(&self) -> Vec<LogoutReason> {
        self.reasons.lock().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn redirect_to_login(&self, reason: LogoutReason) {
        self.reasons.lock().push(reason);
    }
}

/// A mock API with a session facade pointed at it.
pub struct TestApi {
    pub server: MockServer,
    pub facade: SessionFacade,
    pub clock: ManualClock,
    pub navigator: Arc<RecordingNavigator>,
    pub storage: SharedStorage,
}

impl TestApi {
    /// Start with fast retries and default timings.
    pub async fn start() -> Self {
        Self::start_with(|settings| settings).await
    }

    /// Start with adjusted settings.
    pub async fn start_with(tune: impl FnOnce(SessionSettings) -> SessionSettings) -> Self {
        let server = MockServer::start().await;
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        Self::build(server, storage, clock, tune)
    }

    /// Build a facade against an existing server and storage.
    pub fn build(
        server: MockServer,
        storage: SharedStorage,
        clock: ManualClock,
        tune: impl FnOnce(SessionSettings) -> SessionSettings,
    ) -> Self {
        let settings = tune(
            SessionSettings::new()
                .with_api_base(server.uri())
                .with_retry(RetryPolicy {
                    max_retries: 2,
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(100),
                }),
        );
        let navigator = Arc::new(RecordingNavigator::default());
        let facade = SessionFacade::builder()
            .settings(settings)
            .storage(storage.clone())
            .transport(Arc::new(
                ReqwestTransport::new(Duration::from_secs(5)).unwrap(),
            ))
            .navigator(navigator.clone())
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();

        Self {
            server,
            facade,
            clock,
            navigator,
            storage,
        }
    }

    /// Log in, answering the login call once with `token`.
    pub async fn login(&self, token: &str) -> AuthSession {
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(grant(token, json!(3600))))
            .up_to_n_times(1)
            .mount(&self.server)
            .await;

        self.facade
            .login(&json!({"username": "ada", "password": "secret"}))
            .await
            .unwrap()
    }

    /// Paths of every request the server has seen, in order.
    pub async fn request_paths(&self) -> Vec<String> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|r| r.url.path().to_string())
            .collect()
    }

    /// How many requests hit `p`.
    pub async fn hits(&self, p: &str) -> usize {
        self.request_paths().await.iter().filter(|x| *x == p).count()
    }
}

/// Login/refresh success envelope.
pub fn grant(token: &str, expires_in: Value) -> Value {
    json!({
        "success": true,
        "data": {
            "access_token": token,
            "user": {"id": 1, "username": "ada", "role": "admin"},
            "expires_in": expires_in
        }
    })
}
