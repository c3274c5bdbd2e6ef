//! Scripted transport and recorders shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::navigator::{LogoutReason, Navigator, SessionTerminator};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};

type Reply = Result<HttpResponse, TransportError>;

struct Route {
    path: String,
    replies: VecDeque<Reply>,
    fallback: Option<Reply>,
}

/// Transport that answers from per-path queues and records every request.
///
/// The last reply queued for a path repeats once the queue drains.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    routes: Arc<Mutex<Vec<Route>>>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
    latency: Arc<Mutex<Option<Duration>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a JSON reply for requests whose path ends with `path`.
    pub fn reply(&self, path: &str, status: u16, body: Value) -> &Self {
        self.push(path, Ok(HttpResponse::new(status, body.to_string())))
    }

    /// Queue a transport failure.
    pub fn fail(&self, path: &str, error: TransportError) -> &Self {
        self.push(path, Err(error))
    }

    /// Delay every reply, to widen race windows.
    pub fn with_latency(&self, latency: Duration) -> &Self {
        *self.latency.lock() = Some(latency);
        self
    }

    fn push(&self, path: &str, reply: Reply) -> &Self {
        let mut routes = self.routes.lock();
        match routes.iter_mut().find(|r| r.path == path) {
            Some(route) => route.replies.push_back(reply),
            None => routes.push(Route {
                path: path.to_string(),
                replies: VecDeque::from([reply]),
                fallback: None,
            }),
        }
        self
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests whose path ends with `path`.
    pub fn count(&self, path: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.path().ends_with(path))
            .count()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let path = request.url.path().to_string();
        self.requests.lock().push(request);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut routes = self.routes.lock();
        let Some(route) = routes.iter_mut().find(|r| path.ends_with(&r.path)) else {
            return Ok(HttpResponse::new(404, r#"{"message":"no route"}"#));
        };
        match route.replies.pop_front() {
            Some(reply) => {
                if route.replies.is_empty() {
                    route.fallback = Some(reply.clone());
                }
                reply
            }
            None => route
                .fallback
                .clone()
                .unwrap_or_else(|| Ok(HttpResponse::new(404, Vec::new()))),
        }
    }
}

/// Records logout reasons and redirects.
#[derive(Default)]
pub struct Recorder {
    pub reasons: Mutex<Vec<LogoutReason>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reasons(&self) -> Vec<LogoutReason> {
        self.reasons.lock().clone()
    }
}

impl SessionTerminator for Recorder {
    fn force_logout(&self, reason: LogoutReason) {
        self.reasons.lock().push(reason);
    }
}

impl Navigator for Recorder {
    fn redirect_to_login(&self, reason: LogoutReason) {
        self.reasons.lock().push(reason);
    }
}
