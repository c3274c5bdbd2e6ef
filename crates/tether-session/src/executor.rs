//! Single entry point for API calls.
//!
//! Every call goes through the same pipeline: idle check, header assembly,
//! cache lookup for safe reads, bounded retry, one refresh-and-retry on 401,
//! then activity bookkeeping and cache write on success.

use std::sync::{Arc, Weak};

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::activity::ActivityTracker;
use crate::cache::ResponseCache;
use crate::config::SessionSettings;
use crate::error::{Error, Result, message_from_body};
use crate::navigator::{LogoutReason, SessionTerminator};
use crate::refresh::{RefreshCoordinator, RefreshOutcome};
use crate::retry::{is_retryable_status, with_retry};
use crate::store::TokenStore;
use crate::transport::{
    HttpRequest, HttpResponse, HttpTransport, MultipartForm, RequestBody, join_url,
};

/// Whether a call may be answered from, and written to, the response cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
    #[default]
    Use,
    Bypass,
}

/// Method, JSON body and extra headers for [`RequestExecutor::call`].
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub method: Method,
    pub body: Option<Value>,
    pub headers: HeaderMap,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            body: None,
            headers: HeaderMap::new(),
        }
    }
}

impl CallOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn post(body: Value) -> Self {
        Self::new(Method::POST).with_body(body)
    }

    pub fn put(body: Value) -> Self {
        Self::new(Method::PUT).with_body(body)
    }

    pub fn patch(body: Value) -> Self {
        Self::new(Method::PATCH).with_body(body)
    }

    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Add a header. Caller headers override the JSON defaults but never
    /// the bearer token.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Options for [`RequestExecutor::call_multipart`].
#[derive(Debug, Clone)]
pub struct MultipartOptions {
    pub method: Method,
    pub form: MultipartForm,
    pub headers: HeaderMap,
}

impl MultipartOptions {
    /// POST the given form.
    pub fn new(form: MultipartForm) -> Self {
        Self {
            method: Method::POST,
            form,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

struct ExecutorInner {
    settings: SessionSettings,
    store: TokenStore,
    activity: ActivityTracker,
    cache: ResponseCache,
    refresh: RefreshCoordinator,
    transport: Arc<dyn HttpTransport>,
    terminator: Weak<dyn SessionTerminator>,
}

/// Sends API calls with auth, retry, refresh and caching applied.
#[derive(Clone)]
pub struct RequestExecutor {
    inner: Arc<ExecutorInner>,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("api_base", &self.inner.settings.api_base)
            .finish()
    }
}

impl RequestExecutor {
    pub fn new(
        settings: SessionSettings,
        store: TokenStore,
        activity: ActivityTracker,
        cache: ResponseCache,
        refresh: RefreshCoordinator,
        transport: Arc<dyn HttpTransport>,
        terminator: Weak<dyn SessionTerminator>,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                settings,
                store,
                activity,
                cache,
                refresh,
                transport,
                terminator,
            }),
        }
    }

    /// The API base every endpoint is resolved against.
    pub fn api_base(&self) -> &str {
        &self.inner.settings.api_base
    }

    // ─────────────────────────────────────────────────────────────────────
    // Public calls
    // ─────────────────────────────────────────────────────────────────────

    /// Call a JSON endpoint and deserialize the response.
    pub async fn call<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: CallOptions,
        cache: CacheMode,
    ) -> Result<T> {
        let value = self.call_value(endpoint, options, cache).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Call a JSON endpoint and return the raw response value.
    pub async fn call_value(
        &self,
        endpoint: &str,
        options: CallOptions,
        cache: CacheMode,
    ) -> Result<Value> {
        self.ensure_active()?;
        let url = self.url(endpoint)?;

        let cacheable = self.inner.settings.cache_enabled
            && cache == CacheMode::Use
            && ResponseCache::is_cacheable(&options.method);

        if cacheable {
            let headers = self.headers(&options.headers, true, self.inner.store.token().as_deref());
            let key = ResponseCache::key(&options.method, endpoint, options.body.as_ref(), &headers);
            if let Some(hit) = self.inner.cache.get(&key) {
                debug!(endpoint, "Cache hit");
                return Ok(hit);
            }
        }

        let body = match &options.body {
            Some(value) => RequestBody::Json(value.clone()),
            None => RequestBody::Empty,
        };
        let (response, headers) = self
            .send_authorized(endpoint, &options.method, url, body, &options.headers, true)
            .await?;
        let value = self.finish(&response)?;

        if cacheable {
            let key = ResponseCache::key(&options.method, endpoint, options.body.as_ref(), &headers);
            self.inner.cache.set(key, value.clone());
        }
        Ok(value)
    }

    /// Send a multipart body. Never cached; the transport sets the
    /// multipart content type.
    pub async fn call_multipart<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: MultipartOptions,
    ) -> Result<T> {
        self.ensure_active()?;
        let url = self.url(endpoint)?;

        let (response, _) = self
            .send_authorized(
                endpoint,
                &options.method,
                url,
                RequestBody::Multipart(options.form),
                &options.headers,
                false,
            )
            .await?;
        let value = self.finish(&response)?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        self.call(endpoint, CallOptions::get(), CacheMode::Use).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T> {
        let body = serde_json::to_value(body)?;
        self.call(endpoint, CallOptions::post(body), CacheMode::Use).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T> {
        let body = serde_json::to_value(body)?;
        self.call(endpoint, CallOptions::put(body), CacheMode::Use).await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T> {
        let body = serde_json::to_value(body)?;
        self.call(endpoint, CallOptions::patch(body), CacheMode::Use).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        self.call(endpoint, CallOptions::delete(), CacheMode::Use).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pipeline
    // ─────────────────────────────────────────────────────────────────────

    fn ensure_active(&self) -> Result<()> {
        if self.inner.activity.is_idle_expired() {
            warn!("Idle timeout reached, refusing request");
            self.terminate(LogoutReason::IdleTimeout);
            return Err(Error::SessionExpired);
        }
        Ok(())
    }

    fn url(&self, endpoint: &str) -> Result<Url> {
        join_url(&self.inner.settings.api_base, endpoint)
    }

    fn headers(&self, extra: &HeaderMap, json: bool, token: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if json {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        for (name, value) in extra {
            headers.insert(name.clone(), value.clone());
        }
        if let Some(token) = token {
            match HeaderValue::from_str(&format!("Bearer {token}")) {
                Ok(value) => {
                    headers.insert(AUTHORIZATION, value);
                }
                Err(_) => warn!("Stored token is not a valid header value, sending without it"),
            }
        }
        headers
    }

    /// Send with retry; on a 401 from a non-auth endpoint, refresh once and
    /// resend. Returns the final response with the headers it was sent with.
    async fn send_authorized(
        &self,
        endpoint: &str,
        method: &Method,
        url: Url,
        body: RequestBody,
        extra: &HeaderMap,
        json: bool,
    ) -> Result<(HttpResponse, HeaderMap)> {
        let headers = self.headers(extra, json, self.inner.store.token().as_deref());
        let request = HttpRequest {
            method: method.clone(),
            url,
            headers: headers.clone(),
            body,
        };
        let response = self.send(endpoint, &request).await?;

        if response.status != 401 || self.inner.settings.is_auth_endpoint(endpoint) {
            return Ok((response, headers));
        }

        debug!(endpoint, "Unauthorized, attempting token refresh");
        let outcome = self.inner.refresh.refresh().await;
        let Some(token) = outcome.token() else {
            return Err(match &outcome {
                RefreshOutcome::IdleExpired => Error::SessionExpired,
                RefreshOutcome::Unavailable => Error::Transient {
                    status: None,
                    message: "token refresh unavailable".to_string(),
                },
                _ => into_error(&response),
            });
        };

        let headers = self.headers(extra, json, Some(token));
        let retried = HttpRequest {
            headers: headers.clone(),
            ..request
        };
        let response = self.send(endpoint, &retried).await?;
        if response.status == 401 {
            warn!(endpoint, "Still unauthorized after refresh");
            self.terminate(LogoutReason::Unauthorized);
        }
        Ok((response, headers))
    }

    async fn send(&self, endpoint: &str, request: &HttpRequest) -> Result<HttpResponse> {
        with_retry(&self.inner.settings.retry, endpoint, || {
            self.inner.transport.send(request.clone())
        })
        .await
        .map_err(|e| Error::Transient {
            status: None,
            message: e.to_string(),
        })
    }

    /// Turn a final response into a value or an error.
    fn finish(&self, response: &HttpResponse) -> Result<Value> {
        if !response.is_success() {
            return Err(into_error(response));
        }
        self.inner.activity.touch();
        Ok(response.json()?)
    }

    fn terminate(&self, reason: LogoutReason) {
        match self.inner.terminator.upgrade() {
            Some(terminator) => terminator.force_logout(reason),
            None => {
                warn!(%reason, "No session owner, clearing session directly");
                self.inner.refresh.cancel();
                if let Err(e) = self.inner.store.clear() {
                    warn!(error = %e, "Failed to clear session");
                }
                self.inner.activity.clear();
                self.inner.cache.clear();
            }
        }
    }
}

/// Classify a non-2xx response.
pub(crate) fn into_error(response: &HttpResponse) -> Error {
    let body = response.json_opt();
    let message = message_from_body(body.as_ref(), response.status);
    match response.status {
        401 => Error::Authentication {
            status: 401,
            message,
        },
        status if is_retryable_status(status) => Error::Transient {
            status: Some(status),
            message,
        },
        status => Error::Validation {
            status,
            message,
            body,
        },
    }
}
