//! Runtime resolution of the API base URL.
//!
//! Deployments can publish `{ "apiBaseUrl": "..." }` at a well-known URL so
//! one build talks to different backends. Resolution happens once, before
//! the session components are constructed.

use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::transport::{HttpRequest, HttpTransport, RequestBody};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeConfig {
    api_base_url: Option<String>,
}

/// Fetch the runtime config document and return its API base.
///
/// Falls back to `fallback` when no URL is configured, the document cannot
/// be fetched or parsed, or the advertised base is not an http(s) URL.
pub async fn resolve_api_base(
    transport: &dyn HttpTransport,
    runtime_config_url: Option<&str>,
    fallback: &str,
) -> String {
    let Some(config_url) = runtime_config_url.filter(|u| !u.trim().is_empty()) else {
        return fallback.to_string();
    };

    match fetch(transport, config_url).await {
        Ok(base) => {
            debug!(api_base = %base, "Resolved API base from runtime config");
            base
        }
        Err(reason) => {
            warn!(url = config_url, %reason, fallback, "Runtime config unavailable, using configured API base");
            fallback.to_string()
        }
    }
}

async fn fetch(transport: &dyn HttpTransport, config_url: &str) -> Result<String, String> {
    let url = Url::parse(config_url).map_err(|e| e.to_string())?;
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let response = transport
        .send(HttpRequest {
            method: Method::GET,
            url,
            headers,
            body: RequestBody::Empty,
        })
        .await
        .map_err(|e| e.to_string())?;
    if !response.is_success() {
        return Err(format!("HTTP {}", response.status));
    }

    let config: RuntimeConfig =
        serde_json::from_slice(&response.body).map_err(|e| e.to_string())?;
    let base = config
        .api_base_url
        .map(|b| b.trim().trim_end_matches('/').to_string())
        .filter(|b| !b.is_empty())
        .ok_or_else(|| "apiBaseUrl missing".to_string())?;

    let parsed = Url::parse(&base).map_err(|e| e.to_string())?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme {}", parsed.scheme()));
    }
    Ok(base)
}
