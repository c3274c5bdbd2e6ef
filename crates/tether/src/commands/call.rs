//! Call command - send a request through the managed session.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::Args;
use reqwest::Method;
use reqwest::header::{HeaderName, HeaderValue};
use serde_json::Value;
use tether_session::{CacheMode, CallOptions, MultipartForm, MultipartOptions};

use super::{Context, describe_error};

/// Arguments for the call command.
#[derive(Args, Debug)]
pub struct CallArgs {
    /// HTTP method (GET, POST, PUT, PATCH, DELETE, HEAD)
    pub method: String,

    /// Endpoint path relative to the API base, or an absolute URL
    pub endpoint: String,

    /// JSON request body, or @path to read it from a file
    #[arg(short, long)]
    pub data: Option<String>,

    /// Extra header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Multipart text field as name=value (repeatable)
    #[arg(long = "form", conflicts_with = "data")]
    pub form: Vec<String>,

    /// Multipart file field as name=path (repeatable)
    #[arg(long = "file", conflicts_with = "data")]
    pub files: Vec<String>,

    /// Skip the response cache for this call
    #[arg(long)]
    pub no_cache: bool,
}

/// Run the call command.
pub async fn run(args: CallArgs, ctx: &Context) -> Result<()> {
    let method = parse_method(&args.method)?;
    let headers = args
        .headers
        .iter()
        .map(|h| parse_header(h))
        .collect::<Result<Vec<_>>>()?;

    let session = ctx.open_session().await?;
    let executor = session.facade.executor();

    let result = if args.form.is_empty() && args.files.is_empty() {
        let mut options = CallOptions::new(method);
        if let Some(data) = &args.data {
            options = options.with_body(read_body(data)?);
        }
        for (name, value) in headers {
            options = options.with_header(name, value);
        }
        let cache = if args.no_cache {
            CacheMode::Bypass
        } else {
            CacheMode::Use
        };
        executor.call_value(&args.endpoint, options, cache).await
    } else {
        let mut options =
            MultipartOptions::new(build_form(&args.form, &args.files)?).with_method(method);
        for (name, value) in headers {
            options = options.with_header(name, value);
        }
        executor.call_multipart::<Value>(&args.endpoint, options).await
    };

    let value = result.map_err(|e| anyhow::anyhow!("{}", describe_error(&e)))?;
    if ctx.json_output {
        println!("{}", serde_json::to_string(&value)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

fn parse_method(s: &str) -> Result<Method> {
    match s.to_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        "HEAD" => Ok(Method::HEAD),
        other => Err(anyhow::anyhow!(
            "Unknown method '{}'. Valid: GET, POST, PUT, PATCH, DELETE, HEAD",
            other
        )),
    }
}

fn parse_header(s: &str) -> Result<(HeaderName, HeaderValue)> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("Header must look like 'Name: value', got '{}'", s))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .with_context(|| format!("Invalid header name in '{}'", s))?;
    let value = HeaderValue::from_str(value.trim())
        .with_context(|| format!("Invalid header value in '{}'", s))?;
    Ok((name, value))
}

fn read_body(data: &str) -> Result<Value> {
    let text = match data.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request body from {}", path))?,
        None => data.to_string(),
    };
    serde_json::from_str(&text).context("Request body is not valid JSON")
}

fn split_pair(s: &str) -> Result<(&str, &str)> {
    s.split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Expected name=value, got '{}'", s))
}

fn build_form(fields: &[String], files: &[String]) -> Result<MultipartForm> {
    let mut form = MultipartForm::new();
    for field in fields {
        let (name, value) = split_pair(field)?;
        form = form.text(name, value);
    }
    for file in files {
        let (name, path) = split_pair(file)?;
        let path = PathBuf::from(path);
        let bytes =
            std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        form = form.file(name, file_name(&path), None, bytes);
    }
    Ok(form)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string())
}
