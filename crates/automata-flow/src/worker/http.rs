//! HTTP executor: outbound requests with bounded response handling.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::executor::{payload_bool, payload_f64, payload_str, ExecutionResult, Executor};
use crate::error::{Error, Result};
use crate::task::Task;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Response bodies are read up to this many bytes.
const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;
/// Error messages embed at most this much of the response body.
const ERROR_BODY_PREVIEW: usize = 200;

/// Executor for `http` steps.
///
/// Config:
/// - `method` (string): HTTP method, uppercased, default `GET`
/// - `url` (string, required)
/// - `headers` (map of string to string)
/// - `body` (any): strings are sent raw; anything else is JSON-encoded with
///   `Content-Type: application/json` defaulted
/// - `timeout_sec` (number): default 30
/// - `follow_redirects` (bool): default true
/// - `validate_ssl` (bool): default true
///
/// Outputs: `{ "status_code", "headers", "body" }`. The body is JSON-parsed
/// when the response Content-Type contains `application/json` (string
/// fallback on parse failure), a plain string otherwise.
///
/// Status codes >= 400 return a logical error `"HTTP {code}: {body}"`
/// alongside the outputs, which is what lets retry policies match on
/// `status_code`.
pub struct HttpExecutor;

impl HttpExecutor {
    /// Creates the executor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Result<ExecutionResult> {
        let payload = &task.payload;

        let method = payload_str(payload, "method", "GET").to_uppercase();
        let url = payload_str(payload, "url", "");
        if url.is_empty() {
            return Err(Error::execution("http step requires a url"));
        }

        let timeout = payload_f64(payload, "timeout_sec")
            .filter(|secs| *secs > 0.0)
            .map_or(DEFAULT_TIMEOUT, Duration::from_secs_f64);
        let follow_redirects = payload_bool(payload, "follow_redirects", true);
        let validate_ssl = payload_bool(payload, "validate_ssl", true);

        let redirect_policy = if follow_redirects {
            reqwest::redirect::Policy::default()
        } else {
            reqwest::redirect::Policy::none()
        };

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(redirect_policy)
            .danger_accept_invalid_certs(!validate_ssl)
            .build()
            .map_err(|err| Error::execution(format!("build http client: {err}")))?;

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| Error::execution(format!("invalid http method: {method}")))?;

        let mut request = client.request(method, url);

        let mut has_content_type = false;
        if let Some(Value::Object(headers)) = payload.get("headers") {
            for (key, value) in headers {
                if let Value::String(value) = value {
                    if key.eq_ignore_ascii_case("content-type") {
                        has_content_type = true;
                    }
                    request = request.header(key, value);
                }
            }
        }

        if let Some(body) = payload.get("body") {
            match body {
                Value::Null => {}
                Value::String(raw) => {
                    request = request.body(raw.clone());
                }
                other => {
                    request = request.body(serde_json::to_vec(other)?);
                    if !has_content_type {
                        request = request.header("Content-Type", "application/json");
                    }
                }
            }
        }

        let response = tokio::select! {
            response = request.send() => {
                response.map_err(|err| Error::execution(format!("http request: {err}")))?
            }
            () = cancel.cancelled() => return Err(Error::Cancelled),
        };

        let status = response.status().as_u16();
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.to_string(), Value::String(value.to_string()));
            }
        }
        let content_type = headers
            .get("content-type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let body_bytes = read_bounded_body(response).await?;
        let body_text = String::from_utf8_lossy(&body_bytes).into_owned();

        let body = if content_type.contains("application/json") {
            serde_json::from_slice(&body_bytes)
                .unwrap_or_else(|_| Value::String(body_text.clone()))
        } else {
            Value::String(body_text.clone())
        };

        let mut outputs = Map::new();
        outputs.insert("status_code".to_string(), Value::from(status));
        outputs.insert("headers".to_string(), Value::Object(headers));
        outputs.insert("body".to_string(), body);

        if status >= 400 {
            let error = format!("HTTP {status}: {}", truncate(&body_text, ERROR_BODY_PREVIEW));
            return Ok(ExecutionResult {
                outputs,
                error: Some(error),
            });
        }

        Ok(ExecutionResult::success(outputs))
    }
}

/// Reads the response body, stopping at [`MAX_RESPONSE_BYTES`].
async fn read_bounded_body(mut response: reqwest::Response) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| Error::execution(format!("read response: {err}")))?
    {
        let remaining = MAX_RESPONSE_BYTES.saturating_sub(body.len());
        if remaining == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
    }
    Ok(body)
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
