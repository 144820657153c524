//! REST client for the brain's HTTP surface.
//!
//! All endpoints live under `http://{endpoint}/api/v1/`. Each call carries
//! its own deadline; when retry is enabled, 5xx responses are retried with a
//! short incremental backoff, a 403 short-circuits as `Unauthorized`, and
//! other 4xx responses surface to the caller unretried.

use crate::error::{BrainError, Result};
use crate::types::BrainOptions;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Maximum retry attempts on 5xx when retry is enabled.
const DEFAULT_MAX_RETRIES: u32 = 10;

/// Callback invoked with `true` when a request starts and `false` when it
/// completes, success or not.
pub type PendingCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Retry 5xx responses up to the policy limit
    pub auto_retry: bool,
    /// Override the client-wide deadline
    pub timeout: Option<Duration>,
}

/// HTTP client for the brain's REST API.
pub struct RestClient {
    http: reqwest::Client,
    base: Url,
    timeout: Duration,
    max_retries: u32,
    token: Mutex<Option<String>>,
    pending: Mutex<Option<PendingCallback>>,
}

impl RestClient {
    /// Create a client for `http://{endpoint}/api/v1/`.
    pub fn new(endpoint: &str, opts: &BrainOptions) -> Result<Self> {
        let base = Url::parse(&format!("http://{endpoint}/api/v1/"))?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(BrainError::Transport)?;

        Ok(Self {
            http,
            base,
            timeout: opts.http_request_timeout,
            max_retries: DEFAULT_MAX_RETRIES,
            token: Mutex::new(None),
            pending: Mutex::new(None),
        })
    }

    /// Set or clear the bearer token added to every request.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.lock().unwrap() = token;
    }

    /// Install the pending-indicator callback.
    pub fn set_pending_callback(&self, cb: Option<PendingCallback>) {
        *self.pending.lock().unwrap() = cb;
    }

    /// GET with optional query arguments.
    ///
    /// Arrays are encoded as `k[i]`, nested objects as `k[sub]` with the
    /// inner value JSON-stringified.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        args: Option<&Value>,
        opts: CallOptions,
    ) -> Result<T> {
        let mut url = self.join(path)?;
        if let Some(args) = args {
            encode_query(&mut url, args);
        }
        self.request(Method::GET, url, None, opts).await
    }

    /// POST with an optional JSON body.
    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&Value>,
        opts: CallOptions,
    ) -> Result<T> {
        self.request(Method::POST, self.join(path)?, body.cloned(), opts)
            .await
    }

    /// PATCH with an optional JSON body.
    pub async fn patch<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&Value>,
        opts: CallOptions,
    ) -> Result<T> {
        self.request(Method::PATCH, self.join(path)?, body.cloned(), opts)
            .await
    }

    /// DELETE with an optional JSON body.
    pub async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&Value>,
        opts: CallOptions,
    ) -> Result<T> {
        self.request(Method::DELETE, self.join(path)?, body.cloned(), opts)
            .await
    }

    fn join(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    fn set_pending(&self, pending: bool) {
        if let Some(cb) = self.pending.lock().unwrap().clone() {
            cb(pending);
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
        opts: CallOptions,
    ) -> Result<T> {
        self.set_pending(true);
        let result = self.request_inner(method, url, body, opts).await;
        self.set_pending(false);
        result
    }

    async fn request_inner<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
        opts: CallOptions,
    ) -> Result<T> {
        let deadline = opts.timeout.unwrap_or(self.timeout);
        let mut attempt: u32 = 0;

        loop {
            debug!(%method, %url, attempt, "REST request");

            let mut builder = self
                .http
                .request(method.clone(), url.clone())
                .timeout(deadline);

            if let Some(token) = self.token.lock().unwrap().clone() {
                builder = builder.bearer_auth(token);
            }
            if method != Method::GET {
                builder = builder.header(
                    reqwest::header::CONTENT_TYPE,
                    "application/json; charset=utf-8",
                );
            }
            if let Some(ref body) = body {
                builder = builder.body(serde_json::to_vec(body)?);
            }

            let response = match builder.send().await {
                Ok(r) => r,
                Err(e) if e.is_timeout() => return Err(BrainError::Timeout),
                Err(e) => return Err(BrainError::Transport(e)),
            };

            let status = response.status();

            if status == StatusCode::FORBIDDEN {
                return Err(BrainError::Unauthorized);
            }

            if status.is_server_error() && opts.auto_retry && attempt < self.max_retries {
                attempt += 1;
                debug!(%url, %status, attempt, "retrying 5xx response");
                tokio::time::sleep(Duration::from_millis(100) * attempt).await;
                continue;
            }

            let body_text = response.text().await.map_err(BrainError::Transport)?;

            if !status.is_success() {
                return Err(BrainError::Http {
                    status: status.as_u16(),
                    body: body_text,
                });
            }

            return serde_json::from_str(&body_text).map_err(BrainError::Json);
        }
    }
}

/// Encode a JSON object into query pairs: arrays as `k[i]`, nested objects
/// as `k[sub]` with the inner value JSON-stringified, everything else as
/// its plain text form.
fn encode_query(url: &mut Url, args: &Value) {
    let Some(obj) = args.as_object() else {
        return;
    };
    let mut pairs = url.query_pairs_mut();
    for (key, value) in obj {
        match value {
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    pairs.append_pair(&format!("{key}[{i}]"), &plain(item));
                }
            }
            Value::Object(inner) => {
                for (sub, item) in inner {
                    pairs.append_pair(
                        &format!("{key}[{sub}]"),
                        &serde_json::to_string(item).unwrap_or_default(),
                    );
                }
            }
            other => {
                pairs.append_pair(key, &plain(other));
            }
        }
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
