//! PostgREST client for the hosted data service.
//!
//! Rows live under `{url}/rest/v1/{table}`, stored procedures under
//! `{url}/rest/v1/rpc/{name}`. Every request carries the anon key both as
//! `apikey` and as a bearer token.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::{realtime, ChangeFilter, ChangeStream, RemoteDataService, RowQuery};
use crate::config::Config;
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct SupabaseClient {
    http: Client,
    base_url: String,
    anon_key: String,
    heartbeat: Duration,
}

impl std::fmt::Debug for SupabaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl SupabaseClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.supabase_url.clone(),
            anon_key: config.anon_key.clone(),
            heartbeat: config.heartbeat_interval,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str, params: &[(String, String)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/rest/v1/{path}", self.base_url))
            .map_err(|e| Error::Config(format!("Invalid Supabase URL: {e}")))?;
        if !params.is_empty() {
            let mut qp = url.query_pairs_mut();
            for (k, v) in params {
                qp.append_pair(k, v);
            }
        }
        Ok(url)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.anon_key))
            .header("Content-Type", "application/json")
    }

    async fn execute(&self, req: RequestBuilder, what: &str) -> Result<Value> {
        let resp = self
            .authorized(req)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        if !status.is_success() {
            let err = remote_error(status, &body);
            warn!(call = what, status = status.as_u16(), error = %err, "remote call failed");
            return Err(err);
        }

        debug!(call = what, status = status.as_u16(), "remote call ok");
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| Error::Decode(format!("Invalid JSON from {what}: {e}")))
    }
}

#[async_trait]
impl RemoteDataService for SupabaseClient {
    async fn select(&self, query: &RowQuery) -> Result<Vec<Value>> {
        let url = self.endpoint(&query.table, &query.to_params())?;
        let value = self.execute(self.http.get(url), &query.table).await?;
        into_rows(value)
    }

    async fn update(&self, query: &RowQuery, patch: Value) -> Result<Vec<Value>> {
        let url = self.endpoint(&query.table, &query.to_params())?;
        let req = self
            .http
            .patch(url)
            .header("Prefer", "return=representation")
            .json(&patch);
        let value = self.execute(req, &query.table).await?;
        into_rows(value)
    }

    async fn rpc(&self, function: &str, args: Value) -> Result<Value> {
        let url = self.endpoint(&format!("rpc/{function}"), &[])?;
        self.execute(self.http.post(url).json(&args), function).await
    }

    async fn subscribe(&self, filter: ChangeFilter) -> Result<ChangeStream> {
        realtime::open(&self.base_url, &self.anon_key, filter, self.heartbeat).await
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn friendly_error(url: &str, err: &reqwest::Error) -> Error {
    let message = if err.is_connect() {
        format!("Cannot reach the data service at {url}")
    } else if err.is_timeout() {
        format!("Connection to {url} timed out")
    } else if err.is_builder() {
        format!("Invalid data service URL: {url}")
    } else {
        format!("Network error communicating with {url}: {err}")
    };
    Error::Transport(message)
}

fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Access denied by the data service".to_string(),
        404 => "Data service endpoint not found".to_string(),
        s if s >= 500 => format!("Data service error (HTTP {s})"),
        s => format!("Unexpected response from the data service (HTTP {s})"),
    }
}

/// Keep the service's own wording so business errors ("event closed",
/// "invalid join code") reach the user unchanged.
fn remote_error(status: StatusCode, body: &str) -> Error {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|json| {
        ["message", "error", "details", "hint"].iter().find_map(|key| {
            json.get(*key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
    });
    let message = from_json
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty() && !trimmed.starts_with('{') && !trimmed.starts_with('<'))
                .then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| status_error(status));
    Error::remote(Some(status.as_u16()), message)
}

fn into_rows(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(rows) => Ok(rows),
        Value::Null => Ok(Vec::new()),
        obj @ Value::Object(_) => Ok(vec![obj]),
        other => Err(Error::Decode(format!("expected rows, got {other}"))),
    }
}
