use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use http::header::CONTENT_TYPE;
use http::{Method, Request, Uri};

use crate::engine::http_client::HttpClient;
use crate::stats::{RequestError, RequestResult};
use crate::workload::RequestSpec;

/// Turns dispatch events into HTTP calls and result records. Every call to
/// `dispatch` yields exactly one RequestResult; errors are captured, never
/// raised. The correlation id counter is the only mutable state.
pub struct Executor {
    client: HttpClient,
    endpoint: String,
    api_key: String,
    default_timeout: Duration,
    next_id: AtomicU64,
}

impl Executor {
    pub fn new(
        client: HttpClient,
        base_url: &str,
        rpc_path: &str,
        api_key: impl Into<String>,
        default_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let endpoint = format!("{}{}", base_url.trim_end_matches('/'), rpc_path);
        endpoint
            .parse::<Uri>()
            .map_err(|e| anyhow::anyhow!("invalid endpoint url '{}': {}", endpoint, e))?;
        Ok(Self {
            client,
            endpoint,
            api_key: api_key.into(),
            default_timeout,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Build the JSON-RPC envelope for a spec, tagging it with a fresh
    /// correlation id. Returns the id alongside the serialized body.
    pub fn build_body(&self, spec: &RequestSpec) -> (u64, String) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": spec.method,
            "params": spec.params,
            "id": id,
        });
        (id, body.to_string())
    }

    /// Issue one request and record what happened. Timeouts and transport
    /// failures become error results; non-2xx statuses are recorded as-is
    /// and left to the aggregator's checks.
    pub async fn dispatch(&self, spec: &RequestSpec) -> RequestResult {
        let (request_id, body) = self.build_body(spec);

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.as_str())
            .header(CONTENT_TYPE, "application/json")
            .header("X-API-KEY", self.api_key.as_str());
        for (name, value) in &spec.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let started = Instant::now();
        let request = match builder.body(body) {
            Ok(request) => request,
            Err(e) => {
                // Malformed header names/values surface here
                tracing::warn!(method = %spec.method, error = %e, "failed to build request");
                return RequestResult {
                    request_id,
                    method: spec.method.clone(),
                    duration: started.elapsed(),
                    status: 0,
                    body: None,
                    error: Some(RequestError::Transport),
                };
            }
        };

        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(timeout, self.client.request(request)).await {
            Err(_) => RequestResult {
                request_id,
                method: spec.method.clone(),
                duration: started.elapsed(),
                status: 0,
                body: None,
                error: Some(RequestError::Timeout),
            },
            Ok(Err(e)) => {
                tracing::debug!(method = %spec.method, error = %e, "transport error");
                RequestResult {
                    request_id,
                    method: spec.method.clone(),
                    duration: started.elapsed(),
                    status: 0,
                    body: None,
                    error: Some(RequestError::Transport),
                }
            }
            Ok(Ok(response)) => {
                let duration = started.elapsed();
                let status = response.status().as_u16();
                match serde_json::from_slice::<serde_json::Value>(response.body()) {
                    Ok(parsed) => RequestResult {
                        request_id,
                        method: spec.method.clone(),
                        duration,
                        status,
                        body: Some(parsed),
                        error: None,
                    },
                    Err(_) => RequestResult {
                        request_id,
                        method: spec.method.clone(),
                        duration,
                        status,
                        body: None,
                        error: Some(RequestError::Protocol),
                    },
                }
            }
        }
    }
}
