//! Resilient remote CRM client
//!
//! Every outbound call goes through [`ApiClient::call`], an explicit bounded
//! loop that per attempt:
//! - resolves credentials (refreshing expiring OAuth tokens first)
//! - authorizes and sends the request
//! - logs the attempt with its duration, whatever the outcome
//!
//! Failure handling:
//! - 401: refresh once and retry; a second 401 is `AUTH_FAILED`
//! - 429: wait for `Retry-After` (or backoff), at most `max_retries` times
//! - transport failure: exponential backoff, at most `max_retries` times
//! - any other non-2xx: returned as `HTTP_{status}` without retrying

use super::retry::{FailureKind, RetryBudget, RetryConfig};
use super::transport::{ApiRequest, ApiResponse, Transport, TransportError};
use crate::auth::{Authorize, CredentialResolver};
use crate::ledger::{ApiCallLog, SyncLedger};
use crate::sync::metrics;
use crate::{Result, SyncError};
use chrono::Utc;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Error bodies kept in the call log are cut to this many bytes
const MAX_LOGGED_BODY: usize = 500;

pub struct ApiClient {
    base_url: String,
    api_version: Option<String>,
    transport: Arc<dyn Transport>,
    resolver: Arc<CredentialResolver>,
    retry: RetryConfig,
    call_log: Option<Arc<SyncLedger>>,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        resolver: Arc<CredentialResolver>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_version: None,
            transport,
            resolver,
            retry: RetryConfig::default(),
            call_log: None,
        }
    }

    /// Send a `Version` header with every request
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Append every attempt to the ledger's API call log
    pub fn with_call_log(mut self, ledger: Arc<SyncLedger>) -> Self {
        self.call_log = Some(ledger);
        self
    }

    pub fn tenant_id(&self) -> &str {
        self.resolver.tenant_id()
    }

    pub fn resolver(&self) -> &CredentialResolver {
        &self.resolver
    }

    /// Location the tenant's credentials are scoped to
    pub async fn location_id(&self) -> Result<String> {
        let creds = self.resolver.resolve().await?;
        Ok(creds.location_id().to_string())
    }

    pub async fn get(&self, endpoint: &str) -> Result<Value> {
        self.call(Method::GET, endpoint, None).await
    }

    pub async fn post(&self, endpoint: &str, body: Value) -> Result<Value> {
        self.call(Method::POST, endpoint, Some(body)).await
    }

    pub async fn put(&self, endpoint: &str, body: Value) -> Result<Value> {
        self.call(Method::PUT, endpoint, Some(body)).await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<Value> {
        self.call(Method::DELETE, endpoint, None).await
    }

    /// Call the remote CRM and return the decoded JSON body
    ///
    /// An empty 2xx body decodes as `Value::Null`.
    pub async fn call(&self, method: Method, endpoint: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut budget = RetryBudget::new(&self.retry);
        let mut refreshed = false;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let creds = self.resolver.resolve().await?;
            let mut request = ApiRequest::new(method.clone(), &url)
                .with_header("Accept", "application/json");
            if let Some(ref version) = self.api_version {
                request.set_header("Version", version.as_str());
            }
            if let Some(ref body) = body {
                request = request.with_json(body.clone());
            }
            creds.authorize(&mut request);

            let summary = request.summary();
            let started = Instant::now();
            let outcome = self.transport.send(request).await;
            self.log_attempt(&method, endpoint, summary, &outcome, started.elapsed());

            let response = match outcome {
                Ok(response) => response,
                Err(e) => match budget.next_delay(FailureKind::Transport) {
                    Some(delay) => {
                        warn!(
                            tenant = %self.tenant_id(),
                            endpoint,
                            attempt,
                            backoff_ms = delay.as_millis() as u64,
                            "Transport failure, retrying: {}",
                            e
                        );
                        sleep(delay).await;
                        continue;
                    }
                    None => {
                        return Err(SyncError::Network(format!(
                            "{} {} failed after {} attempts: {}",
                            method, endpoint, attempt, e
                        )))
                    }
                },
            };

            match response.status {
                200..=299 => return Ok(response.body_json::<Value>()?),
                401 => {
                    if refreshed {
                        return Err(SyncError::AuthFailed(format!(
                            "{} {} still unauthorized after token refresh",
                            method, endpoint
                        )));
                    }
                    refreshed = true;
                    match self.resolver.refresh().await {
                        Ok(true) => {
                            debug!(tenant = %self.tenant_id(), endpoint, "Retrying with refreshed token");
                            continue;
                        }
                        Ok(false) => {
                            return Err(SyncError::AuthFailed(format!(
                                "{} {} rejected the configured credentials",
                                method, endpoint
                            )))
                        }
                        Err(e) => return Err(e),
                    }
                }
                429 => {
                    let retry_after = response.retry_after();
                    match budget.next_delay(FailureKind::RateLimited { retry_after }) {
                        Some(delay) => {
                            warn!(
                                tenant = %self.tenant_id(),
                                endpoint,
                                attempt,
                                wait_ms = delay.as_millis() as u64,
                                "Rate limited, waiting before retry"
                            );
                            sleep(delay).await;
                        }
                        None => {
                            return Err(SyncError::RateLimited(
                                retry_after.map(|d| d.as_secs()).unwrap_or(0),
                            ))
                        }
                    }
                }
                status => {
                    return Err(SyncError::Http {
                        status,
                        body: truncate(&response.body, MAX_LOGGED_BODY),
                    })
                }
            }
        }
    }

    fn log_attempt(
        &self,
        method: &Method,
        endpoint: &str,
        request_summary: Option<String>,
        outcome: &std::result::Result<ApiResponse, TransportError>,
        elapsed: Duration,
    ) {
        let duration_ms = elapsed.as_millis() as u64;
        let (status, error_message, label) = match outcome {
            Ok(response) if response.is_success() => {
                (Some(response.status), None, response.status.to_string())
            }
            Ok(response) => (
                Some(response.status),
                Some(truncate(&response.body, MAX_LOGGED_BODY)),
                response.status.to_string(),
            ),
            Err(e) => (None, Some(e.to_string()), "transport_error".to_string()),
        };

        metrics::record_api_call(
            route_label(endpoint),
            method.as_str(),
            &label,
            elapsed.as_secs_f64(),
        );
        debug!(
            tenant = %self.tenant_id(),
            method = %method,
            endpoint,
            status = ?status,
            duration_ms,
            "Remote CRM call"
        );

        if let Some(ref ledger) = self.call_log {
            let entry = ApiCallLog {
                tenant_id: self.tenant_id().to_string(),
                endpoint: endpoint.to_string(),
                method: method.to_string(),
                request_summary,
                response_status: status,
                error_message,
                duration_ms,
                created_at: Utc::now(),
            };
            if let Err(e) = ledger.log_api_call(&entry) {
                warn!(tenant = %self.tenant_id(), "Failed to write API call log: {}", e);
            }
        }
    }
}

/// Low-cardinality metric label: the first path segment
fn route_label(endpoint: &str) -> &str {
    let path = endpoint.split('?').next().unwrap_or(endpoint);
    let trimmed = path.trim_start_matches('/');
    match trimmed.find('/') {
        Some(idx) => &path[..idx + (path.len() - trimmed.len())],
        None => path,
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}
