//! DMS adapter
//!
//! The dealership's management system sits behind an adapter service that
//! answers every call with `{success, data, error}`. The bridge only needs
//! contact and appointment saves.

use super::retry::{with_retry, RetryConfig};
use crate::config::DmsConfig;
use crate::ledger::{LocalAppointment, LocalContact};
use crate::{Result, SyncError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Per-request timeout for DMS writes
const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

/// Writes into the dealership's DMS
#[async_trait]
pub trait DmsAdapter: Send + Sync {
    /// Create a contact and return its DMS id
    async fn create_contact(&self, tenant_id: &str, contact: &LocalContact) -> Result<String>;

    async fn update_contact(&self, tenant_id: &str, contact: &LocalContact) -> Result<()>;

    /// Create an appointment and return its DMS id
    async fn create_appointment(
        &self,
        tenant_id: &str,
        appointment: &LocalAppointment,
    ) -> Result<String>;

    async fn update_appointment(&self, tenant_id: &str, appointment: &LocalAppointment)
        -> Result<()>;
}

/// Adapter response envelope
#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct TenantScoped<'a, T> {
    #[serde(rename = "tenantId")]
    tenant_id: &'a str,
    #[serde(flatten)]
    record: &'a T,
}

/// HTTP implementation of [`DmsAdapter`]
pub struct HttpDmsAdapter {
    client: Client,
    base_url: String,
    token: Option<String>,
    retry: RetryConfig,
}

impl HttpDmsAdapter {
    pub fn new(config: &DmsConfig) -> Result<Self> {
        let client = Client::builder().timeout(WRITE_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token(),
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn send<T: Serialize + Sync>(
        &self,
        method: reqwest::Method,
        path: &str,
        tenant_id: &str,
        record: &T,
    ) -> Result<Option<Value>> {
        let url = format!("{}{}", self.base_url, path);
        let body = TenantScoped { tenant_id, record };
        let operation = format!("dms {} {}", method, path);

        with_retry(&self.retry, &operation, || {
            let mut request = self.client.request(method.clone(), &url).json(&body);
            if let Some(ref token) = self.token {
                request = request.bearer_auth(token);
            }
            async move {
                let response = request.send().await?;
                let status = response.status();
                let text = response.text().await?;

                if status.is_server_error() {
                    return Err(SyncError::Http {
                        status: status.as_u16(),
                        body: text,
                    });
                }

                let envelope: Envelope = serde_json::from_str(&text).map_err(|_| {
                    SyncError::Dms(format!("HTTP {} with unreadable body: {}", status, text))
                })?;
                if !envelope.success {
                    return Err(SyncError::Dms(
                        envelope
                            .error
                            .unwrap_or_else(|| format!("request failed with HTTP {}", status)),
                    ));
                }
                Ok(envelope.data)
            }
        })
        .await
        .map_err(|e| match e {
            SyncError::Http { status, body } => {
                SyncError::Dms(format!("HTTP {}: {}", status, body))
            }
            other => other,
        })
    }
}

/// Pull the created record's id out of `data`
fn created_id(data: Option<Value>) -> Result<String> {
    data.as_ref()
        .and_then(|d| d.get("id"))
        .and_then(|id| match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| SyncError::Dms("create response did not include an id".to_string()))
}

#[async_trait]
impl DmsAdapter for HttpDmsAdapter {
    async fn create_contact(&self, tenant_id: &str, contact: &LocalContact) -> Result<String> {
        let data = self
            .send(reqwest::Method::POST, "/contacts", tenant_id, contact)
            .await?;
        created_id(data)
    }

    async fn update_contact(&self, tenant_id: &str, contact: &LocalContact) -> Result<()> {
        let path = format!("/contacts/{}", urlencoding::encode(&contact.id));
        self.send(reqwest::Method::PUT, &path, tenant_id, contact)
            .await?;
        Ok(())
    }

    async fn create_appointment(
        &self,
        tenant_id: &str,
        appointment: &LocalAppointment,
    ) -> Result<String> {
        let data = self
            .send(reqwest::Method::POST, "/appointments", tenant_id, appointment)
            .await?;
        created_id(data)
    }

    async fn update_appointment(
        &self,
        tenant_id: &str,
        appointment: &LocalAppointment,
    ) -> Result<()> {
        let path = format!("/appointments/{}", urlencoding::encode(&appointment.id));
        self.send(reqwest::Method::PUT, &path, tenant_id, appointment)
            .await?;
        Ok(())
    }
}
