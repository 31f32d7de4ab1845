//! HTTP transport seam
//!
//! The resilient client speaks to the remote CRM through [`Transport`], so the
//! retry and auth loops can be driven by a scripted transport in tests.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Request body encodings the remote CRM accepts
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    Form(Vec<(String, String)>),
}

/// One outbound request, before and after credentials are applied
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn with_form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = Some(RequestBody::Form(fields));
        self
    }

    /// Set a header, replacing any previous value with the same name
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Path component of the URL, without query string
    pub fn path(&self) -> String {
        match reqwest::Url::parse(&self.url) {
            Ok(url) => url.path().to_string(),
            Err(_) => self
                .url
                .split('?')
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }

    /// Short description for the API call log (never includes credentials)
    pub fn summary(&self) -> Option<String> {
        match &self.body {
            Some(RequestBody::Json(value)) => {
                let mut text = value.to_string();
                if text.len() > 512 {
                    let mut cut = 512;
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    text.truncate(cut);
                    text.push_str("...");
                }
                Some(text)
            }
            Some(RequestBody::Form(fields)) => {
                let keys: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
                Some(format!("form: {}", keys.join(",")))
            }
            None => None,
        }
    }
}

/// Response as seen by the client
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    /// Header names are lowercased
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn json(status: u16, body: &Value) -> Self {
        Self::new(status, body.to_string())
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parsed `Retry-After` in seconds (HTTP-date form is not supported)
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Decode the body, treating an empty body as JSON null
    pub fn body_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        if self.body.trim().is_empty() {
            serde_json::from_value(Value::Null)
        } else {
            serde_json::from_str(&self.body)
        }
    }
}

/// Failure before any HTTP response was received
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

/// Sends one request and returns whatever status came back
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// reqwest-backed transport (rustls)
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("dealersync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            Some(RequestBody::Json(value)) => builder.json(&value),
            Some(RequestBody::Form(fields)) => builder.form(&fields),
            None => builder,
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
