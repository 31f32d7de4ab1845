//! Scripted transport for tests and dry runs
//!
//! Responses are queued per `(method, path)`. The last queued response for a
//! route is sticky, so a single `429` entry answers every attempt. Requests to
//! unscripted routes get a `404`. Every request is recorded.
//!
//! A route can also be scripted per JSON body field with
//! [`ScriptedTransport::respond_when`]. Those answers are tried before the
//! plain route queue.

use super::transport::{ApiRequest, ApiResponse, RequestBody, Transport, TransportError};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

type Route = (Method, String);

#[derive(Debug, Clone)]
enum Scripted {
    Respond(ApiResponse),
    Fail(TransportError),
}

/// Answers for requests whose JSON body has `field == value`
#[derive(Debug)]
struct BodyMatch {
    route: Route,
    field: String,
    value: Value,
    queue: VecDeque<Scripted>,
}

impl BodyMatch {
    fn matches(&self, route: &Route, body: Option<&RequestBody>) -> bool {
        if &self.route != route {
            return false;
        }
        match body {
            Some(RequestBody::Json(json)) => json.get(&self.field) == Some(&self.value),
            _ => false,
        }
    }
}

/// In-memory [`Transport`] answering from a script
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<Route, VecDeque<Scripted>>>,
    body_matches: Mutex<Vec<BodyMatch>>,
    requests: Mutex<Vec<ApiRequest>>,
}

fn next_entry(queue: &mut VecDeque<Scripted>) -> Option<Scripted> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, method: Method, path: &str, entry: Scripted) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes
            .entry((method, path.to_string()))
            .or_default()
            .push_back(entry);
    }

    /// Queue a raw response for a route
    pub fn respond(&self, method: Method, path: &str, response: ApiResponse) {
        self.push(method, path, Scripted::Respond(response));
    }

    /// Queue a JSON response for a route
    pub fn respond_json(&self, method: Method, path: &str, status: u16, body: Value) {
        self.respond(method, path, ApiResponse::json(status, &body));
    }

    /// Queue a transport failure for a route
    pub fn fail(&self, method: Method, path: &str, error: TransportError) {
        self.push(method, path, Scripted::Fail(error));
    }

    /// Queue a JSON response for requests to a route whose JSON body has
    /// `field` set to `value`
    pub fn respond_when(
        &self,
        method: Method,
        path: &str,
        field: &str,
        value: impl Into<Value>,
        status: u16,
        body: Value,
    ) {
        let route = (method, path.to_string());
        let value = value.into();
        let response = Scripted::Respond(ApiResponse::json(status, &body));

        let mut matches = self.body_matches.lock().unwrap_or_else(|e| e.into_inner());
        match matches
            .iter_mut()
            .find(|m| m.route == route && m.field == field && m.value == value)
        {
            Some(existing) => existing.queue.push_back(response),
            None => matches.push(BodyMatch {
                route,
                field: field.to_string(),
                value,
                queue: VecDeque::from([response]),
            }),
        }
    }

    /// Every request sent so far, in order
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of requests sent to a route
    pub fn calls(&self, method: Method, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.method == method && r.path() == path)
            .count()
    }

    /// Number of requests whose path starts with a prefix
    pub fn calls_with_prefix(&self, prefix: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.path().starts_with(prefix))
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Requests that are not reads
    pub fn write_calls(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.method != Method::GET)
            .count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let route = (request.method.clone(), request.path());
        let matched = {
            let mut matches = self.body_matches.lock().unwrap_or_else(|e| e.into_inner());
            matches
                .iter_mut()
                .find(|m| m.matches(&route, request.body.as_ref()))
                .and_then(|m| next_entry(&mut m.queue))
        };
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        let next = matched.or_else(|| {
            let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
            routes.get_mut(&route).and_then(next_entry)
        });

        match next {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(error)) => Err(error),
            None => Ok(ApiResponse::new(404, r#"{"message":"not scripted"}"#)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn get(path: &str) -> ApiRequest {
        ApiRequest::new(Method::GET, format!("https://crm.test{}", path))
    }

    #[tokio::test]
    async fn test_queue_then_sticky() {
        let transport = ScriptedTransport::new();
        transport.respond_json(Method::GET, "/contacts/1", 500, json!({}));
        transport.respond_json(Method::GET, "/contacts/1", 200, json!({"contact": {"id": "1"}}));

        assert_eq!(transport.send(get("/contacts/1")).await.unwrap().status, 500);
        assert_eq!(transport.send(get("/contacts/1")).await.unwrap().status, 200);
        assert_eq!(transport.send(get("/contacts/1")).await.unwrap().status, 200);
        assert_eq!(transport.calls(Method::GET, "/contacts/1"), 3);
    }

    #[tokio::test]
    async fn test_unscripted_route_is_404() {
        let transport = ScriptedTransport::new();
        let response = transport.send(get("/contacts/missing")).await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(transport.total_calls(), 1);
        assert_eq!(transport.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_body_field_match_wins_over_route() {
        let transport = ScriptedTransport::new();
        transport.respond_json(Method::POST, "/contacts/search", 200, json!({"contacts": []}));
        transport.respond_when(
            Method::POST,
            "/contacts/search",
            "email",
            "a@b.com",
            200,
            json!({"contacts": [{"id": "R-email"}]}),
        );

        let search = |field: &str, value: &str| {
            ApiRequest::new(Method::POST, "https://crm.test/contacts/search")
                .with_json(json!({ field: value }))
        };
        let hit = transport.send(search("email", "a@b.com")).await.unwrap();
        assert!(hit.body.contains("R-email"));
        let miss = transport.send(search("phone", "555")).await.unwrap();
        assert!(!miss.body.contains("R-email"));
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let transport = ScriptedTransport::new();
        transport.fail(Method::GET, "/contacts/1", TransportError::Timeout);
        assert!(transport.send(get("/contacts/1")).await.is_err());
    }
}
