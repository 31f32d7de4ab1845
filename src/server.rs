//! Trigger server
//!
//! HTTP surface for operators and webhook receivers.
//!
//! # Routes
//!
//! - `GET /health` - Liveness and tenant count
//! - `GET /metrics` - Prometheus text exposition
//! - `POST /tenants/{tenant_id}/sync` - Run one batch now, returns the report
//! - `POST /tenants/{tenant_id}/contacts/{contact_id}/enqueue` - Queue a local contact
//! - `POST /tenants/{tenant_id}/appointments/{appointment_id}/enqueue` - Queue a local appointment
//! - `DELETE /tenants/{tenant_id}/appointments/{appointment_id}` - Remove the remote event
//! - `POST /tenants/{tenant_id}/remote-contacts/{remote_id}/queue` - Queue a remote contact change
//! - `POST /tenants/{tenant_id}/remote-appointments/{remote_id}/queue` - Queue a remote event change
//! - `GET /tenants/{tenant_id}/status` - Ledger row counts

use crate::ledger::{
    AppointmentType, EntityKind, LocalAppointment, LocalContact, SyncLedger, SyncStatus,
};
use crate::sync::{
    delete_remote_appointment, metrics, queue_remote_appointment, queue_remote_contact,
    BatchOrchestrator, TenantSession,
};
use crate::{Result, SyncError};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Shared server state
pub struct AppState {
    sessions: HashMap<String, Arc<TenantSession>>,
    ledger: Arc<SyncLedger>,
    orchestrator: BatchOrchestrator,
}

impl AppState {
    pub fn new(
        sessions: &[Arc<TenantSession>],
        ledger: Arc<SyncLedger>,
        orchestrator: BatchOrchestrator,
    ) -> Self {
        Self {
            sessions: sessions
                .iter()
                .map(|s| (s.tenant_id().to_string(), s.clone()))
                .collect(),
            ledger,
            orchestrator,
        }
    }

    fn session(&self, tenant_id: &str) -> std::result::Result<&Arc<TenantSession>, ApiError> {
        self.sessions.get(tenant_id).ok_or_else(|| ApiError {
            status: StatusCode::NOT_FOUND,
            code: "UNKNOWN_TENANT".to_string(),
            error: format!("Unknown tenant: {}", tenant_id),
        })
    }
}

pub struct SyncServer {
    state: Arc<AppState>,
}

impl SyncServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/metrics", get(metrics_text))
            .route("/tenants/{tenant_id}/sync", post(sync_tenant))
            .route(
                "/tenants/{tenant_id}/contacts/{contact_id}/enqueue",
                post(enqueue_contact),
            )
            .route(
                "/tenants/{tenant_id}/appointments/{appointment_id}/enqueue",
                post(enqueue_appointment),
            )
            .route(
                "/tenants/{tenant_id}/appointments/{appointment_id}",
                delete(delete_appointment),
            )
            .route(
                "/tenants/{tenant_id}/remote-contacts/{remote_id}/queue",
                post(queue_remote_contact_change),
            )
            .route(
                "/tenants/{tenant_id}/remote-appointments/{remote_id}/queue",
                post(queue_remote_appointment_change),
            )
            .route("/tenants/{tenant_id}/status", get(status))
            .with_state(state)
    }

    pub async fn run(self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SyncError::Config(format!("Failed to bind {}: {}", addr, e)))?;
        tracing::info!(addr = addr, tenants = self.state.sessions.len(), "Trigger server listening");

        axum::serve(listener, Self::router(self.state)).await?;
        Ok(())
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

/// Error body, with the taxonomy code when there is one
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

struct ApiError {
    status: StatusCode,
    code: String,
    error: String,
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        let status = match &e {
            SyncError::Validation(_) | SyncError::Json(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SyncError::NotEnabled(_) => StatusCode::CONFLICT,
            SyncError::NoAccount(_) | SyncError::AuthFailed(_) => StatusCode::FAILED_DEPENDENCY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: e.code().to_string(),
            error: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.error,
                code: self.code,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Optional contact fields; an empty body re-queues the stored record
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueContactRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueAppointmentRequest {
    pub contact_id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub appointment_type: AppointmentType,
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &Bytes) -> ApiResult<Option<T>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| SyncError::Validation(format!("invalid request body: {}", e)).into())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "tenants": state.sessions.len(),
    }))
}

async fn metrics_text() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

async fn sync_tenant(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session = state.session(&tenant_id)?;
    let report = state.orchestrator.run_batch(session).await;
    Ok(Json(report))
}

async fn enqueue_contact(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, contact_id)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let session = state.session(&tenant_id)?;

    let contact = match parse_body::<EnqueueContactRequest>(&body)? {
        Some(req) => {
            let contact = LocalContact {
                id: contact_id.clone(),
                first_name: req.first_name,
                last_name: req.last_name,
                email: req.email,
                phone: req.phone,
            };
            session.records.upsert_contact(&tenant_id, &contact)?;
            contact
        }
        None => session
            .records
            .get_contact(&tenant_id, &contact_id)?
            .ok_or_else(|| SyncError::Validation(format!("unknown contact {}", contact_id)))?,
    };

    let record = state
        .ledger
        .enqueue_contact(&tenant_id, &contact_id, contact.email(), contact.phone())?;
    tracing::info!(tenant = %tenant_id, local_contact_id = %contact_id, "Contact queued");
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn enqueue_appointment(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, appointment_id)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let session = state.session(&tenant_id)?;

    let appointment = match parse_body::<EnqueueAppointmentRequest>(&body)? {
        Some(req) => {
            if req.end < req.start {
                return Err(SyncError::Validation("appointment ends before it starts".into()).into());
            }
            let appointment = LocalAppointment {
                id: appointment_id.clone(),
                contact_id: req.contact_id,
                title: req.title,
                start: req.start,
                end: req.end,
                status: req.status.unwrap_or_else(|| "confirmed".to_string()),
                appointment_type: req.appointment_type,
            };
            session.records.upsert_appointment(&tenant_id, &appointment)?;
            appointment
        }
        None => session
            .records
            .get_appointment(&tenant_id, &appointment_id)?
            .ok_or_else(|| {
                SyncError::Validation(format!("unknown appointment {}", appointment_id))
            })?,
    };

    let record = state.ledger.enqueue_appointment(&tenant_id, &appointment)?;
    tracing::info!(
        tenant = %tenant_id,
        local_appointment_id = %appointment_id,
        "Appointment queued"
    );
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn delete_appointment(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, appointment_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let session = state.session(&tenant_id)?;
    let removed = delete_remote_appointment(session, &appointment_id).await?;
    Ok(Json(json!({
        "localAppointmentId": appointment_id,
        "removedEventId": removed,
    })))
}

async fn queue_remote_contact_change(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, remote_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let session = state.session(&tenant_id)?;
    let record = queue_remote_contact(session, &remote_id)?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn queue_remote_appointment_change(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, remote_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let session = state.session(&tenant_id)?;
    let record = queue_remote_appointment(session, &remote_id)?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn status(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.session(&tenant_id)?;
    let counts = state.ledger.status_counts(&tenant_id)?;

    let by_status = |entity: EntityKind| -> BTreeMap<&'static str, u64> {
        SyncStatus::all()
            .into_iter()
            .map(|s| (s.as_str(), counts.count(entity, s)))
            .collect()
    };
    Ok(Json(json!({
        "tenantId": tenant_id,
        "contacts": by_status(EntityKind::Contact),
        "appointments": by_status(EntityKind::Appointment),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SyncDirection;
    use crate::remote::ScriptedTransport;
    use crate::sync::testing::{api_key_session, appointment, contact_json};
    use axum::body::Body;
    use axum::http::Request;
    use reqwest::Method;
    use serde_json::Value;
    use tower::ServiceExt;

    fn create_test_state() -> (Arc<AppState>, Arc<ScriptedTransport>) {
        let (session, transport) = api_key_session();
        let ledger = session.ledger.clone();
        let state = AppState::new(&[Arc::new(session)], ledger, BatchOrchestrator::default());
        (Arc::new(state), transport)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (state, _transport) = create_test_state();
        let response = SyncServer::router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["tenants"], 1);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (state, _transport) = create_test_state();
        metrics::set_health_status(true);
        let response = SyncServer::router(state)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_tenant() {
        let (state, _transport) = create_test_state();
        let response = SyncServer::router(state)
            .oneshot(post("/tenants/nope/sync", Value::Null))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "UNKNOWN_TENANT");
    }

    #[tokio::test]
    async fn test_enqueue_then_sync() {
        let (state, transport) = create_test_state();
        transport.respond_json(Method::POST, "/contacts/search", 200, json!({"contacts": []}));
        transport.respond_json(Method::POST, "/contacts/", 200, json!({"contact": contact_json("R1")}));

        let response = SyncServer::router(state.clone())
            .oneshot(post(
                "/tenants/d1/contacts/c1/enqueue",
                json!({"firstName": "Ada", "email": "a@b.com"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["sync_status"], "pending_remote");

        let response = SyncServer::router(state.clone())
            .oneshot(Request::builder().uri("/tenants/d1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["contacts"]["pending_remote"], 1);

        let response = SyncServer::router(state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tenants/d1/sync")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = body_json(response).await;
        assert_eq!(report["syncedCount"], 1);
        assert_eq!(report["errors"], json!([]));
    }

    #[tokio::test]
    async fn test_enqueue_unknown_contact_without_body() {
        let (state, _transport) = create_test_state();
        let response = SyncServer::router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tenants/d1/contacts/missing/enqueue")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(response).await["code"], "VALIDATION");
    }

    #[tokio::test]
    async fn test_enqueue_appointment() {
        let (state, _transport) = create_test_state();
        let response = SyncServer::router(state.clone())
            .oneshot(post(
                "/tenants/d1/appointments/a1/enqueue",
                json!({
                    "contactId": "c1",
                    "title": "Oil change",
                    "start": "2026-11-02T15:00:00Z",
                    "end": "2026-11-02T16:00:00Z",
                    "appointmentType": "service"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let record = state.ledger.get_appointment_record("d1", "a1").unwrap().unwrap();
        assert_eq!(record.appointment_type, AppointmentType::Service);
        assert_eq!(record.sync_status, SyncStatus::PendingRemote);
    }

    #[tokio::test]
    async fn test_queue_remote_contact() {
        let (state, _transport) = create_test_state();
        state
            .ledger
            .link_contact("d1", "c1", "R1", SyncDirection::LocalToRemote)
            .unwrap();

        let response = SyncServer::router(state.clone())
            .oneshot(post("/tenants/d1/remote-contacts/R1/queue", Value::Null))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["local_contact_id"], "c1");
        assert_eq!(body["sync_status"], "pending_local");
        let record = state.ledger.get_contact_record("d1", "c1").unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::PendingLocal);
    }

    #[tokio::test]
    async fn test_queue_unknown_remote_records() {
        let (state, _transport) = create_test_state();

        let response = SyncServer::router(state.clone())
            .oneshot(post("/tenants/d1/remote-contacts/R9/queue", Value::Null))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["remote_contact_id"], "R9");

        let response = SyncServer::router(state.clone())
            .oneshot(post("/tenants/d1/remote-appointments/E9/queue", Value::Null))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["remote_event_id"], "E9");

        let counts = state.ledger.status_counts("d1").unwrap();
        assert_eq!(counts.count(EntityKind::Contact, SyncStatus::PendingLocal), 1);
        assert_eq!(counts.count(EntityKind::Appointment, SyncStatus::PendingLocal), 1);
    }

    #[tokio::test]
    async fn test_delete_appointment_route() {
        let (state, transport) = create_test_state();
        let appt = appointment("a1", "c1", AppointmentType::Sales);
        state
            .ledger
            .link_appointment("d1", &appt, "E1", "cal-sales", SyncDirection::LocalToRemote)
            .unwrap();
        transport.respond_json(Method::DELETE, "/calendars/events/E1", 200, json!({"succeeded": true}));

        let request = Request::builder()
            .method("DELETE")
            .uri("/tenants/d1/appointments/a1")
            .body(Body::empty())
            .unwrap();
        let response = SyncServer::router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["removedEventId"], "E1");

        let record = state.ledger.get_appointment_record("d1", "a1").unwrap().unwrap();
        assert!(record.remote_event_id.is_none());
        assert_eq!(transport.calls(Method::DELETE, "/calendars/events/E1"), 1);
    }
}
