//! HTTP gateway for the EMR integration service.
//!
//! Thin JSON routes over [`EmrIntegrationService`]. The clinic's own auth layer
//! sits in front and passes the signed-in user as `x-user-id`.

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Path, Query, Request, State},
    http::{request::Parts, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::activity_log;
use crate::emr::{EmrError, EmrIntegrationService, EmrSystem, PatientRecord, PatientSearch};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_USER_ID_LENGTH: usize = 256;

type AppState = Arc<EmrIntegrationService>;

/// Build the gateway router
pub fn router(service: Arc<EmrIntegrationService>) -> Router {
    let emr = Router::new()
        .route("/authorize", get(authorize))
        .route("/callback", get(callback))
        .route("/patients", get(search_patients).post(create_patient))
        .route("/patients/:patient_id", get(fetch_patient))
        .route("/session", get(session_status).delete(disconnect));

    Router::new()
        .route("/health", get(health))
        .nest("/api/emr/:system", emr)
        .with_state(service)
        .layer(middleware::from_fn(request_id))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Serve until Ctrl-C
pub async fn serve(addr: SocketAddr, service: Arc<EmrIntegrationService>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind EMR gateway to {}", addr))?;
    info!("EMR gateway listening on {}", listener.local_addr()?);

    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("EMR gateway server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    activity_log::log_app_shutdown("signal");
}

/// Tag every request with an id, taken from the caller when it sent a sane one
async fn request_id(request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 64 && v.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Path only; query strings can carry search demographics
    let span = info_span!(
        "request",
        request_id = %id,
        method = %request.method(),
        path = %request.uri().path()
    );
    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum GatewayError {
    Emr(EmrError),
    /// No usable `x-user-id` header
    MissingCaller,
    /// The user declined consent at the provider
    AuthorizationDenied(String),
}

impl From<EmrError> for GatewayError {
    fn from(err: EmrError) -> Self {
        GatewayError::Emr(err)
    }
}

/// HTTP status for a service error
pub fn status_for(err: &EmrError) -> StatusCode {
    match err {
        EmrError::InvalidState
        | EmrError::ExpiredState
        | EmrError::ReplayedState
        | EmrError::TokenExchangeFailed { .. } => StatusCode::BAD_REQUEST,
        EmrError::NoActiveSession { .. } | EmrError::SessionExpired { .. } => StatusCode::UNAUTHORIZED,
        EmrError::PatientNotFound(_) | EmrError::UnsupportedSystem(_) => StatusCode::NOT_FOUND,
        EmrError::MappingError(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EmrError::ProviderRequestFailed { .. } => StatusCode::BAD_GATEWAY,
        EmrError::Storage(_) | EmrError::Crypto => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match &self {
            GatewayError::Emr(err) => {
                let status = status_for(err);
                if status.is_server_error() {
                    warn!(kind = err.kind(), "Request failed: {}", err);
                }
                (status, err.kind(), err.to_string())
            }
            GatewayError::MissingCaller => (
                StatusCode::UNAUTHORIZED,
                "missing_caller",
                format!("Missing or invalid {} header", USER_ID_HEADER),
            ),
            GatewayError::AuthorizationDenied(reason) => (
                StatusCode::BAD_REQUEST,
                "authorization_denied",
                format!("Authorization denied: {}", reason),
            ),
        };
        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}

// ============================================================================
// Extractors
// ============================================================================

/// Signed-in clinic user, from `x-user-id`
#[derive(Debug, Clone)]
pub struct CallerId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty() && v.len() <= MAX_USER_ID_LENGTH)
            .map(|v| CallerId(v.to_string()))
            .ok_or(GatewayError::MissingCaller)
    }
}

fn parse_system(raw: &str) -> Result<EmrSystem, GatewayError> {
    Ok(raw.parse::<EmrSystem>()?)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(service): State<AppState>) -> Json<Value> {
    Json(json!({
        "healthy": true,
        "systems": service.systems(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeParams {
    patient_context: Option<String>,
}

async fn authorize(
    State(service): State<AppState>,
    Path(system): Path<String>,
    CallerId(user_id): CallerId,
    Query(params): Query<AuthorizeParams>,
) -> Result<Json<Value>, GatewayError> {
    let system = parse_system(&system)?;
    let auth = service.generate_auth_url(system, &user_id, params.patient_context.as_deref())?;
    Ok(Json(json!({ "url": auth.url, "state": auth.state })))
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// Provider redirect target. The user comes from the signed state, not a header.
async fn callback(
    State(service): State<AppState>,
    Path(system): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Result<Json<Value>, GatewayError> {
    let system = parse_system(&system)?;
    if let Some(error) = params.error {
        activity_log::log_emr_auth("callback", system, None, false, Some(&error));
        return Err(GatewayError::AuthorizationDenied(error));
    }
    let state = params.state.ok_or(EmrError::InvalidState)?;
    let code = params.code.unwrap_or_default();

    let session = service.exchange_code_for_token(system, &code, &state).await?;
    Ok(Json(json!({ "connected": true, "session": session.summary() })))
}

async fn search_patients(
    State(service): State<AppState>,
    Path(system): Path<String>,
    CallerId(user_id): CallerId,
    Query(search): Query<PatientSearch>,
) -> Result<Json<Vec<PatientRecord>>, GatewayError> {
    let system = parse_system(&system)?;
    Ok(Json(service.search_patients(&user_id, system, &search).await?))
}

async fn fetch_patient(
    State(service): State<AppState>,
    Path((system, patient_id)): Path<(String, String)>,
    CallerId(user_id): CallerId,
) -> Result<Json<PatientRecord>, GatewayError> {
    let system = parse_system(&system)?;
    Ok(Json(service.fetch_patient_data(&user_id, system, &patient_id).await?))
}

/// Body is a FHIR `Patient` resource
async fn create_patient(
    State(service): State<AppState>,
    Path(system): Path<String>,
    CallerId(user_id): CallerId,
    Json(resource): Json<Value>,
) -> Result<(StatusCode, Json<PatientRecord>), GatewayError> {
    let system = parse_system(&system)?;
    let record = PatientRecord::from_resource(&resource)?;
    let created = service.create_patient(&user_id, system, &record).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn session_status(
    State(service): State<AppState>,
    Path(system): Path<String>,
    CallerId(user_id): CallerId,
) -> Result<Json<Value>, GatewayError> {
    let system = parse_system(&system)?;
    let summary = service.session_status(&user_id, system).await?;
    Ok(Json(json!({ "connected": summary.is_some(), "session": summary })))
}

async fn disconnect(
    State(service): State<AppState>,
    Path(system): Path<String>,
    CallerId(user_id): CallerId,
) -> Result<StatusCode, GatewayError> {
    let system = parse_system(&system)?;
    service.disconnect(&user_id, system).await?;
    Ok(StatusCode::NO_CONTENT)
}
