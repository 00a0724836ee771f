//! Local mock EMR provider for flow tests.
//!
//! One axum server plays the token endpoint and a FHIR `Patient` API for every
//! configured system. Counters and switches on [`MockProvider`] let tests
//! observe traffic and inject failures.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use url::Url;

use super::registry::{FhirDialect, ProviderConfig, ProviderRegistry, TokenAuthMethod};
use super::secret::TokenCipher;
use super::service::{EmrIntegrationService, ServiceSettings};
use super::session_store::{EmrSession, InMemorySessionBackend, SessionBackend, SessionStore};
use super::state_token::{StateCodec, DEFAULT_STATE_TTL};
use super::{EmrError, EmrSystem, SecretString};

pub(crate) const STATE_KEY: [u8; 32] = [11u8; 32];
pub(crate) const TOKEN_KEY: [u8; 32] = [12u8; 32];
pub(crate) const ATHENA_PRACTICE: &str = "195900";

#[derive(Default)]
pub(crate) struct MockProvider {
    base_url: OnceLock<String>,

    pub token_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
    pub read_calls: AtomicUsize,
    pub create_calls: AtomicUsize,

    /// Delay before answering a refresh grant
    pub refresh_delay_ms: AtomicU64,
    /// Answer refresh grants with 400 invalid_grant
    pub reject_refresh: AtomicBool,
    /// Answer refresh grants with 503
    pub refresh_outage: AtomicBool,
    /// Issue a new refresh token on refresh
    pub rotate_refresh: AtomicBool,
    /// Number of upcoming reads answered with 503
    pub read_failures: AtomicUsize,
    /// Number of upcoming creates answered with 503
    pub create_failures: AtomicUsize,
    /// Answer creates with an empty body and only a `Location` header
    pub create_location_only: AtomicBool,
    /// Answer every FHIR call with 401
    pub revoke_tokens: AtomicBool,
    /// Search page size; 0 returns everything in one page
    pub page_size: AtomicUsize,

    issued: AtomicUsize,
    patients: Mutex<Vec<Value>>,
    last_token_form: Mutex<HashMap<String, String>>,
    last_token_auth: Mutex<Option<String>>,
    last_bearer: Mutex<Option<String>>,
    last_search: Mutex<Vec<(String, String)>>,
}

impl MockProvider {
    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn last_token_form(&self) -> HashMap<String, String> {
        self.last_token_form.lock().unwrap().clone()
    }

    pub fn last_token_auth(&self) -> Option<String> {
        self.last_token_auth.lock().unwrap().clone()
    }

    pub fn last_bearer(&self) -> Option<String> {
        self.last_bearer.lock().unwrap().clone()
    }

    pub fn last_search(&self) -> Vec<(String, String)> {
        self.last_search.lock().unwrap().clone()
    }

    pub fn seed_patient(&self, id: &str, given: &str, family: &str, birth_date: &str) {
        self.patients.lock().unwrap().push(json!({
            "resourceType": "Patient",
            "id": id,
            "active": true,
            "name": [{ "use": "official", "family": family, "given": [given] }],
            "birthDate": birth_date,
        }));
    }

    fn next_token(&self) -> usize {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn base_url(&self) -> &str {
        self.base_url.get().map(String::as_str).unwrap_or_default()
    }
}

pub(crate) struct Harness {
    pub base_url: String,
    pub mock: Arc<MockProvider>,
    server: tokio::task::JoinHandle<()>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl Harness {
    pub async fn start() -> Self {
        let mock = Arc::new(MockProvider::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        mock.base_url.set(base_url.clone()).unwrap();

        let app = Router::new()
            .route("/oauth2/token", post(token))
            .route("/fhir/Patient", get(search_patients).post(create_patient))
            .route("/fhir/Patient/:id", get(read_patient))
            .with_state(mock.clone());

        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            mock,
            server,
        }
    }

    /// Provider pointing at the mock, with the system's usual dialect
    pub fn provider(&self, system: EmrSystem) -> ProviderConfig {
        let url = |path: &str| Url::parse(&format!("{}{}", self.base_url, path)).unwrap();
        let (dialect, token_auth, practice_id) = match system {
            EmrSystem::Cerner => (FhirDialect::Cerner, TokenAuthMethod::ClientSecretBasic, None),
            EmrSystem::Athenahealth => (
                FhirDialect::Athena,
                TokenAuthMethod::ClientSecretBasic,
                Some(ATHENA_PRACTICE.to_string()),
            ),
            EmrSystem::Eclinicalworks | EmrSystem::EclinicalworksSandbox => {
                (FhirDialect::Eclinicalworks, TokenAuthMethod::ClientSecretPost, None)
            }
            EmrSystem::Allscripts => (FhirDialect::StandardR4, TokenAuthMethod::ClientSecretPost, None),
            EmrSystem::Epic => (FhirDialect::StandardR4, TokenAuthMethod::ClientSecretBasic, None),
        };

        ProviderConfig {
            system,
            authorize_url: url("/oauth2/authorize"),
            token_url: url("/oauth2/token"),
            fhir_base_url: url("/fhir"),
            client_id: format!("{}-client", system),
            client_secret: SecretString::new(format!("{}-secret", system)),
            redirect_uri: Url::parse(&format!("http://localhost:7210/api/emr/{}/callback", system)).unwrap(),
            scopes: vec!["openid".to_string(), "offline_access".to_string()],
            token_auth,
            send_aud: true,
            dialect,
            practice_id,
        }
    }

    pub fn registry(&self) -> ProviderRegistry {
        ProviderRegistry::new(
            [
                EmrSystem::Epic,
                EmrSystem::Cerner,
                EmrSystem::Athenahealth,
                EmrSystem::Eclinicalworks,
            ]
            .map(|system| self.provider(system)),
        )
    }

    pub fn build_service(&self) -> EmrIntegrationService {
        self.build_service_with(&ServiceSettings::default())
    }

    pub fn build_service_with(&self, settings: &ServiceSettings) -> EmrIntegrationService {
        self.build_service_on(Arc::new(InMemorySessionBackend::new()), settings)
    }

    pub fn build_service_on(
        &self,
        backend: Arc<dyn SessionBackend>,
        settings: &ServiceSettings,
    ) -> EmrIntegrationService {
        let codec = StateCodec::new(&STATE_KEY, DEFAULT_STATE_TTL).unwrap();
        let store = Arc::new(SessionStore::new(backend, TokenCipher::new(&TOKEN_KEY)));
        EmrIntegrationService::new(self.registry(), codec, store, settings).unwrap()
    }

    /// Run the authorization flow with a code the mock recognises
    pub async fn connect_with_code(
        &self,
        service: &EmrIntegrationService,
        user_id: &str,
        system: EmrSystem,
        code: &str,
    ) -> Result<EmrSession, EmrError> {
        let auth = service.generate_auth_url(system, user_id, None)?;
        service.exchange_code_for_token(system, code, &auth.state).await
    }

    pub async fn connect(&self, service: &EmrIntegrationService, user_id: &str, system: EmrSystem) -> EmrSession {
        self.connect_with_code(service, user_id, system, "good-code").await.unwrap()
    }
}

fn oauth_error(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({ "error": error }))).into_response()
}

fn outcome(status: StatusCode, code: &str) -> Response {
    (
        status,
        Json(json!({
            "resourceType": "OperationOutcome",
            "issue": [{ "severity": "error", "code": code }]
        })),
    )
        .into_response()
}

async fn token(
    State(mock): State<Arc<MockProvider>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    mock.token_calls.fetch_add(1, Ordering::SeqCst);
    *mock.last_token_auth.lock().unwrap() = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    *mock.last_token_form.lock().unwrap() = form.clone();

    match form.get("grant_type").map(String::as_str) {
        Some("authorization_code") => authorization_code_grant(&mock, &form),
        Some("refresh_token") => refresh_grant(&mock).await,
        _ => oauth_error(StatusCode::BAD_REQUEST, "unsupported_grant_type"),
    }
}

fn authorization_code_grant(mock: &MockProvider, form: &HashMap<String, String>) -> Response {
    let code = form.get("code").map(String::as_str).unwrap_or_default();
    if code == "bad-code" {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant");
    }
    if code == "garbage" {
        return (StatusCode::OK, "<html>maintenance</html>").into_response();
    }

    let n = mock.next_token();
    let mut body = json!({
        "access_token": format!("access-{}", n),
        "token_type": "Bearer",
        "expires_in": 3600,
        "refresh_token": format!("refresh-{}", n),
        "scope": "openid offline_access",
    });
    match code {
        "launch-code" => body["patient"] = json!("launch-patient"),
        "no-refresh" => {
            body.as_object_mut().unwrap().remove("refresh_token");
        }
        "short-lived" => body["expires_in"] = json!(30),
        "short-no-refresh" => {
            body["expires_in"] = json!(30);
            body.as_object_mut().unwrap().remove("refresh_token");
        }
        "expired-no-refresh" => {
            body["expires_in"] = json!(0);
            body.as_object_mut().unwrap().remove("refresh_token");
        }
        "string-expiry" => body["expires_in"] = json!("7200"),
        "no-expiry" => {
            body.as_object_mut().unwrap().remove("expires_in");
        }
        _ => {}
    }
    Json(body).into_response()
}

async fn refresh_grant(mock: &MockProvider) -> Response {
    mock.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let delay = mock.refresh_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if mock.reject_refresh.load(Ordering::SeqCst) {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant");
    }
    if mock.refresh_outage.load(Ordering::SeqCst) {
        return oauth_error(StatusCode::SERVICE_UNAVAILABLE, "temporarily_unavailable");
    }

    let n = mock.next_token();
    let mut body = json!({
        "access_token": format!("refreshed-{}", n),
        "token_type": "Bearer",
        "expires_in": 3600,
    });
    if mock.rotate_refresh.load(Ordering::SeqCst) {
        body["refresh_token"] = json!(format!("rotated-{}", n));
    }
    Json(body).into_response()
}

/// `None` when the caller may proceed
fn check_bearer(mock: &MockProvider, headers: &HeaderMap) -> Option<Response> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    *mock.last_bearer.lock().unwrap() = bearer.clone();

    if bearer.is_none() || mock.revoke_tokens.load(Ordering::SeqCst) {
        return Some(outcome(StatusCode::UNAUTHORIZED, "login"));
    }
    None
}

fn matches_search(patient: &Value, params: &[(String, String)]) -> bool {
    let family = patient.pointer("/name/0/family").and_then(Value::as_str).unwrap_or_default();
    let given = patient.pointer("/name/0/given/0").and_then(Value::as_str).unwrap_or_default();
    let birth_date = patient.get("birthDate").and_then(Value::as_str).unwrap_or_default();

    params.iter().all(|(key, value)| match key.as_str() {
        "family" => family.eq_ignore_ascii_case(value),
        "given" => given.eq_ignore_ascii_case(value),
        "name" => family.eq_ignore_ascii_case(value) || given.eq_ignore_ascii_case(value),
        "birthdate" => birth_date == value.trim_start_matches("eq"),
        _ => true,
    })
}

async fn search_patients(
    State(mock): State<Arc<MockProvider>>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    mock.search_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(denied) = check_bearer(&mock, &headers) {
        return denied;
    }
    *mock.last_search.lock().unwrap() = params.clone();

    let page: usize = params
        .iter()
        .find(|(k, _)| k == "_page")
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(1);
    let criteria: Vec<(String, String)> = params.iter().filter(|(k, _)| k != "_page").cloned().collect();

    let matches: Vec<Value> = mock
        .patients
        .lock()
        .unwrap()
        .iter()
        .filter(|p| matches_search(p, &criteria))
        .cloned()
        .collect();

    let page_size = mock.page_size.load(Ordering::SeqCst);
    let (entries, has_next) = if page_size == 0 {
        (matches, false)
    } else {
        let start = (page - 1) * page_size;
        let chunk: Vec<Value> = matches.iter().skip(start).take(page_size).cloned().collect();
        (chunk, start + page_size < matches.len())
    };

    let mut bundle = json!({
        "resourceType": "Bundle",
        "type": "searchset",
        "entry": entries
            .into_iter()
            .map(|resource| json!({ "resource": resource, "search": { "mode": "match" } }))
            .collect::<Vec<_>>(),
    });
    if has_next {
        let mut next = Url::parse(&format!("{}/fhir/Patient", mock.base_url())).unwrap();
        next.query_pairs_mut()
            .extend_pairs(criteria.iter())
            .append_pair("_page", &(page + 1).to_string());
        bundle["link"] = json!([{ "relation": "next", "url": next.as_str() }]);
    }
    Json(bundle).into_response()
}

async fn read_patient(
    State(mock): State<Arc<MockProvider>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    mock.read_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(denied) = check_bearer(&mock, &headers) {
        return denied;
    }
    let remaining = mock.read_failures.load(Ordering::SeqCst);
    if remaining > 0 {
        mock.read_failures.store(remaining - 1, Ordering::SeqCst);
        return outcome(StatusCode::SERVICE_UNAVAILABLE, "transient");
    }
    if id == "forbidden" {
        return outcome(StatusCode::FORBIDDEN, "forbidden");
    }

    let found = mock
        .patients
        .lock()
        .unwrap()
        .iter()
        .find(|p| p.get("id").and_then(Value::as_str) == Some(id.as_str()))
        .cloned();
    match found {
        Some(patient) => Json(patient).into_response(),
        None => outcome(StatusCode::NOT_FOUND, "not-found"),
    }
}

async fn create_patient(
    State(mock): State<Arc<MockProvider>>,
    headers: HeaderMap,
    Json(mut resource): Json<Value>,
) -> Response {
    mock.create_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(denied) = check_bearer(&mock, &headers) {
        return denied;
    }
    let remaining = mock.create_failures.load(Ordering::SeqCst);
    if remaining > 0 {
        mock.create_failures.store(remaining - 1, Ordering::SeqCst);
        return outcome(StatusCode::SERVICE_UNAVAILABLE, "transient");
    }
    if resource.get("resourceType").and_then(Value::as_str) != Some("Patient") || resource.get("id").is_some() {
        return outcome(StatusCode::BAD_REQUEST, "invalid");
    }
    if resource.pointer("/name/0/family").is_none() {
        return outcome(StatusCode::UNPROCESSABLE_ENTITY, "required");
    }

    let id = format!("new-{}", mock.next_token());
    resource["id"] = json!(id);
    resource["meta"] = json!({ "versionId": "1" });
    mock.patients.lock().unwrap().push(resource.clone());

    let location = format!("{}/fhir/Patient/{}/_history/1", mock.base_url(), id);
    if mock.create_location_only.load(Ordering::SeqCst) {
        (StatusCode::CREATED, [(header::LOCATION, location)]).into_response()
    } else {
        (StatusCode::CREATED, [(header::LOCATION, location)], Json(resource)).into_response()
    }
}
