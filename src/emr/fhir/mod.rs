//! FHIR HTTP client.
//!
//! Every call carries the session's bearer token, is bounded by the client
//! timeout and gets at most one retry. Dialect-specific request and response
//! shapes live in [`adapter`].

mod adapter;
mod patient;

pub use adapter::{
    adapter_for, AthenaAdapter, CernerAdapter, EclinicalworksAdapter, PatientAdapter, StandardR4Adapter,
};
pub use patient::{PatientIdentifier, PatientRecord, PatientSearch, SearchCriteria};

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::warn;

use super::registry::ProviderConfig;
use super::{EmrError, SecretString};
use crate::activity_log;

/// First attempt plus one retry
const MAX_ATTEMPTS: u32 = 2;

const INITIAL_BACKOFF_MS: u64 = 250;

const MAX_BACKOFF_MS: u64 = 2000;

pub const FHIR_JSON: &str = "application/fhir+json";

/// Which failures a request may be retried on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Timeout, connect failure or 5xx. For reads and searches.
    Transient,
    /// Connect failure only, where the request never reached the provider.
    /// For creates, which are not idempotent.
    ConnectOnly,
}

impl RetryPolicy {
    fn retries_error(self, err: &reqwest::Error) -> bool {
        match self {
            RetryPolicy::Transient => err.is_connect() || err.is_timeout(),
            RetryPolicy::ConnectOnly => err.is_connect(),
        }
    }

    fn retries_status(self, status: StatusCode) -> bool {
        match self {
            RetryPolicy::Transient => status.is_server_error(),
            RetryPolicy::ConnectOnly => false,
        }
    }
}

/// Calculate backoff delay with exponential increase and jitter
fn calculate_backoff(attempt: u32) -> Duration {
    let base_delay = INITIAL_BACKOFF_MS * 2u64.pow(attempt);
    let capped_delay = base_delay.min(MAX_BACKOFF_MS);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_millis() as u64)
        % 100;
    Duration::from_millis(capped_delay + jitter)
}

/// Provider and credentials for one FHIR operation
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub provider: &'a ProviderConfig,
    pub access_token: &'a SecretString,
    /// Operation name for logs: "search", "read", "create"
    pub operation: &'static str,
}

#[derive(Debug, Clone)]
pub struct FhirClient {
    http: reqwest::Client,
}

impl FhirClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// GET with transient-failure retry. Returns the response whatever its status.
    pub async fn get(
        &self,
        ctx: &RequestContext<'_>,
        url: &str,
        query: &[(String, String)],
    ) -> Result<Response, EmrError> {
        self.send(ctx, RetryPolicy::Transient, || {
            self.http.get(url).query(query).header(ACCEPT, FHIR_JSON)
        })
        .await
    }

    /// POST a resource. Only retried when the connection was never made.
    pub async fn post(&self, ctx: &RequestContext<'_>, url: &str, body: &Value) -> Result<Response, EmrError> {
        self.send(ctx, RetryPolicy::ConnectOnly, || {
            self.http
                .post(url)
                .header(ACCEPT, FHIR_JSON)
                .header(CONTENT_TYPE, FHIR_JSON)
                .json(body)
        })
        .await
    }

    async fn send<F>(&self, ctx: &RequestContext<'_>, policy: RetryPolicy, build: F) -> Result<Response, EmrError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let system = ctx.provider.system;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = build().bearer_auth(ctx.access_token.expose()).send().await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(response) => {
                    let status = response.status();
                    activity_log::log_provider_request(system, ctx.operation, Some(status.as_u16()), attempt, elapsed_ms);
                    if attempt < MAX_ATTEMPTS && policy.retries_status(status) {
                        let backoff = calculate_backoff(attempt - 1);
                        warn!(system = %system, operation = ctx.operation, status = status.as_u16(), "Retrying in {:?}", backoff);
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    return Ok(response);
                }
                Err(e) => {
                    activity_log::log_provider_request(system, ctx.operation, None, attempt, elapsed_ms);
                    if attempt < MAX_ATTEMPTS && policy.retries_error(&e) {
                        let backoff = calculate_backoff(attempt - 1);
                        warn!(system = %system, operation = ctx.operation, "Request failed, retrying in {:?}", backoff);
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    return Err(transport_error(ctx, e));
                }
            }
        }
    }
}

/// Request URLs can carry search demographics, so they are stripped
fn transport_error(ctx: &RequestContext<'_>, err: reqwest::Error) -> EmrError {
    let message = if err.is_timeout() {
        format!("{} timed out", ctx.operation)
    } else if err.is_connect() {
        format!("{}: connection failed", ctx.operation)
    } else {
        format!("{}: {}", ctx.operation, err.without_url())
    };
    EmrError::ProviderRequestFailed {
        system: ctx.provider.system,
        status: None,
        message,
    }
}

/// Map a non-success FHIR response to an error
///
/// 401 means the provider no longer honours the access token. Other failures
/// keep the status and, when the body is an `OperationOutcome`, its issue code.
pub async fn error_for_status(ctx: &RequestContext<'_>, response: Response) -> Result<Response, EmrError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(EmrError::SessionExpired {
            system: ctx.provider.system,
        });
    }

    let issue = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|outcome| outcome_issue_code(&outcome));
    let message = match issue {
        Some(code) => format!("{} returned {} ({})", ctx.operation, status.as_u16(), code),
        None => format!("{} returned {}", ctx.operation, status.as_u16()),
    };
    Err(EmrError::ProviderRequestFailed {
        system: ctx.provider.system,
        status: Some(status.as_u16()),
        message,
    })
}

/// First issue code of an `OperationOutcome`. Diagnostics text is left out,
/// providers echo submitted demographics in it.
fn outcome_issue_code(outcome: &Value) -> Option<String> {
    if outcome.get("resourceType").and_then(Value::as_str) != Some("OperationOutcome") {
        return None;
    }
    outcome
        .get("issue")?
        .as_array()?
        .first()?
        .get("code")?
        .as_str()
        .map(str::to_string)
}

/// Parse a success response body as JSON
pub async fn read_json(ctx: &RequestContext<'_>, response: Response) -> Result<Value, EmrError> {
    response.json::<Value>().await.map_err(|e| {
        EmrError::MappingError(format!("{} response is not JSON: {}", ctx.operation, e.without_url()))
    })
}
