//! OAuth2 authorization-code flow against EMR providers.
//!
//! Authorization URLs carry a signed, single-use `state` minted by
//! [`StateCodec`]; the callback is rejected before any provider contact when
//! that state does not verify.

use chrono::{Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use url::Url;

use super::registry::{ProviderConfig, ProviderRegistry, TokenAuthMethod};
use super::session_store::{EmrSession, SessionStore};
use super::state_token::StateCodec;
use super::{EmrError, EmrSystem, SecretString};
use crate::activity_log;

/// Lifetime assumed when a token response carries no `expires_in`
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Upper bound on accepted `expires_in` values (one year)
const MAX_EXPIRES_IN_SECS: u64 = 365 * 24 * 3600;

/// Maximum length for OAuth callback parameters
const MAX_OAUTH_PARAM_LENGTH: usize = 2048;

/// Authorization URL handed to the browser
#[derive(Debug, Clone, Serialize)]
pub struct AuthUrl {
    pub url: String,
    pub state: String,
}

/// OAuth token response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: SecretString,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default, deserialize_with = "deserialize_expires_in")]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<SecretString>,
    #[serde(default)]
    pub scope: Option<String>,
    /// SMART launch context
    #[serde(default)]
    pub patient: Option<String>,
}

impl TokenResponse {
    /// Expiry instant for a token issued now
    pub fn expires_at(&self, now: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
        let secs = self
            .expires_in
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
            .min(MAX_EXPIRES_IN_SECS);
        now + Duration::seconds(secs as i64)
    }
}

/// Some providers send `expires_in` as a string
fn deserialize_expires_in<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid expires_in: {:?}", s))),
    }
}

/// Failure at a provider token endpoint
#[derive(Debug)]
pub(crate) enum TokenEndpointError {
    /// Non-success status; `error` is the OAuth error code when the body had one
    Rejected { status: u16, error: Option<String> },
    Transport(String),
    Malformed(String),
}

impl TokenEndpointError {
    pub(crate) fn reason(&self) -> String {
        match self {
            TokenEndpointError::Rejected { status, error: Some(code) } => {
                format!("provider returned {} ({})", status, code)
            }
            TokenEndpointError::Rejected { status, error: None } => {
                format!("provider returned {}", status)
            }
            TokenEndpointError::Transport(message) => format!("request failed: {}", message),
            TokenEndpointError::Malformed(message) => format!("malformed token response: {}", message),
        }
    }

    /// The provider refused the grant itself, as opposed to failing to answer
    pub(crate) fn is_rejection(&self) -> bool {
        matches!(self, TokenEndpointError::Rejected { status, .. } if (400..500).contains(status))
    }
}

#[derive(Deserialize)]
struct OAuthErrorBody {
    error: Option<String>,
}

/// POST a grant to the provider's token endpoint.
///
/// Never retried: an authorization code is single use and a refresh token may
/// be rotated on first use.
pub(crate) async fn request_token(
    http: &reqwest::Client,
    provider: &ProviderConfig,
    grant: &[(&str, &str)],
) -> Result<TokenResponse, TokenEndpointError> {
    let mut form: Vec<(&str, &str)> = grant.to_vec();
    let mut request = http
        .post(provider.token_url.clone())
        .header(reqwest::header::ACCEPT, "application/json");

    match provider.token_auth {
        TokenAuthMethod::ClientSecretBasic => {
            request = request.basic_auth(&provider.client_id, Some(provider.client_secret.expose()));
        }
        TokenAuthMethod::ClientSecretPost => {
            form.push(("client_id", provider.client_id.as_str()));
            form.push(("client_secret", provider.client_secret.expose()));
        }
    }

    let started = Instant::now();
    let result = request.form(&form).send().await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            activity_log::log_provider_request(provider.system, "token", None, 1, elapsed_ms);
            return Err(TokenEndpointError::Transport(e.without_url().to_string()));
        }
    };

    let status = response.status();
    activity_log::log_provider_request(provider.system, "token", Some(status.as_u16()), 1, elapsed_ms);

    let body = response
        .bytes()
        .await
        .map_err(|e| TokenEndpointError::Transport(e.without_url().to_string()))?;

    if !status.is_success() {
        let error = serde_json::from_slice::<OAuthErrorBody>(&body)
            .ok()
            .and_then(|b| b.error);
        return Err(TokenEndpointError::Rejected {
            status: status.as_u16(),
            error,
        });
    }

    let token: TokenResponse =
        serde_json::from_slice(&body).map_err(|e| TokenEndpointError::Malformed(e.to_string()))?;
    if token.access_token.is_empty() {
        return Err(TokenEndpointError::Malformed("empty access_token".to_string()));
    }
    if let Some(token_type) = &token.token_type {
        if !token_type.eq_ignore_ascii_case("bearer") {
            return Err(TokenEndpointError::Malformed(format!(
                "unsupported token_type: {}",
                token_type
            )));
        }
    }
    Ok(token)
}

/// Authorization URL construction and code exchange
#[derive(Debug, Clone)]
pub struct OAuthFlow {
    http: reqwest::Client,
    registry: Arc<ProviderRegistry>,
    codec: Arc<StateCodec>,
    store: Arc<SessionStore>,
}

impl OAuthFlow {
    pub fn new(
        http: reqwest::Client,
        registry: Arc<ProviderRegistry>,
        codec: Arc<StateCodec>,
        store: Arc<SessionStore>,
    ) -> Self {
        Self {
            http,
            registry,
            codec,
            store,
        }
    }

    /// Build the provider's authorization URL for `user_id`
    pub fn generate_auth_url(
        &self,
        system: EmrSystem,
        user_id: &str,
        patient_context: Option<&str>,
    ) -> Result<AuthUrl, EmrError> {
        let provider = self.registry.config_for(system)?;
        let state = self.codec.encode(system, user_id, patient_context)?;

        let url = build_authorize_url(provider, &state);
        debug!(system = %system, "Generated authorization URL");
        activity_log::log_emr_auth("authorize", system, Some(user_id), true, None);

        Ok(AuthUrl {
            url: url.to_string(),
            state,
        })
    }

    /// Handle a provider callback: verify `state`, redeem `code`, store the session
    pub async fn exchange_code(
        &self,
        system: EmrSystem,
        code: &str,
        state: &str,
    ) -> Result<EmrSession, EmrError> {
        let provider = self.registry.config_for(system)?;

        if state.len() > MAX_OAUTH_PARAM_LENGTH {
            activity_log::log_emr_auth("exchange", system, None, false, Some("invalid_state"));
            return Err(EmrError::InvalidState);
        }
        let verified = self.codec.decode(system, state).map_err(|e| {
            activity_log::log_emr_auth("exchange", system, None, false, Some(e.kind()));
            e
        })?;

        if code.is_empty() || code.len() > MAX_OAUTH_PARAM_LENGTH {
            let reason = "authorization code missing or too long".to_string();
            activity_log::log_emr_auth("exchange", system, Some(&verified.user_id), false, Some(&reason));
            return Err(EmrError::TokenExchangeFailed { system, reason });
        }

        let grant = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", provider.redirect_uri.as_str()),
        ];
        let token = request_token(&self.http, provider, &grant).await.map_err(|e| {
            let reason = e.reason();
            activity_log::log_emr_auth("exchange", system, Some(&verified.user_id), false, Some(&reason));
            EmrError::TokenExchangeFailed { system, reason }
        })?;

        let now = Utc::now();
        let session = EmrSession {
            expires_at: token.expires_at(now),
            user_id: verified.user_id,
            system,
            access_token: token.access_token,
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
            patient_context: verified
                .patient_context
                .or(token.patient.filter(|p| !p.is_empty())),
            scope: token.scope,
            updated_at: now,
        };

        let key = session.key();
        let _guard = self.store.lock(&key).await;
        self.store.save(&session).await?;

        info!(
            system = %system,
            user_id = %session.user_id,
            has_refresh_token = session.refresh_token.is_some(),
            "EMR session established"
        );
        activity_log::log_emr_auth("exchange", system, Some(&session.user_id), true, None);
        Ok(session)
    }
}

fn build_authorize_url(provider: &ProviderConfig, state: &str) -> Url {
    let mut url = provider.authorize_url.clone();
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", &provider.client_id)
            .append_pair("redirect_uri", provider.redirect_uri.as_str())
            .append_pair("scope", &provider.scope_param())
            .append_pair("state", state);
        if provider.send_aud {
            query.append_pair("aud", provider.fhir_base_url.as_str());
        }
    }
    url
}
