//! The integration façade used by the rest of the application.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::fhir::{adapter_for, FhirClient, PatientRecord, PatientSearch, RequestContext};
use super::lifecycle::{TokenLifecycle, DEFAULT_REFRESH_SKEW};
use super::oauth::{AuthUrl, OAuthFlow};
use super::registry::ProviderRegistry;
use super::secret::TokenCipher;
use super::session_store::{
    EmrSession, InMemorySessionBackend, JsonFileSessionBackend, SessionBackend, SessionKey, SessionStore,
    SessionSummary,
};
use super::state_token::StateCodec;
use super::{ConfigError, EmrError, EmrSystem};
use crate::activity_log;
use crate::config::{self, Config, SecretSource};

/// HTTP client timeout for provider requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime tuning for [`EmrIntegrationService`]
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub request_timeout: Duration,
    pub refresh_skew: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            refresh_skew: DEFAULT_REFRESH_SKEW,
        }
    }
}

impl From<&Config> for ServiceSettings {
    fn from(config: &Config) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            refresh_skew: config.refresh_skew(),
        }
    }
}

#[derive(Debug)]
pub struct EmrIntegrationService {
    registry: Arc<ProviderRegistry>,
    store: Arc<SessionStore>,
    oauth: OAuthFlow,
    pub(crate) lifecycle: TokenLifecycle,
    fhir: FhirClient,
}

impl EmrIntegrationService {
    pub fn new(
        registry: ProviderRegistry,
        codec: StateCodec,
        store: Arc<SessionStore>,
        settings: &ServiceSettings,
    ) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(settings.request_timeout))
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        let registry = Arc::new(registry);
        let codec = Arc::new(codec);
        Ok(Self {
            oauth: OAuthFlow::new(http.clone(), registry.clone(), codec, store.clone()),
            lifecycle: TokenLifecycle::new(http.clone(), registry.clone(), store.clone(), settings.refresh_skew),
            fhir: FhirClient::new(http),
            registry,
            store,
        })
    }

    /// Wire every component from the config file and deployment secrets
    pub fn from_config(config: &Config, secrets: &dyn SecretSource) -> Result<Self, ConfigError> {
        let registry = ProviderRegistry::from_config(config, secrets)?;
        let codec = StateCodec::new(&config::load_state_signing_key(secrets)?, config.state_ttl())?;
        let cipher = TokenCipher::new(&config::load_token_encryption_key(secrets)?);

        let backend: Arc<dyn SessionBackend> = match &config.session_dir {
            Some(dir) => {
                info!(dir = %dir.display(), "Using JSON file session storage");
                Arc::new(JsonFileSessionBackend::new(dir.clone()))
            }
            None => {
                info!("Using in-memory session storage");
                Arc::new(InMemorySessionBackend::new())
            }
        };
        let store = Arc::new(SessionStore::new(backend, cipher));

        Self::new(registry, codec, store, &ServiceSettings::from(config))
    }

    /// Systems enabled in this deployment
    pub fn systems(&self) -> Vec<EmrSystem> {
        self.registry.systems()
    }

    #[cfg(test)]
    pub(crate) fn session_store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn generate_auth_url(
        &self,
        system: EmrSystem,
        user_id: &str,
        patient_context: Option<&str>,
    ) -> Result<AuthUrl, EmrError> {
        self.oauth.generate_auth_url(system, user_id, patient_context)
    }

    /// The only way a session is created or replaced
    pub async fn exchange_code_for_token(
        &self,
        system: EmrSystem,
        code: &str,
        state: &str,
    ) -> Result<EmrSession, EmrError> {
        self.oauth.exchange_code(system, code, state).await
    }

    pub async fn fetch_patient_data(
        &self,
        user_id: &str,
        system: EmrSystem,
        patient_id: &str,
    ) -> Result<PatientRecord, EmrError> {
        let result = async {
            let session = self.lifecycle.ensure_fresh_session(user_id, system).await?;
            let provider = self.registry.config_for(system)?;
            let ctx = RequestContext {
                provider,
                access_token: &session.access_token,
                operation: "read",
            };
            adapter_for(provider.dialect).read(&self.fhir, &ctx, patient_id).await
        }
        .await;

        log_outcome(system, user_id, "read", &result, |_| 1);
        result
    }

    pub async fn search_patients(
        &self,
        user_id: &str,
        system: EmrSystem,
        search: &PatientSearch,
    ) -> Result<Vec<PatientRecord>, EmrError> {
        let result = async {
            let criteria = search.validate()?;
            let session = self.lifecycle.ensure_fresh_session(user_id, system).await?;
            let provider = self.registry.config_for(system)?;
            let ctx = RequestContext {
                provider,
                access_token: &session.access_token,
                operation: "search",
            };
            adapter_for(provider.dialect).search(&self.fhir, &ctx, &criteria).await
        }
        .await;

        log_outcome(system, user_id, "search", &result, Vec::len);
        result
    }

    pub async fn create_patient(
        &self,
        user_id: &str,
        system: EmrSystem,
        record: &PatientRecord,
    ) -> Result<PatientRecord, EmrError> {
        let result = async {
            let session = self.lifecycle.ensure_fresh_session(user_id, system).await?;
            let provider = self.registry.config_for(system)?;
            let ctx = RequestContext {
                provider,
                access_token: &session.access_token,
                operation: "create",
            };
            adapter_for(provider.dialect).create(&self.fhir, &ctx, record).await
        }
        .await;

        log_outcome(system, user_id, "create", &result, |_| 1);
        result
    }

    /// Forget the session for this key. Disconnecting twice is not an error.
    pub async fn disconnect(&self, user_id: &str, system: EmrSystem) -> Result<(), EmrError> {
        self.registry.config_for(system)?;
        let key = SessionKey::new(user_id, system);
        let _guard = self.store.lock(&key).await;
        self.store.remove(&key).await?;
        activity_log::log_emr_auth("disconnect", system, Some(user_id), true, None);
        Ok(())
    }

    pub async fn session_status(&self, user_id: &str, system: EmrSystem) -> Result<Option<SessionSummary>, EmrError> {
        self.registry.config_for(system)?;
        let key = SessionKey::new(user_id, system);
        Ok(self.store.load(&key).await?.map(|session| session.summary()))
    }
}

fn log_outcome<T>(
    system: EmrSystem,
    user_id: &str,
    operation: &str,
    result: &Result<T, EmrError>,
    count: impl FnOnce(&T) -> usize,
) {
    match result {
        Ok(value) => activity_log::log_fhir_operation(system, user_id, operation, count(value), true, None),
        Err(e) => activity_log::log_fhir_operation(system, user_id, operation, 0, false, Some(e.kind())),
    }
}
