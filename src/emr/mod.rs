//! EMR integration layer.
//!
//! Authenticates against external medical-record systems with OAuth2, keeps one
//! session per `(user, system)` pair and performs FHIR `Patient` operations
//! against whichever provider the caller names.
//!
//! The rest of the application talks to [`EmrIntegrationService`] only.

mod error;
pub mod fhir;
pub mod lifecycle;
pub mod oauth;
pub mod registry;
pub mod secret;
pub mod service;
pub mod session_store;
pub mod state_token;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ConfigError, EmrError};
pub use fhir::{PatientIdentifier, PatientRecord, PatientSearch};
pub use oauth::AuthUrl;
pub use registry::{FhirDialect, ProviderConfig, ProviderRegistry, TokenAuthMethod};
pub use secret::SecretString;
pub use service::{EmrIntegrationService, ServiceSettings};
pub use session_store::{EmrSession, SessionKey, SessionSummary};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

/// External medical-record systems the clinic can connect to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmrSystem {
    Epic,
    Cerner,
    Allscripts,
    Athenahealth,
    Eclinicalworks,
    EclinicalworksSandbox,
}

impl EmrSystem {
    pub const ALL: [EmrSystem; 6] = [
        EmrSystem::Epic,
        EmrSystem::Cerner,
        EmrSystem::Allscripts,
        EmrSystem::Athenahealth,
        EmrSystem::Eclinicalworks,
        EmrSystem::EclinicalworksSandbox,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EmrSystem::Epic => "epic",
            EmrSystem::Cerner => "cerner",
            EmrSystem::Allscripts => "allscripts",
            EmrSystem::Athenahealth => "athenahealth",
            EmrSystem::Eclinicalworks => "eclinicalworks",
            EmrSystem::EclinicalworksSandbox => "eclinicalworks_sandbox",
        }
    }

    /// Prefix used for this system's secrets, e.g. `EMR_EPIC_CLIENT_ID`
    pub fn env_prefix(self) -> String {
        format!("EMR_{}", self.as_str().to_ascii_uppercase())
    }
}

impl fmt::Display for EmrSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmrSystem {
    type Err = EmrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        EmrSystem::ALL
            .into_iter()
            .find(|system| system.as_str() == normalized)
            .ok_or_else(|| EmrError::UnsupportedSystem(s.to_string()))
    }
}

/// Process-wide service handle.
///
/// Set exactly once at startup by [`init_service`]; every later caller reads the
/// same instance through [`service`].
static SERVICE: OnceLock<Arc<EmrIntegrationService>> = OnceLock::new();

/// Install the process-wide integration service.
///
/// Fails with [`ConfigError::AlreadyInitialized`] on any call after the first,
/// leaving the installed service untouched.
pub fn init_service(service: EmrIntegrationService) -> Result<Arc<EmrIntegrationService>, ConfigError> {
    let service = Arc::new(service);
    SERVICE
        .set(Arc::clone(&service))
        .map_err(|_| ConfigError::AlreadyInitialized)?;
    Ok(service)
}

/// The installed integration service, if [`init_service`] has run
pub fn service() -> Option<Arc<EmrIntegrationService>> {
    SERVICE.get().cloned()
}
