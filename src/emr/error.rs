use super::EmrSystem;

/// EMR integration errors.
///
/// Messages carry provider identity and HTTP status only; tokens and patient
/// demographics never appear here.
#[derive(Debug, thiserror::Error)]
pub enum EmrError {
    #[error("Unsupported EMR system: {0}")]
    UnsupportedSystem(String),

    #[error("Invalid OAuth state")]
    InvalidState,

    #[error("OAuth state expired")]
    ExpiredState,

    #[error("OAuth state already used")]
    ReplayedState,

    #[error("Token exchange with {system} failed: {reason}")]
    TokenExchangeFailed { system: EmrSystem, reason: String },

    #[error("No active {system} session")]
    NoActiveSession { system: EmrSystem },

    #[error("{system} session expired, re-authorization required")]
    SessionExpired { system: EmrSystem },

    #[error("Patient not found: {0}")]
    PatientNotFound(String),

    #[error("{system} request failed: {message}")]
    ProviderRequestFailed {
        system: EmrSystem,
        status: Option<u16>,
        message: String,
    },

    #[error("FHIR mapping error: {0}")]
    MappingError(String),

    #[error("Session storage error: {0}")]
    Storage(String),

    #[error("Token encryption failed")]
    Crypto,
}

impl EmrError {
    /// Stable machine-readable name, used in logs and gateway responses
    pub fn kind(&self) -> &'static str {
        match self {
            EmrError::UnsupportedSystem(_) => "unsupported_system",
            EmrError::InvalidState => "invalid_state",
            EmrError::ExpiredState => "expired_state",
            EmrError::ReplayedState => "replayed_state",
            EmrError::TokenExchangeFailed { .. } => "token_exchange_failed",
            EmrError::NoActiveSession { .. } => "no_active_session",
            EmrError::SessionExpired { .. } => "session_expired",
            EmrError::PatientNotFound(_) => "patient_not_found",
            EmrError::ProviderRequestFailed { .. } => "provider_request_failed",
            EmrError::MappingError(_) => "mapping_error",
            EmrError::Storage(_) => "storage_error",
            EmrError::Crypto => "crypto_error",
        }
    }
}

/// Startup configuration errors. Any of these aborts the process.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{system}: missing required setting `{field}`")]
    MissingField {
        system: EmrSystem,
        field: &'static str,
    },

    #[error("{system}: invalid `{field}`: {reason}")]
    InvalidField {
        system: EmrSystem,
        field: &'static str,
        reason: String,
    },

    #[error("Missing secret `{0}`")]
    MissingSecret(String),

    #[error("Invalid key `{name}`: {reason}")]
    InvalidKey { name: &'static str, reason: String },

    #[error("Failed to create HTTP client: {0}")]
    HttpClient(String),

    #[error("EMR service already initialized")]
    AlreadyInitialized,
}
