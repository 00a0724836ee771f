//! Per-system provider configuration.
//!
//! Built once at startup. Endpoints come from the config file (or the secret
//! source when the file leaves them out); client credentials come from the
//! secret source only. Anything missing is a [`ConfigError`] and aborts startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};
use url::Url;

use super::{ConfigError, EmrError, EmrSystem, SecretString};
use crate::config::{Config, ProviderSettings, SecretSource};

/// How client credentials are presented at the token endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenAuthMethod {
    /// HTTP Basic `client_id:client_secret`
    ClientSecretBasic,
    /// `client_id` and `client_secret` in the form body
    ClientSecretPost,
}

/// Shape of a provider's FHIR Patient API, selects the adapter in [`super::fhir`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FhirDialect {
    StandardR4,
    Cerner,
    Athena,
    Eclinicalworks,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub system: EmrSystem,
    pub authorize_url: Url,
    pub token_url: Url,
    pub fhir_base_url: Url,
    pub client_id: String,
    pub client_secret: SecretString,
    pub redirect_uri: Url,
    pub scopes: Vec<String>,
    pub token_auth: TokenAuthMethod,
    /// Add the SMART `aud` parameter (the FHIR base URL) to authorization requests
    pub send_aud: bool,
    pub dialect: FhirDialect,
    /// Athenahealth practice id, required by its Patient search
    pub practice_id: Option<String>,
}

impl ProviderConfig {
    /// Absolute URL for a path relative to the FHIR base
    pub fn fhir_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.fhir_base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn scope_param(&self) -> String {
        self.scopes.join(" ")
    }
}

/// Behaviour that differs between systems when the config file is silent
struct SystemDefaults {
    scopes: &'static [&'static str],
    token_auth: TokenAuthMethod,
    send_aud: bool,
    dialect: FhirDialect,
}

/// Replaced with the system name in redirect URIs
pub const SYSTEM_PLACEHOLDER: &str = "{system}";

const PROVIDER_SCOPES: &[&str] = &[
    "openid",
    "fhirUser",
    "offline_access",
    "user/Patient.read",
    "user/Patient.write",
];

fn defaults_for(system: EmrSystem) -> SystemDefaults {
    match system {
        EmrSystem::Epic => SystemDefaults {
            scopes: PROVIDER_SCOPES,
            token_auth: TokenAuthMethod::ClientSecretBasic,
            send_aud: true,
            dialect: FhirDialect::StandardR4,
        },
        EmrSystem::Cerner => SystemDefaults {
            scopes: PROVIDER_SCOPES,
            token_auth: TokenAuthMethod::ClientSecretBasic,
            send_aud: true,
            dialect: FhirDialect::Cerner,
        },
        EmrSystem::Allscripts => SystemDefaults {
            scopes: PROVIDER_SCOPES,
            token_auth: TokenAuthMethod::ClientSecretPost,
            send_aud: true,
            dialect: FhirDialect::StandardR4,
        },
        EmrSystem::Athenahealth => SystemDefaults {
            scopes: PROVIDER_SCOPES,
            token_auth: TokenAuthMethod::ClientSecretBasic,
            send_aud: true,
            dialect: FhirDialect::Athena,
        },
        EmrSystem::Eclinicalworks | EmrSystem::EclinicalworksSandbox => SystemDefaults {
            scopes: PROVIDER_SCOPES,
            token_auth: TokenAuthMethod::ClientSecretPost,
            send_aud: true,
            dialect: FhirDialect::Eclinicalworks,
        },
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<EmrSystem, ProviderConfig>,
}

impl ProviderRegistry {
    pub fn new(configs: impl IntoIterator<Item = ProviderConfig>) -> Self {
        Self {
            providers: configs
                .into_iter()
                .map(|config| (config.system, config))
                .collect(),
        }
    }

    /// Resolve every provider listed in `config.providers`.
    pub fn from_config(config: &Config, secrets: &dyn SecretSource) -> Result<Self, ConfigError> {
        if config.providers.is_empty() {
            warn!("No EMR providers configured; every EMR request will be rejected");
        }

        let mut providers = HashMap::new();
        for (system, settings) in &config.providers {
            let provider = resolve_provider(*system, settings, config, secrets)?;
            info!(
                system = %system,
                dialect = ?provider.dialect,
                fhir_base_url = %provider.fhir_base_url,
                "EMR provider configured"
            );
            providers.insert(*system, provider);
        }

        Ok(Self { providers })
    }

    pub fn config_for(&self, system: EmrSystem) -> Result<&ProviderConfig, EmrError> {
        self.providers
            .get(&system)
            .ok_or_else(|| EmrError::UnsupportedSystem(system.to_string()))
    }

    /// Enabled systems in a stable order
    pub fn systems(&self) -> Vec<EmrSystem> {
        let mut systems: Vec<_> = self.providers.keys().copied().collect();
        systems.sort();
        systems
    }
}

fn resolve_provider(
    system: EmrSystem,
    settings: &ProviderSettings,
    config: &Config,
    secrets: &dyn SecretSource,
) -> Result<ProviderConfig, ConfigError> {
    let defaults = defaults_for(system);

    let authorize_url = resolve_url(system, "authorize_url", settings.authorize_url.as_deref(), secrets)?;
    let token_url = resolve_url(system, "token_url", settings.token_url.as_deref(), secrets)?;
    let fhir_base_url = resolve_url(system, "fhir_base_url", settings.fhir_base_url.as_deref(), secrets)?;
    let redirect_template = settings.redirect_uri.as_deref().unwrap_or(config.redirect_uri.as_str());
    let redirect_uri = resolve_url(
        system,
        "redirect_uri",
        Some(&redirect_template.replace(SYSTEM_PLACEHOLDER, system.as_str())),
        secrets,
    )?;

    let client_id = secret_field(system, "client_id", secrets)?;
    let client_secret = SecretString::new(secret_field(system, "client_secret", secrets)?);

    let dialect = settings.dialect.unwrap_or(defaults.dialect);
    let practice_id = settings.practice_id.clone().filter(|id| !id.trim().is_empty());
    if dialect == FhirDialect::Athena && practice_id.is_none() {
        return Err(ConfigError::MissingField {
            system,
            field: "practice_id",
        });
    }

    let scopes = match &settings.scopes {
        Some(scopes) if !scopes.is_empty() => scopes.clone(),
        _ => defaults.scopes.iter().map(|s| s.to_string()).collect(),
    };

    Ok(ProviderConfig {
        system,
        authorize_url,
        token_url,
        fhir_base_url,
        client_id,
        client_secret,
        redirect_uri,
        scopes,
        token_auth: settings.token_auth.unwrap_or(defaults.token_auth),
        send_aud: settings.send_aud.unwrap_or(defaults.send_aud),
        dialect,
        practice_id,
    })
}

fn secret_key(system: EmrSystem, field: &str) -> String {
    format!("{}_{}", system.env_prefix(), field.to_ascii_uppercase())
}

fn secret_field(
    system: EmrSystem,
    field: &'static str,
    secrets: &dyn SecretSource,
) -> Result<String, ConfigError> {
    secrets
        .get_secret(&secret_key(system, field))
        .ok_or(ConfigError::MissingField { system, field })
}

fn resolve_url(
    system: EmrSystem,
    field: &'static str,
    file_value: Option<&str>,
    secrets: &dyn SecretSource,
) -> Result<Url, ConfigError> {
    let raw = match file_value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => value.to_string(),
        None => secret_field(system, field, secrets)?,
    };

    let url = Url::parse(&raw).map_err(|e| ConfigError::InvalidField {
        system,
        field,
        reason: e.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidField {
            system,
            field,
            reason: format!("URL must use http or https scheme, got: {}", url.scheme()),
        });
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(ConfigError::InvalidField {
            system,
            field,
            reason: "URL must not contain credentials".to_string(),
        });
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn epic_settings() -> ProviderSettings {
        ProviderSettings {
            authorize_url: Some("https://fhir.example.org/oauth2/authorize".to_string()),
            token_url: Some("https://fhir.example.org/oauth2/token".to_string()),
            fhir_base_url: Some("https://fhir.example.org/api/FHIR/R4/".to_string()),
            ..ProviderSettings::default()
        }
    }

    fn epic_secrets() -> HashMap<String, String> {
        HashMap::from([
            ("EMR_EPIC_CLIENT_ID".to_string(), "epic-client".to_string()),
            ("EMR_EPIC_CLIENT_SECRET".to_string(), "epic-secret".to_string()),
        ])
    }

    fn config_with(providers: BTreeMap<EmrSystem, ProviderSettings>) -> Config {
        Config {
            providers,
            ..Config::default()
        }
    }

    #[test]
    fn test_registry_from_config() {
        let config = config_with(BTreeMap::from([(EmrSystem::Epic, epic_settings())]));
        let registry = ProviderRegistry::from_config(&config, &epic_secrets()).unwrap();

        let epic = registry.config_for(EmrSystem::Epic).unwrap();
        assert_eq!(epic.client_id, "epic-client");
        assert_eq!(epic.client_secret.expose(), "epic-secret");
        assert_eq!(epic.token_auth, TokenAuthMethod::ClientSecretBasic);
        assert_eq!(epic.dialect, FhirDialect::StandardR4);
        assert!(epic.scopes.iter().any(|s| s == "offline_access"));
        assert_eq!(
            epic.fhir_url("Patient/123"),
            "https://fhir.example.org/api/FHIR/R4/Patient/123"
        );
        assert_eq!(registry.systems(), vec![EmrSystem::Epic]);
    }

    #[test]
    fn test_redirect_uri_placeholder() {
        let config = config_with(BTreeMap::from([(EmrSystem::Epic, epic_settings())]));
        let registry = ProviderRegistry::from_config(&config, &epic_secrets()).unwrap();
        assert_eq!(
            registry.config_for(EmrSystem::Epic).unwrap().redirect_uri.as_str(),
            "http://localhost:7210/api/emr/epic/callback"
        );

        let settings = ProviderSettings {
            redirect_uri: Some("https://clinic.example.org/oauth/done".to_string()),
            ..epic_settings()
        };
        let config = config_with(BTreeMap::from([(EmrSystem::Epic, settings)]));
        let registry = ProviderRegistry::from_config(&config, &epic_secrets()).unwrap();
        assert_eq!(
            registry.config_for(EmrSystem::Epic).unwrap().redirect_uri.as_str(),
            "https://clinic.example.org/oauth/done"
        );
    }

    #[test]
    fn test_unconfigured_system_is_unsupported() {
        let config = config_with(BTreeMap::from([(EmrSystem::Epic, epic_settings())]));
        let registry = ProviderRegistry::from_config(&config, &epic_secrets()).unwrap();

        assert!(matches!(
            registry.config_for(EmrSystem::Cerner),
            Err(EmrError::UnsupportedSystem(ref name)) if name == "cerner"
        ));
    }

    #[test]
    fn test_missing_client_secret_is_fatal() {
        let config = config_with(BTreeMap::from([(EmrSystem::Epic, epic_settings())]));
        let mut secrets = epic_secrets();
        secrets.remove("EMR_EPIC_CLIENT_SECRET");

        let err = ProviderRegistry::from_config(&config, &secrets).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingField { system: EmrSystem::Epic, field: "client_secret" }
        ));
    }

    #[test]
    fn test_missing_base_url_is_fatal() {
        let settings = ProviderSettings {
            fhir_base_url: None,
            ..epic_settings()
        };
        let config = config_with(BTreeMap::from([(EmrSystem::Epic, settings)]));

        let err = ProviderRegistry::from_config(&config, &epic_secrets()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field: "fhir_base_url", .. }));
    }

    #[test]
    fn test_endpoints_fall_back_to_secret_source() {
        let settings = ProviderSettings {
            token_url: None,
            ..epic_settings()
        };
        let config = config_with(BTreeMap::from([(EmrSystem::Epic, settings)]));
        let mut secrets = epic_secrets();
        secrets.insert(
            "EMR_EPIC_TOKEN_URL".to_string(),
            "https://login.example.org/token".to_string(),
        );

        let registry = ProviderRegistry::from_config(&config, &secrets).unwrap();
        assert_eq!(
            registry.config_for(EmrSystem::Epic).unwrap().token_url.as_str(),
            "https://login.example.org/token"
        );
    }

    #[test]
    fn test_rejects_bad_urls() {
        for bad in ["not-a-url", "ftp://fhir.example.org", "https://user:pw@fhir.example.org"] {
            let settings = ProviderSettings {
                authorize_url: Some(bad.to_string()),
                ..epic_settings()
            };
            let config = config_with(BTreeMap::from([(EmrSystem::Epic, settings)]));
            let err = ProviderRegistry::from_config(&config, &epic_secrets()).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidField { field: "authorize_url", .. }), "{}", bad);
        }
    }

    #[test]
    fn test_athena_requires_practice_id() {
        let config = config_with(BTreeMap::from([(EmrSystem::Athenahealth, epic_settings())]));
        let secrets = HashMap::from([
            ("EMR_ATHENAHEALTH_CLIENT_ID".to_string(), "a".to_string()),
            ("EMR_ATHENAHEALTH_CLIENT_SECRET".to_string(), "b".to_string()),
        ]);

        let err = ProviderRegistry::from_config(&config, &secrets).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field: "practice_id", .. }));

        let settings = ProviderSettings {
            practice_id: Some("195900".to_string()),
            ..epic_settings()
        };
        let config = config_with(BTreeMap::from([(EmrSystem::Athenahealth, settings)]));
        let registry = ProviderRegistry::from_config(&config, &secrets).unwrap();
        let athena = registry.config_for(EmrSystem::Athenahealth).unwrap();
        assert_eq!(athena.dialect, FhirDialect::Athena);
        assert_eq!(athena.practice_id.as_deref(), Some("195900"));
    }

    #[test]
    fn test_sandbox_shares_eclinicalworks_dialect() {
        let settings = epic_settings();
        let config = config_with(BTreeMap::from([(EmrSystem::EclinicalworksSandbox, settings)]));
        let secrets = HashMap::from([
            ("EMR_ECLINICALWORKS_SANDBOX_CLIENT_ID".to_string(), "a".to_string()),
            ("EMR_ECLINICALWORKS_SANDBOX_CLIENT_SECRET".to_string(), "b".to_string()),
        ]);

        let registry = ProviderRegistry::from_config(&config, &secrets).unwrap();
        let sandbox = registry.config_for(EmrSystem::EclinicalworksSandbox).unwrap();
        assert_eq!(sandbox.dialect, FhirDialect::Eclinicalworks);
        assert_eq!(sandbox.token_auth, TokenAuthMethod::ClientSecretPost);
    }
}
