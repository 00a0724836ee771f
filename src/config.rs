//! Gateway configuration.
//!
//! Non-secret settings live in a JSON file (`$EMR_GATEWAY_CONFIG`, or
//! `~/.emr-gateway/config.json`). Client credentials and key material come from
//! a [`SecretSource`], the process environment in production.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::emr::{ConfigError, EmrSystem, FhirDialect, TokenAuthMethod};

/// Env var naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "EMR_GATEWAY_CONFIG";

/// Secret holding the base64 HMAC key for OAuth state values
pub const STATE_SIGNING_KEY: &str = "EMR_STATE_SIGNING_KEY";

/// Secret holding the base64 32-byte key for token encryption at rest
pub const TOKEN_ENCRYPTION_KEY: &str = "EMR_TOKEN_ENCRYPTION_KEY";

/// Per-provider settings from the config file.
///
/// Endpoints left out here are looked up in the secret source as
/// `EMR_<SYSTEM>_<FIELD>`, e.g. `EMR_EPIC_TOKEN_URL`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub authorize_url: Option<String>,
    pub token_url: Option<String>,
    pub fhir_base_url: Option<String>,
    /// Overrides the top-level `redirect_uri`
    pub redirect_uri: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub token_auth: Option<TokenAuthMethod>,
    pub send_aud: Option<bool>,
    pub dialect: Option<FhirDialect>,
    pub practice_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schema_version: u32,
    pub listen_addr: SocketAddr,
    /// Callback URL registered with every provider. `{system}` is replaced
    /// with the system's name.
    pub redirect_uri: String,
    pub state_ttl_secs: u64,
    pub refresh_skew_secs: u64,
    pub request_timeout_secs: u64,
    /// JSON-file session storage; sessions are kept in memory when unset
    pub session_dir: Option<PathBuf>,
    /// Enabled providers
    pub providers: BTreeMap<EmrSystem, ProviderSettings>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: 1,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7210)),
            redirect_uri: "http://localhost:7210/api/emr/{system}/callback".to_string(),
            state_ttl_secs: 600,
            refresh_skew_secs: 60,
            request_timeout_secs: 30,
            session_dir: None,
            providers: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Get the default config directory
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".emr-gateway"))
    }

    /// Get the config file path, honouring `EMR_GATEWAY_CONFIG`
    pub fn config_path() -> Result<PathBuf> {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::config_dir()?.join("config.json")),
        }
    }

    /// Load config from file, or defaults when the file does not exist
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config {}", path.display()))?;
            debug!("Loaded config from {:?}", path);
            Ok(config)
        } else {
            debug!("No config at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    pub fn refresh_skew(&self) -> Duration {
        Duration::from_secs(self.refresh_skew_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Deployment secret store
pub trait SecretSource: Send + Sync {
    fn get_secret(&self, key: &str) -> Option<String>;
}

/// Reads secrets from the process environment
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretSource;

impl SecretSource for EnvSecretSource {
    fn get_secret(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|value| !value.trim().is_empty())
    }
}

impl SecretSource for HashMap<String, String> {
    fn get_secret(&self, key: &str) -> Option<String> {
        self.get(key).filter(|value| !value.trim().is_empty()).cloned()
    }
}

fn decode_key(secrets: &dyn SecretSource, name: &'static str) -> Result<Vec<u8>, ConfigError> {
    let encoded = secrets
        .get_secret(name)
        .ok_or_else(|| ConfigError::MissingSecret(name.to_string()))?;
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| ConfigError::InvalidKey {
            name,
            reason: format!("not valid base64: {}", e),
        })
}

/// HMAC key for OAuth state values. Length is checked by the codec.
pub fn load_state_signing_key(secrets: &dyn SecretSource) -> Result<Vec<u8>, ConfigError> {
    decode_key(secrets, STATE_SIGNING_KEY)
}

pub fn load_token_encryption_key(secrets: &dyn SecretSource) -> Result<[u8; 32], ConfigError> {
    let bytes = decode_key(secrets, TOKEN_ENCRYPTION_KEY)?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| ConfigError::InvalidKey {
        name: TOKEN_ENCRYPTION_KEY,
        reason: format!("expected 32 bytes, got {}", len),
    })
}
