//! OAuth2 `state` parameter codec.
//!
//! A state value is `base64url(json) "." base64url(hmac_sha256(json))`. It binds
//! the provider callback to the user, system and patient context that started
//! the flow. Each value validates once: the nonce goes into a seen-set on the
//! first successful decode and stays there until the validity window has passed.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::{ConfigError, EmrError, EmrSystem};

type HmacSha256 = Hmac<Sha256>;

/// Default lifetime of an issued state value
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(600);

/// Minimum signing key length in bytes
pub const MIN_KEY_LEN: usize = 32;

/// Tolerated clock difference for an `issued_at` slightly in the future
const MAX_CLOCK_SKEW_SECS: i64 = 30;

/// Decoded contents of a state value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateToken {
    #[serde(rename = "uid")]
    pub user_id: String,
    #[serde(rename = "sys")]
    pub system: EmrSystem,
    #[serde(rename = "ctx", default, skip_serializing_if = "Option::is_none")]
    pub patient_context: Option<String>,
    /// Base64url of 128 random bits
    pub nonce: String,
    /// Unix seconds
    #[serde(rename = "iat")]
    pub issued_at: i64,
}

pub struct StateCodec {
    mac: HmacSha256,
    ttl_secs: i64,
    /// nonce -> unix second after which the entry can be dropped
    consumed: Mutex<HashMap<String, i64>>,
}

impl StateCodec {
    pub fn new(key: &[u8], ttl: Duration) -> Result<Self, ConfigError> {
        if key.len() < MIN_KEY_LEN {
            return Err(ConfigError::InvalidKey {
                name: "state signing key",
                reason: format!("expected at least {} bytes, got {}", MIN_KEY_LEN, key.len()),
            });
        }
        let mac = HmacSha256::new_from_slice(key).map_err(|e| ConfigError::InvalidKey {
            name: "state signing key",
            reason: e.to_string(),
        })?;

        Ok(Self {
            mac,
            ttl_secs: ttl.as_secs() as i64,
            consumed: Mutex::new(HashMap::new()),
        })
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs as u64)
    }

    /// Mint a signed state value for a new authorization request
    pub fn encode(
        &self,
        system: EmrSystem,
        user_id: &str,
        patient_context: Option<&str>,
    ) -> Result<String, EmrError> {
        self.encode_at(system, user_id, patient_context, Utc::now())
    }

    pub(crate) fn encode_at(
        &self,
        system: EmrSystem,
        user_id: &str,
        patient_context: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<String, EmrError> {
        let nonce_bytes: [u8; 16] = rand::thread_rng().gen();
        let token = StateToken {
            user_id: user_id.to_string(),
            system,
            patient_context: patient_context
                .filter(|ctx| !ctx.is_empty())
                .map(str::to_string),
            nonce: URL_SAFE_NO_PAD.encode(nonce_bytes),
            issued_at: now.timestamp(),
        };

        let payload = serde_json::to_vec(&token)
            .map_err(|e| EmrError::MappingError(format!("state payload: {}", e)))?;
        let body = URL_SAFE_NO_PAD.encode(payload);
        let signature = self.sign(body.as_bytes());

        Ok(format!("{}.{}", body, URL_SAFE_NO_PAD.encode(signature)))
    }

    /// Validate and consume a state value returned on a provider callback.
    ///
    /// `system` is the system whose callback received the value; a state minted
    /// for another system is rejected as invalid.
    pub fn decode(&self, system: EmrSystem, state: &str) -> Result<StateToken, EmrError> {
        self.decode_at(system, state, Utc::now())
    }

    pub(crate) fn decode_at(
        &self,
        system: EmrSystem,
        state: &str,
        now: DateTime<Utc>,
    ) -> Result<StateToken, EmrError> {
        let (body, signature) = state.split_once('.').ok_or(EmrError::InvalidState)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| EmrError::InvalidState)?;

        let mut mac = self.mac.clone();
        mac.update(body.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| EmrError::InvalidState)?;

        let payload = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| EmrError::InvalidState)?;
        let token: StateToken =
            serde_json::from_slice(&payload).map_err(|_| EmrError::InvalidState)?;

        if token.system != system {
            return Err(EmrError::InvalidState);
        }

        let age = now.timestamp() - token.issued_at;
        if age < -MAX_CLOCK_SKEW_SECS {
            return Err(EmrError::InvalidState);
        }
        if age > self.ttl_secs {
            return Err(EmrError::ExpiredState);
        }

        self.consume_nonce(&token.nonce, token.issued_at + self.ttl_secs, now)?;
        Ok(token)
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    /// Check-and-insert under a single lock so concurrent callbacks presenting
    /// the same state cannot both succeed.
    fn consume_nonce(&self, nonce: &str, expires_at: i64, now: DateTime<Utc>) -> Result<(), EmrError> {
        let mut consumed = self
            .consumed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let now = now.timestamp();
        consumed.retain(|_, expiry| *expiry >= now);

        match consumed.entry(nonce.to_string()) {
            Entry::Occupied(_) => Err(EmrError::ReplayedState),
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for StateCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCodec")
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}
