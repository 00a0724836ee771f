//! EMR session persistence.
//!
//! One session per `(user_id, system)`. Tokens are encrypted by [`SessionStore`]
//! before they reach a [`SessionBackend`] and decrypted on the way out, so a
//! backend only ever sees [`StoredSession`] ciphertext.
//!
//! All mutation of a key (upsert on code exchange, refresh, delete) happens
//! inside [`SessionStore::lock`] for that key.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};

use super::secret::{EncryptedToken, SecretString, TokenCipher};
use super::{EmrError, EmrSystem};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub system: EmrSystem,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, system: EmrSystem) -> Self {
        Self {
            user_id: user_id.into(),
            system,
        }
    }

    /// Associated data binding token ciphertext to this key
    fn aad(&self) -> Vec<u8> {
        format!("{}\u{1f}{}", self.system, self.user_id).into_bytes()
    }
}

/// A live session with decrypted tokens.
///
/// Only exists for the duration of an outbound call; the persisted form is
/// [`StoredSession`].
#[derive(Debug, Clone)]
pub struct EmrSession {
    pub user_id: String,
    pub system: EmrSystem,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: DateTime<Utc>,
    pub patient_context: Option<String>,
    pub scope: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl EmrSession {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.user_id.clone(), self.system)
    }

    /// True once `now` is inside the refresh skew before expiry
    pub fn needs_refresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        // A skew reaching past the representable range means always refresh
        self.expires_at
            .checked_sub_signed(skew)
            .map_or(true, |refresh_at| now >= refresh_at)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            user_id: self.user_id.clone(),
            system: self.system,
            expires_at: self.expires_at,
            patient_context: self.patient_context.clone(),
            has_refresh_token: self.refresh_token.is_some(),
        }
    }
}

/// Token-free view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub user_id: String,
    pub system: EmrSystem,
    pub expires_at: DateTime<Utc>,
    pub patient_context: Option<String>,
    pub has_refresh_token: bool,
}

/// Session as persisted by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub user_id: String,
    pub system: EmrSystem,
    pub access_token: EncryptedToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<EncryptedToken>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StoredSession {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.user_id.clone(), self.system)
    }
}

/// Key-value persistence for sessions
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn get(&self, key: &SessionKey) -> Result<Option<StoredSession>, EmrError>;

    /// Insert or replace the session for its key
    async fn put(&self, session: StoredSession) -> Result<(), EmrError>;

    /// Remove the session for a key; absent keys are not an error
    async fn delete(&self, key: &SessionKey) -> Result<(), EmrError>;
}

#[derive(Debug, Default)]
pub struct InMemorySessionBackend {
    sessions: RwLock<HashMap<SessionKey, StoredSession>>,
}

impl InMemorySessionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionBackend for InMemorySessionBackend {
    async fn get(&self, key: &SessionKey) -> Result<Option<StoredSession>, EmrError> {
        Ok(self.sessions.read().await.get(key).cloned())
    }

    async fn put(&self, session: StoredSession) -> Result<(), EmrError> {
        self.sessions.write().await.insert(session.key(), session);
        Ok(())
    }

    async fn delete(&self, key: &SessionKey) -> Result<(), EmrError> {
        self.sessions.write().await.remove(key);
        Ok(())
    }
}

/// One JSON file per session under a directory.
///
/// File names are `<system>-<sha256(user_id)>.json`, so user ids never appear
/// on disk in clear.
#[derive(Debug, Clone)]
pub struct JsonFileSessionBackend {
    dir: PathBuf,
}

impl JsonFileSessionBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &SessionKey) -> PathBuf {
        let digest = Sha256::digest(key.user_id.as_bytes());
        self.dir
            .join(format!("{}-{}.json", key.system, URL_SAFE_NO_PAD.encode(digest)))
    }
}

fn storage_error(action: &str, err: impl std::fmt::Display) -> EmrError {
    EmrError::Storage(format!("Failed to {} session: {}", action, err))
}

#[async_trait]
impl SessionBackend for JsonFileSessionBackend {
    async fn get(&self, key: &SessionKey) -> Result<Option<StoredSession>, EmrError> {
        let path = self.path_for(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_error("read", e)),
        };
        let session = serde_json::from_str(&content).map_err(|e| storage_error("parse", e))?;
        Ok(Some(session))
    }

    async fn put(&self, session: StoredSession) -> Result<(), EmrError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| storage_error("create directory for", e))?;

        let path = self.path_for(&session.key());
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&session).map_err(|e| storage_error("serialize", e))?;

        // Write-then-rename so readers never see a partial file
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| storage_error("write", e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| storage_error("write", e))?;
        debug!("Saved {} session to {:?}", session.system, path);
        Ok(())
    }

    async fn delete(&self, key: &SessionKey) -> Result<(), EmrError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error("delete", e)),
        }
    }
}

/// Encrypting session store with per-key critical sections
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    cipher: TokenCipher,
    locks: Mutex<HashMap<SessionKey, Arc<AsyncMutex<()>>>>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>, cipher: TokenCipher) -> Self {
        Self {
            backend,
            cipher,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Enter the critical section for `key`.
    ///
    /// Held across a whole read-modify-write: refresh grant plus save, or an
    /// upsert after code exchange. Unrelated keys never contend.
    pub async fn lock(&self, key: &SessionKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // Drop entries nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Load and decrypt a session.
    ///
    /// A record whose tokens no longer decrypt (rotated key, tampering) is
    /// treated as absent so the caller re-authorizes.
    pub async fn load(&self, key: &SessionKey) -> Result<Option<EmrSession>, EmrError> {
        let Some(stored) = self.backend.get(key).await? else {
            return Ok(None);
        };

        match self.decrypt(stored) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(
                    system = %key.system,
                    user_id = %key.user_id,
                    "Stored session could not be decrypted: {}",
                    e
                );
                Ok(None)
            }
        }
    }

    /// Encrypt and persist a session, replacing any previous one for its key
    pub async fn save(&self, session: &EmrSession) -> Result<(), EmrError> {
        let stored = self.encrypt(session)?;
        self.backend.put(stored).await
    }

    pub async fn remove(&self, key: &SessionKey) -> Result<(), EmrError> {
        self.backend.delete(key).await
    }

    fn encrypt(&self, session: &EmrSession) -> Result<StoredSession, EmrError> {
        let aad = session.key().aad();
        Ok(StoredSession {
            user_id: session.user_id.clone(),
            system: session.system,
            access_token: self.cipher.encrypt(&session.access_token, &aad)?,
            refresh_token: session
                .refresh_token
                .as_ref()
                .map(|token| self.cipher.encrypt(token, &aad))
                .transpose()?,
            expires_at: session.expires_at,
            patient_context: session.patient_context.clone(),
            scope: session.scope.clone(),
            updated_at: session.updated_at,
        })
    }

    fn decrypt(&self, stored: StoredSession) -> Result<EmrSession, EmrError> {
        let aad = stored.key().aad();
        Ok(EmrSession {
            access_token: self.cipher.decrypt(&stored.access_token, &aad)?,
            refresh_token: stored
                .refresh_token
                .as_ref()
                .map(|token| self.cipher.decrypt(token, &aad))
                .transpose()?,
            user_id: stored.user_id,
            system: stored.system,
            expires_at: stored.expires_at,
            patient_context: stored.patient_context,
            scope: stored.scope,
            updated_at: stored.updated_at,
        })
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}
