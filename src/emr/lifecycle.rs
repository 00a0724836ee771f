//! Session freshness and inline token refresh.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::oauth::request_token;
use super::registry::{ProviderConfig, ProviderRegistry};
use super::session_store::{EmrSession, SessionKey, SessionStore};
use super::{EmrError, EmrSystem};
use crate::activity_log;

/// Refresh this long before the provider's stated expiry
pub const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct TokenLifecycle {
    http: reqwest::Client,
    registry: Arc<ProviderRegistry>,
    store: Arc<SessionStore>,
    skew: chrono::Duration,
}

impl TokenLifecycle {
    pub fn new(
        http: reqwest::Client,
        registry: Arc<ProviderRegistry>,
        store: Arc<SessionStore>,
        refresh_skew: Duration,
    ) -> Self {
        let skew = chrono::Duration::from_std(refresh_skew)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_REFRESH_SKEW.as_secs() as i64));
        Self {
            http,
            registry,
            store,
            skew,
        }
    }

    /// Session with an access token usable right now, refreshing inline if needed
    pub async fn ensure_fresh_session(&self, user_id: &str, system: EmrSystem) -> Result<EmrSession, EmrError> {
        let provider = self.registry.config_for(system)?;
        let key = SessionKey::new(user_id, system);

        let session = self
            .store
            .load(&key)
            .await?
            .ok_or(EmrError::NoActiveSession { system })?;
        if !session.needs_refresh(Utc::now(), self.skew) {
            return Ok(session);
        }

        let _guard = self.store.lock(&key).await;

        // Another request may have refreshed while we waited for the lock
        let session = self
            .store
            .load(&key)
            .await?
            .ok_or(EmrError::NoActiveSession { system })?;
        if !session.needs_refresh(Utc::now(), self.skew) {
            debug!(system = %system, "Session refreshed by a concurrent request");
            return Ok(session);
        }

        self.refresh_locked(provider, &key, session).await
    }

    /// Refresh-token grant. Caller holds the store lock for `key`.
    async fn refresh_locked(
        &self,
        provider: &ProviderConfig,
        key: &SessionKey,
        session: EmrSession,
    ) -> Result<EmrSession, EmrError> {
        let system = key.system;

        let Some(refresh_token) = session.refresh_token.clone() else {
            activity_log::log_token_refresh(system, &key.user_id, false, Some("no_refresh_token"));
            return Err(EmrError::SessionExpired { system });
        };

        let grant = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose()),
        ];
        let token = match request_token(&self.http, provider, &grant).await {
            Ok(token) => token,
            Err(e) => {
                let reason = e.reason();
                activity_log::log_token_refresh(system, &key.user_id, false, Some(&reason));
                if e.is_rejection() {
                    // The refresh token is dead; the stored session can never recover
                    self.store.remove(key).await?;
                    info!(system = %system, user_id = %key.user_id, "Removed session after rejected refresh");
                } else {
                    warn!(system = %system, "Token refresh failed: {}", reason);
                }
                return Err(EmrError::SessionExpired { system });
            }
        };

        let now = Utc::now();
        let refreshed = EmrSession {
            expires_at: token.expires_at(now),
            access_token: token.access_token,
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()).or(Some(refresh_token)),
            scope: token.scope.or(session.scope),
            updated_at: now,
            ..session
        };
        self.store.save(&refreshed).await?;

        activity_log::log_token_refresh(system, &key.user_id, true, None);
        Ok(refreshed)
    }
}
