use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{TimeDelta, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nudge_protocol::PrincipalId;

use crate::error::Result;
use crate::model::{ClientMeta, Principal, Session};
use crate::store::{Directory, SessionStore};

const TOKEN_BYTES: usize = 32;

/// How sessions are issued.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub ttl: TimeDelta,
    /// Purge a principal's older sessions when issuing a new one.
    pub single_session: bool,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            ttl: TimeDelta::hours(24),
            single_session: true,
        }
    }
}

/// Outcome of resolving a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid { principal: Principal, session: Session },
    Expired,
    NotFound,
    /// The session is fine but its principal is deactivated.
    Forbidden(Principal),
}

/// Issues, validates and expires sessions.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    directory: Arc<dyn Directory>,
    policy: SessionPolicy,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        directory: Arc<dyn Directory>,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            store,
            directory,
            policy,
        }
    }

    pub async fn create_session(
        &self,
        principal_id: PrincipalId,
        client_meta: ClientMeta,
    ) -> Result<Session> {
        if self.policy.single_session {
            // Best effort; a stale session left behind still expires.
            if let Err(e) = self.store.delete_sessions_for(principal_id).await {
                warn!(principal_id, error = %e, "failed to purge previous sessions");
            }
        }

        let now = Utc::now();
        let session = Session {
            token: generate_token(),
            principal_id,
            created_at: now,
            expires_at: now + self.policy.ttl,
            client_meta,
        };
        self.store.insert_session(&session).await?;
        info!(principal_id, expires_at = %session.expires_at, "session created");
        Ok(session)
    }

    pub async fn validate_session(&self, token: &str) -> Result<Validation> {
        let Some(session) = self.store.find_session(token).await? else {
            return Ok(Validation::NotFound);
        };

        if session.is_expired_at(Utc::now()) {
            debug!(principal_id = session.principal_id, "session expired");
            if let Err(e) = self.store.delete_session(token).await {
                warn!(error = %e, "failed to delete expired session");
            }
            return Ok(Validation::Expired);
        }

        let Some(principal) = self.directory.principal(session.principal_id).await? else {
            warn!(principal_id = session.principal_id, "session refers to unknown principal");
            return Ok(Validation::NotFound);
        };

        if !principal.is_active {
            return Ok(Validation::Forbidden(principal));
        }
        Ok(Validation::Valid { principal, session })
    }

    /// Idempotent.
    pub async fn invalidate(&self, token: &str) -> Result<()> {
        if self.store.delete_session(token).await? {
            info!("session invalidated");
        }
        Ok(())
    }

    pub async fn invalidate_all(&self, principal_id: PrincipalId) -> Result<usize> {
        let removed = self.store.delete_sessions_for(principal_id).await?;
        info!(principal_id, removed, "all sessions invalidated");
        Ok(removed)
    }

    /// Remove every session whose expiry is at or before now.
    pub async fn sweep_expired(&self) -> Result<usize> {
        Ok(self.store.delete_expired_sessions(Utc::now()).await?)
    }

    /// Run `sweep_expired` every `interval` until `cancel` fires.
    ///
    /// A failed sweep is logged and retried on the next tick.
    pub fn spawn_reaper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "session reaper started");

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!("session reaper stopping");
                        break;
                    }
                    _ = tick.tick() => {
                        match self.sweep_expired().await {
                            Ok(removed) => debug!(removed, "reaper sweep finished"),
                            Err(e) => error!(error = %e, "reaper sweep failed"),
                        }
                    }
                }
            }
        })
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
