//! Persistence seams consumed by the core.
//!
//! The core never talks to a database directly. It goes through these traits,
//! which a concrete store (see [`crate::sqlite::SqliteStore`]) implements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use nudge_protocol::{NotificationId, PrincipalId, SubjectId};

use crate::model::{NewNotification, Notification, Principal, Session};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),

    /// A uniqueness constraint was violated.
    #[error("{0}")]
    Conflict(String),

    #[error("store task failed: {0}")]
    Join(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable session records keyed by opaque token.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &Session) -> StoreResult<()>;

    async fn find_session(&self, token: &str) -> StoreResult<Option<Session>>;

    /// Returns true if a record was removed.
    async fn delete_session(&self, token: &str) -> StoreResult<bool>;

    async fn delete_sessions_for(&self, principal_id: PrincipalId) -> StoreResult<usize>;

    /// Remove every session with `expires_at <= now`.
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}

/// Notification records, point-addressable by id and range-addressable by recipient.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert_notification(&self, new: &NewNotification) -> StoreResult<Notification>;

    async fn mark_delivered(&self, id: NotificationId, at: DateTime<Utc>) -> StoreResult<()>;

    async fn get_notification(&self, id: NotificationId) -> StoreResult<Option<Notification>>;

    /// Newest first.
    async fn list_notifications(
        &self,
        recipient_id: PrincipalId,
        limit: usize,
    ) -> StoreResult<Vec<Notification>>;

    /// Flip `is_read` only if the notification belongs to `recipient_id`.
    async fn mark_read(&self, id: NotificationId, recipient_id: PrincipalId) -> StoreResult<bool>;

    /// Flip every unread notification of `recipient_id` and return exactly those ids.
    async fn mark_all_read(&self, recipient_id: PrincipalId) -> StoreResult<Vec<NotificationId>>;

    async fn unread_count(&self, recipient_id: PrincipalId) -> StoreResult<u64>;
}

/// Read-only lookups of principals and subjects owned by collaborators.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn principal(&self, id: PrincipalId) -> StoreResult<Option<Principal>>;

    /// `None` when the subject no longer exists.
    async fn subject_title(&self, id: SubjectId) -> StoreResult<Option<String>>;
}
