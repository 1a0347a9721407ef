use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nudge_protocol::{ActionKind, NotificationId, PrincipalId, SubjectId};

/// An authenticated identity. Read-only to the core.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: PrincipalId,
    pub username: String,
    pub is_active: bool,
}

/// Client details captured when a session is issued.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientMeta {
    pub ip_address: String,
    pub user_agent: String,
}

/// A server-issued proof of authentication.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub principal_id: PrincipalId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub client_meta: ClientMeta,
}

impl Session {
    /// A session whose expiry is at or before `now` is treated as absent.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A stored notification record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient_id: PrincipalId,
    pub actor_id: PrincipalId,
    pub subject_id: Option<SubjectId>,
    pub action_kind: ActionKind,
    pub message: String,
    pub is_read: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to persist a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub recipient_id: PrincipalId,
    pub actor_id: PrincipalId,
    pub subject_id: Option<SubjectId>,
    pub action_kind: ActionKind,
    pub message: String,
}

/// A todo, the resource that notifications talk about.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Todo {
    pub id: SubjectId,
    pub title: String,
    pub description: Option<String>,
    pub completed: bool,
    pub is_public: bool,
    /// `None` for anonymous todos; those never notify anyone.
    pub owner_id: Option<PrincipalId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Partial update of a todo. Only fields that are `Some` are written.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TodoPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub completed: Option<bool>,
}

impl TodoPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.completed.is_none()
    }

    /// Apply the patch field by field. Returns true if anything changed.
    pub fn apply(&self, todo: &mut Todo) -> bool {
        let mut changed = false;
        if let Some(title) = &self.title {
            if *title != todo.title {
                todo.title = title.clone();
                changed = true;
            }
        }
        if let Some(description) = &self.description {
            if todo.description.as_deref() != Some(description.as_str()) {
                todo.description = Some(description.clone());
                changed = true;
            }
        }
        if let Some(completed) = self.completed {
            if completed != todo.completed {
                todo.completed = completed;
                changed = true;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn todo() -> Todo {
        Todo {
            id: 1,
            title: "water plants".to_string(),
            description: None,
            completed: false,
            is_public: true,
            owner_id: Some(1),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn patch_applies_only_present_fields() {
        let mut t = todo();
        let patch = TodoPatch {
            completed: Some(true),
            ..Default::default()
        };
        assert!(patch.apply(&mut t));
        assert!(t.completed);
        assert_eq!(t.title, "water plants");
        assert!(t.description.is_none());
    }

    #[test]
    fn patch_with_same_values_reports_no_change() {
        let mut t = todo();
        let patch = TodoPatch {
            title: Some("water plants".to_string()),
            completed: Some(false),
            ..Default::default()
        };
        assert!(!patch.apply(&mut t));
    }

    #[test]
    fn patch_deserializes_partial_json() {
        let patch: TodoPatch = serde_json::from_str(r#"{"completed":true}"#).unwrap();
        assert_eq!(patch.completed, Some(true));
        assert!(patch.title.is_none());
        assert!(TodoPatch::default().is_empty());
    }

    #[test]
    fn session_expiry_is_inclusive() {
        let now = Utc::now();
        let session = Session {
            token: "t".to_string(),
            principal_id: 1,
            created_at: now,
            expires_at: now,
            client_meta: ClientMeta::default(),
        };
        assert!(session.is_expired_at(now));
        assert!(!session.is_expired_at(now - chrono::TimeDelta::seconds(1)));
    }
}
