use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use nudge_protocol::{ActionKind, NotificationId, PrincipalId, SubjectId};

use crate::model::{ClientMeta, NewNotification, Notification, Principal, Session, Todo};
use crate::store::{Directory, NotificationStore, SessionStore, StoreError, StoreResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    username      TEXT NOT NULL UNIQUE,
    email         TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    is_active     INTEGER NOT NULL DEFAULT 1,
    created_at    INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS todos (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    title       TEXT NOT NULL,
    description TEXT,
    completed   INTEGER NOT NULL DEFAULT 0,
    is_public   INTEGER NOT NULL DEFAULT 0,
    owner_id    INTEGER,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER
);
CREATE INDEX IF NOT EXISTS idx_todos_owner ON todos(owner_id);
CREATE TABLE IF NOT EXISTS sessions (
    token        TEXT PRIMARY KEY NOT NULL,
    principal_id INTEGER NOT NULL,
    created_at   INTEGER NOT NULL,
    expires_at   INTEGER NOT NULL,
    ip_address   TEXT NOT NULL,
    user_agent   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);
CREATE INDEX IF NOT EXISTS idx_sessions_principal ON sessions(principal_id);
CREATE TABLE IF NOT EXISTS notifications (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    recipient_id INTEGER NOT NULL,
    actor_id     INTEGER NOT NULL,
    subject_id   INTEGER,
    action_kind  TEXT NOT NULL,
    message      TEXT NOT NULL,
    is_read      INTEGER NOT NULL DEFAULT 0,
    delivered_at INTEGER,
    created_at   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_notifications_recipient
    ON notifications(recipient_id, created_at);
";

const NOTIFICATION_COLUMNS: &str = "id, recipient_id, actor_id, subject_id, action_kind, message, \
     is_read, delivered_at, created_at";

const TODO_COLUMNS: &str =
    "id, title, description, completed, is_public, owner_id, created_at, updated_at";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if err.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) {
            StoreError::Conflict(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// SQLite-backed store for principals, todos, sessions and notifications.
///
/// The connection sits behind a `std::sync::Mutex` and every operation runs on
/// `spawn_blocking`, so synchronous SQLite I/O never blocks the runtime.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<StdMutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Backend(format!("create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        // WAL mode for better concurrent read performance
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        let sessions: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        if sessions > 0 {
            tracing::info!(sessions, "loaded session table from disk");
        }
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::Backend(format!("lock poisoned: {e}")))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // ---- principals ----

    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> StoreResult<Principal> {
        let username = username.to_string();
        let email = email.to_string();
        let password_hash = password_hash.to_string();
        self.run(move |conn| {
            let taken: Option<i64> = conn
                .query_row(
                    "SELECT id FROM users WHERE username = ?1",
                    [&username],
                    |row| row.get(0),
                )
                .optional()?;
            if taken.is_some() {
                return Err(StoreError::Conflict(format!(
                    "user with username '{username}' already exists"
                )));
            }
            let taken: Option<i64> = conn
                .query_row("SELECT id FROM users WHERE email = ?1", [&email], |row| {
                    row.get(0)
                })
                .optional()?;
            if taken.is_some() {
                return Err(StoreError::Conflict(format!(
                    "user with email '{email}' already exists"
                )));
            }

            conn.execute(
                "INSERT INTO users (username, email, password_hash, is_active, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                params![username, email, password_hash, to_ms(Utc::now())],
            )?;
            Ok(Principal {
                id: conn.last_insert_rowid(),
                username,
                is_active: true,
            })
        })
        .await
    }

    /// Principal and stored password hash for a username.
    pub async fn user_credentials(&self, username: &str) -> StoreResult<Option<(Principal, String)>> {
        let username = username.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, username, is_active, password_hash FROM users WHERE username = ?1",
                    [&username],
                    |row| Ok((principal_from_row(row)?, row.get::<_, String>(3)?)),
                )
                .optional()?)
        })
        .await
    }

    pub async fn set_user_active(&self, id: PrincipalId, active: bool) -> StoreResult<bool> {
        self.run(move |conn| {
            let n = conn.execute(
                "UPDATE users SET is_active = ?1 WHERE id = ?2",
                params![active, id],
            )?;
            Ok(n > 0)
        })
        .await
    }

    // ---- todos ----

    pub async fn create_todo(
        &self,
        owner_id: Option<PrincipalId>,
        title: &str,
        description: Option<&str>,
        is_public: bool,
    ) -> StoreResult<Todo> {
        let title = title.to_string();
        let description = description.map(str::to_string);
        self.run(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO todos (title, description, completed, is_public, owner_id, created_at)
                 VALUES (?1, ?2, 0, ?3, ?4, ?5)",
                params![title, description, is_public, owner_id, to_ms(now)],
            )?;
            Ok(Todo {
                id: conn.last_insert_rowid(),
                title,
                description,
                completed: false,
                is_public,
                owner_id,
                created_at: from_ms(to_ms(now)),
                updated_at: None,
            })
        })
        .await
    }

    pub async fn get_todo(&self, id: SubjectId) -> StoreResult<Option<Todo>> {
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {TODO_COLUMNS} FROM todos WHERE id = ?1"),
                    [id],
                    todo_from_row,
                )
                .optional()?)
        })
        .await
    }

    /// Public todos with their owner's username, oldest first.
    pub async fn list_public_todos(
        &self,
        skip: usize,
        limit: usize,
    ) -> StoreResult<Vec<(Todo, Option<String>)>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT t.id, t.title, t.description, t.completed, t.is_public, t.owner_id,
                        t.created_at, t.updated_at, u.username
                 FROM todos t LEFT JOIN users u ON u.id = t.owner_id
                 WHERE t.is_public = 1
                 ORDER BY t.id
                 LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt
                .query_map(params![sql_count(limit), sql_count(skip)], |row| {
                    Ok((todo_from_row(row)?, row.get::<_, Option<String>>(8)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn list_todos_for(
        &self,
        owner_id: PrincipalId,
        skip: usize,
        limit: usize,
    ) -> StoreResult<Vec<Todo>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TODO_COLUMNS} FROM todos WHERE owner_id = ?1 ORDER BY id LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt
                .query_map(params![owner_id, sql_count(limit), sql_count(skip)], todo_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Persist the mutable fields of an existing todo.
    pub async fn save_todo(&self, todo: &Todo) -> StoreResult<bool> {
        let todo = todo.clone();
        self.run(move |conn| {
            let n = conn.execute(
                "UPDATE todos SET title = ?1, description = ?2, completed = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    todo.title,
                    todo.description,
                    todo.completed,
                    todo.updated_at.map(to_ms),
                    todo.id
                ],
            )?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn delete_todo(&self, id: SubjectId) -> StoreResult<bool> {
        self.run(move |conn| Ok(conn.execute("DELETE FROM todos WHERE id = ?1", [id])? > 0))
            .await
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        let s = session.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO sessions (token, principal_id, created_at, expires_at, ip_address, user_agent)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    s.token,
                    s.principal_id,
                    to_ms(s.created_at),
                    to_ms(s.expires_at),
                    s.client_meta.ip_address,
                    s.client_meta.user_agent
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn find_session(&self, token: &str) -> StoreResult<Option<Session>> {
        let token = token.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT token, principal_id, created_at, expires_at, ip_address, user_agent
                     FROM sessions WHERE token = ?1",
                    [&token],
                    |row| {
                        Ok(Session {
                            token: row.get(0)?,
                            principal_id: row.get(1)?,
                            created_at: from_ms(row.get(2)?),
                            expires_at: from_ms(row.get(3)?),
                            client_meta: ClientMeta {
                                ip_address: row.get(4)?,
                                user_agent: row.get(5)?,
                            },
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn delete_session(&self, token: &str) -> StoreResult<bool> {
        let token = token.to_string();
        self.run(move |conn| Ok(conn.execute("DELETE FROM sessions WHERE token = ?1", [&token])? > 0))
            .await
    }

    async fn delete_sessions_for(&self, principal_id: PrincipalId) -> StoreResult<usize> {
        self.run(move |conn| {
            Ok(conn.execute(
                "DELETE FROM sessions WHERE principal_id = ?1",
                [principal_id],
            )?)
        })
        .await
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let cutoff = to_ms(now);
        self.run(move |conn| {
            Ok(conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", [cutoff])?)
        })
        .await
    }
}

#[async_trait]
impl NotificationStore for SqliteStore {
    async fn insert_notification(&self, new: &NewNotification) -> StoreResult<Notification> {
        let new = new.clone();
        self.run(move |conn| {
            let created_at = from_ms(to_ms(Utc::now()));
            conn.execute(
                "INSERT INTO notifications
                    (recipient_id, actor_id, subject_id, action_kind, message, is_read, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                params![
                    new.recipient_id,
                    new.actor_id,
                    new.subject_id,
                    new.action_kind.as_str(),
                    new.message,
                    to_ms(created_at)
                ],
            )?;
            Ok(Notification {
                id: conn.last_insert_rowid(),
                recipient_id: new.recipient_id,
                actor_id: new.actor_id,
                subject_id: new.subject_id,
                action_kind: new.action_kind,
                message: new.message,
                is_read: false,
                delivered_at: None,
                created_at,
            })
        })
        .await
    }

    async fn mark_delivered(&self, id: NotificationId, at: DateTime<Utc>) -> StoreResult<()> {
        self.run(move |conn| {
            conn.execute(
                "UPDATE notifications SET delivered_at = ?1 WHERE id = ?2",
                params![to_ms(at), id],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_notification(&self, id: NotificationId) -> StoreResult<Option<Notification>> {
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1"),
                    [id],
                    notification_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn list_notifications(
        &self,
        recipient_id: PrincipalId,
        limit: usize,
    ) -> StoreResult<Vec<Notification>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                 WHERE recipient_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![recipient_id, sql_count(limit)], notification_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn mark_read(&self, id: NotificationId, recipient_id: PrincipalId) -> StoreResult<bool> {
        self.run(move |conn| {
            let n = conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND recipient_id = ?2",
                params![id, recipient_id],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn mark_all_read(&self, recipient_id: PrincipalId) -> StoreResult<Vec<NotificationId>> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let ids = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM notifications
                     WHERE recipient_id = ?1 AND is_read = 0
                     ORDER BY id",
                )?;
                stmt.query_map([recipient_id], |row| row.get::<_, i64>(0))?
                    .collect::<Result<Vec<_>, _>>()?
            };
            tx.execute(
                "UPDATE notifications SET is_read = 1 WHERE recipient_id = ?1 AND is_read = 0",
                [recipient_id],
            )?;
            tx.commit()?;
            Ok(ids)
        })
        .await
    }

    async fn unread_count(&self, recipient_id: PrincipalId) -> StoreResult<u64> {
        self.run(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM notifications WHERE recipient_id = ?1 AND is_read = 0",
                [recipient_id],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
    }
}

#[async_trait]
impl Directory for SqliteStore {
    async fn principal(&self, id: PrincipalId) -> StoreResult<Option<Principal>> {
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, username, is_active FROM users WHERE id = ?1",
                    [id],
                    principal_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn subject_title(&self, id: SubjectId) -> StoreResult<Option<String>> {
        self.run(move |conn| {
            Ok(conn
                .query_row("SELECT title FROM todos WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .optional()?)
        })
        .await
    }
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn principal_from_row(row: &Row<'_>) -> rusqlite::Result<Principal> {
    Ok(Principal {
        id: row.get(0)?,
        username: row.get(1)?,
        is_active: row.get(2)?,
    })
}

fn todo_from_row(row: &Row<'_>) -> rusqlite::Result<Todo> {
    Ok(Todo {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        completed: row.get(3)?,
        is_public: row.get(4)?,
        owner_id: row.get(5)?,
        created_at: from_ms(row.get(6)?),
        updated_at: row.get::<_, Option<i64>>(7)?.map(from_ms),
    })
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let kind: String = row.get(4)?;
    let action_kind = kind
        .parse::<ActionKind>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into()))?;
    Ok(Notification {
        id: row.get(0)?,
        recipient_id: row.get(1)?,
        actor_id: row.get(2)?,
        subject_id: row.get(3)?,
        action_kind,
        message: row.get(5)?,
        is_read: row.get(6)?,
        delivered_at: row.get::<_, Option<i64>>(7)?.map(from_ms),
        created_at: from_ms(row.get(8)?),
    })
}

// SQLite reads a negative LIMIT as "no limit"; saturate instead of wrapping.
fn sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
