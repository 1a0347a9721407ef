use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use nudge_protocol::{ActionKind, NotificationId, NotificationView, PrincipalId, WireEvent};

use crate::error::{NudgeError, Result};
use crate::model::{NewNotification, Notification, Todo};
use crate::registry::ConnectionRegistry;
use crate::store::{Directory, NotificationStore};

const ORDER_STRIPES: usize = 64;
/// How long a push waits for a transport to confirm the write.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
const UNKNOWN_ACTOR: &str = "Someone";
const UNKNOWN_USER: &str = "Unknown user";

/// Decides when a todo action produces a notification, persists it and
/// pushes it to the recipient's live connections.
pub struct NotificationService {
    store: Arc<dyn NotificationStore>,
    directory: Arc<dyn Directory>,
    registry: Arc<ConnectionRegistry>,
    delivery_timeout: Duration,
    // create_and_deliver holds the stripe of its recipient so events for one
    // recipient are persisted and pushed in creation order.
    order: [Mutex<()>; ORDER_STRIPES],
}

impl NotificationService {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        directory: Arc<dyn Directory>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            store,
            directory,
            registry,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            order: std::array::from_fn(|_| Mutex::new(())),
        }
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Notify the owner of a public todo that someone else changed it.
    ///
    /// Private, ownerless and self-owned todos produce nothing.
    pub async fn notify_on_change(
        &self,
        previous: &Todo,
        current: &Todo,
        actor_id: PrincipalId,
    ) -> Result<Option<Notification>> {
        let Some(recipient_id) = notifiable_owner(current, actor_id) else {
            return Ok(None);
        };

        let action_kind = match (previous.completed, current.completed) {
            (false, true) => ActionKind::Completed,
            (true, false) => ActionKind::Uncompleted,
            _ => ActionKind::Updated,
        };
        let actor = self.actor_name(actor_id).await?;
        let message = change_message(&actor, &current.title, action_kind);

        let notification = self
            .create_and_deliver(NewNotification {
                recipient_id,
                actor_id,
                subject_id: Some(current.id),
                action_kind,
                message,
            })
            .await?;
        Ok(Some(notification))
    }

    /// Notify the owner of a public todo that someone else is deleting it.
    ///
    /// Must be called with the still-live todo, before it is removed: the
    /// message is built from its title.
    pub async fn notify_on_delete(
        &self,
        todo: &Todo,
        actor_id: PrincipalId,
    ) -> Result<Option<Notification>> {
        let Some(recipient_id) = notifiable_owner(todo, actor_id) else {
            return Ok(None);
        };

        let actor = self.actor_name(actor_id).await?;
        let notification = self
            .create_and_deliver(NewNotification {
                recipient_id,
                actor_id,
                subject_id: Some(todo.id),
                action_kind: ActionKind::Deleted,
                message: format!("{actor} deleted your public todo '{}'", todo.title),
            })
            .await?;
        Ok(Some(notification))
    }

    /// Persist a notification and push it to the recipient if online.
    ///
    /// `delivered_at` is stamped only once a connection confirmed writing the
    /// frame. Being offline is not an error: the record stays queryable and
    /// `delivered_at` stays unset. There is no retry.
    pub async fn create_and_deliver(&self, new: NewNotification) -> Result<Notification> {
        if new.recipient_id == new.actor_id {
            return Err(NudgeError::Validation(
                "a principal cannot notify themselves".to_string(),
            ));
        }

        let _order = self.order[stripe(new.recipient_id)].lock().await;

        let mut notification = self.store.insert_notification(&new).await?;
        info!(
            notification_id = notification.id,
            recipient_id = notification.recipient_id,
            actor_id = notification.actor_id,
            action = %notification.action_kind,
            "notification created"
        );

        let view = match self.view(&notification).await {
            Ok(view) => view,
            Err(e) => {
                warn!(notification_id = notification.id, error = %e, "could not enrich notification, skipping push");
                return Ok(notification);
            }
        };

        let delivered = self
            .registry
            .deliver_confirmed(
                notification.recipient_id,
                &WireEvent::new_notification(&view),
                self.delivery_timeout,
            )
            .await;
        if !delivered {
            debug!(
                notification_id = notification.id,
                recipient_id = notification.recipient_id,
                "no confirmed push, stored for later"
            );
            return Ok(notification);
        }

        let now = Utc::now();
        match self.store.mark_delivered(notification.id, now).await {
            Ok(()) => {
                notification.delivered_at = Some(now);
                info!(notification_id = notification.id, "notification delivered");
            }
            Err(e) => {
                warn!(notification_id = notification.id, error = %e, "failed to stamp delivery");
            }
        }
        Ok(notification)
    }

    /// Newest first, enriched with actor names and subject titles.
    pub async fn list_for_user(
        &self,
        user_id: PrincipalId,
        limit: usize,
    ) -> Result<Vec<NotificationView>> {
        let notifications = self.store.list_notifications(user_id, limit).await?;

        let mut names: HashMap<PrincipalId, String> = HashMap::new();
        let mut views = Vec::with_capacity(notifications.len());
        for n in &notifications {
            let actor_username = match names.get(&n.actor_id) {
                Some(name) => name.clone(),
                None => {
                    let name = self.username_or(n.actor_id, UNKNOWN_USER).await?;
                    names.insert(n.actor_id, name.clone());
                    name
                }
            };
            let todo_title = self.subject_title(n).await?;
            views.push(to_view(n, actor_username, todo_title));
        }
        Ok(views)
    }

    pub async fn view(&self, notification: &Notification) -> Result<NotificationView> {
        let actor_username = self.username_or(notification.actor_id, UNKNOWN_USER).await?;
        let todo_title = self.subject_title(notification).await?;
        Ok(to_view(notification, actor_username, todo_title))
    }

    /// Returns false when the notification does not exist or belongs to
    /// someone else; the two cases are deliberately indistinguishable.
    pub async fn mark_read(&self, id: NotificationId, user_id: PrincipalId) -> Result<bool> {
        if !self.store.mark_read(id, user_id).await? {
            return Ok(false);
        }

        let view = match self.store.get_notification(id).await {
            Ok(Some(n)) => self.view(&n).await.ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(notification_id = id, error = %e, "failed to reload notification");
                None
            }
        };
        self.registry.deliver(
            user_id,
            &WireEvent::notification_marked_read(id, view.as_ref()),
        );
        Ok(true)
    }

    /// Flip every unread notification of `user_id` and push one aggregate event.
    pub async fn mark_all_read(&self, user_id: PrincipalId) -> Result<usize> {
        let ids = self.store.mark_all_read(user_id).await?;
        debug!(user_id, marked = ids.len(), "marked all notifications read");
        self.registry
            .deliver(user_id, &WireEvent::all_marked_read(&ids));
        Ok(ids.len())
    }

    pub async fn unread_count(&self, user_id: PrincipalId) -> Result<u64> {
        Ok(self.store.unread_count(user_id).await?)
    }

    async fn actor_name(&self, actor_id: PrincipalId) -> Result<String> {
        self.username_or(actor_id, UNKNOWN_ACTOR).await
    }

    async fn username_or(&self, id: PrincipalId, fallback: &str) -> Result<String> {
        Ok(self
            .directory
            .principal(id)
            .await?
            .map(|p| p.username)
            .unwrap_or_else(|| fallback.to_string()))
    }

    async fn subject_title(&self, notification: &Notification) -> Result<Option<String>> {
        match notification.subject_id {
            Some(subject_id) => Ok(self.directory.subject_title(subject_id).await?),
            None => Ok(None),
        }
    }
}

fn notifiable_owner(todo: &Todo, actor_id: PrincipalId) -> Option<PrincipalId> {
    match todo.owner_id {
        Some(owner) if todo.is_public && owner != actor_id => Some(owner),
        _ => None,
    }
}

fn change_message(actor: &str, title: &str, kind: ActionKind) -> String {
    match kind {
        ActionKind::Completed => format!("{actor} marked your public todo '{title}' as completed"),
        ActionKind::Uncompleted => {
            format!("{actor} marked your public todo '{title}' as incomplete")
        }
        ActionKind::Deleted => format!("{actor} deleted your public todo '{title}'"),
        ActionKind::Updated => format!("{actor} updated your public todo '{title}'"),
    }
}

fn stripe(recipient_id: PrincipalId) -> usize {
    recipient_id.rem_euclid(ORDER_STRIPES as i64) as usize
}

fn to_view(n: &Notification, actor_username: String, todo_title: Option<String>) -> NotificationView {
    NotificationView {
        id: n.id,
        user_id: n.recipient_id,
        todo_id: n.subject_id,
        actor_id: n.actor_id,
        action_type: n.action_kind,
        message: n.message.clone(),
        is_read: n.is_read,
        delivered_at: n.delivered_at,
        created_at: n.created_at,
        actor_username,
        todo_title,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Principal;
    use crate::registry::{Connection, FrameReceiver};
    use crate::sqlite::SqliteStore;
    use nudge_protocol::EventKind;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct Fixture {
        service: NotificationService,
        store: SqliteStore,
        registry: Arc<ConnectionRegistry>,
        users: Vec<Principal>,
    }

    async fn fixture(user_count: usize) -> Fixture {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut users = Vec::new();
        for i in 0..user_count {
            users.push(
                store
                    .create_user(&format!("user{i}"), &format!("user{i}@example.com"), "h")
                    .await
                    .unwrap(),
            );
        }
        let registry = Arc::new(ConnectionRegistry::new());
        let service = NotificationService::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::clone(&registry),
        )
        .with_delivery_timeout(Duration::from_millis(200));
        Fixture {
            service,
            store,
            registry,
            users,
        }
    }

    /// Drain `rx` like a healthy socket: acknowledge every frame and hand
    /// the decoded event to the test.
    fn spawn_transport(mut rx: FrameReceiver) -> tokio::sync::mpsc::UnboundedReceiver<WireEvent> {
        let (seen_tx, seen_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let event: WireEvent = serde_json::from_str(frame.text()).unwrap();
                frame.ack(true);
                if seen_tx.send(event).is_err() {
                    break;
                }
            }
        });
        seen_rx
    }

    fn completed(todo: &Todo) -> Todo {
        Todo {
            completed: true,
            ..todo.clone()
        }
    }

    #[tokio::test]
    async fn completing_someone_elses_todo_notifies_owner_once() {
        let f = fixture(2).await;
        let (alice, bob) = (&f.users[0], &f.users[1]);
        let todo = f.store.create_todo(Some(alice.id), "groceries", None, true).await.unwrap();

        let n = f
            .service
            .notify_on_change(&todo, &completed(&todo), bob.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n.action_kind, ActionKind::Completed);
        assert_eq!(n.actor_id, bob.id);
        assert_eq!(n.message, "user1 marked your public todo 'groceries' as completed");

        let listed = f.service.list_for_user(alice.id, 50).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].actor_username, "user1");
        assert_eq!(listed[0].todo_title.as_deref(), Some("groceries"));
    }

    #[tokio::test]
    async fn self_private_and_anonymous_changes_are_silent() {
        let f = fixture(2).await;
        let (alice, bob) = (&f.users[0], &f.users[1]);

        let own = f.store.create_todo(Some(alice.id), "own", None, true).await.unwrap();
        let private = f.store.create_todo(Some(alice.id), "secret", None, false).await.unwrap();
        let anonymous = f.store.create_todo(None, "nobody's", None, true).await.unwrap();

        assert!(f.service.notify_on_change(&own, &completed(&own), alice.id).await.unwrap().is_none());
        assert!(f.service.notify_on_change(&private, &completed(&private), bob.id).await.unwrap().is_none());
        assert!(f.service.notify_on_change(&anonymous, &completed(&anonymous), bob.id).await.unwrap().is_none());
        assert!(f.service.notify_on_delete(&own, alice.id).await.unwrap().is_none());

        assert_eq!(f.service.unread_count(alice.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn action_kind_follows_completed_flag() {
        let f = fixture(2).await;
        let (alice, bob) = (&f.users[0], &f.users[1]);
        let todo = f.store.create_todo(Some(alice.id), "t", None, true).await.unwrap();
        let done = completed(&todo);
        let renamed = Todo {
            title: "t2".to_string(),
            ..done.clone()
        };

        let undo = f.service.notify_on_change(&done, &todo, bob.id).await.unwrap().unwrap();
        assert_eq!(undo.action_kind, ActionKind::Uncompleted);
        assert!(undo.message.ends_with("as incomplete"));

        let update = f.service.notify_on_change(&done, &renamed, bob.id).await.unwrap().unwrap();
        assert_eq!(update.action_kind, ActionKind::Updated);
        assert_eq!(update.message, "user1 updated your public todo 't2'");
    }

    #[tokio::test]
    async fn self_notifications_never_exist_for_random_pairs() {
        let f = fixture(4).await;
        let mut rng = StdRng::seed_from_u64(0x6e75_6467_65);

        for _ in 0..64 {
            let owner = &f.users[rng.gen_range(0..f.users.len())];
            let actor = &f.users[rng.gen_range(0..f.users.len())];
            let todo = f.store.create_todo(Some(owner.id), "t", None, true).await.unwrap();
            let next = Todo {
                completed: rng.gen_bool(0.5),
                ..todo.clone()
            };

            let produced = if rng.gen_bool(0.5) {
                f.service.notify_on_change(&todo, &next, actor.id).await.unwrap()
            } else {
                f.service.notify_on_delete(&todo, actor.id).await.unwrap()
            };
            assert_eq!(produced.is_some(), actor.id != owner.id);
        }

        for user in &f.users {
            for n in f.store.list_notifications(user.id, 1000).await.unwrap() {
                assert_ne!(n.recipient_id, n.actor_id);
            }
        }
    }

    #[tokio::test]
    async fn create_and_deliver_rejects_self_notification() {
        let f = fixture(1).await;
        let err = f
            .service
            .create_and_deliver(NewNotification {
                recipient_id: f.users[0].id,
                actor_id: f.users[0].id,
                subject_id: None,
                action_kind: ActionKind::Updated,
                message: "x".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, NudgeError::Validation(_)));
    }

    #[tokio::test]
    async fn deleted_todo_keeps_title_in_message() {
        let f = fixture(2).await;
        let (alice, bob) = (&f.users[0], &f.users[1]);
        let todo = f.store.create_todo(Some(alice.id), "tax return", None, true).await.unwrap();

        let n = f.service.notify_on_delete(&todo, bob.id).await.unwrap().unwrap();
        f.store.delete_todo(todo.id).await.unwrap();

        assert_eq!(n.action_kind, ActionKind::Deleted);
        assert!(n.message.contains("'tax return'"));

        let listed = f.service.list_for_user(alice.id, 50).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].todo_id, Some(todo.id));
        assert!(listed[0].todo_title.is_none());
        assert!(listed[0].message.contains("tax return"));
    }

    #[tokio::test]
    async fn delivery_stamps_delivered_at_only_when_online() {
        let f = fixture(2).await;
        let (alice, bob) = (&f.users[0], &f.users[1]);
        let todo = f.store.create_todo(Some(alice.id), "t", None, true).await.unwrap();

        let offline = f.service.notify_on_change(&todo, &todo, bob.id).await.unwrap().unwrap();
        assert!(offline.delivered_at.is_none());

        let (conn, rx) = Connection::new(8);
        f.registry.register(alice.id, conn);
        let mut seen = spawn_transport(rx);

        let online = f.service.notify_on_change(&todo, &todo, bob.id).await.unwrap().unwrap();
        assert!(online.delivered_at.is_some());

        let event = seen.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::NewNotification);
        assert_eq!(event.data["id"], online.id);
        assert_eq!(event.data["actor_username"], "user1");

        let stored = f.store.get_notification(online.id).await.unwrap().unwrap();
        assert!(stored.delivered_at.is_some());
        let stored = f.store.get_notification(offline.id).await.unwrap().unwrap();
        assert!(stored.delivered_at.is_none());
    }

    #[tokio::test]
    async fn queued_but_unwritten_push_is_not_delivered() {
        let f = fixture(2).await;
        let (alice, bob) = (&f.users[0], &f.users[1]);
        let todo = f.store.create_todo(Some(alice.id), "t", None, true).await.unwrap();

        // The transport never drains its queue.
        let (conn, rx) = Connection::new(8);
        f.registry.register(alice.id, conn);
        let n = f.service.notify_on_change(&todo, &completed(&todo), bob.id).await.unwrap().unwrap();
        assert!(n.delivered_at.is_none());

        // The transport drops the queue without writing anything.
        drop(rx);
        let n2 = f.service.notify_on_change(&todo, &completed(&todo), bob.id).await.unwrap().unwrap();
        assert!(n2.delivered_at.is_none());

        for id in [n.id, n2.id] {
            let stored = f.store.get_notification(id).await.unwrap().unwrap();
            assert!(stored.delivered_at.is_none());
        }
        assert_eq!(f.service.unread_count(alice.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_socket_write_is_not_delivered() {
        let f = fixture(2).await;
        let (alice, bob) = (&f.users[0], &f.users[1]);
        let todo = f.store.create_todo(Some(alice.id), "t", None, true).await.unwrap();

        let (conn, mut rx) = Connection::new(8);
        f.registry.register(alice.id, conn);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                frame.ack(false);
            }
        });

        let n = f.service.notify_on_change(&todo, &todo, bob.id).await.unwrap().unwrap();
        assert!(n.delivered_at.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_notifications_arrive_in_creation_order() {
        const COUNT: usize = 32;
        let f = Arc::new(fixture(2).await);
        let (alice, bob) = (f.users[0].id, f.users[1].id);

        let (conn, rx) = Connection::new(COUNT);
        f.registry.register(alice, conn);
        let mut seen = spawn_transport(rx);

        let mut tasks = Vec::new();
        for i in 0..COUNT {
            let f = Arc::clone(&f);
            tasks.push(tokio::spawn(async move {
                f.service
                    .create_and_deliver(NewNotification {
                        recipient_id: alice,
                        actor_id: bob,
                        subject_id: None,
                        action_kind: ActionKind::Updated,
                        message: format!("change {i}"),
                    })
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().delivered_at.is_some());
        }

        let mut pushed = Vec::with_capacity(COUNT);
        for _ in 0..COUNT {
            let event = seen.recv().await.unwrap();
            assert_eq!(event.kind, EventKind::NewNotification);
            pushed.push(event.data["id"].as_i64().unwrap());
        }
        let mut ascending = pushed.clone();
        ascending.sort_unstable();
        assert_eq!(pushed, ascending);
        assert_eq!(f.service.unread_count(alice).await.unwrap(), COUNT as u64);
    }

    #[tokio::test]
    async fn mark_all_read_flips_exactly_the_unread_set() {
        let f = fixture(2).await;
        let (alice, bob) = (&f.users[0], &f.users[1]);
        let todo = f.store.create_todo(Some(alice.id), "t", None, true).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(f.service.notify_on_change(&todo, &todo, bob.id).await.unwrap().unwrap().id);
        }
        assert!(f.service.mark_read(ids[1], alice.id).await.unwrap());

        let (conn, mut rx) = Connection::new(8);
        f.registry.register(alice.id, conn);

        assert_eq!(f.service.mark_all_read(alice.id).await.unwrap(), 3);
        assert_eq!(f.service.unread_count(alice.id).await.unwrap(), 0);

        let frame = rx.recv().await.unwrap();
        let event: WireEvent = serde_json::from_str(frame.text()).unwrap();
        assert_eq!(event.kind, EventKind::NotificationsAllMarkedRead);
        let flipped: Vec<i64> = serde_json::from_value(event.data["notification_ids"].clone()).unwrap();
        assert_eq!(flipped, vec![ids[0], ids[2], ids[3]]);

        assert_eq!(f.service.mark_all_read(alice.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_read_collapses_missing_and_foreign() {
        let f = fixture(3).await;
        let (alice, bob, carol) = (&f.users[0], &f.users[1], &f.users[2]);
        let todo = f.store.create_todo(Some(alice.id), "t", None, true).await.unwrap();
        let n = f.service.notify_on_change(&todo, &todo, bob.id).await.unwrap().unwrap();

        assert!(!f.service.mark_read(n.id, carol.id).await.unwrap());
        assert!(!f.service.mark_read(n.id + 999, alice.id).await.unwrap());

        let (conn, mut rx) = Connection::new(8);
        f.registry.register(alice.id, conn);
        assert!(f.service.mark_read(n.id, alice.id).await.unwrap());

        let frame = rx.recv().await.unwrap();
        let event: WireEvent = serde_json::from_str(frame.text()).unwrap();
        assert_eq!(event.kind, EventKind::NotificationMarkedRead);
        assert_eq!(event.data["notification_id"], n.id);
        assert_eq!(event.data["notification"]["is_read"], true);
    }

    #[tokio::test]
    async fn unknown_actor_falls_back_in_message_and_view() {
        let f = fixture(1).await;
        let alice = &f.users[0];
        let todo = f.store.create_todo(Some(alice.id), "t", None, true).await.unwrap();

        let n = f.service.notify_on_change(&todo, &todo, 4242).await.unwrap().unwrap();
        assert_eq!(n.message, "Someone updated your public todo 't'");

        let view = f.service.view(&n).await.unwrap();
        assert_eq!(view.actor_username, "Unknown user");
    }

    #[test]
    fn stripes_cover_negative_ids() {
        assert!(stripe(-1) < ORDER_STRIPES);
        assert_eq!(stripe(ORDER_STRIPES as i64), stripe(0));
    }
}
