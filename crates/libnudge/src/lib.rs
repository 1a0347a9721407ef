pub mod error;
pub mod gate;
pub mod model;
pub mod notify;
pub mod registry;
pub mod session;
pub mod sqlite;
pub mod store;

pub use error::{NudgeError, Result};
pub use gate::{AccessGate, AuthContext, ExemptRule, GateOutcome, default_exempt_rules};
pub use model::{ClientMeta, NewNotification, Notification, Principal, Session, Todo, TodoPatch};
pub use notify::NotificationService;
pub use registry::{Connection, ConnectionId, ConnectionRegistry, Frame, FrameReceiver};
pub use session::{SessionManager, SessionPolicy, Validation};
pub use sqlite::SqliteStore;
pub use store::{Directory, NotificationStore, SessionStore, StoreError, StoreResult};
