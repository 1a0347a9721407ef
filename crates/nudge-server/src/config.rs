use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::TimeDelta;
use serde::Deserialize;

use libnudge::{SessionPolicy, SqliteStore};
use nudge_protocol::paths;

const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 3600;

/// Marker for a store that lives only as long as the process.
pub const IN_MEMORY: &str = ":memory:";

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub database: PathBuf,
    pub session_ttl_secs: u64,
    pub reaper_interval_secs: u64,
    /// Logging in drops the principal's other sessions.
    pub single_session: bool,
    /// Outbound queue depth per live connection.
    pub connection_buffer: usize,
    /// How long a notification push waits for the socket write.
    pub delivery_timeout_ms: u64,
    /// `"*"` allows any origin.
    pub allow_origins: Vec<String>,
    pub cookie_name: String,
}

impl ServerConfig {
    /// Load from `path`, or the default config path, falling back to
    /// defaults when the file does not exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(paths::config_path);
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            Self::from_toml(&contents)
                .with_context(|| format!("invalid config {}", config_path.display()))
        } else if path.is_some() {
            bail!("config file {} does not exist", config_path.display())
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.session_ttl_secs == 0 || self.session_ttl_secs > MAX_TTL_SECS {
            bail!("session_ttl_secs must be between 1 and {MAX_TTL_SECS}");
        }
        if self.reaper_interval_secs == 0 {
            bail!("reaper_interval_secs must be > 0");
        }
        if self.connection_buffer == 0 {
            bail!("connection_buffer must be > 0");
        }
        if self.delivery_timeout_ms == 0 {
            bail!("delivery_timeout_ms must be > 0");
        }
        if self.cookie_name.is_empty() {
            bail!("cookie_name must not be empty");
        }
        Ok(())
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            ttl: TimeDelta::seconds(self.session_ttl_secs.min(MAX_TTL_SECS) as i64),
            single_session: self.single_session,
        }
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn open_store(&self) -> anyhow::Result<SqliteStore> {
        let store = if self.database.as_os_str() == IN_MEMORY {
            SqliteStore::open_in_memory()
        } else {
            SqliteStore::open(&self.database)
        };
        store.with_context(|| format!("failed to open database {}", self.database.display()))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8000)),
            database: paths::default_database_path(),
            session_ttl_secs: 24 * 3600,
            reaper_interval_secs: 3600,
            single_session: true,
            connection_buffer: 64,
            delivery_timeout_ms: 5000,
            allow_origins: vec!["http://localhost:3000".to_string()],
            cookie_name: "session_id".to_string(),
        }
    }
}
