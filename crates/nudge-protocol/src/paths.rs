use std::path::PathBuf;

/// Returns the config directory path for nudge.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("nudge")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("nudge")
    } else {
        PathBuf::from("/tmp/nudge")
    }
}

/// Returns the data directory path for nudge.
pub fn data_path() -> PathBuf {
    if let Ok(data_dir) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(data_dir).join("nudge")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local").join("share").join("nudge")
    } else {
        PathBuf::from("/tmp/nudge")
    }
}

/// Returns the config file path for the nudge server.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}

/// Returns the default SQLite database path.
pub fn default_database_path() -> PathBuf {
    data_path().join("nudge.db")
}
