//! Service configuration from the environment

use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub db_path: PathBuf,
    pub port: u16,
    /// Base URL of the item catalog; `None` runs without one
    pub catalog_url: Option<String>,
    pub catalog_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let db_path = get("BARTER_DB_PATH").map_or_else(
            || {
                let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(format!("{home}/.barter-chat/barter.db"))
            },
            PathBuf::from,
        );

        let port = get("BARTER_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(8000);

        let catalog_timeout = get("BARTER_CATALOG_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .map_or(Duration::from_secs(5), Duration::from_secs);

        Self {
            db_path,
            port,
            catalog_url: get("BARTER_CATALOG_URL").filter(|url| !url.trim().is_empty()),
            catalog_timeout,
        }
    }
}
