use std::env;
use std::path::PathBuf;

use chrono_tz::Tz;

use crate::error::{SyncError, SyncResult};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub link_store_dir: PathBuf,
    pub local_store_path: PathBuf,
    pub timezone: Tz,
    pub window_days: i64,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup (the environment, in production).
    pub fn from_lookup<F>(lookup: F) -> SyncResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let timezone = match lookup("CALSYNC_TIMEZONE") {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| SyncError::Config(format!("unknown time zone '{name}'")))?,
            None => Tz::UTC,
        };

        let window_days = match lookup("CALSYNC_WINDOW_DAYS") {
            Some(raw) => raw.parse::<i64>().ok().filter(|d| *d > 0).ok_or_else(|| {
                SyncError::Config(format!(
                    "CALSYNC_WINDOW_DAYS must be a positive integer, got '{raw}'"
                ))
            })?,
            None => 14,
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:data/calsync.db?mode=rwc".to_string()),
            link_store_dir: lookup("CALSYNC_LINK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/links")),
            local_store_path: lookup("CALSYNC_LOCAL_STORE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/local_calendar.json")),
            timezone,
            window_days,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.database_url, "sqlite:data/calsync.db?mode=rwc");
        assert_eq!(config.link_store_dir, PathBuf::from("data/links"));
        assert_eq!(config.timezone, Tz::UTC);
        assert_eq!(config.window_days, 14);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("CALSYNC_TIMEZONE", "America/New_York"),
            ("CALSYNC_WINDOW_DAYS", "30"),
        ]))
        .unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.timezone, chrono_tz::America::New_York);
        assert_eq!(config.window_days, 30);
    }

    #[test]
    fn test_bad_timezone_is_config_error() {
        let result = Config::from_lookup(lookup_from(&[("CALSYNC_TIMEZONE", "Mars/Olympus")]));
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_non_positive_window_rejected() {
        let result = Config::from_lookup(lookup_from(&[("CALSYNC_WINDOW_DAYS", "0")]));
        assert!(matches!(result, Err(SyncError::Config(_))));
        let result = Config::from_lookup(lookup_from(&[("CALSYNC_WINDOW_DAYS", "soon")]));
        assert!(matches!(result, Err(SyncError::Config(_))));
    }
}
