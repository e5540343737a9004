//! Core configuration
//!
//! Defaults, overlaid with a `.env` file and `READING_LIST_*` environment
//! variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const STORE_FILE_NAME: &str = "books.sqlite";

const ENV_STORE: &str = "READING_LIST_STORE";
const ENV_SYNC_ENABLED: &str = "READING_LIST_SYNC_ENABLED";
const ENV_SYNC_INTERVAL: &str = "READING_LIST_SYNC_INTERVAL_MINUTES";
const ENV_PUSH_BATCH_SIZE: &str = "READING_LIST_PUSH_BATCH_SIZE";
const ENV_REMOTE: &str = "READING_LIST_REMOTE";
const ENV_REMOTE_URL: &str = "READING_LIST_REMOTE_URL";
const ENV_REMOTE_TOKEN: &str = "READING_LIST_REMOTE_TOKEN";

const MIN_INTERVAL_MINUTES: u64 = 1;
const MAX_INTERVAL_MINUTES: u64 = 1440;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} is required when the HTTP remote is selected")]
    Missing(&'static str),

    #[error("Cannot determine a data directory; set {0}")]
    NoDataDir(&'static str),
}

/// Which remote the sync coordinator talks to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteConfig {
    /// In-memory stand-in that logs every operation
    Console,
    /// Never reachable; changes stay queued
    Offline,
    Http {
        base_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub push_batch_size: usize,
    pub remote: RemoteConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 30,
            push_batch_size: 100,
            remote: RemoteConfig::Console,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub store_path: PathBuf,
    pub sync: SyncConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path().unwrap_or_else(|| PathBuf::from(STORE_FILE_NAME)),
            sync: SyncConfig::default(),
        }
    }
}

/// `books.sqlite` in the platform data directory
pub fn default_store_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "readinglist", "reading-list")
        .map(|dirs| dirs.data_dir().join(STORE_FILE_NAME))
}

impl CoreConfig {
    /// Load `.env` if present, then read the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            log::debug!("Loaded environment from {:?}", path);
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with the variables `lookup` returns
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let store_path = match var(ENV_STORE) {
            Some(path) => PathBuf::from(path),
            None => default_store_path().ok_or(ConfigError::NoDataDir(ENV_STORE))?,
        };

        let mut sync = SyncConfig::default();
        if let Some(value) = var(ENV_SYNC_ENABLED) {
            sync.enabled = parse_bool(ENV_SYNC_ENABLED, &value)?;
        }
        if let Some(value) = var(ENV_SYNC_INTERVAL) {
            sync.interval_minutes = parse_number(ENV_SYNC_INTERVAL, &value)?;
        }
        if let Some(value) = var(ENV_PUSH_BATCH_SIZE) {
            sync.push_batch_size = parse_number(ENV_PUSH_BATCH_SIZE, &value)?;
        }
        if let Some(value) = var(ENV_REMOTE) {
            sync.remote = match value.to_ascii_lowercase().as_str() {
                "console" => RemoteConfig::Console,
                "offline" => RemoteConfig::Offline,
                "http" => RemoteConfig::Http {
                    base_url: var(ENV_REMOTE_URL).ok_or(ConfigError::Missing(ENV_REMOTE_URL))?,
                    token: var(ENV_REMOTE_TOKEN),
                },
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: ENV_REMOTE,
                        value,
                        reason: "expected console, offline or http".to_string(),
                    })
                }
            };
        }

        let config = Self { store_path, sync };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let interval = self.sync.interval_minutes;
        if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&interval) {
            return Err(ConfigError::InvalidValue {
                name: ENV_SYNC_INTERVAL,
                value: interval.to_string(),
                reason: format!("must be {}-{} minutes", MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES),
            });
        }
        if self.sync.push_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: ENV_PUSH_BATCH_SIZE,
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if let RemoteConfig::Http { base_url, .. } = &self.sync.remote {
            url::Url::parse(base_url).map_err(|e| ConfigError::InvalidValue {
                name: ENV_REMOTE_URL,
                value: base_url.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CoreConfig::from_lookup(lookup(&[(ENV_STORE, "/tmp/books.sqlite")])).unwrap();
        assert_eq!(config.store_path, PathBuf::from("/tmp/books.sqlite"));
        assert_eq!(config.sync, SyncConfig::default());
        assert!(config.sync.enabled);
        assert_eq!(config.sync.remote, RemoteConfig::Console);
    }

    #[test]
    fn test_environment_overlay() {
        let config = CoreConfig::from_lookup(lookup(&[
            (ENV_STORE, "/data/store.sqlite"),
            (ENV_SYNC_ENABLED, "no"),
            (ENV_SYNC_INTERVAL, "15"),
            (ENV_PUSH_BATCH_SIZE, "25"),
            (ENV_REMOTE, "HTTP"),
            (ENV_REMOTE_URL, "https://sync.example.com/api"),
            (ENV_REMOTE_TOKEN, "secret"),
        ]))
        .unwrap();

        assert!(!config.sync.enabled);
        assert_eq!(config.sync.interval_minutes, 15);
        assert_eq!(config.sync.push_batch_size, 25);
        assert_eq!(
            config.sync.remote,
            RemoteConfig::Http {
                base_url: "https://sync.example.com/api".to_string(),
                token: Some("secret".to_string()),
            }
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases: &[&[(&str, &str)]] = &[
            &[(ENV_SYNC_INTERVAL, "0")],
            &[(ENV_SYNC_INTERVAL, "1441")],
            &[(ENV_SYNC_INTERVAL, "soon")],
            &[(ENV_PUSH_BATCH_SIZE, "0")],
            &[(ENV_SYNC_ENABLED, "maybe")],
            &[(ENV_REMOTE, "carrier-pigeon")],
            &[(ENV_REMOTE, "http"), (ENV_REMOTE_URL, "not a url")],
        ];

        for vars in cases {
            let mut vars = vars.to_vec();
            vars.push((ENV_STORE, "/tmp/books.sqlite"));
            let result = CoreConfig::from_lookup(lookup(&vars));
            assert!(
                matches!(result, Err(ConfigError::InvalidValue { .. })),
                "expected rejection for {:?}",
                vars
            );
        }
    }

    #[test]
    fn test_http_remote_requires_url() {
        let result = CoreConfig::from_lookup(lookup(&[(ENV_STORE, "/tmp/books.sqlite"), (ENV_REMOTE, "http")]));
        assert!(matches!(result, Err(ConfigError::Missing(ENV_REMOTE_URL))));
    }

    #[test]
    fn test_config_serialization() {
        let config = CoreConfig {
            store_path: PathBuf::from("/tmp/books.sqlite"),
            sync: SyncConfig {
                remote: RemoteConfig::Offline,
                ..SyncConfig::default()
            },
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["sync"]["remote"]["type"], "offline");
        let back: CoreConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
