//! Service configuration from `PLACE_*` environment variables.
//!
//! Endpoint URLs are required and reported to clients through the metadata
//! handler; a missing one stops startup. The top-tweets endpoint is optional.
//! Tunables fall back to defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use place_core::{BoardGeometry, DEFAULT_ADMIN_IDP, DEFAULT_BOARD_SIZE, DEFAULT_THROTTLE_SECONDS};

use crate::changelog::{ReaderConfig, StartFrom};
use crate::compactor::CompactorConfig;
use crate::coordinator::CoordinatorConfig;
use crate::server::ServerConfig;
use crate::storage::StoreConfig;

const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Client-facing service endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    pub get_board_endpoint: String,
    pub login_endpoint: String,
    pub update_pixel_endpoint: String,
    pub websocket_endpoint: String,
    pub user_endpoint: String,
    pub admin_endpoint: String,
    pub logout_endpoint: String,
    /// Omitted from metadata when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_tweets_endpoint: Option<String>,
}

/// Everything the server binary needs to start.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub endpoints: Endpoints,
    pub throttle_seconds: u64,
    /// `PLACE_ISPRERELEASE=true`
    pub is_pre_release: bool,
    pub poll_interval: Duration,
    pub compaction_interval: Duration,
    /// WebSocket viewer endpoint
    pub bind_addr: String,
    /// HTTP API
    pub http_addr: String,
    /// `None` keeps everything in memory
    pub storage_path: Option<PathBuf>,
    pub admin_idp: String,
    pub board_size: u16,
    pub start_from: StartFrom,
}

impl ServiceConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, which returns `None` for unset keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| -> Result<String, ConfigError> {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let endpoints = Endpoints {
            get_board_endpoint: required("PLACE_GETBOARD_ENDPOINT")?,
            login_endpoint: required("PLACE_LOGIN_ENDPOINT")?,
            update_pixel_endpoint: required("PLACE_UPDATEPIXEL_ENDPOINT")?,
            websocket_endpoint: required("PLACE_WEBSOCKET_ENDPOINT")?,
            user_endpoint: required("PLACE_USER_ENDPOINT")?,
            admin_endpoint: required("PLACE_ADMIN_ENDPOINT")?,
            logout_endpoint: required("PLACE_LOGOUT_ENDPOINT")?,
            top_tweets_endpoint: lookup("PLACE_TOP_TWEETS_ENDPOINT").filter(|v| !v.is_empty()),
        };

        let start_from = match lookup("PLACE_START_FROM").as_deref() {
            None | Some("") | Some("beginning") => StartFrom::Beginning,
            Some("now") => StartFrom::Now,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "PLACE_START_FROM",
                    value: other.to_string(),
                    reason: "expected `beginning` or `now`".to_string(),
                })
            }
        };

        Ok(Self {
            endpoints,
            throttle_seconds: parse_or(&lookup, "PLACE_THROTTLE_RATE", DEFAULT_THROTTLE_SECONDS)?,
            is_pre_release: lookup("PLACE_ISPRERELEASE").as_deref() == Some("true"),
            poll_interval: Duration::from_secs(parse_or(&lookup, "PLACE_POLL_INTERVAL", 5)?),
            compaction_interval: Duration::from_secs(parse_or(
                &lookup,
                "PLACE_COMPACTION_INTERVAL",
                10,
            )?),
            bind_addr: lookup("PLACE_BIND_ADDR")
                .unwrap_or_else(|| ServerConfig::default().bind_addr),
            http_addr: lookup("PLACE_HTTP_ADDR")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
            storage_path: lookup("PLACE_STORAGE_PATH")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            admin_idp: lookup("PLACE_ADMIN_IDP").unwrap_or_else(|| DEFAULT_ADMIN_IDP.to_string()),
            board_size: parse_or(&lookup, "PLACE_BOARD_SIZE", DEFAULT_BOARD_SIZE)?,
            start_from,
        })
    }

    pub fn geometry(&self) -> BoardGeometry {
        BoardGeometry::square(self.board_size)
    }

    pub fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            poll_delay: self.poll_interval,
            start_from: self.start_from,
            ..ReaderConfig::default()
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            geometry: self.geometry(),
            throttle_seconds: self.throttle_seconds,
            admin_idp: self.admin_idp.clone(),
            ..CoordinatorConfig::default()
        }
    }

    pub fn compactor_config(&self) -> CompactorConfig {
        CompactorConfig {
            geometry: self.geometry(),
            ..CompactorConfig::default()
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr.clone(),
            ..ServerConfig::default()
        }
    }

    pub fn store_config(&self) -> Option<StoreConfig> {
        self.storage_path.as_ref().map(|path| StoreConfig {
            path: path.clone(),
            ..StoreConfig::default()
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => v.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value: v,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, String> {
        [
            ("PLACE_GETBOARD_ENDPOINT", "https://place.test/api/board"),
            ("PLACE_LOGIN_ENDPOINT", "https://place.test/.auth/login"),
            ("PLACE_UPDATEPIXEL_ENDPOINT", "https://place.test/api/update-pixel"),
            ("PLACE_WEBSOCKET_ENDPOINT", "wss://place.test/live"),
            ("PLACE_USER_ENDPOINT", "https://place.test/api/user"),
            ("PLACE_ADMIN_ENDPOINT", "https://place.test/.auth/login/aad"),
            ("PLACE_LOGOUT_ENDPOINT", "https://place.test/.auth/logout"),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect()
    }

    fn load(env: &HashMap<&'static str, String>) -> Result<ServiceConfig, ConfigError> {
        ServiceConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.throttle_seconds, 30);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.admin_idp, "aad");
        assert_eq!(config.geometry(), BoardGeometry::square(1000));
        assert_eq!(config.start_from, StartFrom::Beginning);
        assert!(config.store_config().is_none());
        assert_eq!(config.endpoints.websocket_endpoint, "wss://place.test/live");
        assert_eq!(config.endpoints.top_tweets_endpoint, None);
        assert!(!config.is_pre_release);
        assert_eq!(config.http_addr, "127.0.0.1:8080");
    }

    #[test]
    fn test_optional_front_page_settings() {
        let mut env = base_env();
        env.insert("PLACE_TOP_TWEETS_ENDPOINT", "https://place.test/api/top-tweets".to_string());
        env.insert("PLACE_ISPRERELEASE", "true".to_string());
        let config = load(&env).unwrap();
        assert_eq!(
            config.endpoints.top_tweets_endpoint.as_deref(),
            Some("https://place.test/api/top-tweets")
        );
        assert!(config.is_pre_release);

        env.insert("PLACE_ISPRERELEASE", "yes".to_string());
        assert!(!load(&env).unwrap().is_pre_release);
    }

    #[test]
    fn test_missing_endpoint_is_fatal() {
        let mut env = base_env();
        env.remove("PLACE_USER_ENDPOINT");
        assert_eq!(
            load(&env).unwrap_err(),
            ConfigError::Missing("PLACE_USER_ENDPOINT")
        );
    }

    #[test]
    fn test_tunables_flow_into_component_configs() {
        let mut env = base_env();
        env.insert("PLACE_THROTTLE_RATE", "5".to_string());
        env.insert("PLACE_BOARD_SIZE", "64".to_string());
        env.insert("PLACE_START_FROM", "now".to_string());
        env.insert("PLACE_STORAGE_PATH", "/tmp/place".to_string());
        let config = load(&env).unwrap();

        let coord = config.coordinator_config();
        assert_eq!(coord.throttle_seconds, 5);
        assert_eq!(coord.geometry, BoardGeometry::square(64));
        assert_eq!(config.reader_config().start_from, StartFrom::Now);
        assert_eq!(config.compactor_config().blob_name, "board1");
        assert_eq!(
            config.store_config().unwrap().path,
            PathBuf::from("/tmp/place")
        );
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let mut env = base_env();
        env.insert("PLACE_THROTTLE_RATE", "soon".to_string());
        assert!(matches!(
            load(&env),
            Err(ConfigError::Invalid { key: "PLACE_THROTTLE_RATE", .. })
        ));
    }

    #[test]
    fn test_endpoints_serialize_camel_case() {
        let json = serde_json::to_value(&load(&base_env()).unwrap().endpoints).unwrap();
        assert_eq!(json["getBoardEndpoint"], "https://place.test/api/board");
        assert_eq!(json["updatePixelEndpoint"], "https://place.test/api/update-pixel");
        assert!(json.get("topTweetsEndpoint").is_none());
    }
}
