//! Transport-agnostic request handlers.
//!
//! Each handler takes already-extracted request parts and returns an
//! [`ApiResponse`]. The server binary mounts them as axum routes.
//!
//! | Handler          | Success                     | Failures                       |
//! |------------------|-----------------------------|--------------------------------|
//! | `update_pixel`   | 201 `{timestamp}`           | 400, 401, 429 + Retry-After, 500 |
//! | `user`           | 200 user record             | 401, 500                       |
//! | `metadata`       | 200 endpoints, throttleRate |                                |
//! | `board`          | 200 packed bitmap           | 404, 500                       |
//! | `block_user`     | 200 user record             | 401, 403, 500                  |
//! | `top_tweets`     | 200 `[{url}]`               | 500                            |
//!
//! A blocked user's submission answers 201 exactly like an accepted one.

use serde::Serialize;
use serde_json::json;

use place_core::{is_admin_idp, PixelWrite, ThrottleReason, TimestampMs};

use crate::changelog::{ChangeLog, CursorStore};
use crate::compactor::{BlobStore, CompactorConfig};
use crate::config::ServiceConfig;
use crate::coordinator::{SubmitError, WriteCoordinator};
use crate::tweets::{TweetStore, TOP_TWEETS_LIMIT};

/// Authenticated principal id, set by the fronting auth proxy.
pub const PRINCIPAL_ID_HEADER: &str = "x-ms-client-principal-id";
/// Identity provider of the principal.
pub const PRINCIPAL_IDP_HEADER: &str = "x-ms-client-principal-idp";
/// First log sequence number not folded into a served board.
pub const SEQUENCE_HEADER: &str = "x-place-sequence";

/// Response payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(serde_json::Value),
    Bytes(Vec<u8>),
    Empty,
}

/// Request headers, looked up case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    entries: Vec<(String, String)>,
}

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RequestHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// A handler's answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl ApiResponse {
    pub fn json(status: u16, body: impl Serialize) -> Self {
        let body = match serde_json::to_value(body) {
            Ok(value) => ResponseBody::Json(value),
            Err(e) => {
                log::error!("Failed to serialize response body: {e}");
                return Self::error(500, "could not serialize response");
            }
        };
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    pub fn bytes(status: u16, bytes: Vec<u8>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: ResponseBody::Bytes(bytes),
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: ResponseBody::Empty,
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: ResponseBody::Json(json!({ "error": message })),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&'static str> {
        match self.body {
            ResponseBody::Json(_) => Some("application/json; charset=utf-8"),
            ResponseBody::Bytes(_) => Some("application/octet-stream"),
            ResponseBody::Empty => None,
        }
    }

    /// Echo the request origin with credentials allowed, when one was sent.
    pub fn with_cors(self, request: &RequestHeaders) -> Self {
        let Some(origin) = request.get("origin") else {
            return self;
        };
        let origin = origin.to_string();
        self.with_header("Access-Control-Allow-Credentials", "true")
            .with_header("Access-Control-Allow-Origin", origin)
            .with_header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .with_header(
                "Access-Control-Allow-Headers",
                format!("Content-Type, {PRINCIPAL_ID_HEADER}, {PRINCIPAL_IDP_HEADER}"),
            )
    }
}

/// Answer a CORS preflight.
pub fn preflight(headers: &RequestHeaders) -> ApiResponse {
    ApiResponse::empty(200).with_cors(headers)
}

fn principal(headers: &RequestHeaders) -> Option<(&str, &str)> {
    let id = headers.get(PRINCIPAL_ID_HEADER).filter(|v| !v.is_empty())?;
    let idp = headers.get(PRINCIPAL_IDP_HEADER)?;
    Some((id, idp))
}

fn unauthorized() -> ApiResponse {
    log::warn!("Rejecting request without principal headers");
    ApiResponse::error(401, "could not authenticate user")
}

/// `POST` a JSON array of `{x, y, color}`.
pub async fn update_pixel<L: ChangeLog>(
    coordinator: &WriteCoordinator<L>,
    headers: &RequestHeaders,
    body: &[u8],
    now: TimestampMs,
) -> ApiResponse {
    let Some((user_id, idp)) = principal(headers) else {
        return unauthorized().with_cors(headers);
    };

    let writes: Vec<PixelWrite> = match serde_json::from_slice(body) {
        Ok(writes) => writes,
        Err(e) => {
            log::debug!("Malformed pixel body from {user_id}: {e}");
            return ApiResponse::error(400, "could not read pixels from body").with_cors(headers);
        }
    };

    let response = match coordinator.submit_batch(user_id, idp, &writes, now).await {
        Ok(outcome) if outcome.accepted => {
            ApiResponse::json(201, json!({ "timestamp": outcome.timestamp_ms }))
        }
        Ok(outcome) => match outcome.reason {
            ThrottleReason::RateLimited => {
                let wait_ms = outcome.retry_at_ms.map_or(0, |at| (at - now).max(0));
                let wait_secs = (wait_ms + 999) / 1000;
                ApiResponse::error(429, "too many pixel inserts")
                    .with_header("Retry-After", wait_secs.max(1).to_string())
            }
            ThrottleReason::BatchTooLarge => {
                ApiResponse::error(400, "only one pixel may be inserted at a time")
            }
            reason => {
                log::error!("Unexpected rejection reason {reason:?} for {user_id}");
                ApiResponse::error(500, "could not insert pixels")
            }
        },
        Err(SubmitError::Validation(e)) => ApiResponse::error(400, &e.to_string()),
        Err(e) => {
            log::error!("Submission from {user_id} failed: {e}");
            ApiResponse::error(500, "could not insert pixels")
        }
    };
    response.with_cors(headers)
}

/// The caller's user record, created on first sight.
pub async fn user<L: ChangeLog>(
    coordinator: &WriteCoordinator<L>,
    headers: &RequestHeaders,
    now: TimestampMs,
) -> ApiResponse {
    let Some((user_id, idp)) = principal(headers) else {
        return unauthorized().with_cors(headers);
    };
    let response = match coordinator.user_info(user_id, idp, now).await {
        Ok(user) => ApiResponse::json(200, &user),
        Err(e) => {
            log::error!("Could not load user {user_id}: {e}");
            ApiResponse::error(500, "could not load user info")
        }
    };
    response.with_cors(headers)
}

/// Service endpoints, the throttle rate in seconds and the pre-release flag.
pub fn metadata(config: &ServiceConfig) -> ApiResponse {
    let mut body = match serde_json::to_value(&config.endpoints) {
        Ok(value) => value,
        Err(e) => {
            log::error!("Failed to serialize endpoints: {e}");
            return ApiResponse::error(500, "could not complete the request");
        }
    };
    body["throttleRate"] = json!(config.throttle_seconds);
    body["isPreRelease"] = json!(config.is_pre_release);
    ApiResponse::json(200, body)
}

/// URLs of the newest approved tweets.
pub fn top_tweets(tweets: &dyn TweetStore, headers: &RequestHeaders) -> ApiResponse {
    let response = match tweets.top_tweets(TOP_TWEETS_LIMIT) {
        Ok(top) => {
            let urls: Vec<_> = top.into_iter().map(|t| json!({ "url": t.url })).collect();
            ApiResponse::json(200, urls)
        }
        Err(e) => {
            log::error!("Could not load top tweets: {e}");
            ApiResponse::error(500, "could not load tweets")
        }
    };
    response.with_cors(headers)
}

/// The packed board blob, tagged with [`SEQUENCE_HEADER`].
pub fn board(
    blobs: &dyn BlobStore,
    cursors: &dyn CursorStore,
    config: &CompactorConfig,
) -> ApiResponse {
    // Cursor first: a pass finishing in between only makes the tag older.
    let sequence = match cursors.load_cursor(&config.cursor_name) {
        Ok(cursor) => cursor.map_or_else(|| "1".to_string(), |c| c.as_str().to_string()),
        Err(e) => {
            log::error!("Could not read compactor cursor: {e}");
            return ApiResponse::error(500, "could not load board");
        }
    };
    match blobs.read_blob(&config.container, &config.blob_name) {
        Ok(Some(bytes)) => ApiResponse::bytes(200, bytes).with_header(SEQUENCE_HEADER, sequence),
        Ok(None) => ApiResponse::error(404, "board has not been generated yet"),
        Err(e) => {
            log::error!("Could not read board blob: {e}");
            ApiResponse::error(500, "could not load board")
        }
    }
}

/// Block or unblock `target`. Admin callers only.
pub async fn block_user<L: ChangeLog>(
    coordinator: &WriteCoordinator<L>,
    headers: &RequestHeaders,
    target: &str,
    blocked: bool,
    now: TimestampMs,
) -> ApiResponse {
    let Some((caller, idp)) = principal(headers) else {
        return unauthorized().with_cors(headers);
    };
    if !is_admin_idp(idp, &coordinator.config().admin_idp) {
        log::warn!("Non-admin {caller} tried to change block status of {target}");
        return ApiResponse::error(403, "admin only").with_cors(headers);
    }
    let response = match coordinator.set_blocked(target, blocked, now).await {
        Ok(user) => ApiResponse::json(200, &user),
        Err(e) => {
            log::error!("Could not update user {target}: {e}");
            ApiResponse::error(500, "could not update user")
        }
    };
    response.with_cors(headers)
}
