//! Moderated tweets about the canvas, shown by the front page.
//!
//! Tweets are collected elsewhere and saved here unapproved; a moderator
//! re-saves them with `approved` set. Only approved tweets are served.

use serde::{Deserialize, Serialize};

use place_core::TimestampMs;

use crate::storage::StoreError;

/// How many tweets the top-tweets handler returns.
pub const TOP_TWEETS_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tweet {
    pub id: String,
    pub url: String,
    pub approved: bool,
    pub created_ms: TimestampMs,
}

impl Tweet {
    pub fn new(id: impl Into<String>, url: impl Into<String>, created_ms: TimestampMs) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            approved: false,
            created_ms,
        }
    }

    pub fn approved(mut self) -> Self {
        self.approved = true;
        self
    }
}

/// Durable tweet storage. Saving an existing id replaces it.
pub trait TweetStore: Send + Sync {
    fn save_tweet(&self, tweet: &Tweet) -> Result<(), StoreError>;

    /// Up to `limit` approved tweets, newest first.
    fn top_tweets(&self, limit: usize) -> Result<Vec<Tweet>, StoreError>;
}
