//! Per-user admission policy for pixel submissions.
//!
//! ```text
//!   Idle ──submit──► Evaluating ──► Admitted ──► Idle
//!                               └─► Rejected ──► Idle
//! ```
//!
//! The gate is a pure function over a persisted [`UserState`]. Callers must
//! make load → [`evaluate`] → save atomic per user, otherwise two concurrent
//! submissions can both observe an expired cooldown.

use serde::{Deserialize, Serialize};

use crate::pixel::TimestampMs;

/// Default cooldown between a regular user's accepted writes.
pub const DEFAULT_THROTTLE_SECONDS: u64 = 30;

/// Identity provider whose users are administrators.
pub const DEFAULT_ADMIN_IDP: &str = "aad";

/// How far back a new user's last insert is seeded, so their first write is
/// always admitted.
pub const NEW_USER_LOOKBACK_MS: TimestampMs = 24 * 60 * 60 * 1000;

/// Persisted per-user throttle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserState {
    pub id: String,
    #[serde(rename = "lastInsert")]
    pub last_insert_ms: TimestampMs,
    pub is_admin: bool,
    pub is_blocked: bool,
}

impl UserState {
    /// A first-time user, eligible immediately.
    pub fn new(id: impl Into<String>, now: TimestampMs) -> Self {
        Self {
            id: id.into(),
            last_insert_ms: now - NEW_USER_LOOKBACK_MS,
            is_admin: false,
            is_blocked: false,
        }
    }

    /// Record an accepted write.
    pub fn record_insert(&mut self, now: TimestampMs) {
        self.last_insert_ms = now;
    }

    /// Earliest time a regular user may write again.
    pub fn next_eligible(&self, throttle_seconds: u64) -> TimestampMs {
        self.last_insert_ms.saturating_add(throttle_ms(throttle_seconds))
    }
}

fn throttle_ms(throttle_seconds: u64) -> TimestampMs {
    TimestampMs::try_from(throttle_seconds.saturating_mul(1000)).unwrap_or(TimestampMs::MAX)
}

/// Whether the identity provider claim grants admin rights.
pub fn is_admin_idp(idp: &str, admin_idp: &str) -> bool {
    idp == admin_idp
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThrottleReason {
    Ok,
    RateLimited,
    BatchTooLarge,
    Blocked,
}

/// Outcome of one admission check. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleDecision {
    pub allow: bool,
    pub reason: ThrottleReason,
    /// Next eligible time, set for `RateLimited`
    pub retry_at_ms: Option<TimestampMs>,
}

impl ThrottleDecision {
    fn admit() -> Self {
        Self {
            allow: true,
            reason: ThrottleReason::Ok,
            retry_at_ms: None,
        }
    }

    fn reject(reason: ThrottleReason) -> Self {
        Self {
            allow: false,
            reason,
            retry_at_ms: None,
        }
    }
}

/// Decide whether `user` may write `batch_size` pixels at `now`.
///
/// Blocked users are rejected with [`ThrottleReason::Blocked`]; the caller is
/// expected to answer them with the normal success shape. Admins skip the
/// batch-size and cooldown checks but not the block.
pub fn evaluate(
    user: &UserState,
    batch_size: usize,
    now: TimestampMs,
    throttle_seconds: u64,
) -> ThrottleDecision {
    if user.is_blocked {
        return ThrottleDecision::reject(ThrottleReason::Blocked);
    }
    if user.is_admin {
        return ThrottleDecision::admit();
    }
    if batch_size > 1 {
        return ThrottleDecision::reject(ThrottleReason::BatchTooLarge);
    }
    let next = user.next_eligible(throttle_seconds);
    if now < next {
        return ThrottleDecision {
            retry_at_ms: Some(next),
            ..ThrottleDecision::reject(ThrottleReason::RateLimited)
        };
    }
    ThrottleDecision::admit()
}
