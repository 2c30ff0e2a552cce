//! Fixed-window rate admission.
//!
//! Each policy owns a scope; each `(scope, actor)` pair owns one counter in
//! the shared cache store. The first consumption in a window creates the
//! counter with an expiry equal to the window; later consumptions increment
//! it atomically. When the counter expires the window starts over.
//!
//! The controller is a plain gate: it answers allowed or not and never
//! raises business errors. Mapping a denial to a response is the caller's
//! job.
//!
//! # Policies
//!
//! | Policy | Scope | Points | Window | Store failure |
//! |--------|-------|--------|--------|---------------|
//! | [`RateLimitPolicy::GLOBAL_PER_IP`] | `global` | 10 | 1 s | allow |
//! | [`RateLimitPolicy::REGISTRATION_PER_IP`] | `register` | 50 | 15 min | deny |
//! | [`RateLimitPolicy::CONTENT_CREATION`] | `content-create` | 9 | 60 s | deny |
//! | [`RateLimitPolicy::MEDIA_UPLOAD`] | `media-upload` | 13 | 60 s | deny |

use crate::cache::DEFAULT_OPERATION_TIMEOUT;
use crate::metrics::RateLimitMetrics;
use ripple_core::cache::{CacheError, CacheStore};
use ripple_core::keys::{self, RateScope};
use std::sync::Arc;
use std::time::Duration;

/// What to do when the cache store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    /// Admit the request.
    Open,
    /// Reject the request.
    Closed,
}

/// A fixed-window quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Key scope.
    pub scope: RateScope,
    /// Points allotted per window.
    pub points: u64,
    /// Window length.
    pub window: Duration,
    /// Behaviour when the store is unavailable.
    pub on_store_failure: FailMode,
}

impl RateLimitPolicy {
    /// Cheap limiter applied to every request by client IP.
    pub const GLOBAL_PER_IP: Self = Self {
        scope: RateScope::from_static("global"),
        points: 10,
        window: Duration::from_secs(1),
        on_store_failure: FailMode::Open,
    };

    /// Account registration by client IP.
    pub const REGISTRATION_PER_IP: Self = Self {
        scope: RateScope::from_static("register"),
        points: 50,
        window: Duration::from_secs(15 * 60),
        on_store_failure: FailMode::Closed,
    };

    /// Content creation per authenticated actor.
    pub const CONTENT_CREATION: Self = Self {
        scope: RateScope::from_static("content-create"),
        points: 9,
        window: Duration::from_secs(60),
        on_store_failure: FailMode::Closed,
    };

    /// Media upload per authenticated actor.
    pub const MEDIA_UPLOAD: Self = Self {
        scope: RateScope::from_static("media-upload"),
        points: 13,
        window: Duration::from_secs(60),
        on_store_failure: FailMode::Closed,
    };

    /// Custom policy.
    #[must_use]
    pub const fn new(scope: RateScope, points: u64, window: Duration, on_store_failure: FailMode) -> Self {
        Self {
            scope,
            points,
            window,
            on_store_failure,
        }
    }
}

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Points counted in the current window, including this request.
    pub consumed: u64,
    /// Points left in the current window.
    pub remaining: u64,
    /// Time until the window resets.
    pub reset_after: Duration,
}

/// Boolean gate over per-actor fixed-window counters.
#[derive(Clone)]
pub struct RateAdmissionController {
    store: Arc<dyn CacheStore>,
    op_timeout: Duration,
}

impl RateAdmissionController {
    /// Controller with the default store timeout.
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_timeout(store, DEFAULT_OPERATION_TIMEOUT)
    }

    /// Controller with a custom store timeout.
    #[must_use]
    pub fn with_timeout(store: Arc<dyn CacheStore>, op_timeout: Duration) -> Self {
        Self { store, op_timeout }
    }

    /// Consume `cost` points for `actor` and report the window state.
    ///
    /// A `cost` of zero is a caller bug and is denied without touching the
    /// store.
    pub async fn check(&self, policy: &RateLimitPolicy, actor: &str, cost: u64) -> RateDecision {
        if cost == 0 {
            tracing::error!(scope = %policy.scope, actor, "Rate check with zero cost rejected");
            return RateDecision {
                allowed: false,
                consumed: 0,
                remaining: 0,
                reset_after: Duration::ZERO,
            };
        }

        let key = keys::rate_key(&policy.scope, actor);
        let counted = tokio::time::timeout(
            self.op_timeout,
            self.store.incr_window(&key, cost, policy.window),
        )
        .await
        .map_err(|_| CacheError::Timeout(self.op_timeout))
        .and_then(|result| result);

        let window = match counted {
            Ok(window) => window,
            Err(error) => return Self::store_failure(policy, actor, &error),
        };

        let allowed = window.count <= policy.points;
        let decision = RateDecision {
            allowed,
            consumed: window.count,
            remaining: policy.points.saturating_sub(window.count),
            reset_after: window.reset_after,
        };

        if allowed {
            RateLimitMetrics::record_allowed(policy.scope.as_str());
        } else {
            RateLimitMetrics::record_denied(policy.scope.as_str());
            tracing::warn!(
                scope = %policy.scope,
                actor,
                consumed = window.count,
                limit = policy.points,
                reset_after_ms = u64::try_from(window.reset_after.as_millis()).unwrap_or(u64::MAX),
                "Rate limit exceeded"
            );
        }
        decision
    }

    /// [`RateAdmissionController::check`] reduced to the boolean answer.
    pub async fn try_consume(&self, policy: &RateLimitPolicy, actor: &str, cost: u64) -> bool {
        self.check(policy, actor, cost).await.allowed
    }

    fn store_failure(policy: &RateLimitPolicy, actor: &str, error: &CacheError) -> RateDecision {
        RateLimitMetrics::record_store_failure(policy.scope.as_str());
        let allowed = policy.on_store_failure == FailMode::Open;
        tracing::warn!(
            scope = %policy.scope,
            actor,
            error = %error,
            allowed,
            "Rate limit store unavailable, applying fail mode"
        );
        RateDecision {
            allowed,
            consumed: 0,
            remaining: if allowed { policy.points } else { 0 },
            reset_after: policy.window,
        }
    }
}
