//! Fixed-window rate limiting with a minimum spacing between calls.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use orderdesk_core::{DomainError, DomainResult, TenantId, UserId};
use orderdesk_orders::OrderId;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Calls allowed per window.
    pub max: u32,
    pub window: Duration,
    /// Minimum time between two accepted calls.
    pub min_interval: Duration,
}

impl RateLimitPolicy {
    pub fn new(max: u32, window: Duration, min_interval: Duration) -> Self {
        Self {
            max,
            window,
            min_interval,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

impl RateDecision {
    /// Turn a rejection into [`DomainError::RateLimited`], rounding the wait
    /// up to whole seconds (at least one).
    pub fn into_result(self) -> DomainResult<()> {
        match self {
            RateDecision::Allowed => Ok(()),
            RateDecision::Limited { retry_after } => {
                let mut secs = retry_after.as_secs();
                if retry_after.subsec_nanos() > 0 {
                    secs += 1;
                }
                Err(DomainError::rate_limited(secs.max(1)))
            }
        }
    }
}

pub trait RateLimiter: Send + Sync {
    fn check(&self, key: &str, policy: &RateLimitPolicy) -> RateDecision;
}

pub fn create_key(tenant_id: TenantId, actor: UserId) -> String {
    format!("order:create:{tenant_id}:{actor}")
}

pub fn preview_key(tenant_id: TenantId, actor: UserId) -> String {
    format!("order:preview:{tenant_id}:{actor}")
}

pub fn note_key(tenant_id: TenantId, actor: UserId, order_id: OrderId) -> String {
    format!("order:note:create:{tenant_id}:{actor}:{order_id}")
}

/// How often the limiter drops windows that can no longer reject anything.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct WindowState {
    started: Instant,
    count: u32,
    last: Option<Instant>,
    policy: RateLimitPolicy,
}

impl WindowState {
    /// Past its window and its spacing: equivalent to no entry at all.
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= self.policy.window
            && self
                .last
                .is_none_or(|last| now.saturating_duration_since(last) >= self.policy.min_interval)
    }
}

#[derive(Debug, Default)]
struct Windows {
    by_key: HashMap<String, WindowState>,
    last_sweep: Option<Instant>,
}

impl Windows {
    fn sweep(&mut self, now: Instant) {
        let due = self
            .last_sweep
            .is_none_or(|at| now.saturating_duration_since(at) >= SWEEP_INTERVAL);
        if due {
            self.by_key.retain(|_, state| !state.is_expired(now));
            self.last_sweep = Some(now);
        }
    }
}

/// Process-local limiter. State is lost on restart; expired windows are
/// swept at most once per [`SWEEP_INTERVAL`].
#[derive(Debug, Default)]
pub struct InMemoryRateLimiter {
    windows: Mutex<Windows>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_key
            .len()
    }

    pub fn check_at(&self, key: &str, policy: &RateLimitPolicy, now: Instant) -> RateDecision {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.sweep(now);
        let state = windows.by_key.entry(key.to_string()).or_insert(WindowState {
            started: now,
            count: 0,
            last: None,
            policy: *policy,
        });
        state.policy = *policy;

        if now.saturating_duration_since(state.started) >= policy.window {
            *state = WindowState {
                started: now,
                count: 0,
                last: state.last,
                policy: *policy,
            };
        }

        if let Some(last) = state.last {
            let since = now.saturating_duration_since(last);
            if since < policy.min_interval {
                return RateDecision::Limited {
                    retry_after: policy.min_interval - since,
                };
            }
        }

        if state.count >= policy.max {
            let elapsed = now.saturating_duration_since(state.started);
            return RateDecision::Limited {
                retry_after: policy.window.saturating_sub(elapsed),
            };
        }

        state.count += 1;
        state.last = Some(now);
        RateDecision::Allowed
    }
}

impl RateLimiter for InMemoryRateLimiter {
    fn check(&self, key: &str, policy: &RateLimitPolicy) -> RateDecision {
        self.check_at(key, policy, Instant::now())
    }
}
