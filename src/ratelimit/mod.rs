pub mod in_memory;
pub mod redis_backend;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{config::WindowPolicy, error::GatewayResult, identity::ClientIdentity};

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_requests: u64,
    pub window: Duration,
    pub window_policy: WindowPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Counter value after this call.
    pub count: u64,
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    fn admitted(count: u64) -> Self {
        Self {
            allowed: true,
            count,
            retry_after_secs: 0,
        }
    }

    fn rejected(count: u64, remaining_window: Duration) -> Self {
        Self {
            allowed: false,
            count,
            retry_after_secs: ceil_secs(remaining_window),
        }
    }
}

/// Shared per-client counters with expiry.
///
/// Implementations must perform the read, the comparison against
/// `policy.max_requests` and the increment as one atomic step per key; two
/// concurrent callers for the same key must never both observe a count below
/// the limit when only one slot is left. A rejected call leaves the counter
/// untouched.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn check_and_increment(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> GatewayResult<RateLimitDecision>;
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, policy: RateLimitPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn check_and_increment(
        &self,
        identity: &ClientIdentity,
    ) -> GatewayResult<RateLimitDecision> {
        self.store
            .check_and_increment(identity.as_str(), &self.policy)
            .await
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_rounds_up_to_whole_seconds() {
        assert_eq!(ceil_secs(Duration::ZERO), 1);
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_secs(2)), 2);
        assert_eq!(ceil_secs(Duration::from_millis(2_001)), 3);
    }
}
