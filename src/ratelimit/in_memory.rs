use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::{
    config::WindowPolicy,
    error::GatewayResult,
    ratelimit::{CounterStore, RateLimitDecision, RateLimitPolicy},
};

/// Process-local counter store for single-instance deployments.
///
/// `DashMap::entry` holds the shard's write lock for the lifetime of the
/// returned guard, which makes check-then-increment atomic per key.
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: DashMap<String, Counter>,
}

#[derive(Debug)]
struct Counter {
    count: u64,
    expires_at: Instant,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Drops every counter whose window has passed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    /// Periodically purges expired counters. The task ends once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, remaining = store.len(), "purged expired rate-limit counters");
                }
            }
        })
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.counters.len();
        self.counters.retain(|_, counter| counter.expires_at > now);
        before.saturating_sub(self.counters.len())
    }

    fn check_at(&self, key: &str, policy: &RateLimitPolicy, now: Instant) -> RateLimitDecision {
        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| Counter {
                count: 0,
                expires_at: now,
            });

        if counter.expires_at <= now {
            counter.count = 0;
        }

        if counter.count >= policy.max_requests {
            return RateLimitDecision::rejected(
                counter.count,
                counter.expires_at.saturating_duration_since(now),
            );
        }

        if counter.count == 0 || policy.window_policy == WindowPolicy::Rolling {
            counter.expires_at = now + policy.window;
        }
        counter.count += 1;

        RateLimitDecision::admitted(counter.count)
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn check_and_increment(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> GatewayResult<RateLimitDecision> {
        Ok(self.check_at(key, policy, Instant::now()))
    }
}
