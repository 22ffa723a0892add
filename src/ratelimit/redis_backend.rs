use async_trait::async_trait;
use redis::{
    Script,
    aio::ConnectionManager,
};
use std::time::Duration;

use crate::{
    config::WindowPolicy,
    error::GatewayResult,
    ratelimit::{CounterStore, RateLimitDecision, RateLimitPolicy},
};

// Returns {allowed, count, pttl_ms}. A rejected call never writes.
const FIXED_WINDOW_LUA: &str = r#"
local key = KEYS[1]
local max_requests = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local rolling = tonumber(ARGV[3])

local count = tonumber(redis.call('GET', key) or '0')
if count >= max_requests then
  return {0, count, redis.call('PTTL', key)}
end

count = redis.call('INCR', key)
if count == 1 or rolling == 1 or redis.call('PTTL', key) < 0 then
  redis.call('PEXPIRE', key, window_ms)
end

return {1, count, redis.call('PTTL', key)}
"#;

/// Counter store shared by every gateway instance pointed at the same Redis.
pub struct RedisCounterStore {
    manager: ConnectionManager,
    key_prefix: String,
    script: Script,
}

impl RedisCounterStore {
    pub async fn new(url: String, key_prefix: String) -> GatewayResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            key_prefix,
            script: Script::new(FIXED_WINDOW_LUA),
        })
    }

    fn key(&self, key: &str) -> String {
        redis_key(&self.key_prefix, key)
    }
}

fn redis_key(prefix: &str, key: &str) -> String {
    format!("{prefix}:{key}")
}

fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1)
}

fn decision_from_reply(allowed: i64, count: i64, pttl_ms: i64) -> RateLimitDecision {
    let count = count.max(0) as u64;
    if allowed == 1 {
        RateLimitDecision::admitted(count)
    } else {
        RateLimitDecision::rejected(count, Duration::from_millis(pttl_ms.max(0) as u64))
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn check_and_increment(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> GatewayResult<RateLimitDecision> {
        let mut conn = self.manager.clone();
        let rolling = i64::from(policy.window_policy == WindowPolicy::Rolling);

        let (allowed, count, pttl_ms): (i64, i64, i64) = self
            .script
            .key(self.key(key))
            .arg(policy.max_requests)
            .arg(window_millis(policy.window))
            .arg(rolling)
            .invoke_async(&mut conn)
            .await?;

        Ok(decision_from_reply(allowed, count, pttl_ms))
    }
}
