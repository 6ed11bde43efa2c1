use anyhow::Result;
use chrono::Utc;
use std::time::Duration;

use super::Decision;

/// Atomic prune-count-insert. Scores and the TTL are both milliseconds so
/// retry-after arithmetic never mixes units.
const ACQUIRE_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window_start = tonumber(ARGV[2])
local max_requests = tonumber(ARGV[3])
local window_ms = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', key, '-inf', window_start)

local current_count = redis.call('ZCARD', key)

if current_count < max_requests then
    redis.call('ZADD', key, now, now)
    redis.call('PEXPIRE', key, window_ms)
    return {1, 0}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if #oldest >= 2 then
    local retry_after = tonumber(oldest[2]) + window_ms - now
    if retry_after < 0 then
        retry_after = 0
    end
    return {0, retry_after}
end
return {0, window_ms}
"#;

/// Redis-backed sliding window. The whole decision runs server-side in one
/// script invocation, so two acquirers cannot both observe `size == rpm - 1`.
pub struct RedisRpmLimiter {
    client: redis::Client,
    script: redis::Script,
}

impl RedisRpmLimiter {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            script: redis::Script::new(ACQUIRE_SCRIPT),
        })
    }

    pub async fn acquire(&self, key: &str, rpm: u32, window: Duration) -> Result<Decision> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = window.as_millis() as i64;

        let mut invocation = self.script.key(key);
        invocation
            .arg(now_ms)
            .arg(now_ms - window_ms)
            .arg(rpm)
            .arg(window_ms);
        let (admitted, retry_after_ms): (i64, i64) =
            invocation.invoke_async(&mut conn).await?;

        if admitted == 1 {
            Ok(Decision::admit())
        } else {
            Ok(Decision::deny(retry_after_ms))
        }
    }
}
