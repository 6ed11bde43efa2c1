use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

mod memory;
mod redis;

pub use memory::MemoryRpmLimiter;
pub use redis::RedisRpmLimiter;

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub admitted: bool,
    /// How long a denied caller must wait before an attempt can succeed
    /// under current conditions. Zero when admitted.
    pub retry_after: Duration,
}

impl Decision {
    pub fn admit() -> Self {
        Self {
            admitted: true,
            retry_after: Duration::ZERO,
        }
    }

    pub fn deny(retry_after_ms: i64) -> Self {
        Self {
            admitted: false,
            retry_after: Duration::from_millis(retry_after_ms.max(0) as u64),
        }
    }
}

/// Sliding-window admission over a per-key multiset of request timestamps.
///
/// The distributed (redis) path is preferred; any redis failure degrades
/// transparently to the in-process window, so callers always get an answer.
pub struct RpmLimiter {
    redis: Option<RedisRpmLimiter>,
    memory: Arc<MemoryRpmLimiter>,
}

impl RpmLimiter {
    /// Must be called from within a tokio runtime: the in-memory window
    /// starts its eviction sweeper here.
    pub fn new(redis_url: Option<&str>) -> anyhow::Result<Self> {
        let redis = match redis_url {
            Some(url) => Some(RedisRpmLimiter::new(url)?),
            None => None,
        };
        let memory = Arc::new(MemoryRpmLimiter::new());
        memory::start_sweeper(&memory);
        Ok(Self { redis, memory })
    }

    pub fn in_memory() -> Self {
        let memory = Arc::new(MemoryRpmLimiter::new());
        memory::start_sweeper(&memory);
        Self {
            redis: None,
            memory,
        }
    }

    /// Admit iff fewer than `rpm` acquisitions happened in the trailing
    /// `window`. `rpm == 0` means unlimited.
    pub async fn acquire(&self, key: &str, rpm: u32, window: Duration) -> Decision {
        if rpm == 0 {
            return Decision::admit();
        }
        if let Some(redis) = &self.redis {
            match redis.acquire(key, rpm, window).await {
                Ok(decision) => return decision,
                Err(e) => {
                    warn!("redis rpm limiter failed, falling back to memory: {}", e);
                }
            }
        }
        self.memory.acquire(key, rpm, window)
    }
}
