use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use super::Decision;

/// Keys idle this long are dropped by the sweeper.
const IDLE_EVICT_MS: i64 = 10 * 60 * 1000;
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

type Slot = Arc<Mutex<Vec<i64>>>;

/// In-process sliding window: per key, a sorted vector of request
/// timestamps in milliseconds, guarded by a per-key mutex so the sweeper
/// and concurrent acquirers never race.
#[derive(Default)]
pub struct MemoryRpmLimiter {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryRpmLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: &str, rpm: u32, window: Duration) -> Decision {
        self.acquire_at(key, rpm, window, Utc::now().timestamp_millis())
    }

    /// Admission with an explicit clock, so tests are deterministic.
    pub fn acquire_at(&self, key: &str, rpm: u32, window: Duration, now_ms: i64) -> Decision {
        let window_ms = window.as_millis() as i64;
        let window_start = now_ms - window_ms;

        let slot = {
            let mut slots = self.slots.lock().unwrap();
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Vec::with_capacity(rpm as usize))))
                .clone()
        };

        let mut timestamps = slot.lock().unwrap();
        timestamps.retain(|ts| *ts > window_start);

        if (timestamps.len() as u32) < rpm {
            timestamps.push(now_ms);
            return Decision::admit();
        }

        let oldest = timestamps[0];
        Decision::deny(oldest + window_ms - now_ms)
    }

    /// Drop every key whose newest timestamp is older than ten minutes.
    pub fn sweep_at(&self, now_ms: i64) {
        let mut slots = self.slots.lock().unwrap();
        slots.retain(|_, slot| {
            let timestamps = slot.lock().unwrap();
            match timestamps.last() {
                Some(newest) => now_ms - newest <= IDLE_EVICT_MS,
                None => false,
            }
        });
    }

    #[cfg(test)]
    fn key_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

/// Background eviction loop; stops once the limiter is dropped.
pub(super) fn start_sweeper(limiter: &Arc<MemoryRpmLimiter>) {
    let weak: Weak<MemoryRpmLimiter> = Arc::downgrade(limiter);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match weak.upgrade() {
                Some(limiter) => limiter.sweep_at(Utc::now().timestamp_millis()),
                None => break,
            }
        }
    });
}
