use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::config::RateLimitSettings;
use crate::limiter::{Decision, RpmLimiter};

/// Resolves the applicable rpm for (user, model, group), builds the limiter
/// key, and delegates admission to the sliding window. Settings are a
/// snapshot with an explicit reload hook; nothing here reads global state.
pub struct ModelRpmService {
    limiter: Arc<RpmLimiter>,
    settings: RwLock<RateLimitSettings>,
}

impl ModelRpmService {
    pub fn new(limiter: Arc<RpmLimiter>, settings: RateLimitSettings) -> Self {
        Self {
            limiter,
            settings: RwLock::new(settings),
        }
    }

    /// Swap in a fresh settings snapshot.
    pub fn reload(&self, settings: RateLimitSettings) {
        *self.settings.write().unwrap() = settings;
    }

    pub async fn acquire(&self, user_id: i64, model_id: &str, group: Option<&str>) -> Decision {
        let (enabled, rpm, window) = {
            let settings = self.settings.read().unwrap();
            let rpm = group
                .and_then(|g| settings.group_overrides.get(g).copied())
                .unwrap_or(settings.default_rpm);
            (settings.enabled, rpm, settings.window())
        };

        if !enabled || rpm == 0 {
            return Decision::admit();
        }

        let key = match group {
            Some(g) => format!("rpm:group:{}:user:{}:model:{}", g, user_id, model_id),
            None => format!("rpm:user:{}:model:{}", user_id, model_id),
        };

        let decision = self.limiter.acquire(&key, rpm, window).await;
        debug!(
            "rpm admission user={} model={} rpm={} admitted={}",
            user_id, model_id, rpm, decision.admitted
        );
        decision
    }
}
