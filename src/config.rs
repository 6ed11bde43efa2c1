use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Process-shared option map. Subsystems never read it directly from their
/// hot paths; they take a typed snapshot at construction time and can be
/// handed a fresh snapshot on reload.
#[derive(Clone, Default)]
pub struct Options {
    map: Arc<RwLock<HashMap<String, String>>>,
}

/// Option keys recognized by `Options::from_env`.
const KNOWN_KEYS: &[&str] = &[
    "ImageGenerationTimeout",
    "ImageWorkerCount",
    "ImageWorkerPollInterval",
    "ImageTaskTimeout",
    "ImageTaskMaxRetries",
    "ImageStorageS3Enabled",
    "ImageStorageS3Endpoint",
    "ImageStorageS3Region",
    "ImageStorageS3Bucket",
    "ImageStorageS3AccessKey",
    "ImageStorageS3SecretKey",
    "ImageStorageS3PublicURL",
    "ImageStorageS3UseSSL",
    "ImageStorageS3PathStyle",
    "ImageStorageLocalRoot",
    "RateLimitEnabled",
    "RateLimitDefaultRpm",
    "RateLimitDurationMinutes",
];

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the map from environment variables of the same name.
    pub fn from_env() -> Self {
        let opts = Self::new();
        for key in KNOWN_KEYS {
            if let Ok(value) = std::env::var(key) {
                opts.set(key, &value);
            }
        }
        opts
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.map.read().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok()).filter(|v| *v > 0)
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).map(|v| v == "true")
    }

    /// Duration options are integer seconds.
    fn get_duration(&self, key: &str) -> Option<Duration> {
        self.get_u64(key).map(Duration::from_secs)
    }
}

/// Snapshot read by the generation service.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    /// Upper bound on a single provider call.
    pub timeout: Duration,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
        }
    }
}

impl GenerationSettings {
    pub fn from_options(opts: &Options) -> Self {
        let mut settings = Self::default();
        if let Some(timeout) = opts.get_duration("ImageGenerationTimeout") {
            settings.timeout = timeout;
        }
        settings
    }
}

/// Snapshot read by the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub task_timeout: Duration,
    pub max_retries: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_count: 2,
            poll_interval: Duration::from_secs(2),
            task_timeout: Duration::from_secs(180),
            max_retries: 3,
        }
    }
}

impl WorkerSettings {
    pub fn from_options(opts: &Options) -> Self {
        let mut settings = Self::default();
        if let Some(count) = opts.get_u64("ImageWorkerCount") {
            settings.worker_count = count as usize;
        }
        if let Some(interval) = opts.get_duration("ImageWorkerPollInterval") {
            settings.poll_interval = interval;
        }
        if let Some(timeout) = opts.get_duration("ImageTaskTimeout") {
            settings.task_timeout = timeout;
        }
        if let Some(retries) = opts.get_u64("ImageTaskMaxRetries") {
            settings.max_retries = retries as u32;
        }
        settings
    }
}

/// Snapshot read by the artifact sink.
#[derive(Debug, Clone, Default)]
pub struct SinkSettings {
    pub s3_enabled: bool,
    pub s3_endpoint: String,
    pub s3_region: String,
    pub s3_bucket: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub s3_public_url: String,
    pub s3_use_ssl: bool,
    pub s3_path_style: bool,
    pub local_root: String,
}

impl SinkSettings {
    pub fn from_options(opts: &Options) -> Self {
        let mut settings = Self {
            s3_enabled: opts.get_bool("ImageStorageS3Enabled").unwrap_or(false),
            s3_endpoint: opts.get("ImageStorageS3Endpoint").unwrap_or_default(),
            s3_region: opts.get("ImageStorageS3Region").unwrap_or_default(),
            s3_bucket: opts.get("ImageStorageS3Bucket").unwrap_or_default(),
            s3_access_key: opts.get("ImageStorageS3AccessKey").unwrap_or_default(),
            s3_secret_key: opts.get("ImageStorageS3SecretKey").unwrap_or_default(),
            s3_public_url: opts.get("ImageStorageS3PublicURL").unwrap_or_default(),
            s3_use_ssl: opts.get_bool("ImageStorageS3UseSSL").unwrap_or(true),
            s3_path_style: opts.get_bool("ImageStorageS3PathStyle").unwrap_or(false),
            local_root: opts.get("ImageStorageLocalRoot").unwrap_or_default(),
        };
        if settings.local_root.is_empty() {
            settings.local_root = "./storage/images".to_string();
        }
        // S3 without an endpoint and bucket is unusable; degrade to local.
        if settings.s3_enabled && (settings.s3_endpoint.is_empty() || settings.s3_bucket.is_empty()) {
            settings.s3_enabled = false;
        }
        settings
    }
}

/// Snapshot read by the RPM admission service.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub enabled: bool,
    /// Requests per window; 0 means unlimited.
    pub default_rpm: u32,
    pub window_minutes: u64,
    /// Per-group rpm overrides.
    pub group_overrides: HashMap<String, u32>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            default_rpm: 0,
            window_minutes: 1,
            group_overrides: HashMap::new(),
        }
    }
}

impl RateLimitSettings {
    pub fn from_options(opts: &Options) -> Self {
        let mut settings = Self::default();
        settings.enabled = opts.get_bool("RateLimitEnabled").unwrap_or(false);
        if let Some(rpm) = opts.get_u64("RateLimitDefaultRpm") {
            settings.default_rpm = rpm as u32;
        }
        if let Some(minutes) = opts.get_u64("RateLimitDurationMinutes") {
            settings.window_minutes = minutes;
        }
        settings
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_minutes * 60)
    }
}
