use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;

pub mod gemini;
pub mod openai;

use crate::config::GenerationSettings;
use crate::sink::ImageSink;
use crate::storage::channel::{Channel, ChannelStore, ChannelType, CHANNEL_STATUS_ENABLED};
use crate::storage::task::Task;

/// Structured provider error. The retry classifier reads the status code
/// and transport flags first; the `Display` text keeps the `status {code}`
/// token so free-form matching still works as a fallback.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("deadline exceeded")]
    Timeout,

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("request failed with status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("api error: {0}")]
    Api(String),

    #[error("no images returned")]
    NoImages,

    #[error("select channel failed: {0}")]
    Channel(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("decode response failed: {0}")]
    Decode(#[from] serde_json::Error),
}

impl GenerateError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            GenerateError::Status { code, .. } => Some(*code),
            GenerateError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Protocol-agnostic dispatch: picks a channel through the ability index,
/// rotates its API keys, and hands the task to the per-family adapter.
/// Adapters never retry; the worker pool owns retry policy.
pub struct GenerationService {
    channels: Arc<dyn ChannelStore>,
    sink: Option<Arc<ImageSink>>,
    http: reqwest::Client,
    settings: GenerationSettings,
    key_cursors: Mutex<HashMap<i64, usize>>,
}

impl GenerationService {
    pub fn new(
        channels: Arc<dyn ChannelStore>,
        sink: Option<Arc<ImageSink>>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            channels,
            sink,
            http: reqwest::Client::new(),
            settings,
            key_cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Run one generation for `task` and return the artifact URL list.
    pub async fn generate(
        &self,
        task: &Task,
        group: Option<&str>,
    ) -> Result<Vec<String>, GenerateError> {
        if task.prompt.is_empty() {
            return Err(GenerateError::Invalid("prompt is required".to_string()));
        }
        if task.model_id.is_empty() {
            return Err(GenerateError::Invalid("model_id is required".to_string()));
        }

        let group = group.unwrap_or("default");
        let channel = self.select_channel(&task.model_id, group).await?;
        let api_key = self.next_enabled_key(&channel)?;

        let call = async {
            match channel.channel_type {
                ChannelType::OpenAI | ChannelType::Azure | ChannelType::Custom => {
                    openai::generate(&self.http, &channel, &api_key, task).await
                }
                ChannelType::Gemini | ChannelType::Vertex => {
                    gemini::generate(&self.http, &channel, &api_key, task).await
                }
            }
        };
        let image_urls = tokio::time::timeout(self.settings.timeout, call)
            .await
            .map_err(|_| GenerateError::Timeout)??;

        // Storage must never fail the task; per-image fallbacks happen
        // inside the sink.
        let image_urls = match &self.sink {
            Some(sink) => sink.store_all(image_urls).await,
            None => image_urls,
        };

        info!(
            "task {}: generated {} images via channel {}",
            task.id,
            image_urls.len(),
            channel.id
        );
        Ok(image_urls)
    }

    async fn select_channel(&self, model_id: &str, group: &str) -> Result<Channel, GenerateError> {
        let ability = self
            .channels
            .find_ability(group, model_id)
            .await
            .map_err(|e| GenerateError::Channel(e.to_string()))?
            .ok_or_else(|| {
                GenerateError::Channel(format!("no available channel for model {}", model_id))
            })?;

        let channel = self
            .channels
            .get_channel(ability.channel_id)
            .await
            .map_err(|e| GenerateError::Channel(e.to_string()))?
            .ok_or_else(|| {
                GenerateError::Channel(format!("channel {} not found", ability.channel_id))
            })?;

        if channel.status != CHANNEL_STATUS_ENABLED {
            return Err(GenerateError::Channel(format!(
                "channel {} is not enabled",
                channel.id
            )));
        }
        Ok(channel)
    }

    /// Round-robin over the channel's key list.
    fn next_enabled_key(&self, channel: &Channel) -> Result<String, GenerateError> {
        let keys = channel.keys();
        if keys.is_empty() {
            return Err(GenerateError::Channel(format!(
                "channel {} has no enabled key",
                channel.id
            )));
        }
        let mut cursors = self.key_cursors.lock().unwrap();
        let cursor = cursors.entry(channel.id).or_insert(0);
        let key = keys[*cursor % keys.len()].to_string();
        *cursor = (*cursor + 1) % keys.len();
        Ok(key)
    }
}
