use async_trait::async_trait;
use anyhow::Result;
use sqlx::{PgPool, Row, SqlitePool};

pub const CHANNEL_STATUS_ENABLED: i32 = 1;
pub const CHANNEL_STATUS_DISABLED: i32 = 2;

/// Provider family a channel speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    OpenAI,
    Azure,
    Custom,
    Gemini,
    Vertex,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::OpenAI => "openai",
            ChannelType::Azure => "azure",
            ChannelType::Custom => "custom",
            ChannelType::Gemini => "gemini",
            ChannelType::Vertex => "vertex",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "openai" => Ok(ChannelType::OpenAI),
            "azure" => Ok(ChannelType::Azure),
            "custom" => Ok(ChannelType::Custom),
            "gemini" => Ok(ChannelType::Gemini),
            "vertex" => Ok(ChannelType::Vertex),
            other => Err(anyhow::anyhow!("unknown channel type: {}", other)),
        }
    }

    /// Default base URL used when the channel does not carry one.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ChannelType::OpenAI | ChannelType::Azure | ChannelType::Custom => {
                "https://api.openai.com"
            }
            ChannelType::Gemini | ChannelType::Vertex => {
                "https://generativelanguage.googleapis.com"
            }
        }
    }
}

/// Externally configured gateway to a provider.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub channel_type: ChannelType,
    pub base_url: String,
    /// Newline-separated API keys.
    pub api_keys: String,
    pub status: i32,
}

impl Channel {
    pub fn base_url_or_default(&self) -> &str {
        if self.base_url.is_empty() {
            self.channel_type.default_base_url()
        } else {
            self.base_url.trim_end_matches('/')
        }
    }

    pub fn keys(&self) -> Vec<&str> {
        self.api_keys
            .lines()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .collect()
    }
}

/// Ability index entry: channel `channel_id` serves `model` for `group_name`.
#[derive(Debug, Clone)]
pub struct Ability {
    pub group_name: String,
    pub model: String,
    pub channel_id: i64,
    pub enabled: bool,
    pub priority: i64,
    pub weight: i64,
}

/// Read side of the channel/ability tables the dispatcher consumes. The
/// insert helpers exist for seeding and tests; channel administration
/// proper lives outside this crate.
#[async_trait]
pub trait ChannelStore: Send + Sync + 'static {
    async fn get_channel(&self, id: i64) -> Result<Option<Channel>>;

    /// Best enabled ability for (group, model): priority desc, weight desc.
    async fn find_ability(&self, group: &str, model: &str) -> Result<Option<Ability>>;

    async fn insert_channel(&self, channel: &Channel) -> Result<()>;
    async fn insert_ability(&self, ability: &Ability) -> Result<()>;
}

const CHANNEL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS channels (
    id BIGINT PRIMARY KEY,
    name TEXT NOT NULL,
    channel_type TEXT NOT NULL,
    base_url TEXT NOT NULL DEFAULT '',
    api_keys TEXT NOT NULL DEFAULT '',
    status INTEGER NOT NULL DEFAULT 1
)
"#;

const ABILITY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS abilities (
    group_name TEXT NOT NULL,
    model TEXT NOT NULL,
    channel_id BIGINT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    priority BIGINT NOT NULL DEFAULT 0,
    weight BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (group_name, model, channel_id)
)
"#;

pub struct SqliteChannelStore {
    pool: SqlitePool,
}

impl SqliteChannelStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(CHANNEL_SCHEMA).execute(&pool).await?;
        sqlx::query(ABILITY_SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ChannelStore for SqliteChannelStore {
    async fn get_channel(&self, id: i64) -> Result<Option<Channel>> {
        let row = sqlx::query(
            "SELECT id, name, channel_type, base_url, api_keys, status FROM channels WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(Channel {
                id: r.get("id"),
                name: r.get("name"),
                channel_type: ChannelType::parse(r.get("channel_type"))?,
                base_url: r.get("base_url"),
                api_keys: r.get("api_keys"),
                status: r.get("status"),
            })
        })
        .transpose()
    }

    async fn find_ability(&self, group: &str, model: &str) -> Result<Option<Ability>> {
        let row = sqlx::query(
            "SELECT group_name, model, channel_id, enabled, priority, weight FROM abilities \
             WHERE group_name = ? AND model = ? AND enabled = 1 \
             ORDER BY priority DESC, weight DESC LIMIT 1",
        )
        .bind(group)
        .bind(model)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Ability {
            group_name: r.get("group_name"),
            model: r.get("model"),
            channel_id: r.get("channel_id"),
            enabled: r.get::<i32, _>("enabled") != 0,
            priority: r.get("priority"),
            weight: r.get("weight"),
        }))
    }

    async fn insert_channel(&self, channel: &Channel) -> Result<()> {
        sqlx::query(
            "INSERT INTO channels (id, name, channel_type, base_url, api_keys, status) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(channel.id)
        .bind(&channel.name)
        .bind(channel.channel_type.as_str())
        .bind(&channel.base_url)
        .bind(&channel.api_keys)
        .bind(channel.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_ability(&self, ability: &Ability) -> Result<()> {
        sqlx::query(
            "INSERT INTO abilities (group_name, model, channel_id, enabled, priority, weight) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&ability.group_name)
        .bind(&ability.model)
        .bind(ability.channel_id)
        .bind(ability.enabled as i32)
        .bind(ability.priority)
        .bind(ability.weight)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub struct PgChannelStore {
    pool: PgPool,
}

impl PgChannelStore {
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query(CHANNEL_SCHEMA).execute(&pool).await?;
        sqlx::query(ABILITY_SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ChannelStore for PgChannelStore {
    async fn get_channel(&self, id: i64) -> Result<Option<Channel>> {
        let row = sqlx::query(
            "SELECT id, name, channel_type, base_url, api_keys, status FROM channels WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(Channel {
                id: r.get("id"),
                name: r.get("name"),
                channel_type: ChannelType::parse(r.get("channel_type"))?,
                base_url: r.get("base_url"),
                api_keys: r.get("api_keys"),
                status: r.get("status"),
            })
        })
        .transpose()
    }

    async fn find_ability(&self, group: &str, model: &str) -> Result<Option<Ability>> {
        let row = sqlx::query(
            "SELECT group_name, model, channel_id, enabled, priority, weight FROM abilities \
             WHERE group_name = $1 AND model = $2 AND enabled = 1 \
             ORDER BY priority DESC, weight DESC LIMIT 1",
        )
        .bind(group)
        .bind(model)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Ability {
            group_name: r.get("group_name"),
            model: r.get("model"),
            channel_id: r.get("channel_id"),
            enabled: r.get::<i32, _>("enabled") != 0,
            priority: r.get("priority"),
            weight: r.get("weight"),
        }))
    }

    async fn insert_channel(&self, channel: &Channel) -> Result<()> {
        sqlx::query(
            "INSERT INTO channels (id, name, channel_type, base_url, api_keys, status) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(channel.id)
        .bind(&channel.name)
        .bind(channel.channel_type.as_str())
        .bind(&channel.base_url)
        .bind(&channel.api_keys)
        .bind(channel.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_ability(&self, ability: &Ability) -> Result<()> {
        sqlx::query(
            "INSERT INTO abilities (group_name, model, channel_id, enabled, priority, weight) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&ability.group_name)
        .bind(&ability.model)
        .bind(ability.channel_id)
        .bind(ability.enabled as i32)
        .bind(ability.priority)
        .bind(ability.weight)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
