//! Durable source of truth for user, token and channel balances plus the
//! append-only consume log.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod memory;
#[cfg(feature = "store-sqlite")]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "store-sqlite")]
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    #[default]
    Enabled,
    Disabled,
}

impl UserStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Enabled => 1,
            Self::Disabled => 2,
        }
    }

    pub fn from_i64(raw: i64) -> Self {
        if raw == 1 {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyType {
    #[default]
    Email,
    Webhook,
}

/// Per-user notification preferences.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSetting {
    /// Overrides the global low-balance threshold when set.
    pub quota_warning_threshold: Option<i64>,
    pub notify_type: NotifyType,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub group: String,
    /// Balance in the smallest billing unit. Ignored while `unlimited_quota`.
    pub quota: i64,
    pub used_quota: i64,
    pub request_count: i64,
    pub status: UserStatus,
    pub role: i64,
    pub unlimited_quota: bool,
    pub email: Option<String>,
    #[serde(default)]
    pub setting: UserSetting,
}

impl UserRecord {
    pub fn new(id: i64, username: impl Into<String>, quota: i64) -> Self {
        Self {
            id,
            username: username.into(),
            group: crate::settings::DEFAULT_GROUP.to_string(),
            quota,
            role: 1,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    pub name: String,
    /// Sub-ledger of the owning user's balance; unbounded when `unlimited_quota`.
    pub remain_quota: i64,
    pub used_quota: i64,
    pub unlimited_quota: bool,
    pub status: UserStatus,
}

impl TokenRecord {
    pub fn new(id: i64, user_id: i64, remain_quota: i64) -> Self {
        Self {
            id,
            user_id,
            key: format!("sk-{id}"),
            name: format!("token-{id}"),
            remain_quota,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: i64,
    pub name: String,
    /// Observational aggregate; never gates admission.
    pub used_quota: i64,
}

/// Append-only audit record of one request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumeLog {
    pub id: i64,
    pub created_at: i64,
    pub user_id: i64,
    pub username: String,
    pub channel_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub model_name: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub quota: i64,
    pub content: String,
    pub use_time_seconds: i64,
    pub is_stream: bool,
    pub group: String,
    #[serde(default)]
    pub other: Value,
}

/// Durable store contract. Balance mutations are atomic signed increments
/// executed by the store; callers never read-modify-write.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get_user(&self, id: i64) -> Result<UserRecord, StoreError>;
    async fn get_token(&self, id: i64) -> Result<TokenRecord, StoreError>;
    async fn get_channel(&self, id: i64) -> Result<ChannelRecord, StoreError>;

    async fn insert_user(&self, user: &UserRecord) -> Result<(), StoreError>;
    async fn insert_token(&self, token: &TokenRecord) -> Result<(), StoreError>;
    async fn insert_channel(&self, channel: &ChannelRecord) -> Result<(), StoreError>;

    /// `quota += delta`; returns the new balance.
    async fn adjust_user_quota(&self, id: i64, delta: i64) -> Result<i64, StoreError>;

    /// Decrements by `amount` only while the balance covers it. Returns the
    /// new balance, or `None` when the balance was insufficient.
    async fn try_decrease_user_quota(&self, id: i64, amount: i64)
    -> Result<Option<i64>, StoreError>;

    /// `remain_quota += delta; used_quota -= delta`.
    async fn adjust_token_quota(&self, id: i64, delta: i64) -> Result<(), StoreError>;

    /// Conditional decrement of a token's remaining quota. Unlimited tokens
    /// always succeed and only accumulate `used_quota`.
    async fn try_decrease_token_quota(&self, id: i64, amount: i64) -> Result<bool, StoreError>;

    async fn update_user_used_quota_and_request_count(
        &self,
        id: i64,
        quota: i64,
    ) -> Result<(), StoreError>;
    async fn update_channel_used_quota(&self, id: i64, quota: i64) -> Result<(), StoreError>;

    async fn set_user_group(&self, id: i64, group: &str) -> Result<(), StoreError>;
    async fn set_user_status(&self, id: i64, status: UserStatus) -> Result<(), StoreError>;
    async fn set_user_unlimited(&self, id: i64, unlimited: bool) -> Result<(), StoreError>;

    /// Appends a consume log and returns its id.
    async fn record_consume_log(&self, log: &ConsumeLog) -> Result<i64, StoreError>;

    /// Most recent logs first.
    async fn list_consume_logs(
        &self,
        user_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ConsumeLog>, StoreError>;
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
