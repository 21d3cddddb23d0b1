//! Expendable key/value overlay over the quota store.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod ledger;
mod memory;
#[cfg(feature = "cache-redis")]
mod redis_cache;

pub use ledger::QuotaLedger;
pub use memory::MemoryCache;
#[cfg(feature = "cache-redis")]
pub use redis_cache::RedisCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[cfg(feature = "cache-redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("cached value for {key} is not valid: {value}")]
    InvalidValue { key: String, value: String },
}

#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Adds `delta` to an integer entry only when the key is present, so a
    /// balance mutation never creates an entry without a TTL. Returns the
    /// new value, or `None` for a missing key.
    async fn incr_by_if_exists(&self, key: &str, delta: i64) -> Result<Option<i64>, CacheError>;

    async fn del(&self, keys: &[String]) -> Result<(), CacheError>;
}

/// Per-field key naming: `<prefix>:<entity>:<id>:<field>`.
#[derive(Clone, Debug)]
pub(crate) struct CacheKeys {
    prefix: String,
}

impl CacheKeys {
    pub(crate) fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub(crate) fn user(&self, id: i64, field: UserField) -> String {
        format!("{}:user:{id}:{}", self.prefix, field.as_str())
    }

    pub(crate) fn token_remain_quota(&self, id: i64) -> String {
        format!("{}:token:{id}:remain_quota", self.prefix)
    }

    pub(crate) fn all_user(&self, id: i64) -> Vec<String> {
        UserField::ALL
            .iter()
            .map(|field| self.user(id, *field))
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UserField {
    Quota,
    Group,
    Enabled,
    Username,
    UnlimitedQuota,
}

impl UserField {
    const ALL: [UserField; 5] = [
        Self::Quota,
        Self::Group,
        Self::Enabled,
        Self::Username,
        Self::UnlimitedQuota,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Quota => "quota",
            Self::Group => "group",
            Self::Enabled => "enabled",
            Self::Username => "username",
            Self::UnlimitedQuota => "unlimited_quota",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_entity_id_field_layout() {
        let keys = CacheKeys::new("relay");
        assert_eq!(keys.user(7, UserField::Quota), "relay:user:7:quota");
        assert_eq!(
            keys.user(7, UserField::UnlimitedQuota),
            "relay:user:7:unlimited_quota"
        );
        assert_eq!(keys.token_remain_quota(3), "relay:token:3:remain_quota");
        assert_eq!(keys.all_user(1).len(), 5);
    }
}
