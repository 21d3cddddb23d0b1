use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use super::{CacheError, KvCache};

#[derive(Clone, Debug)]
pub struct RedisCache {
    client: redis::Client,
}

impl RedisCache {
    pub fn new(url: impl AsRef<str>) -> Result<Self, CacheError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get("__quota_relay_ping__").await?;
        Ok(())
    }
}

#[async_trait]
impl KvCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let ttl_secs = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn incr_by_if_exists(&self, key: &str, delta: i64) -> Result<Option<i64>, CacheError> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(
            r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
  return redis.call("INCRBY", KEYS[1], ARGV[1])
end
return false
"#,
        );
        let value: Option<i64> = script
            .key(key)
            .arg(delta)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn del(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let _: i64 = conn.del(keys.to_vec()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn env_nonempty(key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    fn redis_url() -> Option<String> {
        env_nonempty("QUOTA_RELAY_REDIS_URL").or_else(|| env_nonempty("REDIS_URL"))
    }

    static PREFIX_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn test_key(field: &str) -> String {
        let n = PREFIX_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!(
            "quota_relay_test:{}:{n}:{field}",
            crate::store::now_millis()
        )
    }

    #[tokio::test]
    async fn redis_cache_increments_only_existing_keys() {
        let Some(url) = redis_url() else {
            return;
        };
        let cache = RedisCache::new(url).expect("cache");
        cache.ping().await.expect("ping");

        let key = test_key("quota");
        assert_eq!(cache.incr_by_if_exists(&key, 5).await.expect("incr"), None);
        assert!(cache.get(&key).await.expect("get").is_none());

        cache
            .set(&key, "100", Duration::from_secs(60))
            .await
            .expect("set");
        assert_eq!(
            cache.incr_by_if_exists(&key, -40).await.expect("incr"),
            Some(60)
        );
        assert_eq!(cache.get(&key).await.expect("get").as_deref(), Some("60"));

        cache.del(std::slice::from_ref(&key)).await.expect("del");
        assert!(cache.get(&key).await.expect("get").is_none());
    }
}
