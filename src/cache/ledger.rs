use std::sync::Arc;
use std::time::Duration;

use super::{CacheKeys, KvCache, UserField};
use crate::settings::CacheSettings;
use crate::store::{ConsumeLog, QuotaStore, StoreError, UserRecord, UserStatus};

/// Balance and user-field access with the durable store as the source of
/// truth and an optional cache overlay.
///
/// Writes always go to the store first. Touched cache keys are then adjusted
/// in place or deleted, so a cache entry is never knowingly left stale.
/// Cache failures are logged and bypassed; with no cache configured every
/// call is a plain store call.
#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    cache: Option<Arc<dyn KvCache>>,
    keys: CacheKeys,
    user_ttl: Duration,
    status_ttl: Duration,
}

impl std::fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("cache_enabled", &self.cache.is_some())
            .field("keys", &self.keys)
            .field("user_ttl", &self.user_ttl)
            .field("status_ttl", &self.status_ttl)
            .finish_non_exhaustive()
    }
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        let defaults = CacheSettings::default();
        Self {
            store,
            cache: None,
            keys: CacheKeys::new(defaults.prefix),
            user_ttl: Duration::from_secs(defaults.user_ttl_secs),
            status_ttl: Duration::from_secs(defaults.status_ttl_secs),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn KvCache>, settings: &CacheSettings) -> Self {
        self.cache = Some(cache);
        self.keys = CacheKeys::new(settings.prefix.clone());
        self.user_ttl = Duration::from_secs(settings.user_ttl_secs);
        self.status_ttl = Duration::from_secs(settings.status_ttl_secs);
        self
    }

    pub fn store(&self) -> &Arc<dyn QuotaStore> {
        &self.store
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.is_some()
    }

    async fn cached(&self, key: &str) -> Option<String> {
        let cache = self.cache.as_ref()?;
        match cache.get(key).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(key, error = %err, "cache read failed, using store");
                None
            }
        }
    }

    /// Returns whether the entry was written.
    async fn fill(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let Some(cache) = self.cache.as_ref() else {
            return false;
        };
        match cache.set(key, value, ttl).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(key, error = %err, "cache fill failed");
                false
            }
        }
    }

    /// Fills a balance read from the store. A concurrent credit that found no
    /// key to increment would otherwise be missing from the entry until it
    /// expires, so the store is read once more and a moved balance drops the
    /// entry.
    async fn fill_balance<F, Fut>(
        &self,
        key: &str,
        read: i64,
        ttl: Duration,
        reread: F,
    ) -> Result<i64, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<i64, StoreError>>,
    {
        if !self.fill(key, &read.to_string(), ttl).await {
            return Ok(read);
        }
        let current = reread().await?;
        if current != read {
            tracing::debug!(key, read, current, "balance moved during fill, dropping entry");
            self.forget(&[key.to_string()]).await;
        }
        Ok(current)
    }

    async fn forget(&self, keys: &[String]) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        if let Err(err) = cache.del(keys).await {
            tracing::error!(?keys, error = %err, "cache invalidation failed");
        }
    }

    /// Mirrors a committed balance change into the cache.
    async fn apply_delta(&self, key: String, delta: i64) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        if let Err(err) = cache.incr_by_if_exists(&key, delta).await {
            tracing::warn!(key = %key, delta, error = %err, "cache increment failed, dropping entry");
            self.forget(std::slice::from_ref(&key)).await;
        }
    }

    fn field_ttl(&self, field: UserField) -> Duration {
        match field {
            UserField::Enabled => self.status_ttl,
            _ => self.user_ttl,
        }
    }

    async fn user_field(
        &self,
        id: i64,
        field: UserField,
        render: impl FnOnce(&UserRecord) -> String,
    ) -> Result<String, StoreError> {
        let key = self.keys.user(id, field);
        if let Some(value) = self.cached(&key).await {
            return Ok(value);
        }
        let user = self.store.get_user(id).await?;
        let value = render(&user);
        self.fill(&key, &value, self.field_ttl(field)).await;
        Ok(value)
    }

    /// Current balance, cache first. An unparsable entry is overwritten from
    /// the store.
    pub async fn user_quota(&self, id: i64) -> Result<i64, StoreError> {
        let key = self.keys.user(id, UserField::Quota);
        if let Some(quota) = self.cached(&key).await.and_then(|raw| raw.parse().ok()) {
            return Ok(quota);
        }
        let quota = self.store.get_user(id).await?.quota;
        self.fill_balance(&key, quota, self.user_ttl, || async {
            self.store.get_user(id).await.map(|user| user.quota)
        })
        .await
    }

    pub async fn user_unlimited(&self, id: i64) -> Result<bool, StoreError> {
        let raw = self
            .user_field(id, UserField::UnlimitedQuota, |user| {
                flag(user.unlimited_quota).to_string()
            })
            .await?;
        Ok(raw == "1")
    }

    pub async fn user_group(&self, id: i64) -> Result<String, StoreError> {
        self.user_field(id, UserField::Group, |user| user.group.clone())
            .await
    }

    pub async fn user_enabled(&self, id: i64) -> Result<bool, StoreError> {
        let raw = self
            .user_field(id, UserField::Enabled, |user| {
                flag(user.status == UserStatus::Enabled).to_string()
            })
            .await?;
        Ok(raw == "1")
    }

    pub async fn username(&self, id: i64) -> Result<String, StoreError> {
        self.user_field(id, UserField::Username, |user| user.username.clone())
            .await
    }

    /// Full user record straight from the store (email, settings).
    pub async fn user_record(&self, id: i64) -> Result<UserRecord, StoreError> {
        self.store.get_user(id).await
    }

    pub async fn token_remain_quota(&self, id: i64) -> Result<i64, StoreError> {
        let key = self.keys.token_remain_quota(id);
        if let Some(quota) = self.cached(&key).await.and_then(|raw| raw.parse().ok()) {
            return Ok(quota);
        }
        let remain = self.store.get_token(id).await?.remain_quota;
        self.fill_balance(&key, remain, self.user_ttl, || async {
            self.store.get_token(id).await.map(|token| token.remain_quota)
        })
        .await
    }

    /// Signed balance change: positive credits, negative debits.
    pub async fn adjust_user_quota(&self, id: i64, delta: i64) -> Result<i64, StoreError> {
        if delta == 0 {
            return self.user_quota(id).await;
        }
        let quota = self.store.adjust_user_quota(id, delta).await?;
        self.apply_delta(self.keys.user(id, UserField::Quota), delta)
            .await;
        Ok(quota)
    }

    /// Debits `amount` only if the durable balance covers it.
    pub async fn try_reserve_user_quota(
        &self,
        id: i64,
        amount: i64,
    ) -> Result<Option<i64>, StoreError> {
        let key = self.keys.user(id, UserField::Quota);
        match self.store.try_decrease_user_quota(id, amount).await? {
            Some(quota) => {
                self.apply_delta(key, -amount).await;
                Ok(Some(quota))
            }
            None => {
                // The cached balance admitted a request the store refused.
                self.forget(&[key]).await;
                Ok(None)
            }
        }
    }

    pub async fn adjust_token_quota(&self, id: i64, delta: i64) -> Result<(), StoreError> {
        if delta == 0 {
            return Ok(());
        }
        self.store.adjust_token_quota(id, delta).await?;
        self.apply_delta(self.keys.token_remain_quota(id), delta)
            .await;
        Ok(())
    }

    pub async fn try_reserve_token_quota(&self, id: i64, amount: i64) -> Result<bool, StoreError> {
        let key = self.keys.token_remain_quota(id);
        if self.store.try_decrease_token_quota(id, amount).await? {
            self.apply_delta(key, -amount).await;
            Ok(true)
        } else {
            self.forget(&[key]).await;
            Ok(false)
        }
    }

    /// Monotonic counters: user used quota and request count, channel used
    /// quota. Both take the actual charge, not a delta.
    pub async fn record_usage(
        &self,
        user_id: i64,
        channel_id: i64,
        quota: i64,
    ) -> Result<(), StoreError> {
        self.store
            .update_user_used_quota_and_request_count(user_id, quota)
            .await?;
        self.store.update_channel_used_quota(channel_id, quota).await
    }

    pub async fn record_consume_log(&self, log: &ConsumeLog) -> Result<i64, StoreError> {
        self.store.record_consume_log(log).await
    }

    pub async fn set_user_group(&self, id: i64, group: &str) -> Result<(), StoreError> {
        self.store.set_user_group(id, group).await?;
        let key = self.keys.user(id, UserField::Group);
        if self.cache.is_some() && !self.fill(&key, group, self.user_ttl).await {
            self.forget(&[key]).await;
        }
        Ok(())
    }

    pub async fn set_user_status(&self, id: i64, status: UserStatus) -> Result<(), StoreError> {
        self.store.set_user_status(id, status).await?;
        self.forget(&[self.keys.user(id, UserField::Enabled)]).await;
        Ok(())
    }

    pub async fn set_user_unlimited(&self, id: i64, unlimited: bool) -> Result<(), StoreError> {
        self.store.set_user_unlimited(id, unlimited).await?;
        self.forget(&[self.keys.user(id, UserField::UnlimitedQuota)])
            .await;
        Ok(())
    }

    pub async fn invalidate_user(&self, id: i64) {
        self.forget(&self.keys.all_user(id)).await;
    }

    /// Rewrites every cached user field from the durable record.
    pub async fn refresh_user(&self, id: i64) -> Result<UserRecord, StoreError> {
        let user = self.store.get_user(id).await?;
        if self.cache.is_none() {
            return Ok(user);
        }
        let fields = [
            (UserField::Quota, user.quota.to_string()),
            (UserField::Group, user.group.clone()),
            (
                UserField::Enabled,
                flag(user.status == UserStatus::Enabled).to_string(),
            ),
            (UserField::Username, user.username.clone()),
            (
                UserField::UnlimitedQuota,
                flag(user.unlimited_quota).to_string(),
            ),
        ];
        for (field, value) in fields {
            self.fill(&self.keys.user(id, field), &value, self.field_ttl(field))
                .await;
        }
        Ok(user)
    }
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use crate::cache::{CacheError, MemoryCache};
    use crate::store::{MemoryStore, TokenRecord};

    /// Accepts reads and deletes but refuses every write.
    #[derive(Default)]
    struct ReadOnlyCache {
        inner: MemoryCache,
    }

    #[async_trait]
    impl KvCache for ReadOnlyCache {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            })
        }

        async fn incr_by_if_exists(
            &self,
            key: &str,
            delta: i64,
        ) -> Result<Option<i64>, CacheError> {
            self.inner.incr_by_if_exists(key, delta).await
        }

        async fn del(&self, keys: &[String]) -> Result<(), CacheError> {
            self.inner.del(keys).await
        }
    }

    /// Credits the user in the store, bypassing the cache, just before the
    /// first write lands.
    struct CreditDuringFill {
        inner: MemoryCache,
        store: Arc<MemoryStore>,
        credited: AtomicBool,
    }

    #[async_trait]
    impl KvCache for CreditDuringFill {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
            if !self.credited.swap(true, Ordering::SeqCst) {
                self.store
                    .adjust_user_quota(1, 500)
                    .await
                    .expect("concurrent credit");
            }
            self.inner.set(key, value, ttl).await
        }

        async fn incr_by_if_exists(
            &self,
            key: &str,
            delta: i64,
        ) -> Result<Option<i64>, CacheError> {
            self.inner.incr_by_if_exists(key, delta).await
        }

        async fn del(&self, keys: &[String]) -> Result<(), CacheError> {
            self.inner.del(keys).await
        }
    }

    async fn ledger_with_cache() -> (QuotaLedger, Arc<MemoryCache>) {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_user(&UserRecord::new(1, "alice", 1_000))
            .await
            .expect("user");
        store
            .insert_token(&TokenRecord::new(10, 1, 500))
            .await
            .expect("token");
        let cache = Arc::new(MemoryCache::new());
        let ledger = QuotaLedger::new(store).with_cache(cache.clone(), &CacheSettings::default());
        (ledger, cache)
    }

    #[tokio::test]
    async fn reads_fill_the_cache_and_writes_adjust_it() {
        let (ledger, cache) = ledger_with_cache().await;
        let key = "quota-relay:user:1:quota";

        assert_eq!(ledger.user_quota(1).await.expect("quota"), 1_000);
        assert_eq!(cache.get(key).await.expect("get").as_deref(), Some("1000"));

        ledger.adjust_user_quota(1, -100).await.expect("debit");
        assert_eq!(cache.get(key).await.expect("get").as_deref(), Some("900"));
        assert_eq!(ledger.store().get_user(1).await.expect("user").quota, 900);
    }

    #[tokio::test]
    async fn refused_reservation_drops_stale_balance() {
        let (ledger, cache) = ledger_with_cache().await;
        let key = "quota-relay:user:1:quota";
        cache
            .set(key, "5000", Duration::from_secs(60))
            .await
            .expect("stale");

        assert_eq!(
            ledger.try_reserve_user_quota(1, 2_000).await.expect("reserve"),
            None
        );
        assert!(cache.get(key).await.expect("get").is_none());
        assert_eq!(ledger.user_quota(1).await.expect("quota"), 1_000);
    }

    #[tokio::test]
    async fn flag_changes_invalidate_cached_fields() {
        let (ledger, cache) = ledger_with_cache().await;
        assert!(!ledger.user_unlimited(1).await.expect("unlimited"));
        assert!(ledger.user_enabled(1).await.expect("enabled"));

        ledger.set_user_unlimited(1, true).await.expect("set");
        ledger
            .set_user_status(1, UserStatus::Disabled)
            .await
            .expect("status");
        assert!(ledger.user_unlimited(1).await.expect("unlimited"));
        assert!(!ledger.user_enabled(1).await.expect("enabled"));

        ledger.refresh_user(1).await.expect("refresh");
        assert!(cache.len().await >= 5);
        ledger.invalidate_user(1).await;
        assert!(
            cache
                .get("quota-relay:user:1:username")
                .await
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn token_reservations_track_remaining_quota() {
        let (ledger, _cache) = ledger_with_cache().await;
        assert_eq!(ledger.token_remain_quota(10).await.expect("remain"), 500);
        assert!(ledger.try_reserve_token_quota(10, 200).await.expect("reserve"));
        assert_eq!(ledger.token_remain_quota(10).await.expect("remain"), 300);
        assert!(!ledger.try_reserve_token_quota(10, 301).await.expect("reserve"));
        ledger.adjust_token_quota(10, 50).await.expect("refund");
        assert_eq!(ledger.token_remain_quota(10).await.expect("remain"), 350);
    }

    #[tokio::test]
    async fn without_cache_everything_hits_the_store() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_user(&UserRecord::new(1, "alice", 10))
            .await
            .expect("user");
        let ledger = QuotaLedger::new(store);
        assert!(!ledger.cache_enabled());
        ledger.adjust_user_quota(1, 5).await.expect("credit");
        assert_eq!(ledger.user_quota(1).await.expect("quota"), 15);
        assert_eq!(ledger.username(1).await.expect("name"), "alice");
        assert_eq!(ledger.user_group(1).await.expect("group"), "default");
    }

    #[tokio::test]
    async fn failed_group_write_drops_the_old_entry() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_user(&UserRecord::new(1, "alice", 10))
            .await
            .expect("user");
        let cache = Arc::new(ReadOnlyCache::default());
        let key = "quota-relay:user:1:group";
        cache
            .inner
            .set(key, "default", Duration::from_secs(60))
            .await
            .expect("seed");
        let ledger = QuotaLedger::new(store).with_cache(cache.clone(), &CacheSettings::default());

        ledger.set_user_group(1, "vip").await.expect("group");
        assert!(cache.inner.get(key).await.expect("get").is_none());
        assert_eq!(ledger.user_group(1).await.expect("group"), "vip");
    }

    #[tokio::test]
    async fn credit_racing_a_cold_fill_is_not_lost() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_user(&UserRecord::new(1, "alice", 1_000))
            .await
            .expect("user");
        let cache = Arc::new(CreditDuringFill {
            inner: MemoryCache::new(),
            store: store.clone(),
            credited: AtomicBool::new(false),
        });
        let ledger =
            QuotaLedger::new(store.clone()).with_cache(cache.clone(), &CacheSettings::default());

        assert_eq!(ledger.user_quota(1).await.expect("quota"), 1_500);
        assert!(
            cache
                .inner
                .get("quota-relay:user:1:quota")
                .await
                .expect("get")
                .is_none()
        );
        assert_eq!(ledger.user_quota(1).await.expect("quota"), 1_500);
        assert_eq!(
            cache
                .inner
                .get("quota-relay:user:1:quota")
                .await
                .expect("get")
                .as_deref(),
            Some("1500")
        );
    }
}
