use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    ChannelRecord, ConsumeLog, QuotaStore, StoreError, TokenRecord, UserRecord, UserStatus,
    now_millis,
};

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<i64, UserRecord>,
    tokens: HashMap<i64, TokenRecord>,
    channels: HashMap<i64, ChannelRecord>,
    logs: Vec<ConsumeLog>,
}

/// Process-local store. Every operation runs under one lock, which gives
/// the same atomicity as a single-statement SQL update.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn user_mut(state: &mut MemoryState, id: i64) -> Result<&mut UserRecord, StoreError> {
    state
        .users
        .get_mut(&id)
        .ok_or(StoreError::NotFound { entity: "user", id })
}

fn token_mut(state: &mut MemoryState, id: i64) -> Result<&mut TokenRecord, StoreError> {
    state
        .tokens
        .get_mut(&id)
        .ok_or(StoreError::NotFound { entity: "token", id })
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn get_user(&self, id: i64) -> Result<UserRecord, StoreError> {
        let mut state = self.state.lock().await;
        user_mut(&mut state, id).map(|user| user.clone())
    }

    async fn get_token(&self, id: i64) -> Result<TokenRecord, StoreError> {
        let mut state = self.state.lock().await;
        token_mut(&mut state, id).map(|token| token.clone())
    }

    async fn get_channel(&self, id: i64) -> Result<ChannelRecord, StoreError> {
        let state = self.state.lock().await;
        state
            .channels
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "channel",
                id,
            })
    }

    async fn insert_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn insert_token(&self, token: &TokenRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn insert_channel(&self, channel: &ChannelRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.channels.insert(channel.id, channel.clone());
        Ok(())
    }

    async fn adjust_user_quota(&self, id: i64, delta: i64) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let user = user_mut(&mut state, id)?;
        user.quota = user.quota.saturating_add(delta);
        Ok(user.quota)
    }

    async fn try_decrease_user_quota(
        &self,
        id: i64,
        amount: i64,
    ) -> Result<Option<i64>, StoreError> {
        let mut state = self.state.lock().await;
        let user = user_mut(&mut state, id)?;
        if user.quota < amount {
            return Ok(None);
        }
        user.quota -= amount;
        Ok(Some(user.quota))
    }

    async fn adjust_token_quota(&self, id: i64, delta: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let token = token_mut(&mut state, id)?;
        token.remain_quota = token.remain_quota.saturating_add(delta);
        token.used_quota = token.used_quota.saturating_sub(delta);
        Ok(())
    }

    async fn try_decrease_token_quota(&self, id: i64, amount: i64) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let token = token_mut(&mut state, id)?;
        if !token.unlimited_quota && token.remain_quota < amount {
            return Ok(false);
        }
        token.remain_quota -= amount;
        token.used_quota = token.used_quota.saturating_add(amount);
        Ok(true)
    }

    async fn update_user_used_quota_and_request_count(
        &self,
        id: i64,
        quota: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let user = user_mut(&mut state, id)?;
        user.used_quota = user.used_quota.saturating_add(quota);
        user.request_count = user.request_count.saturating_add(1);
        Ok(())
    }

    async fn update_channel_used_quota(&self, id: i64, quota: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let channel = state
            .channels
            .entry(id)
            .or_insert_with(|| ChannelRecord {
                id,
                ..ChannelRecord::default()
            });
        channel.used_quota = channel.used_quota.saturating_add(quota);
        Ok(())
    }

    async fn set_user_group(&self, id: i64, group: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        user_mut(&mut state, id)?.group = group.to_string();
        Ok(())
    }

    async fn set_user_status(&self, id: i64, status: UserStatus) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        user_mut(&mut state, id)?.status = status;
        Ok(())
    }

    async fn set_user_unlimited(&self, id: i64, unlimited: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        user_mut(&mut state, id)?.unlimited_quota = unlimited;
        Ok(())
    }

    async fn record_consume_log(&self, log: &ConsumeLog) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let id = i64::try_from(state.logs.len()).unwrap_or(i64::MAX - 1) + 1;
        let mut log = log.clone();
        log.id = id;
        if log.created_at == 0 {
            log.created_at = now_millis();
        }
        state.logs.push(log);
        Ok(id)
    }

    async fn list_consume_logs(
        &self,
        user_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ConsumeLog>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .logs
            .iter()
            .rev()
            .filter(|log| user_id.is_none_or(|id| log.user_id == id))
            .take(limit)
            .cloned()
            .collect())
    }
}
