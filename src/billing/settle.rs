use serde_json::{Value, json};

use super::reservation::BillingContext;
use super::{BillingState, QuotaEngine, SettleOutcome};
use crate::cache::QuotaLedger;
use crate::notify::{Notify, NotifyQueue, NotifyTarget};
use crate::pricing::QuotaInfo;
use crate::settings::RelaySettings;
use crate::store::ConsumeLog;
use crate::types::Usage;

pub(super) enum Finish {
    Usage(Usage),
    Refund(String),
    Abandoned,
}

impl QuotaEngine {
    /// Terminal transition of a reservation. Accounting failures are logged,
    /// never returned: by now the client already has its response.
    pub(super) async fn finish(&self, ctx: BillingContext, finish: Finish) -> SettleOutcome {
        let settings = self.settings.current();
        let usage = match &finish {
            Finish::Usage(usage) => usage.clone(),
            Finish::Refund(_) | Finish::Abandoned => Usage::default(),
        };
        let quota_info = QuotaInfo::from_usage(&usage, ctx.price);
        let mut content = ctx.price.describe();

        let (state, quota, delta) = match &finish {
            Finish::Refund(reason) => {
                content.push_str(&format!(" (refunded: {reason})"));
                self.apply_delta(&ctx, -ctx.amount).await;
                (BillingState::Refunded, 0, -ctx.amount)
            }
            Finish::Abandoned => {
                content.push_str(" (request aborted)");
                (BillingState::SettledZero, 0, 0)
            }
            Finish::Usage(usage) if usage.total_tokens == 0 => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    user_id = ctx.user_id,
                    channel_id = ctx.channel_id,
                    model = %ctx.origin_model_name,
                    "upstream reported zero usage, charging nothing"
                );
                content.push_str(" (possibly upstream timeout)");
                (BillingState::SettledZero, 0, 0)
            }
            Finish::Usage(_) => {
                if self.unlimited_now(&ctx).await {
                    content.push_str(" (unlimited quota)");
                    self.apply_delta(&ctx, -ctx.amount).await;
                    (BillingState::Settled, 0, -ctx.amount)
                } else {
                    let quota = quota_info.calculate_quota(settings.quota_per_unit);
                    let delta = quota - ctx.amount;
                    self.apply_delta(&ctx, delta).await;
                    (BillingState::Settled, quota, delta)
                }
            }
        };

        if state == BillingState::Settled {
            if let Err(err) = self
                .ledger
                .record_usage(ctx.user_id, ctx.channel_id, quota)
                .await
            {
                tracing::error!(
                    request_id = %ctx.request_id,
                    user_id = ctx.user_id,
                    channel_id = ctx.channel_id,
                    quota,
                    error = %err,
                    "failed to update usage counters"
                );
            }
        }

        let log_id = self
            .write_log(&ctx, &usage, &quota_info, quota, content)
            .await;

        tracing::info!(
            request_id = %ctx.request_id,
            user_id = ctx.user_id,
            token_id = ctx.token_id,
            channel_id = ctx.channel_id,
            model = %ctx.origin_model_name,
            quota,
            delta,
            state = ?state,
            "request settled"
        );

        if state == BillingState::Settled && quota > 0 {
            if let Some(notifier) = self.notifier.clone() {
                let ledger = self.ledger.clone();
                let spent = quota.saturating_add(ctx.amount);
                let user_id = ctx.user_id;
                let user_quota = ctx.user_quota;
                tokio::spawn(async move {
                    check_low_balance(ledger, notifier, settings, user_id, user_quota, spent).await;
                });
            }
        }

        SettleOutcome {
            state,
            quota,
            delta,
            log_id,
        }
    }

    /// Unlimited status may change mid-request, so it is read from the
    /// store rather than the cache.
    async fn unlimited_now(&self, ctx: &BillingContext) -> bool {
        match self.ledger.store().get_user(ctx.user_id).await {
            Ok(user) => user.unlimited_quota,
            Err(err) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    user_id = ctx.user_id,
                    error = %err,
                    "failed to re-read unlimited flag, using admission value"
                );
                ctx.unlimited
            }
        }
    }

    /// Positive `delta` debits user and token further; negative credits back.
    async fn apply_delta(&self, ctx: &BillingContext, delta: i64) {
        if delta == 0 {
            return;
        }
        if let Err(err) = self.ledger.adjust_user_quota(ctx.user_id, -delta).await {
            tracing::error!(
                request_id = %ctx.request_id,
                user_id = ctx.user_id,
                quota = delta,
                error = %err,
                "failed to adjust user quota"
            );
        }
        if ctx.is_playground {
            return;
        }
        if let Err(err) = self.ledger.adjust_token_quota(ctx.token_id, -delta).await {
            tracing::error!(
                request_id = %ctx.request_id,
                token_id = ctx.token_id,
                quota = delta,
                error = %err,
                "failed to adjust token quota"
            );
        }
    }

    async fn write_log(
        &self,
        ctx: &BillingContext,
        usage: &Usage,
        quota_info: &QuotaInfo,
        quota: i64,
        content: String,
    ) -> Option<i64> {
        let username = self.ledger.username(ctx.user_id).await.unwrap_or_default();
        let mut other = quota_info.other_info();
        if let Value::Object(map) = &mut other {
            map.insert("pre_consumed_quota".into(), json!(ctx.amount));
            map.insert(
                "upstream_model_name".into(),
                json!(ctx.upstream_model_name),
            );
            map.insert("request_id".into(), json!(ctx.request_id));
            if ctx.is_playground {
                map.insert("playground".into(), json!(true));
            }
        }
        let log = ConsumeLog {
            user_id: ctx.user_id,
            username,
            channel_id: ctx.channel_id,
            token_id: ctx.token_id,
            token_name: ctx.token_name.clone(),
            model_name: ctx.origin_model_name.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            quota,
            content,
            use_time_seconds: i64::try_from(ctx.start_time.elapsed().as_secs())
                .unwrap_or(i64::MAX),
            is_stream: ctx.is_stream,
            group: ctx.group.clone(),
            other,
            ..ConsumeLog::default()
        };
        match self.ledger.record_consume_log(&log).await {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::error!(
                    request_id = %ctx.request_id,
                    user_id = ctx.user_id,
                    quota,
                    error = %err,
                    "failed to record consume log"
                );
                None
            }
        }
    }
}

/// Warns the user while their balance net of this request sits below the
/// threshold. `spent` is the settled charge plus the reservation.
async fn check_low_balance(
    ledger: QuotaLedger,
    notifier: NotifyQueue,
    settings: std::sync::Arc<RelaySettings>,
    user_id: i64,
    user_quota: i64,
    spent: i64,
) {
    let user = match ledger.store().get_user(user_id).await {
        Ok(user) => user,
        Err(err) => {
            tracing::warn!(user_id, error = %err, "failed to load user for quota warning");
            return;
        }
    };
    let threshold = user
        .setting
        .quota_warning_threshold
        .unwrap_or(settings.quota_remind_threshold);
    if user_quota.saturating_sub(spent) >= threshold {
        return;
    }
    let topup_link = format!("{}/topup", settings.server_address.trim_end_matches('/'));
    let message = Notify::quota_exceed(
        "Your quota is about to run out",
        &settings.format_quota(user.quota),
        &topup_link,
    );
    notifier.submit(
        NotifyTarget {
            user_id,
            email: user.email.clone(),
            setting: user.setting.clone(),
        },
        message,
    );
}
