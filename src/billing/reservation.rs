use std::sync::Arc;
use std::time::Instant;

use super::settle::Finish;
use super::{QuotaEngine, SettleOutcome};
use crate::pricing::PriceData;
use crate::relay::info::RelayInfo;
use crate::types::Usage;

/// Request facts captured at admission; settlement never reads `RelayInfo`
/// again.
#[derive(Clone, Debug)]
pub(super) struct BillingContext {
    pub(super) request_id: String,
    pub(super) user_id: i64,
    pub(super) token_id: i64,
    pub(super) channel_id: i64,
    pub(super) token_name: String,
    pub(super) group: String,
    pub(super) origin_model_name: String,
    pub(super) upstream_model_name: String,
    pub(super) is_stream: bool,
    pub(super) is_playground: bool,
    pub(super) start_time: Instant,
    pub(super) price: PriceData,
    /// Balance observed at admission, before the reservation.
    pub(super) user_quota: i64,
    pub(super) amount: i64,
    pub(super) unlimited: bool,
}

/// Quota held for one admitted request.
///
/// Consumed by exactly one of [`settle`](Self::settle) or
/// [`refund`](Self::refund). If it is dropped first (cancelled future,
/// client disconnect, panic unwinding), a background task settles it as
/// zero usage so the request still gets its audit log.
#[derive(Debug)]
pub struct Reservation {
    engine: Arc<QuotaEngine>,
    context: Option<BillingContext>,
}

impl Reservation {
    pub(super) fn new(
        engine: Arc<QuotaEngine>,
        info: &RelayInfo,
        price: PriceData,
        amount: i64,
        unlimited: bool,
    ) -> Self {
        Self {
            engine,
            context: Some(BillingContext {
                request_id: info.request_id.clone(),
                user_id: info.user_id,
                token_id: info.token_id,
                channel_id: info.channel.id,
                token_name: info.token_name.clone(),
                group: info.group.clone(),
                origin_model_name: info.origin_model_name.clone(),
                upstream_model_name: info.upstream_model_name.clone(),
                is_stream: info.is_stream,
                is_playground: info.is_playground,
                start_time: info.start_time,
                price,
                user_quota: info.user_quota,
                amount,
                unlimited,
            }),
        }
    }

    /// Quota debited at admission.
    pub fn amount(&self) -> i64 {
        self.context.as_ref().map(|ctx| ctx.amount).unwrap_or(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.context.as_ref().is_some_and(|ctx| ctx.unlimited)
    }

    pub fn request_id(&self) -> &str {
        self.context
            .as_ref()
            .map(|ctx| ctx.request_id.as_str())
            .unwrap_or_default()
    }

    /// Reconciles the reservation against the actual usage and writes the
    /// consume log.
    pub async fn settle(mut self, usage: &Usage) -> SettleOutcome {
        match self.context.take() {
            Some(ctx) => self.engine.finish(ctx, Finish::Usage(usage.clone())).await,
            None => unreachable_outcome(),
        }
    }

    /// Returns the reservation to the user and token and writes a zero-charge
    /// log annotated with `reason`.
    pub async fn refund(mut self, reason: &str) -> SettleOutcome {
        match self.context.take() {
            Some(ctx) => {
                self.engine
                    .finish(ctx, Finish::Refund(reason.to_string()))
                    .await
            }
            None => unreachable_outcome(),
        }
    }
}

// `context` is only taken by the consuming methods above and by `drop`.
fn unreachable_outcome() -> SettleOutcome {
    SettleOutcome {
        state: super::BillingState::Unconsumed,
        quota: 0,
        delta: 0,
        log_id: None,
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let Some(ctx) = self.context.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::info!(
                    request_id = %ctx.request_id,
                    user_id = ctx.user_id,
                    "request abandoned before settlement"
                );
                let engine = self.engine.clone();
                handle.spawn(async move {
                    engine.finish(ctx, Finish::Abandoned).await;
                });
            }
            Err(_) => {
                tracing::error!(
                    request_id = %ctx.request_id,
                    user_id = ctx.user_id,
                    quota = ctx.amount,
                    "reservation dropped outside a runtime, left unsettled"
                );
            }
        }
    }
}
