//! Two-phase quota accounting: reserve an estimate before dispatch, settle
//! the actual charge once usage is known.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::QuotaLedger;
use crate::error::{RelayError, Result};
use crate::notify::NotifyQueue;
use crate::pricing::PriceData;
use crate::relay::info::RelayInfo;
use crate::settings::SettingsHandle;

mod reservation;
mod settle;

pub use reservation::Reservation;

/// Per-request billing state machine.
///
/// `Unconsumed → PreConsumed → Settled | SettledZero | Refunded`, or
/// `Unconsumed → Rejected` when admission fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingState {
    #[default]
    Unconsumed,
    PreConsumed,
    Settled,
    SettledZero,
    Rejected,
    Refunded,
}

impl BillingState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Settled | Self::SettledZero | Self::Rejected | Self::Refunded
        )
    }
}

/// Result of the single settlement of a reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SettleOutcome {
    pub state: BillingState,
    /// Actual charge recorded in the consume log.
    pub quota: i64,
    /// Signed adjustment applied on top of the reservation; positive debits.
    pub delta: i64,
    /// `None` when the consume log could not be written.
    pub log_id: Option<i64>,
}

/// Quota accounting engine shared by every request.
#[derive(Clone, Debug)]
pub struct QuotaEngine {
    ledger: QuotaLedger,
    settings: SettingsHandle,
    notifier: Option<NotifyQueue>,
}

impl QuotaEngine {
    pub fn new(ledger: QuotaLedger, settings: SettingsHandle) -> Self {
        Self {
            ledger,
            settings,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: NotifyQueue) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    /// Resolves pricing once per request. A price already recorded on
    /// `info` is returned unchanged, so the mode can never switch between
    /// admission and settlement.
    pub fn resolve_price(&self, info: &mut RelayInfo) -> Result<PriceData> {
        if let Some(price) = info.price_data {
            return Ok(price);
        }
        let settings = self.settings.current();
        let price = PriceData::resolve(&settings, &info.origin_model_name, &info.group)?;
        info.price_data = Some(price);
        Ok(price)
    }

    /// Quota to reserve for a request expected to consume `tokens`.
    pub fn estimate(&self, price: &PriceData, tokens: u32) -> i64 {
        price.estimate(tokens, self.settings.current().quota_per_unit)
    }

    /// Admits the request by reserving `estimate` from the user balance and,
    /// outside the playground, from the token's remaining quota.
    ///
    /// Unlimited users are admitted with an empty reservation. The returned
    /// [`Reservation`] must be settled or refunded; dropping it settles the
    /// request in the background as zero usage.
    pub async fn pre_consume(
        self: &Arc<Self>,
        info: &mut RelayInfo,
        estimate: i64,
    ) -> Result<Reservation> {
        let price = self.resolve_price(info)?;
        let estimate = estimate.max(0);

        let unlimited = self.ledger.user_unlimited(info.user_id).await?;
        info.user_quota = self.ledger.user_quota(info.user_id).await?;
        if unlimited {
            tracing::debug!(
                request_id = %info.request_id,
                user_id = info.user_id,
                "unlimited user, skipping reservation"
            );
            info.billing_state = BillingState::PreConsumed;
            return Ok(Reservation::new(self.clone(), info, price, 0, true));
        }

        if info.user_quota < estimate {
            info.billing_state = BillingState::Rejected;
            return Err(insufficient_user_quota(info.user_quota, estimate));
        }

        if estimate > 0 {
            if self
                .ledger
                .try_reserve_user_quota(info.user_id, estimate)
                .await?
                .is_none()
            {
                info.billing_state = BillingState::Rejected;
                return Err(insufficient_user_quota(info.user_quota, estimate));
            }
            if !info.is_playground {
                let reserved = match self
                    .ledger
                    .try_reserve_token_quota(info.token_id, estimate)
                    .await
                {
                    Ok(reserved) => reserved,
                    Err(err) => {
                        self.release_user(info.user_id, estimate).await;
                        info.billing_state = BillingState::Rejected;
                        return Err(err.into());
                    }
                };
                if !reserved {
                    self.release_user(info.user_id, estimate).await;
                    info.billing_state = BillingState::Rejected;
                    return Err(RelayError::InsufficientQuota {
                        code: "insufficient_token_quota",
                        message: format!("token quota is not enough for {estimate}"),
                    });
                }
            }
        }

        tracing::debug!(
            request_id = %info.request_id,
            user_id = info.user_id,
            token_id = info.token_id,
            quota = estimate,
            "pre-consumed quota"
        );
        info.billing_state = BillingState::PreConsumed;
        Ok(Reservation::new(self.clone(), info, price, estimate, false))
    }

    async fn release_user(&self, user_id: i64, amount: i64) {
        if let Err(err) = self.ledger.adjust_user_quota(user_id, amount).await {
            tracing::error!(user_id, quota = amount, error = %err, "failed to release user reservation");
        }
    }
}

fn insufficient_user_quota(balance: i64, estimate: i64) -> RelayError {
    RelayError::InsufficientQuota {
        code: "insufficient_user_quota",
        message: format!("user quota {balance} is not enough for {estimate}"),
    }
}
