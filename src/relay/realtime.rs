use futures_util::stream::BoxStream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::adaptor::ClientSink;
use super::info::{RelayInfo, RelayMode};
use super::{RelayEngine, RelayOutcome, require_model, resolve_adaptor};
use crate::error::Result;

impl RelayEngine {
    /// One websocket session, settled once when the upstream ends or
    /// `cancel` fires. Partial usage from completed responses is billed.
    pub async fn relay_realtime(
        &self,
        info: &mut RelayInfo,
        model: &str,
        upstream: BoxStream<'static, Result<Value>>,
        sink: &mut dyn ClientSink,
        cancel: CancellationToken,
    ) -> Result<RelayOutcome> {
        require_model(model)?;
        info.relay_mode = RelayMode::Realtime;
        info.is_stream = true;
        info.set_model(model);

        let adaptor = resolve_adaptor(info)?;
        let price = self.quota.resolve_price(info)?;
        let estimate = self.quota.estimate(&price, self.default_estimate_tokens());
        let reservation = self.quota.pre_consume(info, estimate).await?;

        let usage = match adaptor.do_realtime(info, upstream, sink, cancel).await {
            Ok(usage) => usage,
            Err(err) => {
                tracing::warn!(
                    request_id = %info.request_id,
                    channel_id = info.channel.id,
                    error = %err,
                    "realtime session failed"
                );
                let outcome = reservation.refund(&err.to_string()).await;
                info.billing_state = outcome.state;
                return Err(err);
            }
        };

        let settle = reservation.settle(&usage).await;
        info.billing_state = settle.state;
        tracing::info!(
            request_id = %info.request_id,
            user_id = info.user_id,
            total_tokens = usage.total_tokens,
            "realtime session closed"
        );
        Ok(RelayOutcome { usage, settle })
    }
}
