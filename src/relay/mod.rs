//! Request lifecycle: validate, convert, reserve, dispatch, settle.

use std::sync::Arc;

use crate::billing::{QuotaEngine, SettleOutcome};
use crate::error::{RelayError, Result};
use crate::types::Usage;
use crate::utils::http::relay_error_from_response;

pub mod adaptor;
pub mod channel;
pub mod info;

mod audio;
mod realtime;
mod rerank;
mod text;

pub use adaptor::{
    Adaptor, BufferSink, ChannelSink, ClientSink, RequestBody, SinkClosed, adaptor_for,
};
pub use info::{ApiType, ChannelMeta, RelayInfo, RelayMode};
pub use text::TextRequest;

/// What a completed relay produced and how it was billed.
#[derive(Clone, Debug, PartialEq)]
pub struct RelayOutcome {
    pub usage: Usage,
    pub settle: SettleOutcome,
}

/// Entry point for every relay mode. One instance is shared by all requests.
#[derive(Clone, Debug)]
pub struct RelayEngine {
    quota: Arc<QuotaEngine>,
    client: reqwest::Client,
}

impl RelayEngine {
    pub fn new(quota: Arc<QuotaEngine>) -> Self {
        Self {
            quota,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn quota(&self) -> &Arc<QuotaEngine> {
        &self.quota
    }

    fn default_estimate_tokens(&self) -> u32 {
        self.quota.settings().current().pre_consumed_quota
    }

    /// Shared tail of the HTTP relay flows: price, reserve, dispatch and
    /// settle. Everything before this point is free of quota side effects.
    async fn run(
        &self,
        info: &mut RelayInfo,
        adaptor: &dyn Adaptor,
        body: RequestBody,
        estimate_tokens: u32,
        sink: &mut dyn ClientSink,
    ) -> Result<RelayOutcome> {
        let price = self.quota.resolve_price(info)?;
        let estimate = self.quota.estimate(&price, estimate_tokens);
        let reservation = self.quota.pre_consume(info, estimate).await?;

        let response = match adaptor.do_request(&self.client, info, body).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    request_id = %info.request_id,
                    channel_id = info.channel.id,
                    error = %err,
                    "upstream request failed"
                );
                let outcome = reservation.refund(&err.to_string()).await;
                info.billing_state = outcome.state;
                return Err(err);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let mut err = relay_error_from_response(response).await;
            err.remap_status(&info.channel.status_code_mapping);
            tracing::warn!(
                request_id = %info.request_id,
                channel_id = info.channel.id,
                status = status.as_u16(),
                error = %err,
                "upstream returned an error status"
            );
            let outcome = reservation
                .refund(&format!("upstream status {}", status.as_u16()))
                .await;
            info.billing_state = outcome.state;
            return Err(err);
        }

        let usage = match adaptor.do_response(response, info, sink).await {
            Ok(usage) => usage,
            Err(err) => {
                tracing::warn!(
                    request_id = %info.request_id,
                    channel_id = info.channel.id,
                    error = %err,
                    "failed to handle upstream response"
                );
                // Upstream may already have billed us; keep the reservation.
                let outcome = reservation.settle(&Usage::default()).await;
                info.billing_state = outcome.state;
                return Err(err);
            }
        };

        let settle = reservation.settle(&usage).await;
        info.billing_state = settle.state;
        Ok(RelayOutcome { usage, settle })
    }
}

fn resolve_adaptor(info: &RelayInfo) -> Result<Box<dyn Adaptor>> {
    let mut adaptor = adaptor_for(info.channel.api_type).ok_or_else(|| {
        RelayError::invalid(
            "invalid_api_type",
            format!("api type {:?} is not enabled", info.channel.api_type),
        )
    })?;
    adaptor.init(info);
    Ok(adaptor)
}

fn require_model(model: &str) -> Result<()> {
    if model.trim().is_empty() {
        return Err(RelayError::invalid("invalid_request", "model is required"));
    }
    Ok(())
}
