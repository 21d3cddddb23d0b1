use serde_json::Value;

use super::adaptor::{ClientSink, RequestBody};
use super::info::{RelayInfo, RelayMode};
use super::{RelayEngine, RelayOutcome, require_model, resolve_adaptor};
use crate::error::{RelayError, Result};
use crate::token_count::count_text_tokens;
use crate::types::RerankRequest;

impl RelayEngine {
    pub async fn relay_rerank(
        &self,
        info: &mut RelayInfo,
        request: RerankRequest,
        sink: &mut dyn ClientSink,
    ) -> Result<RelayOutcome> {
        if request.query.trim().is_empty() {
            return Err(RelayError::invalid("invalid_query", "query is empty"));
        }
        if request.documents.is_empty() {
            return Err(RelayError::invalid("invalid_documents", "documents is empty"));
        }
        require_model(&request.model)?;
        info.relay_mode = RelayMode::Rerank;
        info.is_stream = false;
        info.set_model(&request.model);

        let adaptor = resolve_adaptor(info)?;
        let model = info.upstream_model_name.clone();
        info.prompt_tokens = request
            .documents
            .iter()
            .filter_map(Value::as_str)
            .fold(count_text_tokens(&model, &request.query), |acc, doc| {
                acc.saturating_add(count_text_tokens(&model, doc))
            });
        let estimate_tokens = info.prompt_tokens;
        let body = adaptor.convert_rerank_request(info, request)?;

        self.run(
            info,
            adaptor.as_ref(),
            RequestBody::Json(body),
            estimate_tokens,
            sink,
        )
        .await
    }
}
