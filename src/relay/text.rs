use serde_json::Value;

use super::adaptor::{ClientSink, RequestBody};
use super::info::{RelayInfo, RelayMode};
use super::{RelayEngine, RelayOutcome, require_model, resolve_adaptor};
use crate::error::{RelayError, Result};
use crate::token_count::{count_messages_tokens, count_text_tokens, count_value_tokens};
use crate::types::{ChatRequest, EmbeddingRequest, ImageRequest};

/// Canonical requests handled by [`RelayEngine::relay_text`].
#[derive(Clone, Debug)]
pub enum TextRequest {
    Chat(ChatRequest),
    Embedding(EmbeddingRequest),
    Image(ImageRequest),
}

impl TextRequest {
    fn model(&self) -> &str {
        match self {
            Self::Chat(request) => &request.model,
            Self::Embedding(request) => &request.model,
            Self::Image(request) => &request.model,
        }
    }

    fn relay_mode(&self) -> RelayMode {
        match self {
            Self::Chat(_) => RelayMode::ChatCompletions,
            Self::Embedding(_) => RelayMode::Embeddings,
            Self::Image(_) => RelayMode::ImagesGenerations,
        }
    }

    fn validate(&self) -> Result<()> {
        require_model(self.model())?;
        match self {
            Self::Chat(request) if request.messages.is_empty() => Err(RelayError::invalid(
                "invalid_request",
                "messages is required",
            )),
            Self::Embedding(request) if is_empty_input(&request.input) => Err(
                RelayError::invalid("invalid_request", "input is required"),
            ),
            Self::Image(request) if request.prompt.trim().is_empty() => Err(
                RelayError::invalid("invalid_request", "prompt is required"),
            ),
            _ => Ok(()),
        }
    }
}

fn is_empty_input(input: &Value) -> bool {
    match input {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

impl RelayEngine {
    /// Chat completions, embeddings and image generation.
    ///
    /// Chat reserves prompt tokens plus `max_tokens`; without `max_tokens`
    /// it reserves the larger of the prompt and the configured default.
    pub async fn relay_text(
        &self,
        info: &mut RelayInfo,
        request: TextRequest,
        sink: &mut dyn ClientSink,
    ) -> Result<RelayOutcome> {
        request.validate()?;
        info.relay_mode = request.relay_mode();
        info.set_model(request.model());

        let adaptor = resolve_adaptor(info)?;
        let default_tokens = self.default_estimate_tokens();
        let model = info.upstream_model_name.clone();

        let (body, estimate_tokens) = match request {
            TextRequest::Chat(request) => {
                info.is_stream = request.stream;
                info.prompt_tokens = count_messages_tokens(&model, &request.messages);
                let estimate = match request.max_tokens {
                    Some(max_tokens) => info.prompt_tokens.saturating_add(max_tokens),
                    None => info.prompt_tokens.max(default_tokens),
                };
                (adaptor.convert_chat_request(info, request)?, estimate)
            }
            TextRequest::Embedding(request) => {
                info.prompt_tokens = count_value_tokens(&model, &request.input);
                let estimate = info.prompt_tokens;
                (adaptor.convert_embedding_request(info, request)?, estimate)
            }
            TextRequest::Image(request) => {
                info.prompt_tokens = count_text_tokens(&model, &request.prompt);
                let estimate = info
                    .prompt_tokens
                    .saturating_mul(request.n.unwrap_or(1).max(1));
                (adaptor.convert_image_request(info, request)?, estimate)
            }
        };

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
