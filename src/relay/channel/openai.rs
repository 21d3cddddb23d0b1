use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};
use crate::relay::adaptor::{Adaptor, ClientSink, RequestBody};
use crate::relay::info::{RelayInfo, RelayMode};
use crate::token_count::count_text_tokens;
use crate::types::{AudioRequest, ChatRequest, EmbeddingRequest, ImageRequest, RerankRequest, Usage};
use crate::utils::http::read_body_limited;
use crate::utils::sse::{DONE_FRAME, data_frame, sse_data_stream_from_response};

const MODELS: &[&str] = &[
    "gpt-4o",
    "gpt-4o-mini",
    "gpt-4.1",
    "text-embedding-3-small",
    "text-embedding-3-large",
    "dall-e-3",
    "tts-1",
    "whisper-1",
    "gpt-4o-realtime-preview",
];

/// OpenAI wire protocol, also spoken by most compatible upstreams.
#[derive(Clone, Debug, Default)]
pub struct OpenAiAdaptor;

#[async_trait]
impl Adaptor for OpenAiAdaptor {
    fn request_url(&self, info: &RelayInfo) -> Result<String> {
        Ok(format!("{}{}", info.channel.base_url(), info.relay_mode.path()))
    }

    fn setup_request_headers(
        &self,
        request: reqwest::RequestBuilder,
        info: &RelayInfo,
    ) -> Result<reqwest::RequestBuilder> {
        if info.channel.api_key.is_empty() {
            return Ok(request);
        }
        Ok(request.bearer_auth(&info.channel.api_key))
    }

    fn convert_chat_request(&self, info: &RelayInfo, mut request: ChatRequest) -> Result<Value> {
        request.model = info.upstream_model_name.clone();
        request.stream = info.is_stream;
        let mut body = serde_json::to_value(request)?;
        if info.is_stream {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("stream_options".into(), json!({"include_usage": true}));
            }
        }
        Ok(body)
    }

    fn convert_embedding_request(
        &self,
        info: &RelayInfo,
        mut request: EmbeddingRequest,
    ) -> Result<Value> {
        request.model = info.upstream_model_name.clone();
        Ok(serde_json::to_value(request)?)
    }

    fn convert_image_request(&self, info: &RelayInfo, mut request: ImageRequest) -> Result<Value> {
        request.model = info.upstream_model_name.clone();
        Ok(serde_json::to_value(request)?)
    }

    fn convert_audio_request(&self, info: &RelayInfo, request: AudioRequest) -> Result<RequestBody> {
        let model = info.upstream_model_name.clone();
        if info.relay_mode == RelayMode::AudioSpeech {
            let mut body = json!({"model": model, "input": request.input});
            if let Some(obj) = body.as_object_mut() {
                if let Some(voice) = request.voice {
                    obj.insert("voice".into(), json!(voice));
                }
                if let Some(format) = request.response_format {
                    obj.insert("response_format".into(), json!(format));
                }
                if let Some(speed) = request.speed {
                    obj.insert("speed".into(), json!(speed));
                }
            }
            return Ok(RequestBody::Json(body));
        }

        let Some(file) = request.file else {
            return Err(RelayError::invalid("invalid_request", "file is required"));
        };
        let mut part = reqwest::multipart::Part::bytes(file.bytes.to_vec()).file_name(file.filename);
        if let Some(content_type) = file.content_type.as_deref() {
            part = part.mime_str(content_type)?;
        }
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", model)
            .text(
                "response_format",
                request.response_format.unwrap_or_else(|| "json".to_string()),
            );
        if let Some(language) = request.language {
            form = form.text("language", language);
        }
        if let Some(prompt) = request.prompt {
            form = form.text("prompt", prompt);
        }
        Ok(RequestBody::Multipart(form))
    }

    fn convert_rerank_request(&self, info: &RelayInfo, mut request: RerankRequest) -> Result<Value> {
        request.model = info.upstream_model_name.clone();
        Ok(serde_json::to_value(request)?)
    }

    async fn do_response(
        &self,
        response: reqwest::Response,
        info: &RelayInfo,
        sink: &mut dyn ClientSink,
    ) -> Result<Usage> {
        match info.relay_mode {
            RelayMode::ChatCompletions if info.is_stream => {
                handle_chat_stream(response, info, sink).await
            }
            RelayMode::ChatCompletions => handle_chat_response(response, info, sink).await,
            RelayMode::AudioSpeech => handle_speech_response(response, info, sink).await,
            RelayMode::AudioTranscription | RelayMode::AudioTranslation => {
                handle_transcription_response(response, info, sink).await
            }
            RelayMode::Rerank => handle_rerank_response(response, info, sink).await,
            RelayMode::Embeddings | RelayMode::ImagesGenerations | RelayMode::Realtime => {
                handle_prompt_only_response(response, info, sink).await
            }
        }
    }

    async fn do_realtime(
        &self,
        _info: &RelayInfo,
        mut upstream: BoxStream<'static, Result<Value>>,
        sink: &mut dyn ClientSink,
        cancel: CancellationToken,
    ) -> Result<Usage> {
        let mut usage = Usage::default();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                next = upstream.next() => match next {
                    None => break,
                    Some(Ok(event)) => event,
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "realtime upstream failed");
                        break;
                    }
                },
            };
            if event.get("type").and_then(Value::as_str) == Some("response.done") {
                if let Some(done) = event
                    .pointer("/response/usage")
                    .and_then(Usage::from_openai_value)
                {
                    usage.accumulate(&done);
                }
            }
            if sink.send(Bytes::from(serde_json::to_vec(&event)?)).await.is_err() {
                break;
            }
        }
        Ok(usage)
    }

    fn model_list(&self) -> &'static [&'static str] {
        MODELS
    }

    fn channel_name(&self) -> &'static str {
        "openai"
    }
}

/// Upstream usage, or prompt tokens plus counted completion text when the
/// upstream reported nothing.
fn usage_or_counted(reported: Option<Usage>, info: &RelayInfo, completion_text: &str) -> Usage {
    match reported {
        Some(usage) if usage.total_tokens > 0 => usage,
        _ => Usage::from_counts(
            info.prompt_tokens,
            count_text_tokens(&info.upstream_model_name, completion_text),
        ),
    }
}

fn choice_text(body: &Value, pointer: &str) -> String {
    body.get("choices")
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .filter_map(|choice| choice.pointer(pointer).and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

async fn deliver(sink: &mut dyn ClientSink, chunk: Bytes, info: &RelayInfo) {
    if sink.send(chunk).await.is_err() {
        tracing::debug!(request_id = %info.request_id, "client disconnected before body was delivered");
    }
}

pub(crate) async fn handle_chat_response(
    response: reqwest::Response,
    info: &RelayInfo,
    sink: &mut dyn ClientSink,
) -> Result<Usage> {
    let body = read_body_limited(response).await?;
    let parsed: Value = serde_json::from_slice(&body)
        .map_err(|err| RelayError::InvalidResponse(format!("invalid chat response: {err}")))?;
    let reported = parsed.get("usage").and_then(Usage::from_openai_value);
    let usage = usage_or_counted(reported, info, &choice_text(&parsed, "/message/content"));
    deliver(sink, body, info).await;
    Ok(usage)
}

/// Forwards SSE frames until upstream ends or the client leaves. Usage
/// comes from the final chunk when the upstream includes it.
pub(crate) async fn handle_chat_stream(
    response: reqwest::Response,
    info: &RelayInfo,
    sink: &mut dyn ClientSink,
) -> Result<Usage> {
    let mut data = sse_data_stream_from_response(response);
    let mut reported = None;
    let mut text = String::new();
    let mut client_open = true;

    while let Some(item) = data.next().await {
        let payload = match item {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(request_id = %info.request_id, error = %err, "upstream stream broke");
                break;
            }
        };
        if let Ok(chunk) = serde_json::from_str::<Value>(&payload) {
            if let Some(usage) = chunk.get("usage").and_then(Usage::from_openai_value) {
                reported = Some(usage);
            }
            text.push_str(&choice_text(&chunk, "/delta/content"));
        }
        if sink.send(data_frame(&payload)).await.is_err() {
            tracing::info!(request_id = %info.request_id, "client disconnected mid-stream");
            client_open = false;
            break;
        }
    }
    if client_open {
        deliver(sink, Bytes::from_static(DONE_FRAME), info).await;
    }
    Ok(usage_or_counted(reported, info, &text))
}

async fn handle_speech_response(
    response: reqwest::Response,
    info: &RelayInfo,
    sink: &mut dyn ClientSink,
) -> Result<Usage> {
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if sink.send(chunk?).await.is_err() {
            break;
        }
    }
    Ok(Usage::from_counts(info.prompt_tokens, 0))
}

async fn handle_transcription_response(
    response: reqwest::Response,
    info: &RelayInfo,
    sink: &mut dyn ClientSink,
) -> Result<Usage> {
    let body = read_body_limited(response).await?;
    let parsed = serde_json::from_slice::<Value>(&body).ok();
    let reported = parsed
        .as_ref()
        .and_then(|value| value.get("usage"))
        .and_then(Usage::from_openai_value);
    let text = match parsed.as_ref() {
        Some(value) => value
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        None => String::from_utf8_lossy(&body).to_string(),
    };
    let usage = match reported {
        Some(usage) if usage.total_tokens > 0 => usage,
        _ => Usage::from_counts(0, count_text_tokens(&info.upstream_model_name, &text)),
    };
    deliver(sink, body, info).await;
    Ok(usage)
}

async fn handle_rerank_response(
    response: reqwest::Response,
    info: &RelayInfo,
    sink: &mut dyn ClientSink,
) -> Result<Usage> {
    let body = read_body_limited(response).await?;
    let parsed: Value = serde_json::from_slice(&body)
        .map_err(|err| RelayError::InvalidResponse(format!("invalid rerank response: {err}")))?;
    let reported = parsed
        .get("usage")
        .and_then(Usage::from_openai_value)
        .map(|mut usage| {
            if usage.prompt_tokens == 0 {
                usage.prompt_tokens = usage.total_tokens;
            }
            usage
        });
    let usage = match reported {
        Some(usage) if usage.total_tokens > 0 => usage,
        _ => Usage::from_counts(info.prompt_tokens, 0),
    };
    deliver(sink, body, info).await;
    Ok(usage)
}

async fn handle_prompt_only_response(
    response: reqwest::Response,
    info: &RelayInfo,
    sink: &mut dyn ClientSink,
) -> Result<Usage> {
    let body = read_body_limited(response).await?;
    let reported = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|value| value.get("usage").and_then(Usage::from_openai_value));
    let usage = match reported {
        Some(usage) if usage.total_tokens > 0 => usage,
        _ => Usage::from_counts(info.prompt_tokens, 0),
    };
    deliver(sink, body, info).await;
    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::info::{ApiType, ChannelMeta};

    fn info(mode: RelayMode) -> RelayInfo {
        let channel =
            ChannelMeta::new(1, ApiType::OpenAi, "https://api.openai.com/").with_api_key("sk-test");
        let mut info = RelayInfo::new(mode, 1, 1, channel);
        info.set_model("gpt-4o");
        info
    }

    #[test]
    fn request_url_follows_relay_mode() {
        let adaptor = OpenAiAdaptor;
        assert_eq!(
            adaptor
                .request_url(&info(RelayMode::AudioSpeech))
                .expect("url"),
            "https://api.openai.com/v1/audio/speech"
        );
    }

    #[test]
    fn streamed_chat_requests_ask_for_usage() {
        let mut info = info(RelayMode::ChatCompletions);
        info.is_stream = true;
        info.upstream_model_name = "gpt-4o-2024-08-06".into();
        let body = OpenAiAdaptor
            .convert_chat_request(
                &info,
                ChatRequest {
                    model: "gpt-4o".into(),
                    ..ChatRequest::default()
                },
            )
            .expect("convert");
        assert_eq!(body["model"], "gpt-4o-2024-08-06");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn transcription_requires_a_file() {
        let err = OpenAiAdaptor
            .convert_audio_request(&info(RelayMode::AudioTranscription), AudioRequest::default())
            .expect_err("no file");
        assert_eq!(err.code().as_deref(), Some("invalid_request"));
    }

    #[test]
    fn counted_usage_fills_missing_reports() {
        let mut info = info(RelayMode::ChatCompletions);
        info.prompt_tokens = 12;
        let usage = usage_or_counted(None, &info, "hello there");
        assert_eq!(usage.prompt_tokens, 12);
        assert!(usage.completion_tokens > 0);

        let reported = Usage::from_counts(3, 4);
        assert_eq!(usage_or_counted(Some(reported.clone()), &info, "x"), reported);
    }
}
