use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Map, Value, json};

use crate::error::{RelayError, Result};
use crate::relay::adaptor::{Adaptor, ClientSink};
use crate::relay::info::{RelayInfo, RelayMode};
use crate::token_count::count_text_tokens;
use crate::types::{ChatRequest, Usage};
use crate::utils::http::read_body_limited;
use crate::utils::sse::{DONE_FRAME, data_frame, sse_data_stream_from_response};

const DEFAULT_API_VERSION: &str = "v1";

/// Models served only under a specific API version.
const MODEL_VERSIONS: &[(&str, &str)] = &[
    ("gemini-1.5-pro-latest", "v1beta"),
    ("gemini-1.5-flash-latest", "v1beta"),
    ("gemini-2.0-flash", "v1beta"),
    ("gemini-2.5-pro", "v1beta"),
    ("gemini-2.5-flash", "v1beta"),
];

const MODELS: &[&str] = &[
    "gemini-1.5-pro",
    "gemini-1.5-flash",
    "gemini-2.0-flash",
    "gemini-2.5-pro",
    "gemini-2.5-flash",
];

#[derive(Clone, Debug, Default)]
pub struct GeminiAdaptor;

/// Version precedence: per-model table (experimental models always use
/// `v1beta`), then the channel's configured version, then `v1`.
pub(crate) fn api_version(model: &str, configured: Option<&str>) -> String {
    if let Some((_, version)) = MODEL_VERSIONS.iter().find(|(name, _)| *name == model) {
        return (*version).to_string();
    }
    if model.contains("exp") {
        return "v1beta".to_string();
    }
    configured
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .unwrap_or(DEFAULT_API_VERSION)
        .to_string()
}

fn convert_messages(request: &ChatRequest) -> (Vec<Value>, Option<Value>) {
    let mut contents = Vec::new();
    let mut system = Vec::new();
    for message in &request.messages {
        let text = message.text();
        match message.role.as_str() {
            "system" => system.push(json!({"text": text})),
            "assistant" => contents.push(json!({"role": "model", "parts": [{"text": text}]})),
            _ => contents.push(json!({"role": "user", "parts": [{"text": text}]})),
        }
    }
    let system = (!system.is_empty()).then(|| json!({"parts": system}));
    (contents, system)
}

fn usage_from_metadata(body: &Value) -> Option<Usage> {
    let meta = body.get("usageMetadata")?;
    let read = |key: &str| {
        meta.get(key)
            .and_then(Value::as_u64)
            .map(|value| u32::try_from(value).unwrap_or(u32::MAX))
            .unwrap_or(0)
    };
    let prompt = read("promptTokenCount");
    let completion = read("candidatesTokenCount").saturating_add(read("thoughtsTokenCount"));
    let mut usage = Usage::from_counts(prompt, completion);
    let total = read("totalTokenCount");
    if total > 0 {
        usage.total_tokens = total;
    }
    Some(usage)
}

fn candidate_text(body: &Value) -> String {
    body.pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn finish_reason(body: &Value) -> Value {
    match body
        .pointer("/candidates/0/finishReason")
        .and_then(Value::as_str)
    {
        Some("STOP") => json!("stop"),
        Some("MAX_TOKENS") => json!("length"),
        Some("SAFETY") | Some("RECITATION") => json!("content_filter"),
        _ => Value::Null,
    }
}

fn openai_usage(usage: &Usage) -> Value {
    json!({
        "prompt_tokens": usage.prompt_tokens,
        "completion_tokens": usage.completion_tokens,
        "total_tokens": usage.total_tokens,
    })
}

#[async_trait]
impl Adaptor for GeminiAdaptor {
    fn request_url(&self, info: &RelayInfo) -> Result<String> {
        let model = &info.upstream_model_name;
        let version = api_version(model, info.channel.api_version.as_deref());
        let action = match info.relay_mode {
            RelayMode::ChatCompletions if info.is_stream => "streamGenerateContent?alt=sse",
            RelayMode::ChatCompletions => "generateContent",
            _ => return Err(self.not_implemented("this relay mode")),
        };
        Ok(format!(
            "{}/{version}/models/{model}:{action}",
            info.channel.base_url()
        ))
    }

    fn setup_request_headers(
        &self,
        request: reqwest::RequestBuilder,
        info: &RelayInfo,
    ) -> Result<reqwest::RequestBuilder> {
        Ok(request.header("x-goog-api-key", &info.channel.api_key))
    }

    fn convert_chat_request(&self, _info: &RelayInfo, request: ChatRequest) -> Result<Value> {
        let (contents, system) = convert_messages(&request);
        if contents.is_empty() {
            return Err(RelayError::invalid(
                "invalid_request",
                "at least one non-system message is required",
            ));
        }
        let mut generation = Map::new();
        if let Some(temperature) = request.temperature {
            generation.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            generation.insert("topP".into(), json!(top_p));
        }
        if let Some(max_tokens) = request.max_tokens {
            generation.insert("maxOutputTokens".into(), json!(max_tokens));
        }
        match request.stop {
            Some(Value::String(stop)) => {
                generation.insert("stopSequences".into(), json!([stop]));
            }
            Some(Value::Array(stop)) => {
                generation.insert("stopSequences".into(), Value::Array(stop));
            }
            _ => {}
        }

        let mut body = json!({"contents": contents});
        if let Some(obj) = body.as_object_mut() {
            if let Some(system) = system {
                obj.insert("systemInstruction".into(), system);
            }
            if !generation.is_empty() {
                obj.insert("generationConfig".into(), Value::Object(generation));
            }
        }
        Ok(body)
    }

    async fn do_response(
        &self,
        response: reqwest::Response,
        info: &RelayInfo,
        sink: &mut dyn ClientSink,
    ) -> Result<Usage> {
        if info.is_stream {
            return handle_stream(response, info, sink).await;
        }

        let body = read_body_limited(response).await?;
        let parsed: Value = serde_json::from_slice(&body)
            .map_err(|err| RelayError::InvalidResponse(format!("invalid gemini response: {err}")))?;
        let text = candidate_text(&parsed);
        let usage = match usage_from_metadata(&parsed) {
            Some(usage) if usage.total_tokens > 0 => usage,
            _ => Usage::from_counts(
                info.prompt_tokens,
                count_text_tokens(&info.upstream_model_name, &text),
            ),
        };

        let completion = json!({
            "id": format!("chatcmpl-{}", info.request_id),
            "object": "chat.completion",
            "model": info.origin_model_name,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": finish_reason(&parsed),
            }],
            "usage": openai_usage(&usage),
        });
        if sink
            .send(bytes::Bytes::from(serde_json::to_vec(&completion)?))
            .await
            .is_err()
        {
            tracing::debug!(request_id = %info.request_id, "client disconnected before body was delivered");
        }
        Ok(usage)
    }

    fn model_list(&self) -> &'static [&'static str] {
        MODELS
    }

    fn channel_name(&self) -> &'static str {
        "google gemini"
    }
}

async fn handle_stream(
    response: reqwest::Response,
    info: &RelayInfo,
    sink: &mut dyn ClientSink,
) -> Result<Usage> {
    let mut data = sse_data_stream_from_response(response);
    let mut reported = None;
    let mut text = String::new();
    let mut client_open = true;
    let id = format!("chatcmpl-{}", info.request_id);

    while let Some(item) = data.next().await {
        let payload = match item {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(request_id = %info.request_id, error = %err, "upstream stream broke");
                break;
            }
        };
        let Ok(chunk) = serde_json::from_str::<Value>(&payload) else {
            continue;
        };
        if let Some(usage) = usage_from_metadata(&chunk) {
            reported = Some(usage);
        }
        let delta = candidate_text(&chunk);
        text.push_str(&delta);

        let frame = json!({
            "id": id,
            "object": "chat.completion.chunk",
            "model": info.origin_model_name,
            "choices": [{
                "index": 0,
                "delta": {"content": delta},
                "finish_reason": finish_reason(&chunk),
            }],
        });
        if sink.send(data_frame(&frame.to_string())).await.is_err() {
            client_open = false;
            break;
        }
    }

    let usage = match reported {
        Some(usage) if usage.total_tokens > 0 => usage,
        _ => Usage::from_counts(
            info.prompt_tokens,
            count_text_tokens(&info.upstream_model_name, &text),
        ),
    };
    if client_open {
        let tail = json!({
            "id": id,
            "object": "chat.completion.chunk",
            "model": info.origin_model_name,
            "choices": [],
            "usage": openai_usage(&usage),
        });
        let _ = sink.send(data_frame(&tail.to_string())).await;
        let _ = sink.send(bytes::Bytes::from_static(DONE_FRAME)).await;
    }
    Ok(usage)
}
