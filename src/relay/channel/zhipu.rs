use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;

use super::openai::{handle_chat_response, handle_chat_stream};
use crate::error::{RelayError, Result};
use crate::relay::adaptor::{Adaptor, ClientSink};
use crate::relay::info::{RelayInfo, RelayMode};
use crate::types::{ChatRequest, EmbeddingRequest, Usage};
use crate::utils::http::read_body_limited;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const MIN_SAMPLING: f64 = 0.01;
const MAX_SAMPLING: f64 = 0.99;

const MODELS: &[&str] = &["glm-4", "glm-4-plus", "glm-4-air", "glm-4-flash", "glm-4v", "embedding-3"];

/// Zhipu GLM, v4 API only.
#[derive(Clone, Debug, Default)]
pub struct ZhipuAdaptor;

/// Signs a short-lived HS256 JWT from an `id.secret` API key.
pub(crate) fn sign_token(api_key: &str, now_millis: i64) -> Result<String> {
    let Some((id, secret)) = api_key.split_once('.') else {
        return Err(RelayError::invalid(
            "invalid_api_key",
            "zhipu api key must look like `id.secret`",
        ));
    };
    let ttl = i64::try_from(TOKEN_TTL.as_millis()).unwrap_or(i64::MAX);
    let header = json!({"alg": "HS256", "sign_type": "SIGN"});
    let payload = json!({
        "api_key": id,
        "exp": now_millis.saturating_add(ttl),
        "timestamp": now_millis,
    });
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload)?)
    );
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| RelayError::invalid("invalid_api_key", format!("invalid hmac key: {err}")))?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{signing_input}.{signature}"))
}

fn clamp_sampling(value: Option<f64>) -> Option<f64> {
    value.map(|value| value.clamp(MIN_SAMPLING, MAX_SAMPLING))
}

#[async_trait]
impl Adaptor for ZhipuAdaptor {
    fn request_url(&self, info: &RelayInfo) -> Result<String> {
        let path = match info.relay_mode {
            RelayMode::ChatCompletions => "chat/completions",
            RelayMode::Embeddings => "embeddings",
            _ => return Err(self.not_implemented("this relay mode")),
        };
        Ok(format!("{}/api/paas/v4/{path}", info.channel.base_url()))
    }

    fn setup_request_headers(
        &self,
        request: reqwest::RequestBuilder,
        info: &RelayInfo,
    ) -> Result<reqwest::RequestBuilder> {
        let token = sign_token(&info.channel.api_key, crate::store::now_millis())?;
        Ok(request.header("Authorization", token))
    }

    fn convert_chat_request(&self, info: &RelayInfo, mut request: ChatRequest) -> Result<Value> {
        request.model = info.upstream_model_name.clone();
        request.stream = info.is_stream;
        request.temperature = clamp_sampling(request.temperature);
        request.top_p = clamp_sampling(request.top_p);
        Ok(serde_json::to_value(request)?)
    }

    fn convert_embedding_request(
        &self,
        info: &RelayInfo,
        mut request: EmbeddingRequest,
    ) -> Result<Value> {
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
            _ => {
                let body = read_body_limited(response).await?;
                let usage = serde_json::from_slice::<Value>(&body)
                    .ok()
                    .and_then(|value| value.get("usage").and_then(Usage::from_openai_value))
                    .filter(|usage| usage.total_tokens > 0)
                    .unwrap_or_else(|| Usage::from_counts(info.prompt_tokens, 0));
                let _ = sink.send(body).await;
                Ok(usage)
            }
        }
    }

    fn model_list(&self) -> &'static [&'static str] {
        MODELS
    }

    fn channel_name(&self) -> &'static str {
        "zhipu"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::info::{ApiType, ChannelMeta};

    #[test]
    fn signs_three_part_token() {
        let token = sign_token("abc.secret", 1_700_000_000_000).expect("token");
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header: Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[0]).expect("b64")).expect("json");
        assert_eq!(header["sign_type"], "SIGN");
        let payload: Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).expect("b64")).expect("json");
        assert_eq!(payload["api_key"], "abc");
        assert_eq!(payload["timestamp"], 1_700_000_000_000_i64);
        assert_eq!(payload["exp"], 1_700_086_400_000_i64);

        let again = sign_token("abc.secret", 1_700_000_000_000).expect("token");
        assert_eq!(token, again);
    }

    #[test]
    fn rejects_malformed_key() {
        let err = sign_token("no-dot", 0).expect_err("malformed");
        assert_eq!(err.code().as_deref(), Some("invalid_api_key"));
    }

    #[test]
    fn clamps_sampling_parameters() {
        let channel = ChannelMeta::new(2, ApiType::Zhipu, "https://open.bigmodel.cn").with_api_key("a.b");
        let mut info = RelayInfo::new(RelayMode::ChatCompletions, 1, 1, channel);
        info.set_model("glm-4");
        let body = ZhipuAdaptor
            .convert_chat_request(
                &info,
                ChatRequest {
                    model: "glm-4".into(),
                    temperature: Some(1.5),
                    top_p: Some(0.0),
                    ..ChatRequest::default()
                },
            )
            .expect("convert");
        assert_eq!(body["temperature"], 0.99);
        assert_eq!(body["top_p"], 0.01);
        assert_eq!(
            ZhipuAdaptor.request_url(&info).expect("url"),
            "https://open.bigmodel.cn/api/paas/v4/chat/completions"
        );
    }
}
