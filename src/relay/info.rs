use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::billing::BillingState;
use crate::error::{RelayError, StatusCodeMapping};
use crate::pricing::PriceData;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    ChatCompletions,
    Embeddings,
    ImagesGenerations,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    Rerank,
    Realtime,
}

impl RelayMode {
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split_once('?').map(|(path, _)| path).unwrap_or(path);
        let path = path.trim_end_matches('/');
        let mode = match path {
            "/v1/chat/completions" | "/v1/completions" => Self::ChatCompletions,
            "/v1/embeddings" => Self::Embeddings,
            "/v1/images/generations" => Self::ImagesGenerations,
            "/v1/audio/speech" => Self::AudioSpeech,
            "/v1/audio/transcriptions" => Self::AudioTranscription,
            "/v1/audio/translations" => Self::AudioTranslation,
            "/v1/rerank" => Self::Rerank,
            "/v1/realtime" => Self::Realtime,
            _ => return None,
        };
        Some(mode)
    }

    pub fn path(self) -> &'static str {
        match self {
            Self::ChatCompletions => "/v1/chat/completions",
            Self::Embeddings => "/v1/embeddings",
            Self::ImagesGenerations => "/v1/images/generations",
            Self::AudioSpeech => "/v1/audio/speech",
            Self::AudioTranscription => "/v1/audio/transcriptions",
            Self::AudioTranslation => "/v1/audio/translations",
            Self::Rerank => "/v1/rerank",
            Self::Realtime => "/v1/realtime",
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(
            self,
            Self::AudioSpeech | Self::AudioTranscription | Self::AudioTranslation
        )
    }
}

/// Upstream API family; selects the adaptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiType {
    OpenAi,
    Gemini,
    Zhipu,
}

impl std::str::FromStr for ApiType {
    type Err = RelayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "gemini" | "google" => Ok(Self::Gemini),
            "zhipu" | "glm" => Ok(Self::Zhipu),
            other => Err(RelayError::invalid(
                "invalid_api_type",
                format!("unknown api type: {other}"),
            )),
        }
    }
}

/// Upstream channel selected for the request.
#[derive(Clone, Debug)]
pub struct ChannelMeta {
    pub id: i64,
    pub api_type: ApiType,
    pub base_url: String,
    pub api_key: String,
    /// Explicit API version; provider defaults apply when unset.
    pub api_version: Option<String>,
    pub model_mapping: HashMap<String, String>,
    pub status_code_mapping: StatusCodeMapping,
}

impl ChannelMeta {
    pub fn new(id: i64, api_type: ApiType, base_url: impl Into<String>) -> Self {
        Self {
            id,
            api_type,
            base_url: base_url.into(),
            api_key: String::new(),
            api_version: None,
            model_mapping: HashMap::new(),
            status_code_mapping: StatusCodeMapping::default(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_request_id() -> String {
    let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}{seq:06}", crate::store::now_millis())
}

/// Per-request context. Owned by exactly one request; relay flows fill the
/// routing and pricing fields before dispatch and hand adaptors a shared
/// borrow from then on.
#[derive(Clone, Debug)]
pub struct RelayInfo {
    pub request_id: String,
    pub relay_mode: RelayMode,
    pub user_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub group: String,
    pub channel: ChannelMeta,
    pub origin_model_name: String,
    pub upstream_model_name: String,
    pub is_stream: bool,
    /// Playground calls are billed to the user only; no token ledger.
    pub is_playground: bool,
    /// Balance observed at admission.
    pub user_quota: i64,
    pub price_data: Option<PriceData>,
    pub prompt_tokens: u32,
    pub start_time: Instant,
    pub billing_state: BillingState,
}

impl RelayInfo {
    pub fn new(relay_mode: RelayMode, user_id: i64, token_id: i64, channel: ChannelMeta) -> Self {
        Self {
            request_id: next_request_id(),
            relay_mode,
            user_id,
            token_id,
            token_name: String::new(),
            group: crate::settings::DEFAULT_GROUP.to_string(),
            channel,
            origin_model_name: String::new(),
            upstream_model_name: String::new(),
            is_stream: false,
            is_playground: false,
            user_quota: 0,
            price_data: None,
            prompt_tokens: 0,
            start_time: Instant::now(),
            billing_state: BillingState::Unconsumed,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_token_name(mut self, name: impl Into<String>) -> Self {
        self.token_name = name.into();
        self
    }

    pub fn playground(mut self) -> Self {
        self.is_playground = true;
        self
    }

    /// Records the requested model and resolves the upstream name through
    /// the channel's model mapping.
    pub fn set_model(&mut self, model: &str) {
        self.origin_model_name = model.to_string();
        self.upstream_model_name = self
            .channel
            .model_mapping
            .get(model)
            .filter(|mapped| !mapped.is_empty())
            .cloned()
            .unwrap_or_else(|| model.to_string());
    }

    pub fn use_time_seconds(&self) -> i64 {
        i64::try_from(self.start_time.elapsed().as_secs()).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_mode_from_path_ignores_query_and_slash() {
        assert_eq!(
            RelayMode::from_path("/v1/chat/completions?x=1"),
            Some(RelayMode::ChatCompletions)
        );
        assert_eq!(RelayMode::from_path("/v1/rerank/"), Some(RelayMode::Rerank));
        assert_eq!(RelayMode::from_path("/v2/unknown"), None);
        assert!(RelayMode::AudioTranslation.is_audio());
    }

    #[test]
    fn model_mapping_renames_upstream_model() {
        let mut channel = ChannelMeta::new(1, ApiType::OpenAi, "https://api.example/");
        channel
            .model_mapping
            .insert("gpt-4".into(), "gpt-4-0613".into());
        channel.model_mapping.insert("empty".into(), String::new());
        let mut info = RelayInfo::new(RelayMode::ChatCompletions, 1, 1, channel);

        info.set_model("gpt-4");
        assert_eq!(info.origin_model_name, "gpt-4");
        assert_eq!(info.upstream_model_name, "gpt-4-0613");

        info.set_model("empty");
        assert_eq!(info.upstream_model_name, "empty");
        assert_eq!(info.channel.base_url(), "https://api.example");
    }

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(next_request_id(), next_request_id());
    }

    #[test]
    fn api_type_parses_aliases() {
        assert_eq!("Google".parse::<ApiType>().expect("api type"), ApiType::Gemini);
        assert!("nope".parse::<ApiType>().is_err());
    }
}
