use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-kind token split for one direction (input or output) of a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDetails {
    #[serde(default)]
    pub text_tokens: u32,
    #[serde(default)]
    pub audio_tokens: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cached_tokens: u32,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl TokenDetails {
    pub fn text(tokens: u32) -> Self {
        Self {
            text_tokens: tokens,
            ..Self::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.text_tokens == 0 && self.audio_tokens == 0
    }
}

/// Canonical usage produced by an adaptor's response handler.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<TokenDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens_details: Option<TokenDetails>,
}

impl Usage {
    pub fn from_counts(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            ..Self::default()
        }
    }

    /// Input split used for pricing. Without a usable upstream split every
    /// prompt token counts as text.
    pub fn input_details(&self) -> TokenDetails {
        match self.prompt_tokens_details {
            Some(details) if !details.is_empty() => details,
            _ => TokenDetails::text(self.prompt_tokens),
        }
    }

    pub fn output_details(&self) -> TokenDetails {
        match self.completion_tokens_details {
            Some(details) if !details.is_empty() => details,
            _ => TokenDetails::text(self.completion_tokens),
        }
    }

    /// Folds another usage report into this one (realtime sessions report
    /// one usage per response).
    pub fn accumulate(&mut self, other: &Usage) {
        let input = add_details(self.input_details(), other.input_details());
        let output = add_details(self.output_details(), other.output_details());
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
        self.prompt_tokens_details = Some(input);
        self.completion_tokens_details = Some(output);
    }

    /// Parses the OpenAI `usage` object, including the realtime spelling
    /// (`input_tokens` / `output_tokens` / `*_token_details`).
    pub fn from_openai_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let read = |key: &str| {
            obj.get(key)
                .and_then(Value::as_u64)
                .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
        };
        let prompt_tokens = read("prompt_tokens").or_else(|| read("input_tokens"));
        let completion_tokens = read("completion_tokens").or_else(|| read("output_tokens"));
        let total_tokens = read("total_tokens");
        if prompt_tokens.is_none() && completion_tokens.is_none() && total_tokens.is_none() {
            return None;
        }
        let prompt_tokens = prompt_tokens.unwrap_or(0);
        let completion_tokens = completion_tokens.unwrap_or(0);
        let details = |keys: [&str; 2]| {
            keys.iter()
                .find_map(|key| obj.get(*key))
                .and_then(|raw| serde_json::from_value::<TokenDetails>(raw.clone()).ok())
        };
        Some(Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: total_tokens
                .unwrap_or_else(|| prompt_tokens.saturating_add(completion_tokens)),
            prompt_tokens_details: details(["prompt_tokens_details", "input_token_details"]),
            completion_tokens_details: details([
                "completion_tokens_details",
                "output_token_details",
            ]),
        })
    }
}

fn add_details(a: TokenDetails, b: TokenDetails) -> TokenDetails {
    TokenDetails {
        text_tokens: a.text_tokens.saturating_add(b.text_tokens),
        audio_tokens: a.audio_tokens.saturating_add(b.audio_tokens),
        cached_tokens: a.cached_tokens.saturating_add(b.cached_tokens),
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    /// Concatenated text of a string or multi-part content.
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }
}

/// Canonical chat completion request. Fields a provider does not know are
/// kept in `extra` and forwarded by pass-through adaptors.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Uploaded audio for transcription and translation requests.
#[derive(Clone, Debug)]
pub struct AudioFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

#[derive(Clone, Debug, Default)]
pub struct AudioRequest {
    pub model: String,
    /// Text to synthesize (speech only).
    pub input: String,
    pub voice: Option<String>,
    pub response_format: Option<String>,
    pub speed: Option<f64>,
    pub language: Option<String>,
    pub prompt: Option<String>,
    /// Audio to transcribe or translate.
    pub file: Option<AudioFile>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RerankRequest {
    pub model: String,
    pub query: String,
    #[serde(default)]
    pub documents: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_documents: Option<bool>,
}
