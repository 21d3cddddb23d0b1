use serde_json::Value;

use crate::types::ChatMessage;

#[cfg(feature = "tokenizer")]
use tiktoken_rs::{CoreBPE, tokenizer};

#[cfg(feature = "tokenizer")]
fn bpe_for_model(model: &str) -> &'static CoreBPE {
    let tokenizer = tokenizer::get_tokenizer(model).unwrap_or(tokenizer::Tokenizer::Cl100kBase);
    match tokenizer {
        tokenizer::Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase => tiktoken_rs::r50k_base_singleton(),
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        tokenizer::Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
    }
}

/// Token count of a plain string under the model's encoding.
#[cfg(feature = "tokenizer")]
pub fn count_text_tokens(model: &str, text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    clamp_usize_to_u32(bpe_for_model(model).encode_with_special_tokens(text).len())
}

/// Without a tokenizer, approximate four characters per token.
#[cfg(not(feature = "tokenizer"))]
pub fn count_text_tokens(_model: &str, text: &str) -> u32 {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }
    clamp_usize_to_u32(chars.div_ceil(4))
}

/// Prompt tokens of a chat conversation including per-message overhead.
pub fn count_messages_tokens(model: &str, messages: &[ChatMessage]) -> u32 {
    let (tokens_per_message, tokens_per_name) = if model.starts_with("gpt-3.5") {
        (4i64, -1i64)
    } else {
        (3i64, 1i64)
    };

    let mut num_tokens: i64 = 0;
    for message in messages {
        num_tokens = num_tokens.saturating_add(tokens_per_message);
        num_tokens = num_tokens.saturating_add(i64::from(count_text_tokens(model, &message.role)));
        num_tokens = num_tokens.saturating_add(i64::from(count_text_tokens(model, &message.text())));
        if let Some(name) = message.name.as_deref() {
            num_tokens = num_tokens.saturating_add(i64::from(count_text_tokens(model, name)));
            num_tokens = num_tokens.saturating_add(tokens_per_name);
        }
    }
    num_tokens = num_tokens.saturating_add(3);
    u32::try_from(num_tokens.max(0)).unwrap_or(u32::MAX)
}

/// Tokens in a string or array-of-strings input (embeddings, rerank documents).
pub fn count_value_tokens(model: &str, value: &Value) -> u32 {
    match value {
        Value::String(text) => count_text_tokens(model, text),
        Value::Array(items) => items
            .iter()
            .fold(0u32, |acc, item| acc.saturating_add(count_value_tokens(model, item))),
        Value::Object(obj) => obj
            .get("text")
            .map(|text| count_value_tokens(model, text))
            .unwrap_or(0),
        _ => 0,
    }
}

fn clamp_usize_to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_text_has_no_tokens() {
        assert_eq!(count_text_tokens("gpt-4o", ""), 0);
    }

    #[test]
    fn longer_text_costs_more() {
        let short = count_text_tokens("gpt-4o", "hello");
        let long = count_text_tokens("gpt-4o", "hello there, how is the weather today?");
        assert!(short > 0);
        assert!(long > short);
    }

    #[test]
    fn messages_include_priming_overhead() {
        let messages = vec![ChatMessage {
            role: "user".into(),
            content: json!("hi"),
            name: None,
        }];
        let tokens = count_messages_tokens("gpt-4o", &messages);
        assert!(tokens >= 3 + 3 + count_text_tokens("gpt-4o", "hi"));
    }

    #[test]
    fn value_tokens_sum_arrays() {
        let one = count_value_tokens("gpt-4o", &json!("alpha beta"));
        let both = count_value_tokens("gpt-4o", &json!(["alpha beta", {"text": "alpha beta"}]));
        assert_eq!(both, one * 2);
    }
}
