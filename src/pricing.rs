use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{RelayError, Result};
use crate::settings::RelaySettings;
use crate::types::{TokenDetails, Usage};

/// Pricing mode resolved once per request and reused by settlement.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PricingMode {
    Ratio {
        model_ratio: f64,
        completion_ratio: f64,
        audio_ratio: f64,
        audio_completion_ratio: f64,
    },
    Fixed {
        model_price: f64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceData {
    pub group_ratio: f64,
    #[serde(flatten)]
    pub mode: PricingMode,
}

impl PriceData {
    /// Resolves pricing for `model` in `group`. A configured fixed price
    /// wins over a model ratio.
    pub fn resolve(settings: &RelaySettings, model: &str, group: &str) -> Result<Self> {
        let group_ratio = settings.group_ratio(group);
        if let Some(model_price) = settings.model_price(model) {
            return Ok(Self {
                group_ratio,
                mode: PricingMode::Fixed { model_price },
            });
        }
        let Some(model_ratio) = settings.model_ratio(model) else {
            return Err(RelayError::PricingNotConfigured {
                model: model.to_string(),
            });
        };
        Ok(Self {
            group_ratio,
            mode: PricingMode::Ratio {
                model_ratio,
                completion_ratio: settings.completion_ratio(model),
                audio_ratio: settings.audio_ratio(model),
                audio_completion_ratio: settings.audio_completion_ratio(model),
            },
        })
    }

    pub fn uses_price(&self) -> bool {
        matches!(self.mode, PricingMode::Fixed { .. })
    }

    /// Combined multiplier applied to weighted tokens. Zero for fixed prices.
    pub fn ratio(&self) -> f64 {
        match self.mode {
            PricingMode::Ratio { model_ratio, .. } => model_ratio * self.group_ratio,
            PricingMode::Fixed { .. } => 0.0,
        }
    }

    /// Quota reserved before dispatch. Fixed prices are exact; ratio mode
    /// prices `tokens` as plain input text.
    pub fn estimate(&self, tokens: u32, quota_per_unit: f64) -> i64 {
        match self.mode {
            PricingMode::Fixed { model_price } => {
                fixed_quota(model_price, quota_per_unit, self.group_ratio)
            }
            PricingMode::Ratio { model_ratio, .. } => {
                (f64::from(tokens) * model_ratio * self.group_ratio) as i64
            }
        }
    }

    /// Rationale written into the consume log.
    pub fn describe(&self) -> String {
        match self.mode {
            PricingMode::Ratio {
                model_ratio,
                completion_ratio,
                audio_ratio,
                audio_completion_ratio,
            } => {
                let mut out = format!(
                    "model ratio {model_ratio:.2}, completion ratio {completion_ratio:.2}"
                );
                if audio_ratio != 1.0 || audio_completion_ratio != 1.0 {
                    out.push_str(&format!(
                        ", audio ratio {audio_ratio:.2}, audio completion ratio {audio_completion_ratio:.2}"
                    ));
                }
                out.push_str(&format!(", group ratio {:.2}", self.group_ratio));
                out
            }
            PricingMode::Fixed { model_price } => format!(
                "model price {model_price:.2}, group ratio {:.2}",
                self.group_ratio
            ),
        }
    }
}

fn fixed_quota(model_price: f64, quota_per_unit: f64, group_ratio: f64) -> i64 {
    (model_price * quota_per_unit * group_ratio) as i64
}

/// Per-request pricing inputs; never persisted.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuotaInfo {
    pub input: TokenDetails,
    pub output: TokenDetails,
    pub price: PriceData,
}

impl QuotaInfo {
    pub fn from_usage(usage: &Usage, price: PriceData) -> Self {
        Self {
            input: usage.input_details(),
            output: usage.output_details(),
            price,
        }
    }

    /// Token count weighted by kind, before model and group ratios.
    pub fn weighted_tokens(&self) -> f64 {
        match self.price.mode {
            PricingMode::Ratio {
                completion_ratio,
                audio_ratio,
                audio_completion_ratio,
                ..
            } => {
                f64::from(self.input.text_tokens)
                    + f64::from(self.output.text_tokens) * completion_ratio
                    + f64::from(self.input.audio_tokens) * audio_ratio
                    + f64::from(self.output.audio_tokens) * audio_ratio * audio_completion_ratio
            }
            PricingMode::Fixed { .. } => 0.0,
        }
    }

    /// Actual charge. A nonzero ratio never yields a free call.
    pub fn calculate_quota(&self, quota_per_unit: f64) -> i64 {
        match self.price.mode {
            PricingMode::Fixed { model_price } => {
                fixed_quota(model_price, quota_per_unit, self.price.group_ratio)
            }
            PricingMode::Ratio { .. } => {
                let ratio = self.price.ratio();
                let quota = (self.weighted_tokens() * ratio) as i64;
                if ratio != 0.0 && quota <= 0 { 1 } else { quota }
            }
        }
    }

    /// Structured pricing details stored in the consume log's `other` blob.
    pub fn other_info(&self) -> Value {
        let mut other = json!({
            "group_ratio": self.price.group_ratio,
            "input_text_tokens": self.input.text_tokens,
            "input_audio_tokens": self.input.audio_tokens,
            "output_text_tokens": self.output.text_tokens,
            "output_audio_tokens": self.output.audio_tokens,
        });
        if let Some(map) = other.as_object_mut() {
            match self.price.mode {
                PricingMode::Ratio {
                    model_ratio,
                    completion_ratio,
                    audio_ratio,
                    audio_completion_ratio,
                } => {
                    map.insert("model_ratio".into(), json!(model_ratio));
                    map.insert("completion_ratio".into(), json!(completion_ratio));
                    map.insert("audio_ratio".into(), json!(audio_ratio));
                    map.insert(
                        "audio_completion_ratio".into(),
                        json!(audio_completion_ratio),
                    );
                }
                PricingMode::Fixed { model_price } => {
                    map.insert("model_price".into(), json!(model_price));
                }
            }
        }
        other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RelaySettings {
        let mut settings = RelaySettings::default();
        settings.model_ratio.insert("gpt-4o".into(), 2.0);
        settings.completion_ratio.insert("gpt-4o".into(), 3.0);
        settings.model_ratio.insert("gpt-4o-audio".into(), 1.0);
        settings.audio_ratio.insert("gpt-4o-audio".into(), 8.0);
        settings
            .audio_completion_ratio
            .insert("gpt-4o-audio".into(), 2.0);
        settings.model_price.insert("dall-e-3".into(), 0.04);
        settings.model_ratio.insert("dall-e-3".into(), 10.0);
        settings.model_ratio.insert("free".into(), 0.0);
        settings.group_ratio.insert("vip".into(), 0.5);
        settings
    }

    #[test]
    fn fixed_price_wins_over_ratio() {
        let price = PriceData::resolve(&settings(), "dall-e-3", "default").expect("price");
        assert!(price.uses_price());
        assert_eq!(price.estimate(10_000, 500_000.0), 20_000);

        let info = QuotaInfo::from_usage(&Usage::from_counts(999, 999), price);
        assert_eq!(info.calculate_quota(500_000.0), 20_000);
        assert!(price.describe().starts_with("model price 0.04"));
    }

    #[test]
    fn unknown_model_is_not_priced() {
        let err = PriceData::resolve(&settings(), "mystery", "default").expect_err("no price");
        assert!(matches!(err, RelayError::PricingNotConfigured { .. }));
    }

    #[test]
    fn ratio_mode_weights_completion_tokens() {
        let price = PriceData::resolve(&settings(), "gpt-4o", "vip").expect("price");
        assert_eq!(price.ratio(), 1.0);
        let info = QuotaInfo::from_usage(&Usage::from_counts(10, 20), price);
        assert_eq!(info.weighted_tokens(), 70.0);
        assert_eq!(info.calculate_quota(500_000.0), 70);
    }

    #[test]
    fn ratio_mode_prices_audio_kinds() {
        let price = PriceData::resolve(&settings(), "gpt-4o-audio", "default").expect("price");
        let usage = Usage {
            prompt_tokens: 30,
            completion_tokens: 40,
            total_tokens: 70,
            prompt_tokens_details: Some(TokenDetails {
                text_tokens: 10,
                audio_tokens: 20,
                cached_tokens: 0,
            }),
            completion_tokens_details: Some(TokenDetails {
                text_tokens: 15,
                audio_tokens: 25,
                cached_tokens: 0,
            }),
        };
        let info = QuotaInfo::from_usage(&usage, price);
        // 10 + 15 + 20*8 + 25*8*2
        assert_eq!(info.calculate_quota(500_000.0), 585);
        assert!(price.describe().contains("audio ratio 8.00"));
    }

    #[test]
    fn nonzero_ratio_is_never_free() {
        let mut settings = settings();
        settings.model_ratio.insert("tiny".into(), 0.001);
        let price = PriceData::resolve(&settings, "tiny", "default").expect("price");
        let info = QuotaInfo::from_usage(&Usage::from_counts(1, 1), price);
        assert_eq!(info.calculate_quota(500_000.0), 1);

        let free = PriceData::resolve(&settings, "free", "default").expect("price");
        let info = QuotaInfo::from_usage(&Usage::from_counts(100, 100), free);
        assert_eq!(info.calculate_quota(500_000.0), 0);
    }
}
