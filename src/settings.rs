use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_QUOTA_PER_UNIT: f64 = 500_000.0;
pub const DEFAULT_PRE_CONSUMED_TOKENS: u32 = 500;
pub const DEFAULT_QUOTA_REMIND_THRESHOLD: i64 = 1000;
pub const DEFAULT_GROUP: &str = "default";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "config-yaml")]
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unsupported settings format: {0}")]
    UnsupportedFormat(String),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Pricing tables, thresholds and sideband configuration. Immutable once
/// loaded; swapped wholesale through [`SettingsHandle::reload`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Quota units per one unit of `model_price`.
    pub quota_per_unit: f64,
    /// Tokens reserved for ratio-priced requests whose size is unknown.
    pub pre_consumed_quota: u32,
    pub quota_remind_threshold: i64,
    pub server_address: String,
    pub display_in_currency: bool,
    pub model_ratio: HashMap<String, f64>,
    pub model_price: HashMap<String, f64>,
    pub completion_ratio: HashMap<String, f64>,
    pub audio_ratio: HashMap<String, f64>,
    pub audio_completion_ratio: HashMap<String, f64>,
    pub group_ratio: HashMap<String, f64>,
    pub cache: CacheSettings,
    pub notify: NotifySettings,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            quota_per_unit: DEFAULT_QUOTA_PER_UNIT,
            pre_consumed_quota: DEFAULT_PRE_CONSUMED_TOKENS,
            quota_remind_threshold: DEFAULT_QUOTA_REMIND_THRESHOLD,
            server_address: "http://localhost:3000".to_string(),
            display_in_currency: true,
            model_ratio: HashMap::new(),
            model_price: HashMap::new(),
            completion_ratio: HashMap::new(),
            audio_ratio: HashMap::new(),
            audio_completion_ratio: HashMap::new(),
            group_ratio: HashMap::from([(DEFAULT_GROUP.to_string(), 1.0)]),
            cache: CacheSettings::default(),
            notify: NotifySettings::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub redis_url: Option<String>,
    pub prefix: String,
    /// TTL for balance, group, username and unlimited-flag entries.
    pub user_ttl_secs: u64,
    /// TTL for status entries; kept shorter so bans propagate quickly.
    pub status_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: None,
            prefix: "quota-relay".to_string(),
            user_ttl_secs: 300,
            status_ttl_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub queue_capacity: usize,
    pub webhook_timeout_secs: u64,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            webhook_timeout_secs: 10,
        }
    }
}

impl RelaySettings {
    pub fn from_toml_str(raw: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_json::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    #[cfg(feature = "config-yaml")]
    pub fn from_yaml_str(raw: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings, picking the format from the file extension.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "toml" => Self::from_toml_str(&raw),
            "json" => Self::from_json_str(&raw),
            #[cfg(feature = "config-yaml")]
            "yaml" | "yml" => Self::from_yaml_str(&raw),
            other => Err(SettingsError::UnsupportedFormat(other.to_string())),
        }
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if !self.quota_per_unit.is_finite() || self.quota_per_unit <= 0.0 {
            return Err(SettingsError::Invalid(
                "quota_per_unit must be a positive number".to_string(),
            ));
        }
        let tables = [
            ("model_ratio", &self.model_ratio),
            ("model_price", &self.model_price),
            ("completion_ratio", &self.completion_ratio),
            ("audio_ratio", &self.audio_ratio),
            ("audio_completion_ratio", &self.audio_completion_ratio),
            ("group_ratio", &self.group_ratio),
        ];
        for (table, entries) in tables {
            for (name, value) in entries {
                if !value.is_finite() || *value < 0.0 {
                    return Err(SettingsError::Invalid(format!(
                        "{table}[{name}] must be a non-negative number"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Group multiplier; unknown groups price at 1.0.
    pub fn group_ratio(&self, group: &str) -> f64 {
        match self.group_ratio.get(group) {
            Some(ratio) => *ratio,
            None => {
                tracing::warn!(group, "group ratio not configured, using 1.0");
                1.0
            }
        }
    }

    pub fn model_ratio(&self, model: &str) -> Option<f64> {
        self.model_ratio.get(model).copied()
    }

    pub fn model_price(&self, model: &str) -> Option<f64> {
        self.model_price.get(model).copied()
    }

    pub fn completion_ratio(&self, model: &str) -> f64 {
        self.completion_ratio.get(model).copied().unwrap_or(1.0)
    }

    pub fn audio_ratio(&self, model: &str) -> f64 {
        self.audio_ratio.get(model).copied().unwrap_or(1.0)
    }

    pub fn audio_completion_ratio(&self, model: &str) -> f64 {
        self.audio_completion_ratio.get(model).copied().unwrap_or(1.0)
    }

    /// Renders a quota amount for humans, e.g. in low-balance notices.
    pub fn format_quota(&self, quota: i64) -> String {
        if self.display_in_currency {
            format!("${:.6}", quota as f64 / self.quota_per_unit)
        } else {
            format!("{quota} points")
        }
    }
}

/// Shared accessor over the current settings snapshot.
#[derive(Clone, Debug)]
pub struct SettingsHandle {
    inner: Arc<ArcSwap<RelaySettings>>,
}

impl SettingsHandle {
    pub fn new(settings: RelaySettings) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }

    pub fn current(&self) -> Arc<RelaySettings> {
        self.inner.load_full()
    }

    pub fn reload(&self, settings: RelaySettings) {
        self.inner.store(Arc::new(settings));
        tracing::info!("relay settings reloaded");
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(RelaySettings::default())
    }
}
