use std::collections::BTreeMap;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheError;
use crate::store::StoreError;

/// The five error kinds surfaced by the relay core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    InsufficientQuota,
    UnsupportedCapability,
    UpstreamFailure,
    AccountingFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InsufficientQuota => "insufficient_quota",
            Self::UnsupportedCapability => "unsupported_capability",
            Self::UpstreamFailure => "upstream_failure",
            Self::AccountingFailure => "accounting_failure",
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { code: &'static str, message: String },
    #[error("pricing not configured for model {model}")]
    PricingNotConfigured { model: String },
    #[error("insufficient quota: {message}")]
    InsufficientQuota { code: &'static str, message: String },
    #[error("{capability} is not implemented by channel {channel}")]
    NotImplemented {
        channel: &'static str,
        capability: &'static str,
    },
    #[error("upstream error ({status}): {message}")]
    Upstream {
        status: StatusCode,
        error_type: String,
        code: Option<String>,
        message: String,
    },
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
    #[error("accounting failure: {0}")]
    Store(#[from] StoreError),
    #[error("cache failure: {0}")]
    Cache(#[from] CacheError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub fn invalid(code: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            code,
            message: message.into(),
        }
    }

    pub fn upstream(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            error_type: "upstream_error".to_string(),
            code: None,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest { .. } | Self::PricingNotConfigured { .. } | Self::Json(_) => {
                ErrorKind::InvalidRequest
            }
            Self::InsufficientQuota { .. } => ErrorKind::InsufficientQuota,
            Self::NotImplemented { .. } => ErrorKind::UnsupportedCapability,
            Self::Upstream { .. } | Self::Transport(_) | Self::InvalidResponse(_) => {
                ErrorKind::UpstreamFailure
            }
            Self::Store(_) | Self::Cache(_) => ErrorKind::AccountingFailure,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::InsufficientQuota { .. } => StatusCode::BAD_REQUEST,
            Self::PricingNotConfigured { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            Self::Upstream { status, .. } => *status,
            Self::Transport(_) | Self::InvalidResponse(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store(_) | Self::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code placed in the `code` field of the error body.
    pub fn code(&self) -> Option<String> {
        match self {
            Self::InvalidRequest { code, .. } | Self::InsufficientQuota { code, .. } => {
                Some((*code).to_string())
            }
            Self::PricingNotConfigured { .. } => Some("model_price_error".to_string()),
            Self::NotImplemented { .. } => Some("not_implemented".to_string()),
            Self::Upstream { code, .. } => code.clone(),
            Self::Transport(_) => Some("do_request_failed".to_string()),
            Self::InvalidResponse(_) => Some("bad_response".to_string()),
            Self::Store(_) | Self::Cache(_) => Some("accounting_failed".to_string()),
            Self::Json(_) => Some("invalid_json".to_string()),
        }
    }

    pub fn to_openai_error(&self) -> OpenAiErrorResponse {
        let error_type = match self {
            Self::Upstream { error_type, .. } => error_type.clone(),
            other => other.kind().as_str().to_string(),
        };
        let message = match self {
            Self::Upstream { message, .. } => message.clone(),
            other => other.to_string(),
        };
        OpenAiErrorResponse {
            error: OpenAiErrorDetail {
                message,
                error_type,
                code: self.code(),
            },
        }
    }

    /// Rewrites the status of an upstream failure through a channel's
    /// status-code mapping. Successful statuses are never remapped.
    pub fn remap_status(&mut self, mapping: &StatusCodeMapping) {
        let Self::Upstream { status, .. } = self else {
            return;
        };
        if *status == StatusCode::OK {
            return;
        }
        if let Some(mapped) = mapping.get(status.as_u16()) {
            *status = mapped;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenAiErrorResponse {
    pub error: OpenAiErrorDetail,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenAiErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Per-channel upstream status translation, configured as a JSON object
/// such as `{"429": "500"}`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusCodeMapping {
    codes: BTreeMap<u16, u16>,
}

impl StatusCodeMapping {
    /// Parses the JSON form. Entries whose source or target is not a valid
    /// HTTP status are skipped.
    pub fn parse(raw: &str) -> std::result::Result<Self, serde_json::Error> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "{}" {
            return Ok(Self::default());
        }
        let entries: BTreeMap<String, serde_json::Value> = serde_json::from_str(raw)?;
        let mut codes = BTreeMap::new();
        for (from, to) in entries {
            let to = match &to {
                serde_json::Value::String(value) => value.trim().parse::<u16>().ok(),
                serde_json::Value::Number(value) => {
                    value.as_u64().and_then(|v| u16::try_from(v).ok())
                }
                _ => None,
            };
            let (Ok(from), Some(to)) = (from.trim().parse::<u16>(), to) else {
                continue;
            };
            if StatusCode::from_u16(to).is_err() {
                continue;
            }
            codes.insert(from, to);
        }
        Ok(Self { codes })
    }

    pub fn insert(&mut self, from: u16, to: u16) {
        self.codes.insert(from, to);
    }

    pub fn get(&self, from: u16) -> Option<StatusCode> {
        self.codes
            .get(&from)
            .and_then(|to| StatusCode::from_u16(*to).ok())
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}
