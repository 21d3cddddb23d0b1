use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde_json::Value;

use crate::error::RelayError;

pub(crate) const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;
pub(crate) const MAX_RESPONSE_BODY_BYTES: usize = 16 * 1024 * 1024;

pub(crate) async fn response_text_truncated(
    response: reqwest::Response,
    max_bytes: usize,
) -> String {
    let (bytes, truncated) = response_bytes_truncated(response, max_bytes).await;
    let mut body = String::from_utf8_lossy(&bytes).to_string();
    if truncated {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("...(truncated)");
    }
    body
}

async fn response_bytes_truncated(
    response: reqwest::Response,
    max_bytes: usize,
) -> (Vec<u8>, bool) {
    let max_bytes = max_bytes.max(1);
    let mut out = Vec::<u8>::new();
    let mut truncated = false;

    let mut stream = response.bytes_stream();
    while let Some(next) = stream.next().await {
        let Ok(chunk) = next else {
            break;
        };
        let remaining = max_bytes.saturating_sub(out.len());
        if remaining == 0 {
            truncated = true;
            break;
        }
        if chunk.len() <= remaining {
            out.extend_from_slice(chunk.as_ref());
        } else {
            out.extend_from_slice(&chunk.as_ref()[..remaining]);
            truncated = true;
            break;
        }
    }
    (out, truncated)
}

/// Buffers a successful upstream body, refusing bodies over the size cap.
pub(crate) async fn read_body_limited(response: reqwest::Response) -> Result<Bytes, RelayError> {
    let (bytes, truncated) = response_bytes_truncated(response, MAX_RESPONSE_BODY_BYTES).await;
    if truncated {
        return Err(RelayError::InvalidResponse(format!(
            "response exceeded max bytes ({MAX_RESPONSE_BODY_BYTES})"
        )));
    }
    Ok(Bytes::from(bytes))
}

/// Turns a non-success upstream response into a structured error, reading
/// the OpenAI (`{"error":{"message","type","code"}}`) and Google
/// (`{"error":{"message","status","code"}}`) error shapes.
pub(crate) async fn relay_error_from_response(response: reqwest::Response) -> RelayError {
    let status = response.status();
    let body = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
    relay_error_from_body(status, &body)
}

pub(crate) fn relay_error_from_body(status: StatusCode, body: &str) -> RelayError {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let error = parsed.as_ref().and_then(|value| value.get("error"));

    let message = error
        .and_then(|error| match error {
            Value::String(message) => Some(message.clone()),
            other => other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
        .or_else(|| {
            parsed
                .as_ref()
                .and_then(|value| value.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                format!("bad response status code {}", status.as_u16())
            } else {
                body.to_string()
            }
        });

    let error_type = error
        .and_then(|error| error.get("type").or_else(|| error.get("status")))
        .and_then(Value::as_str)
        .unwrap_or("upstream_error")
        .to_string();

    let code = error.and_then(|error| error.get("code")).and_then(|code| match code {
        Value::String(code) => Some(code.clone()),
        Value::Number(code) => Some(code.to_string()),
        _ => None,
    });

    RelayError::Upstream {
        status,
        error_type,
        code,
        message,
    }
}
