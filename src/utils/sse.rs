//! Upstream SSE decoding. Only `data:` payloads are relayed; event names,
//! ids and comments are dropped.

use std::collections::VecDeque;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};

use crate::error::{RelayError, Result};

pub(crate) const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Cap on one buffered event, partial line included.
const MAX_EVENT_BYTES: usize = 4 * 1024 * 1024;

/// Re-encodes one data payload as an SSE frame for the client.
pub(crate) fn data_frame(data: &str) -> Bytes {
    Bytes::from(format!("data: {data}\n\n"))
}

/// Incremental decoder fed with arbitrary body chunks.
#[derive(Debug, Default)]
struct SseDecoder {
    partial: Vec<u8>,
    data: String,
    done: bool,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8], ready: &mut VecDeque<String>) -> Result<()> {
        self.partial.extend_from_slice(chunk);
        while !self.done {
            let Some(end) = self.partial.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.partial.drain(..=end).collect();
            self.line(&line, ready)?;
        }
        if self.partial.len() > MAX_EVENT_BYTES {
            return Err(oversized());
        }
        Ok(())
    }

    /// End of body: a trailing event without its blank line still counts.
    fn finish(&mut self, ready: &mut VecDeque<String>) -> Result<()> {
        if !self.done && !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.line(&line, ready)?;
        }
        self.dispatch(ready);
        Ok(())
    }

    fn line(&mut self, raw: &[u8], ready: &mut VecDeque<String>) -> Result<()> {
        let line = std::str::from_utf8(raw)
            .map_err(|err| RelayError::InvalidResponse(format!("invalid SSE UTF-8: {err}")))?
            .trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            self.dispatch(ready);
            return Ok(());
        }
        let Some(payload) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let payload = payload.strip_prefix(' ').unwrap_or(payload);
        if self.data.len() + payload.len() + 1 > MAX_EVENT_BYTES {
            return Err(oversized());
        }
        if !self.data.is_empty() {
            self.data.push('\n');
        }
        self.data.push_str(payload);
        Ok(())
    }

    fn dispatch(&mut self, ready: &mut VecDeque<String>) {
        if self.done || self.data.is_empty() {
            return;
        }
        let data = std::mem::take(&mut self.data);
        if data == "[DONE]" {
            self.done = true;
        } else {
            ready.push_back(data);
        }
    }
}

fn oversized() -> RelayError {
    RelayError::InvalidResponse(format!("SSE event exceeds {MAX_EVENT_BYTES} bytes"))
}

/// Data payloads of an upstream SSE body, ending at EOF or `[DONE]`.
pub(crate) fn sse_data_stream_from_response(
    response: reqwest::Response,
) -> BoxStream<'static, Result<String>> {
    sse_data_stream(response.bytes_stream().map(|chunk| chunk.map_err(RelayError::from)))
}

fn sse_data_stream<S>(body: S) -> BoxStream<'static, Result<String>>
where
    S: futures_util::Stream<Item = Result<Bytes>> + Send + 'static,
{
    let state = (body.boxed(), SseDecoder::default(), VecDeque::new(), false);
    Box::pin(stream::try_unfold(
        state,
        |(mut body, mut decoder, mut ready, mut eof)| async move {
            loop {
                if let Some(data) = ready.pop_front() {
                    return Ok(Some((data, (body, decoder, ready, eof))));
                }
                if eof || decoder.done {
                    return Ok(None);
                }
                match body.next().await {
                    Some(chunk) => decoder.push(&chunk?, &mut ready)?,
                    None => {
                        decoder.finish(&mut ready)?;
                        eof = true;
                    }
                }
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(chunks: &[&str]) -> Vec<Result<String>> {
        let body = stream::iter(
            chunks
                .iter()
                .map(|chunk| Ok(Bytes::from(chunk.to_string())))
                .collect::<Vec<_>>(),
        );
        sse_data_stream(body).collect().await
    }

    fn payloads(items: Vec<Result<String>>) -> Vec<String> {
        items.into_iter().map(|item| item.expect("data")).collect()
    }

    #[tokio::test]
    async fn joins_multiline_data_and_stops_at_done() {
        let out = decode(&[
            "event: message\n",
            ": keep-alive\n\n",
            "data: {\"hello\":1}\n\n",
            "data: line1\ndata: line2\r\n\r\n",
            "data: [DONE]\n\n",
            "data: ignored\n\n",
        ])
        .await;
        assert_eq!(payloads(out), vec!["{\"hello\":1}", "line1\nline2"]);
    }

    #[tokio::test]
    async fn lines_split_across_chunks_are_reassembled() {
        let out = decode(&["da", "ta: {\"a\"", ":1}\n", "\ndata: ü", "ber\n\n"]).await;
        assert_eq!(payloads(out), vec!["{\"a\":1}", "über"]);
    }

    #[tokio::test]
    async fn trailing_event_without_blank_line_is_kept() {
        assert_eq!(payloads(decode(&["data: tail"]).await), vec!["tail"]);
    }

    #[tokio::test]
    async fn unterminated_oversized_line_is_rejected() {
        let huge = "a".repeat(MAX_EVENT_BYTES + 1);
        let out = decode(&["data: ok\n\n", &huge]).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_deref().expect("first"), "ok");
        let err = out[1].as_ref().expect_err("too large");
        assert!(err.to_string().contains("SSE event exceeds"));
    }

    #[test]
    fn frames_data_payloads() {
        assert_eq!(&data_frame("{}")[..], b"data: {}\n\n");
    }
}
