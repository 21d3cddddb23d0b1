use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::info::{ApiType, RelayInfo};
use crate::error::{RelayError, Result};
use crate::types::{AudioRequest, ChatRequest, EmbeddingRequest, ImageRequest, RerankRequest, Usage};

/// The client went away; nothing more can be delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkClosed;

/// Where adaptors write the client-facing response body.
#[async_trait]
pub trait ClientSink: Send {
    async fn send(&mut self, chunk: Bytes) -> std::result::Result<(), SinkClosed>;
}

/// Collects the whole body in memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    chunks: Vec<Bytes>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    pub fn into_bytes(self) -> Bytes {
        let total = self.chunks.iter().map(Bytes::len).sum();
        let mut out = Vec::with_capacity(total);
        for chunk in self.chunks {
            out.extend_from_slice(&chunk);
        }
        Bytes::from(out)
    }
}

#[async_trait]
impl ClientSink for BufferSink {
    async fn send(&mut self, chunk: Bytes) -> std::result::Result<(), SinkClosed> {
        self.chunks.push(chunk);
        Ok(())
    }
}

/// Forwards chunks to a transport task; a dropped receiver means the client
/// disconnected.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ClientSink for ChannelSink {
    async fn send(&mut self, chunk: Bytes) -> std::result::Result<(), SinkClosed> {
        self.tx.send(chunk).await.map_err(|_| SinkClosed)
    }
}

/// Provider-ready request body.
#[derive(Debug)]
pub enum RequestBody {
    Json(Value),
    Multipart(reqwest::multipart::Form),
}

/// Upstream provider contract. Conversions are pure with respect to quota;
/// `do_response` is the only place usage is produced.
#[async_trait]
pub trait Adaptor: Send + Sync {
    fn init(&mut self, _info: &RelayInfo) {}

    fn request_url(&self, info: &RelayInfo) -> Result<String>;

    fn setup_request_headers(
        &self,
        request: reqwest::RequestBuilder,
        info: &RelayInfo,
    ) -> Result<reqwest::RequestBuilder>;

    fn convert_chat_request(&self, _info: &RelayInfo, _request: ChatRequest) -> Result<Value> {
        Err(self.not_implemented("chat conversion"))
    }

    fn convert_embedding_request(
        &self,
        _info: &RelayInfo,
        _request: EmbeddingRequest,
    ) -> Result<Value> {
        Err(self.not_implemented("embedding conversion"))
    }

    fn convert_image_request(&self, _info: &RelayInfo, _request: ImageRequest) -> Result<Value> {
        Err(self.not_implemented("image conversion"))
    }

    fn convert_audio_request(
        &self,
        _info: &RelayInfo,
        _request: AudioRequest,
    ) -> Result<RequestBody> {
        Err(self.not_implemented("audio conversion"))
    }

    fn convert_rerank_request(&self, _info: &RelayInfo, _request: RerankRequest) -> Result<Value> {
        Err(self.not_implemented("rerank conversion"))
    }

    async fn do_request(
        &self,
        client: &reqwest::Client,
        info: &RelayInfo,
        body: RequestBody,
    ) -> Result<reqwest::Response> {
        let url = self.request_url(info)?;
        let request = self.setup_request_headers(client.post(url), info)?;
        let request = match body {
            RequestBody::Json(body) => request.json(&body),
            RequestBody::Multipart(form) => request.multipart(form),
        };
        Ok(request.send().await?)
    }

    /// Consumes a successful upstream response, writes the client body to
    /// `sink` and returns canonical usage.
    async fn do_response(
        &self,
        response: reqwest::Response,
        info: &RelayInfo,
        sink: &mut dyn ClientSink,
    ) -> Result<Usage>;

    /// Pumps a realtime session until the upstream ends or `cancel` fires,
    /// returning the usage accumulated from terminal events.
    async fn do_realtime(
        &self,
        _info: &RelayInfo,
        _upstream: BoxStream<'static, Result<Value>>,
        _sink: &mut dyn ClientSink,
        _cancel: CancellationToken,
    ) -> Result<Usage> {
        Err(self.not_implemented("realtime sessions"))
    }

    fn model_list(&self) -> &'static [&'static str];

    fn channel_name(&self) -> &'static str;

    fn not_implemented(&self, capability: &'static str) -> RelayError {
        RelayError::NotImplemented {
            channel: self.channel_name(),
            capability,
        }
    }
}

/// Adaptor registry keyed by API type. Types compiled out by feature flags
/// resolve to `None`.
pub fn adaptor_for(api_type: ApiType) -> Option<Box<dyn Adaptor>> {
    match api_type {
        #[cfg(feature = "provider-openai")]
        ApiType::OpenAi => Some(Box::new(super::channel::openai::OpenAiAdaptor::default())),
        #[cfg(feature = "provider-gemini")]
        ApiType::Gemini => Some(Box::new(super::channel::gemini::GeminiAdaptor::default())),
        #[cfg(feature = "provider-zhipu")]
        ApiType::Zhipu => Some(Box::new(super::channel::zhipu::ZhipuAdaptor::default())),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}
