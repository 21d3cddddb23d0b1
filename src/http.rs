//! axum glue: error bodies and streaming response bodies fed by
//! [`ChannelSink`](crate::relay::ChannelSink).

use axum::Json;
use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::RelayError;

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "relay request failed");
        }
        (status, Json(self.to_openai_error())).into_response()
    }
}

/// Response body that yields every chunk a `ChannelSink` sends. Dropping
/// the body drops the receiver, which the sink reports as a disconnect.
pub fn channel_body(rx: mpsc::Receiver<Bytes>) -> Body {
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, std::convert::Infallible>(chunk), rx))
    });
    Body::from_stream(stream)
}
