//! SSE forwarding: read the provider body line by line, translate each data
//! payload through the adapter, and flush canonical frames to the client.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::{self, BoxStream};
use futures_util::TryStreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;
use tracing::{error, info, warn};

use crate::adapters::{ProviderAdapter, StreamEvent};
use crate::auth::Principal;
use crate::error::GatewayError;

use super::AppState;

/// Provider SSE lines above this size terminate the stream.
const MAX_LINE_BYTES: usize = 1024 * 1024;

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

pub(crate) async fn handle_stream(
    state: &AppState,
    adapter: Arc<dyn ProviderAdapter>,
    provider_request: reqwest::Request,
    request_id: String,
    original_model: String,
    principal: Arc<Principal>,
) -> Response {
    let provider = adapter.name().to_string();

    let provider_response = match adapter.send(provider_request).await {
        Ok(provider_response) => provider_response,
        Err(err) => {
            state.health.record_failure(&provider);
            error!(error = %err, provider = %provider, "streaming provider request failed");
            return GatewayError::DispatchFailed("provider request failed".to_string())
                .into_response_with_id(&request_id);
        }
    };

    let status = provider_response.status();
    if status != reqwest::StatusCode::OK {
        let body = provider_response.text().await.unwrap_or_default();
        state.health.record_failure(&provider);
        error!(
            status = %status,
            provider = %provider,
            body = %body,
            "streaming provider returned error"
        );
        return GatewayError::DispatchFailed("provider returned error".to_string())
            .into_response_with_id(&request_id);
    }
    state.health.record_success(&provider);

    info!(
        request_id = %request_id,
        model_requested = %original_model,
        provider = %provider,
        org_id = %principal.organization_id,
        "streaming started"
    );

    let byte_stream = provider_response
        .bytes_stream()
        .map_err(std::io::Error::other);
    let reader = BufReader::with_capacity(64 * 1024, StreamReader::new(byte_stream));
    let frames = sse_frames(
        reader,
        adapter,
        Duration::from_secs(state.config.routing.stream_first_chunk_timeout_secs),
        Duration::from_secs(state.config.routing.stream_chunk_timeout_secs),
    );

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-request-id", request_id.as_str())
        .body(Body::from_stream(frames));
    match response {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "failed to build streaming response");
            GatewayError::Internal("streaming setup failed".to_string())
                .into_response_with_id(&request_id)
        }
    }
}

struct SseState<R> {
    reader: R,
    adapter: Arc<dyn ProviderAdapter>,
    line: Vec<u8>,
    first: bool,
    finished: bool,
    first_chunk_timeout: Duration,
    chunk_timeout: Duration,
}

/// Translate a provider SSE body into client frames.
///
/// `data:` payloads run through the adapter's chunk translator; `event:`
/// lines and blank keep-alives pass through verbatim. Read errors and
/// timeouts are logged and end the stream; bytes already sent stand.
pub(crate) fn sse_frames<R>(
    reader: R,
    adapter: Arc<dyn ProviderAdapter>,
    first_chunk_timeout: Duration,
    chunk_timeout: Duration,
) -> BoxStream<'static, std::io::Result<Bytes>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let state = SseState {
        reader,
        adapter,
        line: Vec::new(),
        first: true,
        finished: false,
        first_chunk_timeout,
        chunk_timeout,
    };

    Box::pin(stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }
        loop {
            let deadline = if st.first {
                st.first_chunk_timeout
            } else {
                st.chunk_timeout
            };
            let read = tokio::time::timeout(
                deadline,
                read_line_limited(&mut st.reader, &mut st.line, MAX_LINE_BYTES),
            )
            .await;

            let has_line = match read {
                Err(_) => {
                    warn!(
                        provider = %st.adapter.name(),
                        first = st.first,
                        "stream chunk timed out"
                    );
                    return None;
                }
                Ok(Err(err)) => {
                    error!(error = %err, provider = %st.adapter.name(), "error reading stream");
                    return None;
                }
                Ok(Ok(has_line)) => has_line,
            };
            if !has_line {
                // Provider closed the body without [DONE]; the client sees
                // the connection close.
                return None;
            }
            st.first = false;

            let raw = String::from_utf8_lossy(&st.line).into_owned();
            let line = raw.trim_end_matches(['\r', '\n']);

            let Some(payload) = line.strip_prefix("data: ") else {
                // Forward event: lines and blank keep-alives as-is.
                if line.is_empty() || line.starts_with("event: ") {
                    let frame = Bytes::from(format!("{line}\n"));
                    return Some((Ok(frame), st));
                }
                continue;
            };

            if payload == "[DONE]" {
                st.finished = true;
                return Some((Ok(Bytes::from_static(DONE_FRAME)), st));
            }

            match st.adapter.transform_stream_chunk(payload.as_bytes()) {
                Ok(StreamEvent::Emit(bytes)) => {
                    let mut frame = BytesMut::with_capacity(bytes.len() + 8);
                    frame.put_slice(b"data: ");
                    frame.put_slice(&bytes);
                    frame.put_slice(b"\n\n");
                    return Some((Ok(frame.freeze()), st));
                }
                Ok(StreamEvent::Skip) => continue,
                Ok(StreamEvent::Done) => {
                    st.finished = true;
                    return Some((Ok(Bytes::from_static(DONE_FRAME)), st));
                }
                Err(err) => {
                    error!(
                        error = %err,
                        provider = %st.adapter.name(),
                        "failed to transform stream chunk"
                    );
                    continue;
                }
            }
        }
    }))
}

/// Read one line (through `\n`) into `out`, bounded by `max_bytes`.
/// Returns false at clean EOF with nothing buffered.
async fn read_line_limited<R>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_bytes: usize,
) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    out.clear();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(!out.is_empty());
        }

        let newline_pos = buf.iter().position(|b| *b == b'\n');
        let take_len = newline_pos.map(|pos| pos + 1).unwrap_or(buf.len());

        if out.len().saturating_add(take_len) > max_bytes {
            return Err(std::io::Error::other(format!(
                "SSE line exceeds {max_bytes} bytes"
            )));
        }

        out.extend_from_slice(&buf[..take_len]);
        reader.consume(take_len);

        if newline_pos.is_some() {
            return Ok(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::anthropic::AnthropicAdapter;
    use crate::adapters::openai::OpenAiAdapter;
    use crate::config::ProviderConfig;
    use futures_util::StreamExt;

    fn reader_for(body: &str) -> BufReader<&[u8]> {
        BufReader::new(body.as_bytes())
    }

    async fn collect_frames(
        body: &'static str,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Vec<String> {
        let frames = sse_frames(
            reader_for(body),
            adapter,
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        frames
            .map(|frame| String::from_utf8(frame.unwrap().to_vec()).unwrap())
            .collect()
            .await
    }

    fn anthropic() -> Arc<dyn ProviderAdapter> {
        Arc::new(AnthropicAdapter::new(
            "anthropic",
            ProviderConfig::default(),
        ))
    }

    fn openai() -> Arc<dyn ProviderAdapter> {
        Arc::new(OpenAiAdapter::new("openai", ProviderConfig::default()))
    }

    #[tokio::test]
    async fn anthropic_events_translate_to_canonical_frames() {
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{}}\n",
            "\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n",
            "\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" world\"}}\n",
            "\n",
            "data: {\"type\":\"message_stop\"}\n",
        );
        let frames = collect_frames(body, anthropic()).await;

        let data_frames: Vec<&String> =
            frames.iter().filter(|f| f.starts_with("data: ")).collect();
        assert_eq!(data_frames.len(), 3);
        assert!(data_frames[0].contains("Hello"));
        assert!(data_frames[1].contains(" world"));
        assert_eq!(data_frames[2].as_str(), "data: [DONE]\n\n");
        // Bookkeeping events never reach the client as data.
        assert!(!frames.iter().any(|f| f.contains("message_start")));
        // event: lines pass through verbatim.
        assert!(frames.iter().any(|f| f == "event: message_start\n"));
    }

    #[tokio::test]
    async fn openai_done_sentinel_is_forwarded() {
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"}}]}\n",
            "\n",
            "data: [DONE]\n",
            "\n",
        );
        let frames = collect_frames(body, openai()).await;
        assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
        // Nothing after [DONE].
        let done_pos = frames.iter().position(|f| f == "data: [DONE]\n\n").unwrap();
        assert_eq!(done_pos, frames.len() - 1);
    }

    #[tokio::test]
    async fn provider_close_without_done_ends_stream() {
        let body = "data: {\"choices\":[]}\n";
        let frames = collect_frames(body, openai()).await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with("data: "));
    }

    #[tokio::test]
    async fn oversized_line_terminates_stream() {
        let frames = sse_frames(
            reader_for("data: x\n"),
            openai(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        // A tiny reader with the default cap passes; exercise the cap
        // directly through the bounded reader instead.
        drop(frames);

        let mut reader = BufReader::new(&b"data: 0123456789\n"[..]);
        let mut line = Vec::new();
        let err = read_line_limited(&mut reader, &mut line, 4)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }
}
