//! Provider adapters: translation between the canonical OpenAI-shaped form
//! and each provider's wire dialect, including streaming events.

pub mod anthropic;
pub mod openai;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::types::{ChatRequest, ChatResponse};

/// Outcome of translating one provider SSE payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// Forward these bytes to the client as one `data:` frame.
    Emit(Bytes),
    /// Drop the payload (provider bookkeeping events, unparseable chunks).
    Skip,
    /// Terminate the stream with `data: [DONE]`.
    Done,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync + std::fmt::Debug {
    /// Registry instance name; reported as the provider served.
    fn name(&self) -> &str;

    /// Wire dialect: "openai" or "anthropic".
    fn provider_type(&self) -> &'static str;

    fn supports_streaming(&self) -> bool {
        true
    }

    /// Serialize the canonical request into a dispatchable provider request.
    fn transform_request(&self, request: &ChatRequest) -> Result<reqwest::Request>;

    /// Dispatch over the adapter's configured client.
    async fn send(&self, request: reqwest::Request) -> Result<reqwest::Response>;

    /// Parse a full provider response into the canonical response.
    /// Non-2xx provider responses are dispatch failures.
    async fn transform_response(&self, response: reqwest::Response) -> Result<ChatResponse>;

    /// Translate one SSE data payload (the bytes after `data: `).
    fn transform_stream_chunk(&self, payload: &[u8]) -> Result<StreamEvent>;
}
