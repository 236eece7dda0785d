//! Anthropic Messages adapter: splits the system role out of the message
//! list, maps stop reasons, and rewrites streaming events into canonical
//! delta chunks.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::{GatewayError, Result};
use crate::types::{ChatRequest, ChatResponse, Choice, Message, Usage};

use super::{ProviderAdapter, StreamEvent};

const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug)]
pub struct AnthropicAdapter {
    name: String,
    http: reqwest::Client,
    config: ProviderConfig,
}

impl AnthropicAdapter {
    pub fn new(name: impl Into<String>, config: ProviderConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            name: name.into(),
            http,
            config,
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/messages", self.config.base_url.trim_end_matches('/'))
    }
}

fn map_stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        "stop_sequence" => "stop".to_string(),
        other => other.to_string(),
    }
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct AnthropicRequestBody<'a> {
    model: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop_sequences: &'a [String],
}

#[derive(Deserialize)]
struct AnthropicResponseBody {
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    stop_reason: String,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type", default)]
    block_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

// Streaming: the event subset the gateway understands.
#[derive(Deserialize)]
struct AnthropicStreamEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    #[serde(default)]
    index: u32,
    #[serde(default)]
    delta: AnthropicStreamDelta,
}

#[derive(Default, Deserialize)]
struct AnthropicStreamDelta {
    #[serde(rename = "type", default)]
    delta_type: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    stop_reason: String,
}

// Canonical streaming chunk emitted toward the client.
#[derive(Serialize)]
struct CanonicalStreamChunk {
    choices: Vec<CanonicalStreamChoice>,
}

#[derive(Serialize)]
struct CanonicalStreamChoice {
    index: u32,
    delta: CanonicalDelta,
    finish_reason: Option<String>,
}

#[derive(Default, Serialize)]
struct CanonicalDelta {
    #[serde(skip_serializing_if = "String::is_empty")]
    role: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    content: String,
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> &'static str {
        "anthropic"
    }

    fn transform_request(&self, request: &ChatRequest) -> Result<reqwest::Request> {
        // System messages become the top-level system field.
        let mut system = "";
        let mut messages = Vec::with_capacity(request.messages.len());
        for message in &request.messages {
            if message.role == "system" {
                system = &message.content;
                continue;
            }
            messages.push(AnthropicMessage {
                role: &message.role,
                content: &message.content,
            });
        }

        let body = AnthropicRequestBody {
            model: &request.model,
            messages,
            system,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            stream: request.stream,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: &request.stop,
        };

        let mut builder = self
            .http
            .post(self.messages_url())
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body);
        for (key, value) in &self.config.headers {
            if !value.is_empty() {
                builder = builder.header(key, value);
            }
        }
        Ok(builder.build()?)
    }

    async fn send(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        Ok(self.http.execute(request).await?)
    }

    async fn transform_response(&self, response: reqwest::Response) -> Result<ChatResponse> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::DispatchFailed(format!(
                "{} returned status {status}: {body}",
                self.name
            )));
        }

        let body: AnthropicResponseBody = response.json().await?;
        let content = body
            .content
            .iter()
            .find(|block| block.block_type == "text")
            .map(|block| block.text.clone())
            .unwrap_or_default();

        Ok(ChatResponse {
            model: body.model,
            provider: self.name.clone(),
            choices: vec![Choice {
                index: 0,
                message: Message {
                    role: "assistant".to_string(),
                    content,
                    name: None,
                },
                finish_reason: map_stop_reason(&body.stop_reason),
            }],
            usage: Usage {
                prompt_tokens: body.usage.input_tokens,
                completion_tokens: body.usage.output_tokens,
                total_tokens: body.usage.input_tokens + body.usage.output_tokens,
            },
            ..ChatResponse::default()
        })
    }

    fn transform_stream_chunk(&self, payload: &[u8]) -> Result<StreamEvent> {
        let event: AnthropicStreamEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(err) => {
                debug!(error = %err, provider = %self.name, "skipping unparseable stream chunk");
                return Ok(StreamEvent::Skip);
            }
        };

        match event.event_type.as_str() {
            "content_block_delta" => {
                if event.delta.delta_type != "text_delta" {
                    return Ok(StreamEvent::Skip);
                }
                let chunk = CanonicalStreamChunk {
                    choices: vec![CanonicalStreamChoice {
                        index: event.index,
                        delta: CanonicalDelta {
                            content: event.delta.text,
                            ..CanonicalDelta::default()
                        },
                        finish_reason: None,
                    }],
                };
                Ok(StreamEvent::Emit(Bytes::from(serde_json::to_vec(&chunk)?)))
            }
            "message_delta" => {
                // Final chunk carrying the mapped finish reason.
                let chunk = CanonicalStreamChunk {
                    choices: vec![CanonicalStreamChoice {
                        index: 0,
                        delta: CanonicalDelta::default(),
                        finish_reason: Some(map_stop_reason(&event.delta.stop_reason)),
                    }],
                };
                Ok(StreamEvent::Emit(Bytes::from(serde_json::to_vec(&chunk)?)))
            }
            "message_stop" => Ok(StreamEvent::Done),
            // message_start, content_block_start/stop, ping, ...
            _ => Ok(StreamEvent::Skip),
        }
    }
}
