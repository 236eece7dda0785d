//! OpenAI-compatible adapter. The canonical form is already OpenAI-shaped,
//! so translation is serialization plus auth headers, and stream chunks pass
//! through unchanged.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;
use crate::error::{GatewayError, Result};
use crate::types::{ChatRequest, ChatResponse, Choice, Message, Usage};

use super::{ProviderAdapter, StreamEvent};

#[derive(Debug)]
pub struct OpenAiAdapter {
    name: String,
    http: reqwest::Client,
    config: ProviderConfig,
}

impl OpenAiAdapter {
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

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[derive(Serialize)]
struct OpenAiRequestBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
}

#[derive(Deserialize)]
struct OpenAiResponseBody {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: OpenAiUsage,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    index: u32,
    message: Message,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> &'static str {
        "openai"
    }

    fn transform_request(&self, request: &ChatRequest) -> Result<reqwest::Request> {
        let body = OpenAiRequestBody {
            model: &request.model,
            messages: &request.messages,
            stream: request.stream,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            stop: &request.stop,
        };

        let mut builder = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.config.api_key)
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

        let body: OpenAiResponseBody = response.json().await?;
        let choices = body
            .choices
            .into_iter()
            .map(|choice| Choice {
                index: choice.index,
                message: choice.message,
                finish_reason: choice.finish_reason.unwrap_or_default(),
            })
            .collect();

        Ok(ChatResponse {
            model: body.model,
            provider: self.name.clone(),
            choices,
            usage: Usage {
                prompt_tokens: body.usage.prompt_tokens,
                completion_tokens: body.usage.completion_tokens,
                total_tokens: body.usage.total_tokens,
            },
            ..ChatResponse::default()
        })
    }

    fn transform_stream_chunk(&self, payload: &[u8]) -> Result<StreamEvent> {
        // Chunks are already in canonical streaming shape.
        Ok(StreamEvent::Emit(Bytes::copy_from_slice(payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> OpenAiAdapter {
        OpenAiAdapter::new(
            "openai",
            ProviderConfig {
                provider_type: "openai".to_string(),
                base_url: "https://api.openai.example/v1".to_string(),
                api_key: "sk-test".to_string(),
                ..ProviderConfig::default()
            },
        )
    }

    fn canonical_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: "hello".to_string(),
                name: None,
            }],
            temperature: Some(0.2),
            ..ChatRequest::default()
        }
    }

    #[test]
    fn request_carries_bearer_auth_and_url() {
        let request = adapter().transform_request(&canonical_request()).unwrap();
        assert_eq!(
            request.url().as_str(),
            "https://api.openai.example/v1/chat/completions"
        );
        let auth = request.headers().get("authorization").unwrap();
        assert_eq!(auth.to_str().unwrap(), "Bearer sk-test");
    }

    #[test]
    fn request_body_omits_unset_params() {
        let request = adapter().transform_request(&canonical_request()).unwrap();
        let body = request.body().unwrap().as_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(value["model"], "gpt-4o");
        assert_eq!(value["temperature"], 0.2);
        assert!(value.get("max_tokens").is_none());
        assert!(value.get("stream").is_none());
        assert!(value.get("stop").is_none());
    }

    #[test]
    fn stream_chunks_pass_through() {
        let event = adapter().transform_stream_chunk(b"{\"choices\":[]}").unwrap();
        assert_eq!(event, StreamEvent::Emit(Bytes::from_static(b"{\"choices\":[]}")));
    }
}
