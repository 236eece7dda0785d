//! PII filter backed by the out-of-process NLP sidecar. One RPC per message;
//! the action on detection depends on the request's classification tier.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::PiiServiceConfig;
use crate::types::{ChatRequest, Classification};

use super::{ContentFilter, FilterAction, FilterVerdict};

#[derive(Clone, Debug, Serialize)]
struct ScanPiiRequest<'a> {
    text: &'a str,
    classification: &'a str,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ScanPiiResponse {
    #[serde(default)]
    pub detected: bool,
    #[serde(default)]
    pub detections: Vec<PiiDetection>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PiiDetection {
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub start: usize,
    #[serde(default)]
    pub end: usize,
    #[serde(default)]
    pub score: f64,
}

pub struct PiiFilter {
    http: Option<reqwest::Client>,
    config: PiiServiceConfig,
}

impl PiiFilter {
    pub fn new(config: PiiServiceConfig) -> Self {
        let http = if config.address.trim().is_empty() {
            None
        } else {
            reqwest::Client::builder()
                .timeout(Duration::from_millis(config.timeout_ms.max(1)))
                .build()
                .ok()
        };
        Self { http, config }
    }

    fn scan_url(&self) -> String {
        format!(
            "{}/v1/scan",
            self.config.address.trim_end_matches('/')
        )
    }

    fn unavailable(&self) -> FilterVerdict {
        if self.config.fail_open {
            return FilterVerdict::pass("pii");
        }
        FilterVerdict {
            filter: "pii",
            action: FilterAction::Block,
            message: "PII service unavailable".to_string(),
            detections: 0,
            score: 0.0,
        }
    }

    async fn scan_text(&self, http: &reqwest::Client, text: &str, tier: &str) -> Option<ScanPiiResponse> {
        let result = http
            .post(self.scan_url())
            .json(&ScanPiiRequest {
                text,
                classification: tier,
            })
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                response.json::<ScanPiiResponse>().await.ok()
            }
            Ok(response) => {
                warn!(status = %response.status(), "pii service returned error");
                None
            }
            Err(err) => {
                warn!(error = %err, "pii service unreachable");
                None
            }
        }
    }
}

/// Detection → action, keyed on the request tier: sensitive tiers block,
/// the rest flag for review.
fn classification_action(tier: Classification, detections: usize) -> FilterAction {
    if detections == 0 {
        return FilterAction::Pass;
    }
    match tier {
        Classification::Restricted | Classification::Confidential => FilterAction::Block,
        Classification::Internal | Classification::Public => FilterAction::Flag,
    }
}

#[async_trait]
impl ContentFilter for PiiFilter {
    fn name(&self) -> &'static str {
        "pii"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn scan(&self, request: &ChatRequest) -> FilterVerdict {
        let Some(http) = self.http.as_ref() else {
            return self.unavailable();
        };

        let tier = request.classification.as_str();
        for message in &request.messages {
            let Some(response) = self.scan_text(http, &message.content, tier).await else {
                return self.unavailable();
            };

            if !response.detected {
                continue;
            }
            let count = response.detections.len();
            match classification_action(request.classification, count) {
                FilterAction::Block => {
                    return FilterVerdict {
                        filter: "pii",
                        action: FilterAction::Block,
                        message: format!("PII detected: {count} entities found"),
                        detections: count,
                        score: 0.0,
                    };
                }
                FilterAction::Flag => {
                    return FilterVerdict {
                        filter: "pii",
                        action: FilterAction::Flag,
                        message: String::new(),
                        detections: count,
                        score: 0.0,
                    };
                }
                _ => {}
            }
        }

        FilterVerdict::pass("pii")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    fn request(tier: Classification) -> ChatRequest {
        ChatRequest {
            classification: tier,
            messages: vec![Message {
                role: "user".to_string(),
                content: "call me at 555-0100".to_string(),
                name: None,
            }],
            ..ChatRequest::default()
        }
    }

    #[test]
    fn action_depends_on_tier() {
        assert_eq!(
            classification_action(Classification::Restricted, 2),
            FilterAction::Block
        );
        assert_eq!(
            classification_action(Classification::Confidential, 1),
            FilterAction::Block
        );
        assert_eq!(
            classification_action(Classification::Internal, 1),
            FilterAction::Flag
        );
        assert_eq!(
            classification_action(Classification::Public, 1),
            FilterAction::Flag
        );
        assert_eq!(
            classification_action(Classification::Restricted, 0),
            FilterAction::Pass
        );
    }

    #[tokio::test]
    async fn no_connection_fails_closed_by_default() {
        let filter = PiiFilter::new(PiiServiceConfig {
            enabled: true,
            ..PiiServiceConfig::default()
        });
        let verdict = filter.scan(&request(Classification::Internal)).await;
        assert_eq!(verdict.action, FilterAction::Block);
        assert_eq!(verdict.message, "PII service unavailable");
    }

    #[tokio::test]
    async fn no_connection_passes_when_fail_open() {
        let filter = PiiFilter::new(PiiServiceConfig {
            enabled: true,
            fail_open: true,
            ..PiiServiceConfig::default()
        });
        let verdict = filter.scan(&request(Classification::Restricted)).await;
        assert_eq!(verdict.action, FilterAction::Pass);
    }
}
