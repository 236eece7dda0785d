//! Canonical request/response types and the data-classification lattice.
//!
//! The gateway speaks OpenAI's chat-completions dialect internally; provider
//! adapters translate to and from it at the edges.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Data-classification tier attached to principals and provider routes.
///
/// Totally ordered: a route may serve a request only when its ceiling is at
/// least the request's tier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Classification {
    #[default]
    #[serde(rename = "PUBLIC")]
    Public,
    #[serde(rename = "INTERNAL")]
    Internal,
    #[serde(rename = "CONFIDENTIAL")]
    Confidential,
    #[serde(rename = "RESTRICTED")]
    Restricted,
}

impl Classification {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PUBLIC" => Some(Self::Public),
            "INTERNAL" => Some(Self::Internal),
            "CONFIDENTIAL" => Some(Self::Confidential),
            "RESTRICTED" => Some(Self::Restricted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "PUBLIC",
            Self::Internal => "INTERNAL",
            Self::Confidential => "CONFIDENTIAL",
            Self::Restricted => "RESTRICTED",
        }
    }

    /// True when data at `tier` may pass through a boundary with this ceiling.
    pub fn allows(&self, tier: Classification) -> bool {
        *self >= tier
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// The gateway's internal neutral form of an incoming chat request.
///
/// Deserialized straight from the client body, then enriched with identity
/// fields from the authenticated principal. Immutable afterwards except that
/// `model` is rewritten to the provider-specific name at route time.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    // Identity, filled in by the handler after auth.
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub api_key_id: String,
    #[serde(default)]
    pub classification: Classification,

    // Request content.
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,

    // Routing hints from request headers.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefer_provider: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_context: String,

    #[serde(skip)]
    pub received_at: Option<Instant>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    pub request_id: String,
    pub model: String,
    pub provider: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
    pub estimated_cost_usd: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_actions: Vec<FilterActionRecord>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: String,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Per-filter outcome surfaced on the response for non-pass results.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FilterActionRecord {
    pub filter: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub detections: usize,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub score: f64,
}

fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_totally_ordered() {
        assert!(Classification::Public < Classification::Internal);
        assert!(Classification::Internal < Classification::Confidential);
        assert!(Classification::Confidential < Classification::Restricted);
    }

    #[test]
    fn ceiling_allows_at_or_below() {
        assert!(Classification::Restricted.allows(Classification::Public));
        assert!(Classification::Internal.allows(Classification::Internal));
        assert!(!Classification::Internal.allows(Classification::Restricted));
    }

    #[test]
    fn parse_round_trips() {
        for tier in [
            Classification::Public,
            Classification::Internal,
            Classification::Confidential,
            Classification::Restricted,
        ] {
            assert_eq!(Classification::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(Classification::parse("SECRET"), None);
    }

    #[test]
    fn request_deserializes_without_identity_fields() {
        let req: ChatRequest = serde_json::from_str(
            r#"{"model":"gpt-x","messages":[{"role":"user","content":"hi"}],"stream":true}"#,
        )
        .unwrap();
        assert_eq!(req.model, "gpt-x");
        assert!(req.stream);
        assert_eq!(req.classification, Classification::Public);
        assert!(req.request_id.is_empty());
    }
}
