//! Bearer-key authentication: fingerprinting, the principal record, and the
//! axum middleware that resolves tokens on the way in.

pub mod store;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, warn};

use crate::error::GatewayError;
use crate::http::{AppState, RequestId};
use crate::types::Classification;

pub use store::{CachedKeyStore, KeyStore, PersistedKey, SqliteKeyStore, StoreError};

const KEY_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const KEY_RANDOM_LEN: usize = 32;

/// Identity resolved from a bearer key. Read-only in the hot path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub organization_id: String,
    pub team_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub name: String,
    pub max_classification: Classification,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_spend_limit_cents: Option<i64>,
    pub expires_at: i64,
}

impl Principal {
    pub fn model_allowed(&self, alias: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == alias)
    }
}

/// SHA-256 hex fingerprint of a raw key. The raw key is never stored.
pub fn hash_key(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Mint a new key: `aegis-{env}-{32 random alphanumeric chars}`.
pub fn generate_key(env: &str) -> String {
    let mut rng = rand::thread_rng();
    let random: String = (0..KEY_RANDOM_LEN)
        .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
        .collect();
    format!("aegis-{env}-{random}")
}

/// Display-safe prefix: `aegis-{env}-` plus the first 8 random chars.
pub fn key_prefix(raw: &str) -> String {
    let mut dashes = 0;
    for (i, c) in raw.char_indices() {
        if c == '-' {
            dashes += 1;
            if dashes == 2 {
                let end = (i + 9).min(raw.len());
                return raw[..end].to_string();
            }
        }
    }
    raw.chars().take(16).collect()
}

fn bearer_token(request: &Request) -> Result<&str, GatewayError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .ok_or_else(|| {
            GatewayError::AuthMissing(
                "missing Authorization header; use: Authorization: Bearer <api-key>".to_string(),
            )
        })?
        .to_str()
        .map_err(|_| GatewayError::AuthInvalid("malformed Authorization header".to_string()))?;

    let token = header.strip_prefix("Bearer ").ok_or_else(|| {
        GatewayError::AuthInvalid(
            "invalid Authorization format; use: Authorization: Bearer <api-key>".to_string(),
        )
    })?;
    if token.is_empty() {
        return Err(GatewayError::AuthInvalid("empty API key".to_string()));
    }
    Ok(token)
}

/// Authentication middleware: resolves the bearer key to a principal and
/// attaches it to the request.
pub async fn middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .cloned()
        .unwrap_or_default();

    let token = match bearer_token(&request) {
        Ok(token) => token.to_string(),
        Err(err) => return err.into_response_with_id(&request_id.0),
    };

    let fingerprint = hash_key(&token);
    match state.key_store.lookup(&fingerprint).await {
        Ok(Some(principal)) => {
            request.extensions_mut().insert(Arc::new(principal));
            next.run(request).await
        }
        Ok(None) => {
            warn!(key_prefix = %key_prefix(&token), "auth failed: key not found");
            GatewayError::AuthInvalid("invalid API key".to_string())
                .into_response_with_id(&request_id.0)
        }
        Err(err) => {
            error!(error = %err, key_prefix = %key_prefix(&token), "key lookup failed");
            GatewayError::Internal("authentication backend failure".to_string())
                .into_response_with_id(&request_id.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_sha256_hex() {
        // sha256("test") — well-known digest.
        assert_eq!(
            hash_key("test"),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }

    #[test]
    fn generated_keys_have_expected_shape() {
        let key = generate_key("prod");
        assert!(key.starts_with("aegis-prod-"));
        assert_eq!(key.len(), "aegis-prod-".len() + KEY_RANDOM_LEN);
        assert_ne!(generate_key("prod"), key);
    }

    #[test]
    fn prefix_truncates_after_eight_random_chars() {
        assert_eq!(
            key_prefix("aegis-prod-abcdefghijklmnopqrstuvwxyz012345"),
            "aegis-prod-abcdefgh"
        );
        assert_eq!(key_prefix("short"), "short");
    }

    #[test]
    fn model_allow_list_empty_means_all() {
        let mut principal = Principal {
            id: String::new(),
            organization_id: String::new(),
            team_id: String::new(),
            user_id: None,
            name: String::new(),
            max_classification: Classification::Public,
            allowed_models: Vec::new(),
            rpm_limit: None,
            tpm_limit: None,
            daily_spend_limit_cents: None,
            expires_at: 0,
        };
        assert!(principal.model_allowed("anything"));
        principal.allowed_models = vec!["gpt-x".to_string()];
        assert!(principal.model_allowed("gpt-x"));
        assert!(!principal.model_allowed("other"));
    }
}
