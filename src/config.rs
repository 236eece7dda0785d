//! Gateway configuration. Loading and hot reload live outside the crate;
//! the binary reads a single JSON document into [`GatewayConfig`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub auth_db: AuthDbConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://localhost:6379/0`. Empty disables the
    /// shared store: auth cache is skipped and limits fail open.
    #[serde(default)]
    pub url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthDbConfig {
    #[serde(default = "default_auth_db_path")]
    pub path: String,
}

fn default_auth_db_path() -> String {
    "aegis-keys.db".to_string()
}

impl Default for AuthDbConfig {
    fn default() -> Self {
        Self {
            path: default_auth_db_path(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub secrets: SecretsFilterConfig,
    #[serde(default)]
    pub injection: InjectionFilterConfig,
    #[serde(default)]
    pub pii: PiiServiceConfig,
    #[serde(default)]
    pub policy: PolicyFilterConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretsFilterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for SecretsFilterConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InjectionFilterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_block_threshold")]
    pub block_threshold: f64,
    #[serde(default = "default_flag_threshold")]
    pub flag_threshold: f64,
}

fn default_block_threshold() -> f64 {
    0.9
}

fn default_flag_threshold() -> f64 {
    0.7
}

impl Default for InjectionFilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            block_threshold: default_block_threshold(),
            flag_threshold: default_flag_threshold(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PiiServiceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Base URL of the NLP sidecar, e.g. `http://aegis-filter-nlp:50051`.
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_pii_timeout_ms")]
    pub timeout_ms: u64,
    /// When the sidecar is unreachable: pass (true) or block (false).
    #[serde(default)]
    pub fail_open: bool,
}

fn default_pii_timeout_ms() -> u64 {
    5_000
}

impl Default for PiiServiceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            timeout_ms: default_pii_timeout_ms(),
            fail_open: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyFilterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub default_allow: bool,
    #[serde(default)]
    pub rules: Vec<PolicyRuleConfig>,
    #[serde(default = "default_policy_budget_ms")]
    pub evaluation_budget_ms: u64,
}

fn default_policy_budget_ms() -> u64 {
    100
}

impl Default for PolicyFilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_allow: true,
            rules: Vec::new(),
            evaluation_budget_ms: default_policy_budget_ms(),
        }
    }
}

/// One pre-compiled authorization rule. First matching rule wins.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PolicyRuleConfig {
    pub name: String,
    /// "allow" or "deny".
    pub effect: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub classifications: Vec<String>,
    #[serde(default)]
    pub provider_types: Vec<String>,
    #[serde(default)]
    pub orgs: Vec<String>,
    #[serde(default)]
    pub teams: Vec<String>,
    /// Inclusive UTC hour range, e.g. [9, 17]. Empty means any hour.
    #[serde(default)]
    pub hours: Vec<u8>,
    #[serde(default)]
    pub days: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_provider_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_stream_first_chunk_timeout_secs")]
    pub stream_first_chunk_timeout_secs: u64,
    #[serde(default = "default_stream_chunk_timeout_secs")]
    pub stream_chunk_timeout_secs: u64,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_provider_timeout_secs() -> u64 {
    30
}

fn default_stream_first_chunk_timeout_secs() -> u64 {
    60
}

fn default_stream_chunk_timeout_secs() -> u64 {
    10
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_provider_timeout_secs(),
            stream_first_chunk_timeout_secs: default_stream_first_chunk_timeout_secs(),
            stream_chunk_timeout_secs: default_stream_chunk_timeout_secs(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_probe_interval_secs")]
    pub recovery_probe_interval_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_probe_interval_secs() -> u64 {
    15
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_probe_interval_secs: default_recovery_probe_interval_secs(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub models: HashMap<String, ModelMapping>,
    /// alias → provider → price. Values are USD per 1M tokens.
    #[serde(default)]
    pub pricing: HashMap<String, HashMap<String, PriceEntry>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelMapping {
    #[serde(default)]
    pub display_name: String,
    pub primary: ProviderRoute,
    #[serde(default)]
    pub fallback: Vec<ProviderRoute>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProviderRoute {
    pub provider: String,
    pub model: String,
    /// Highest classification this route may carry. Empty allows all tiers;
    /// an unparseable value makes the route ineligible.
    #[serde(default)]
    pub classification_ceiling: String,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PriceEntry {
    pub input: f64,
    pub output: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Wire dialect: "openai" or "anthropic". Unknown values fall back to
    /// the OpenAI-compatible adapter.
    #[serde(rename = "type", default)]
    pub provider_type: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: String::new(),
            base_url: String::new(),
            api_key: String::new(),
            timeout_secs: default_provider_timeout_secs(),
            headers: HashMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.filter.secrets.enabled);
        assert_eq!(config.filter.injection.block_threshold, 0.9);
        assert_eq!(config.filter.injection.flag_threshold, 0.7);
        assert_eq!(config.routing.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.routing.circuit_breaker.recovery_probe_interval_secs, 15);
    }

    #[test]
    fn model_mapping_parses_with_fallbacks() {
        let raw = r#"{
            "models": {
                "test-model": {
                    "primary": {"provider": "openai", "model": "gpt-4o", "classification_ceiling": "INTERNAL"},
                    "fallback": [{"provider": "internal_vllm", "model": "llama-70b", "classification_ceiling": "RESTRICTED"}]
                }
            }
        }"#;
        let models: ModelsConfig = serde_json::from_str(raw).unwrap();
        let mapping = &models.models["test-model"];
        assert_eq!(mapping.primary.provider, "openai");
        assert_eq!(mapping.fallback[0].model, "llama-70b");
    }
}
