//! Model routing: alias → ordered candidate routes, gated by the
//! classification lattice first and provider health second.

pub mod circuit;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::adapters::anthropic::AnthropicAdapter;
use crate::adapters::openai::OpenAiAdapter;
use crate::adapters::ProviderAdapter;
use crate::config::{ModelsConfig, ProviderRoute, ProvidersConfig};
use crate::error::{GatewayError, Result};
use crate::types::Classification;

pub use circuit::{CircuitBreaker, CircuitState, HealthTracker};

/// Provider adapters by registry name. Read-mostly; the whole map is swapped
/// on config reload.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Swap the full adapter set. Reload hook; in-flight requests keep the
    /// adapters they already resolved.
    pub fn replace(&self, adapters: HashMap<String, Arc<dyn ProviderAdapter>>) {
        *self.adapters.write().unwrap_or_else(|e| e.into_inner()) = adapters;
    }

    /// Build adapters from the providers config. Unknown types get the
    /// OpenAI-compatible adapter.
    pub fn from_config(config: &ProvidersConfig) -> Self {
        let registry = Self::new();
        for (name, provider) in &config.providers {
            let adapter: Arc<dyn ProviderAdapter> = match provider.provider_type.as_str() {
                "anthropic" => Arc::new(AnthropicAdapter::new(name.clone(), provider.clone())),
                _ => Arc::new(OpenAiAdapter::new(name.clone(), provider.clone())),
            };
            registry.register(name.clone(), adapter);
        }
        registry
    }
}

/// Whether a route's ceiling permits a request at `tier`. An empty ceiling
/// allows all tiers; an unparseable ceiling denies; an unknown request tier
/// would have failed open at parse time, before this point.
fn route_eligible(route: &ProviderRoute, tier: Classification) -> bool {
    if route.classification_ceiling.is_empty() {
        return true;
    }
    match Classification::parse(&route.classification_ceiling) {
        Some(ceiling) => ceiling.allows(tier),
        None => false,
    }
}

/// Resolve a model alias to `(adapter, provider_model)`.
///
/// Candidates are tried in order: primary, then fallbacks. A candidate wins
/// when its ceiling admits the request tier, its provider has a registered
/// adapter, and its circuit breaker allows traffic. The preferred-provider
/// hint only reorders candidates that already appear in the list.
pub fn resolve_route(
    models: &ModelsConfig,
    registry: &AdapterRegistry,
    health: &HealthTracker,
    model: &str,
    tier: Classification,
    prefer_provider: Option<&str>,
) -> Result<(Arc<dyn ProviderAdapter>, String)> {
    let mapping = models
        .models
        .get(model)
        .ok_or_else(|| GatewayError::NoEligibleRoute(format!("unknown model: {model}")))?;

    let mut candidates: Vec<&ProviderRoute> = Vec::with_capacity(1 + mapping.fallback.len());
    candidates.push(&mapping.primary);
    candidates.extend(mapping.fallback.iter());

    if let Some(preferred) = prefer_provider.filter(|p| !p.is_empty()) {
        if candidates.iter().any(|route| route.provider == preferred) {
            candidates.sort_by_key(|route| route.provider != preferred);
        }
    }

    for route in candidates {
        if !route_eligible(route, tier) {
            continue;
        }
        let Some(adapter) = registry.get(&route.provider) else {
            continue;
        };
        if !health.is_available(&route.provider) {
            continue;
        }
        return Ok((adapter, route.model.clone()));
    }

    Err(GatewayError::NoEligibleRoute(format!(
        "no eligible provider for model {model} at classification {tier}"
    )))
}
