//! HTTP surface: the axum router, shared state, and request-id plumbing.

pub mod chat;
pub mod streaming;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::Serialize;

use crate::auth::store::KeyStore;
use crate::config::GatewayConfig;
use crate::costing::PricingTable;
use crate::filter::FilterChain;
use crate::ratelimit::{BudgetTracker, RateLimiter};
use crate::router::{AdapterRegistry, HealthTracker};
use crate::telemetry::Metrics;

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Gateway request id, honored from `X-Request-ID` or minted, echoed on
/// every response and error body.
#[derive(Clone, Debug, Default)]
pub struct RequestId(pub String);

fn mint_request_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("req-{nanos:x}-{seq:04x}")
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<AdapterRegistry>,
    pub health: Arc<HealthTracker>,
    pub key_store: Arc<dyn KeyStore>,
    pub limiter: Arc<RateLimiter>,
    pub budget: Arc<BudgetTracker>,
    pub filters: Arc<FilterChain>,
    pub metrics: Arc<Metrics>,
    pub pricing: Arc<PricingTable>,
}

impl AppState {
    /// Wire up shared state from config. The key store is passed in so the
    /// binary can front it with the Redis cache tier while tests substitute
    /// their own.
    pub fn from_config(config: GatewayConfig, key_store: Arc<dyn KeyStore>) -> Self {
        let redis_client = if config.redis.url.is_empty() {
            None
        } else {
            redis::Client::open(config.redis.url.as_str()).ok()
        };

        let registry = Arc::new(AdapterRegistry::from_config(&config.providers));
        let health = Arc::new(HealthTracker::new(
            config.routing.circuit_breaker.failure_threshold,
            std::time::Duration::from_secs(
                config.routing.circuit_breaker.recovery_probe_interval_secs,
            ),
        ));
        let filters = Arc::new(FilterChain::from_config(&config.filter));
        let pricing = Arc::new(PricingTable::from_models_config(&config.models));

        Self {
            registry,
            health,
            key_store,
            limiter: Arc::new(RateLimiter::new(redis_client.clone())),
            budget: Arc::new(BudgetTracker::new(redis_client)),
            filters,
            metrics: Arc::new(Metrics::new()),
            pricing,
            config: Arc::new(config),
        }
    }
}

/// Honor an incoming `X-Request-ID` or mint one; always echo it back.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(mint_request_id);

    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;
    if !response.headers().contains_key("x-request-id") {
        if let Ok(value) = id.parse() {
            response.headers_mut().insert("x-request-id", value);
        }
    }
    response
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Build the gateway router. Authenticated routes run auth, then limits;
/// the health probe stays open.
pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/models", get(chat::list_models))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::ratelimit::middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::middleware,
        ));

    Router::new()
        .route("/aegis/v1/health", get(health))
        .merge(authed)
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}
