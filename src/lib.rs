//! AEGIS gateway: a single OpenAI-compatible HTTP surface in front of many
//! LLM back-ends, with bearer-key auth, sliding-window rate limits, daily
//! spend budgets, a content filter chain, classification-gated routing with
//! circuit breakers, and real-time SSE translation.

pub mod adapters;
pub mod auth;
pub mod config;
pub mod costing;
pub mod error;
pub mod filter;
pub mod http;
pub mod ratelimit;
pub mod router;
pub mod telemetry;
pub mod types;

pub use error::{GatewayError, Result};
pub use types::{ChatRequest, ChatResponse, Choice, Classification, Message, Usage};

pub use adapters::{ProviderAdapter, StreamEvent};
pub use auth::{CachedKeyStore, KeyStore, Principal, SqliteKeyStore};
pub use config::GatewayConfig;
pub use http::{router, AppState};
pub use router::{AdapterRegistry, CircuitBreaker, CircuitState, HealthTracker};
