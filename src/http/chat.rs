//! `/v1/chat/completions` and `/v1/models`.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bytes::Bytes;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::auth::Principal;
use crate::costing::{usd_micros_to_cents, usd_micros_to_usd};
use crate::error::GatewayError;
use crate::filter::FilterAction;
use crate::router::resolve_route;
use crate::telemetry::{RequestLabels, RequestObservation};
use crate::types::ChatRequest;

use super::{streaming, AppState, RequestId};

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(principal): Extension<Arc<Principal>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let received_at = Instant::now();
    let request_id = request_id.0;

    let mut request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return GatewayError::BadRequest(format!("invalid JSON: {err}"))
                .into_response_with_id(&request_id);
        }
    };

    if request.model.is_empty() {
        return GatewayError::BadRequest("model is required".to_string())
            .into_response_with_id(&request_id);
    }
    if request.messages.is_empty() {
        return GatewayError::BadRequest("messages is required".to_string())
            .into_response_with_id(&request_id);
    }

    // Enrich with the authenticated identity.
    request.request_id = request_id.clone();
    request.organization_id = principal.organization_id.clone();
    request.team_id = principal.team_id.clone();
    request.user_id = principal.user_id.clone().unwrap_or_default();
    request.api_key_id = principal.id.clone();
    request.classification = principal.max_classification;
    request.received_at = Some(received_at);
    request.project = header_value(&headers, "x-aegis-project");
    request.prefer_provider = header_value(&headers, "x-aegis-prefer-provider");
    request.trace_context = header_value(&headers, "x-aegis-trace-context");

    // Content filters, before any routing decision.
    let (verdicts, blocked) = state.filters.run(&request).await;
    for verdict in &verdicts {
        if verdict.action != FilterAction::Pass {
            state
                .metrics
                .record_filter_action(verdict.filter, verdict.action.as_str());
        }
    }
    let filter_records: Vec<_> = verdicts
        .iter()
        .filter(|verdict| verdict.action != FilterAction::Pass)
        .map(|verdict| verdict.record())
        .collect();

    if let Some(block) = blocked {
        warn!(
            request_id = %request_id,
            filter = block.filter,
            detections = block.detections,
            score = block.score,
            org_id = %principal.organization_id,
            "request blocked by content filter"
        );
        return GatewayError::ContentBlocked {
            filter: block.filter.to_string(),
            message: block.message,
        }
        .into_response_with_id(&request_id);
    }

    // Route, classification gate first, then health.
    let prefer = (!request.prefer_provider.is_empty()).then_some(request.prefer_provider.as_str());
    let (adapter, provider_model) = match resolve_route(
        &state.config.models,
        &state.registry,
        &state.health,
        &request.model,
        request.classification,
        prefer,
    ) {
        Ok(resolved) => resolved,
        Err(err) => return err.into_response_with_id(&request_id),
    };

    let original_model = request.model.clone();
    request.model = provider_model;
    let provider = adapter.name().to_string();

    let provider_request = match adapter.transform_request(&request) {
        Ok(provider_request) => provider_request,
        Err(err) => {
            error!(error = %err, provider = %provider, "failed to transform request");
            return GatewayError::Internal("failed to prepare provider request".to_string())
                .into_response_with_id(&request_id);
        }
    };

    if request.stream {
        return streaming::handle_stream(
            &state,
            adapter,
            provider_request,
            request_id,
            original_model,
            principal,
        )
        .await;
    }

    let provider_response = match adapter.send(provider_request).await {
        Ok(provider_response) => provider_response,
        Err(err) => {
            state.health.record_failure(&provider);
            error!(error = %err, provider = %provider, "provider request failed");
            return GatewayError::DispatchFailed("provider request failed".to_string())
                .into_response_with_id(&request_id);
        }
    };

    let mut response = match adapter.transform_response(provider_response).await {
        Ok(response) => response,
        Err(err) => {
            state.health.record_failure(&provider);
            error!(error = %err, provider = %provider, "failed to transform response");
            let mapped = match err {
                dispatch @ GatewayError::DispatchFailed(_) => dispatch,
                _ => GatewayError::Internal("failed to process provider response".to_string()),
            };
            return mapped.into_response_with_id(&request_id);
        }
    };
    // Success only counts once translation has completed.
    state.health.record_success(&provider);

    response.request_id = request_id.clone();
    response.filter_actions = filter_records;

    let cost_usd_micros = state
        .pricing
        .estimate_usd_micros(&original_model, &provider, response.usage)
        .unwrap_or(0);
    response.estimated_cost_usd = usd_micros_to_usd(cost_usd_micros);

    let duration_ms = received_at.elapsed().as_secs_f64() * 1000.0;
    info!(
        request_id = %request_id,
        model_requested = %original_model,
        model_served = %response.model,
        provider = %provider,
        prompt_tokens = response.usage.prompt_tokens,
        completion_tokens = response.usage.completion_tokens,
        total_tokens = response.usage.total_tokens,
        estimated_cost_usd = response.estimated_cost_usd,
        duration_ms = duration_ms as u64,
        status_code = 200,
        stream = false,
        classification = %request.classification,
        org_id = %principal.organization_id,
        team_id = %principal.team_id,
        "request completed"
    );

    state.metrics.record_request(RequestObservation {
        labels: RequestLabels {
            org: principal.organization_id.clone(),
            team: principal.team_id.clone(),
            model: original_model,
            provider: provider.clone(),
            status: "200".to_string(),
            classification: request.classification.as_str().to_string(),
        },
        duration_ms,
        overhead_ms: duration_ms,
        prompt_tokens: response.usage.prompt_tokens,
        completion_tokens: response.usage.completion_tokens,
        cost_usd: response.estimated_cost_usd,
    });

    state
        .budget
        .record_spend(&principal.team_id, usd_micros_to_cents(cost_usd_micros))
        .await;

    (StatusCode::OK, Json(response)).into_response()
}

#[derive(Serialize)]
struct ModelObject {
    id: String,
    object: &'static str,
    created: i64,
    owned_by: &'static str,
}

#[derive(Serialize)]
struct ModelListResponse {
    object: &'static str,
    data: Vec<ModelObject>,
}

pub async fn list_models(
    State(state): State<AppState>,
    Extension(principal): Extension<Arc<Principal>>,
) -> Response {
    let mut data: Vec<ModelObject> = state
        .config
        .models
        .models
        .keys()
        .filter(|alias| principal.model_allowed(alias))
        .map(|alias| ModelObject {
            id: alias.clone(),
            object: "model",
            created: 0,
            owned_by: "aegis",
        })
        .collect();
    data.sort_by(|a, b| a.id.cmp(&b.id));

    Json(ModelListResponse {
        object: "list",
        data,
    })
    .into_response()
}
