//! Sliding-window rate limiting and daily spend budgets over Redis.
//!
//! Both checks fail open when the counter store is unreachable: availability
//! over strictness, logged at warn so operators can see it happening.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::warn;

use crate::auth::Principal;
use crate::error::GatewayError;
use crate::http::{AppState, RequestId};

pub const DEFAULT_RPM: u32 = 60;
pub const WINDOW: Duration = Duration::from_secs(60);

const RATE_KEY_PREFIX: &str = "aegis:rl:rpm:";
const BUDGET_KEY_PREFIX: &str = "aegis:budget:daily:";

/// Atomically: drop entries older than the window, count the rest, and admit
/// (recording the arrival) only while under the limit.
/// KEYS[1] = sorted-set key; ARGV = window start (µs), now (µs), limit, TTL.
/// Returns [current_count, 1=allowed/0=denied].
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local window_start = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', key, '-inf', window_start)
local count = redis.call('ZCARD', key)

if count < limit then
    redis.call('ZADD', key, now, now .. ':' .. math.random(1000000))
    redis.call('EXPIRE', key, ttl)
    return {count + 1, 1}
end

redis.call('EXPIRE', key, ttl)
return {count, 0}
"#;

#[derive(Clone, Debug)]
pub struct LimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: i64,
    pub reset_at: OffsetDateTime,
    pub retry_after: Option<Duration>,
}

impl LimitDecision {
    fn open(limit: u32, window: Duration) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: i64::from(limit),
            reset_at: OffsetDateTime::now_utc() + window,
            retry_after: None,
        }
    }

    pub fn reset_at_rfc3339(&self) -> String {
        self.reset_at.format(&Rfc3339).unwrap_or_default()
    }
}

pub struct RateLimiter {
    redis: Option<redis::Client>,
}

impl RateLimiter {
    pub fn new(redis: Option<redis::Client>) -> Self {
        Self { redis }
    }

    pub async fn check(&self, key_id: &str, limit: u32, window: Duration) -> LimitDecision {
        let Some(client) = self.redis.as_ref() else {
            let mut decision = LimitDecision::open(limit, window);
            decision.remaining = i64::from(limit) - 1;
            return decision;
        };

        let now = OffsetDateTime::now_utc();
        let now_micros = (now.unix_timestamp_nanos() / 1_000) as i64;
        let window_micros = window.as_micros() as i64;
        let ttl_secs = window.as_secs() as i64 + 1;
        let redis_key = format!("{RATE_KEY_PREFIX}{key_id}");

        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "rate limit store unreachable; failing open");
                return LimitDecision::open(limit, window);
            }
        };

        let script = redis::Script::new(SLIDING_WINDOW_SCRIPT);
        let result: Result<Vec<i64>, redis::RedisError> = script
            .key(&redis_key)
            .arg(now_micros - window_micros)
            .arg(now_micros)
            .arg(i64::from(limit))
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await;

        let values = match result {
            Ok(values) if values.len() >= 2 => values,
            Ok(_) => {
                warn!("rate limit script returned unexpected shape; failing open");
                return LimitDecision::open(limit, window);
            }
            Err(err) => {
                warn!(error = %err, "rate limit script failed; failing open");
                return LimitDecision::open(limit, window);
            }
        };

        let count = values[0];
        let allowed = values[1] == 1;
        let remaining = (i64::from(limit) - count).max(0);
        LimitDecision {
            allowed,
            limit,
            remaining,
            reset_at: now + window,
            // Conservative: half the window.
            retry_after: (!allowed).then(|| window / 2),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub spent_cents: i64,
    pub limit_cents: i64,
}

pub struct BudgetTracker {
    redis: Option<redis::Client>,
}

fn daily_budget_key(team_id: &str, now: OffsetDateTime) -> String {
    let day = now
        .date()
        .format(&format_description!("[year]-[month]-[day]"))
        .unwrap_or_default();
    format!("{BUDGET_KEY_PREFIX}{team_id}:{day}")
}

/// Seconds until the next UTC midnight, plus an hour of slack.
fn seconds_to_end_of_day(now: OffsetDateTime) -> i64 {
    let next_midnight = now
        .date()
        .next_day()
        .map(|day| day.midnight().assume_utc())
        .unwrap_or(now);
    (next_midnight - now).whole_seconds().max(0) + 3600
}

impl BudgetTracker {
    pub fn new(redis: Option<redis::Client>) -> Self {
        Self { redis }
    }

    pub async fn check_daily_spend(&self, team_id: &str, limit_cents: i64) -> BudgetDecision {
        let open = BudgetDecision {
            allowed: true,
            spent_cents: 0,
            limit_cents,
        };
        let Some(client) = self.redis.as_ref() else {
            return open;
        };
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "budget store unreachable; failing open");
                return open;
            }
        };

        let key = daily_budget_key(team_id, OffsetDateTime::now_utc());
        let spent: i64 = match redis::cmd("GET")
            .arg(&key)
            .query_async::<Option<i64>>(&mut conn)
            .await
        {
            Ok(value) => value.unwrap_or(0),
            Err(err) => {
                warn!(error = %err, "budget read failed; failing open");
                return open;
            }
        };

        BudgetDecision {
            allowed: spent < limit_cents,
            spent_cents: spent,
            limit_cents,
        }
    }

    /// Record spend after a successful completion. Zero or negative cost is a
    /// no-op; failures are logged and swallowed.
    pub async fn record_spend(&self, team_id: &str, cost_cents: i64) {
        if cost_cents <= 0 {
            return;
        }
        let Some(client) = self.redis.as_ref() else {
            return;
        };
        let Ok(mut conn) = client.get_multiplexed_async_connection().await else {
            warn!("budget store unreachable; spend not recorded");
            return;
        };

        let now = OffsetDateTime::now_utc();
        let key = daily_budget_key(team_id, now);
        let ttl = seconds_to_end_of_day(now);
        let result: Result<(), redis::RedisError> = redis::pipe()
            .cmd("INCRBY")
            .arg(&key)
            .arg(cost_cents)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(ttl)
            .ignore()
            .query_async(&mut conn)
            .await;
        if let Err(err) = result {
            warn!(error = %err, "failed to record spend");
        }
    }
}

fn apply_limit_headers(response: &mut Response, decision: &LimitDecision) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("x-ratelimit-limit-requests", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining-requests", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.reset_at_rfc3339()) {
        headers.insert("x-ratelimit-reset-requests", value);
    }
}

/// Rate-limit and budget middleware. Runs after auth; emits the rate-limit
/// headers on every response it touches.
pub async fn middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .cloned()
        .unwrap_or_default();
    let Some(principal) = request.extensions().get::<Arc<Principal>>().cloned() else {
        // Unauthenticated request slipped through; auth middleware owns that.
        return next.run(request).await;
    };

    let rpm = principal.rpm_limit.unwrap_or(DEFAULT_RPM);
    let decision = state.limiter.check(&principal.id, rpm, WINDOW).await;

    if !decision.allowed {
        warn!(
            key_id = %principal.id,
            org_id = %principal.organization_id,
            limit = rpm,
            dimension = "rpm",
            "rate limit exceeded"
        );
        state
            .metrics
            .record_rate_limit_hit("rpm", &principal.organization_id);
        let retry_after_secs = decision.retry_after.map(|d| d.as_secs()).unwrap_or(0);
        let mut response = GatewayError::RateLimited {
            limit: rpm,
            retry_after_secs,
        }
        .into_response_with_id(&request_id.0);
        apply_limit_headers(&mut response, &decision);
        if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
            response.headers_mut().insert("retry-after", value);
        }
        return response;
    }

    if let Some(limit_cents) = principal.daily_spend_limit_cents {
        let budget = state
            .budget
            .check_daily_spend(&principal.team_id, limit_cents)
            .await;
        if !budget.allowed {
            warn!(
                key_id = %principal.id,
                team_id = %principal.team_id,
                spent_cents = budget.spent_cents,
                limit_cents = budget.limit_cents,
                "daily budget exceeded"
            );
            state
                .metrics
                .record_rate_limit_hit("budget", &principal.team_id);
            let mut response = GatewayError::BudgetExceeded {
                spent_cents: budget.spent_cents,
                limit_cents: budget.limit_cents,
            }
            .into_response_with_id(&request_id.0);
            apply_limit_headers(&mut response, &decision);
            return response;
        }
    }

    let mut response = next.run(request).await;
    apply_limit_headers(&mut response, &decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[tokio::test]
    async fn missing_store_fails_open() {
        let limiter = RateLimiter::new(None);
        let decision = limiter.check("key-1", 60, WINDOW).await;
        assert!(decision.allowed);
        assert_eq!(decision.limit, 60);
        assert_eq!(decision.remaining, 59);
        assert!(decision.retry_after.is_none());
    }

    #[tokio::test]
    async fn budget_without_store_allows() {
        let tracker = BudgetTracker::new(None);
        let decision = tracker.check_daily_spend("team-1", 100).await;
        assert!(decision.allowed);
        // record_spend with no store is a no-op.
        tracker.record_spend("team-1", 50).await;
        tracker.record_spend("team-1", 0).await;
    }

    #[test]
    fn budget_key_embeds_utc_day() {
        let now = datetime!(2025-03-07 23:59:00 UTC);
        assert_eq!(
            daily_budget_key("team-9", now),
            "aegis:budget:daily:team-9:2025-03-07"
        );
    }

    #[test]
    fn end_of_day_ttl_includes_slack_hour() {
        let now = datetime!(2025-03-07 23:00:00 UTC);
        // One hour to midnight plus the slack hour.
        assert_eq!(seconds_to_end_of_day(now), 7200);
    }

    #[test]
    fn reset_header_is_rfc3339() {
        let decision = LimitDecision {
            allowed: true,
            limit: 60,
            remaining: 10,
            reset_at: datetime!(2025-03-07 12:00:00 UTC),
            retry_after: None,
        };
        assert_eq!(decision.reset_at_rfc3339(), "2025-03-07T12:00:00Z");
    }

    /// Requires a live Redis at REDIS_URL; run with `cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn sixty_first_request_in_window_is_denied() {
        let url = std::env::var("REDIS_URL").expect("REDIS_URL not set");
        let client = redis::Client::open(url).expect("invalid REDIS_URL");
        let limiter = RateLimiter::new(Some(client));
        let key = format!("test-{}", std::process::id());

        for i in 0..60 {
            let decision = limiter.check(&key, 60, WINDOW).await;
            assert!(decision.allowed, "request {i} should be admitted");
        }
        let decision = limiter.check(&key, 60, WINDOW).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after, Some(Duration::from_secs(30)));
    }
}
