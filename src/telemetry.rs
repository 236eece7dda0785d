//! Gateway metrics: an owned registry rendered to Prometheus exposition
//! text. The scrape endpoint is wired by the embedding process; the gateway
//! only records and renders.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RequestLabels {
    pub org: String,
    pub team: String,
    pub model: String,
    pub provider: String,
    pub status: String,
    pub classification: String,
}

#[derive(Clone, Debug, Default)]
pub struct RequestObservation {
    pub labels: RequestLabels,
    pub duration_ms: f64,
    pub overhead_ms: f64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
}

#[derive(Clone, Debug)]
struct DurationHistogram {
    buckets: Vec<f64>,
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl DurationHistogram {
    fn new(buckets: Vec<f64>) -> Self {
        let counts = vec![0; buckets.len()];
        Self {
            buckets,
            counts,
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        for (i, bound) in self.buckets.iter().enumerate() {
            if value <= *bound {
                self.counts[i] += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }
}

fn duration_buckets() -> Vec<f64> {
    vec![
        50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 60000.0,
    ]
}

fn overhead_buckets() -> Vec<f64> {
    vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0]
}

#[derive(Debug, Default)]
struct MetricsInner {
    request_total: HashMap<RequestLabels, u64>,
    request_duration_ms: HashMap<(String, String), DurationHistogram>,
    gateway_overhead_ms: HashMap<String, DurationHistogram>,
    tokens_total: HashMap<(String, String, String, &'static str), u64>,
    cost_usd_total: HashMap<(String, String, String, String), f64>,
    filter_action_total: HashMap<(String, String), u64>,
    rate_limit_hit_total: HashMap<(String, String), u64>,
}

#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<MetricsInner>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_request(&self, observation: RequestObservation) {
        let mut inner = self.lock();
        let labels = observation.labels.clone();

        *inner.request_total.entry(labels.clone()).or_insert(0) += 1;

        inner
            .request_duration_ms
            .entry((labels.model.clone(), labels.provider.clone()))
            .or_insert_with(|| DurationHistogram::new(duration_buckets()))
            .observe(observation.duration_ms);

        inner
            .gateway_overhead_ms
            .entry(labels.org.clone())
            .or_insert_with(|| DurationHistogram::new(overhead_buckets()))
            .observe(observation.overhead_ms);

        if observation.prompt_tokens > 0 {
            *inner
                .tokens_total
                .entry((
                    labels.org.clone(),
                    labels.team.clone(),
                    labels.model.clone(),
                    "prompt",
                ))
                .or_insert(0) += u64::from(observation.prompt_tokens);
        }
        if observation.completion_tokens > 0 {
            *inner
                .tokens_total
                .entry((
                    labels.org.clone(),
                    labels.team.clone(),
                    labels.model.clone(),
                    "completion",
                ))
                .or_insert(0) += u64::from(observation.completion_tokens);
        }
        if observation.cost_usd > 0.0 {
            *inner
                .cost_usd_total
                .entry((
                    labels.org,
                    labels.team,
                    labels.model,
                    labels.provider,
                ))
                .or_insert(0.0) += observation.cost_usd;
        }
    }

    pub fn record_filter_action(&self, filter: &str, action: &str) {
        let mut inner = self.lock();
        *inner
            .filter_action_total
            .entry((filter.to_string(), action.to_string()))
            .or_insert(0) += 1;
    }

    pub fn record_rate_limit_hit(&self, dimension: &str, scope: &str) {
        let mut inner = self.lock();
        *inner
            .rate_limit_hit_total
            .entry((dimension.to_string(), scope.to_string()))
            .or_insert(0) += 1;
    }

    pub fn request_count(&self, status: &str) -> u64 {
        self.lock()
            .request_total
            .iter()
            .filter(|(labels, _)| labels.status == status)
            .map(|(_, count)| *count)
            .sum()
    }

    pub fn filter_action_count(&self, filter: &str, action: &str) -> u64 {
        self.lock()
            .filter_action_total
            .get(&(filter.to_string(), action.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Prometheus exposition text.
    pub fn render(&self) -> String {
        let inner = self.lock();
        let mut out = String::new();

        out.push_str("# TYPE aegis_request_total counter\n");
        let mut requests: Vec<_> = inner.request_total.iter().collect();
        requests.sort_by_key(|(labels, _)| format!("{labels:?}"));
        for (labels, count) in requests {
            out.push_str(&format!(
                "aegis_request_total{{org=\"{}\",team=\"{}\",model=\"{}\",provider=\"{}\",status=\"{}\",classification=\"{}\"}} {}\n",
                labels.org,
                labels.team,
                labels.model,
                labels.provider,
                labels.status,
                labels.classification,
                count
            ));
        }

        out.push_str("# TYPE aegis_request_duration_ms histogram\n");
        render_histograms(&mut out, "aegis_request_duration_ms", &inner.request_duration_ms, |(model, provider)| {
            format!("model=\"{model}\",provider=\"{provider}\"")
        });

        out.push_str("# TYPE aegis_gateway_overhead_ms histogram\n");
        render_histograms(&mut out, "aegis_gateway_overhead_ms", &inner.gateway_overhead_ms, |org| {
            format!("org=\"{org}\"")
        });

        out.push_str("# TYPE aegis_tokens_total counter\n");
        let mut tokens: Vec<_> = inner.tokens_total.iter().collect();
        tokens.sort_by_key(|(key, _)| format!("{key:?}"));
        for ((org, team, model, direction), count) in tokens {
            out.push_str(&format!(
                "aegis_tokens_total{{org=\"{org}\",team=\"{team}\",model=\"{model}\",direction=\"{direction}\"}} {count}\n"
            ));
        }

        out.push_str("# TYPE aegis_cost_usd_total counter\n");
        let mut costs: Vec<_> = inner.cost_usd_total.iter().collect();
        costs.sort_by_key(|(key, _)| format!("{key:?}"));
        for ((org, team, model, provider), total) in costs {
            out.push_str(&format!(
                "aegis_cost_usd_total{{org=\"{org}\",team=\"{team}\",model=\"{model}\",provider=\"{provider}\"}} {total}\n"
            ));
        }

        out.push_str("# TYPE aegis_filter_action_total counter\n");
        let mut filters: Vec<_> = inner.filter_action_total.iter().collect();
        filters.sort_by_key(|(key, _)| format!("{key:?}"));
        for ((filter, action), count) in filters {
            out.push_str(&format!(
                "aegis_filter_action_total{{filter=\"{filter}\",action=\"{action}\"}} {count}\n"
            ));
        }

        out.push_str("# TYPE aegis_rate_limit_hit_total counter\n");
        let mut hits: Vec<_> = inner.rate_limit_hit_total.iter().collect();
        hits.sort_by_key(|(key, _)| format!("{key:?}"));
        for ((dimension, scope), count) in hits {
            out.push_str(&format!(
                "aegis_rate_limit_hit_total{{dimension=\"{dimension}\",scope=\"{scope}\"}} {count}\n"
            ));
        }

        out
    }
}

fn render_histograms<K>(
    out: &mut String,
    name: &str,
    histograms: &HashMap<K, DurationHistogram>,
    label_fmt: impl Fn(&K) -> String,
) where
    K: std::fmt::Debug,
{
    let mut entries: Vec<_> = histograms.iter().collect();
    entries.sort_by_key(|(key, _)| format!("{key:?}"));
    for (key, histogram) in entries {
        let labels = label_fmt(key);
        for (bound, count) in histogram.buckets.iter().zip(&histogram.counts) {
            out.push_str(&format!(
                "{name}_bucket{{{labels},le=\"{bound}\"}} {count}\n"
            ));
        }
        out.push_str(&format!(
            "{name}_bucket{{{labels},le=\"+Inf\"}} {}\n",
            histogram.count
        ));
        out.push_str(&format!("{name}_sum{{{labels}}} {}\n", histogram.sum));
        out.push_str(&format!("{name}_count{{{labels}}} {}\n", histogram.count));
    }
}
