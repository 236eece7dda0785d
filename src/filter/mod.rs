//! Content filter chain. Filters run in order; the first Block short-circuits
//! the chain and the request never reaches a provider.

pub mod injection;
pub mod pii;
pub mod policy;
pub mod secrets;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::FilterConfig;
use crate::types::{ChatRequest, FilterActionRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterAction {
    Pass,
    Flag,
    Redact,
    Block,
}

impl FilterAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Flag => "flag",
            Self::Redact => "redact",
            Self::Block => "block",
        }
    }
}

#[derive(Clone, Debug)]
pub struct FilterVerdict {
    pub filter: &'static str,
    pub action: FilterAction,
    pub message: String,
    pub detections: usize,
    pub score: f64,
}

impl FilterVerdict {
    pub fn pass(filter: &'static str) -> Self {
        Self {
            filter,
            action: FilterAction::Pass,
            message: String::new(),
            detections: 0,
            score: 0.0,
        }
    }

    pub fn record(&self) -> FilterActionRecord {
        FilterActionRecord {
            filter: self.filter.to_string(),
            action: self.action.as_str().to_string(),
            detections: self.detections,
            score: self.score,
        }
    }
}

#[async_trait]
pub trait ContentFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn enabled(&self) -> bool;
    async fn scan(&self, request: &ChatRequest) -> FilterVerdict;
}

pub struct FilterChain {
    filters: Vec<Arc<dyn ContentFilter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn ContentFilter>>) -> Self {
        Self { filters }
    }

    /// Build the standard chain: secrets, injection, PII, policy.
    pub fn from_config(config: &FilterConfig) -> Self {
        Self::new(vec![
            Arc::new(secrets::SecretsFilter::new(config.secrets.clone())),
            Arc::new(injection::InjectionFilter::new(config.injection.clone())),
            Arc::new(pii::PiiFilter::new(config.pii.clone())),
            Arc::new(policy::PolicyFilter::from_config(config.policy.clone())),
        ])
    }

    /// Run enabled filters in order. Returns every verdict produced plus the
    /// first blocking verdict, if any; filters after a Block do not run.
    pub async fn run(
        &self,
        request: &ChatRequest,
    ) -> (Vec<FilterVerdict>, Option<FilterVerdict>) {
        let mut verdicts = Vec::with_capacity(self.filters.len());
        for filter in &self.filters {
            if !filter.enabled() {
                continue;
            }
            let verdict = filter.scan(request).await;
            let blocked = verdict.action == FilterAction::Block;
            verdicts.push(verdict.clone());
            if blocked {
                return (verdicts, Some(verdict));
            }
        }
        (verdicts, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedFilter {
        name: &'static str,
        action: FilterAction,
        calls: AtomicUsize,
    }

    impl FixedFilter {
        fn new(name: &'static str, action: FilterAction) -> Arc<Self> {
            Arc::new(Self {
                name,
                action,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ContentFilter for FixedFilter {
        fn name(&self) -> &'static str {
            self.name
        }

        fn enabled(&self) -> bool {
            true
        }

        async fn scan(&self, _request: &ChatRequest) -> FilterVerdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            FilterVerdict {
                filter: self.name,
                action: self.action,
                message: String::new(),
                detections: 0,
                score: 0.0,
            }
        }
    }

    #[tokio::test]
    async fn block_short_circuits_later_filters() {
        let first = FixedFilter::new("first", FilterAction::Pass);
        let blocker = FixedFilter::new("blocker", FilterAction::Block);
        let after = FixedFilter::new("after", FilterAction::Pass);
        let chain = FilterChain::new(vec![first.clone(), blocker.clone(), after.clone()]);

        let (verdicts, blocked) = chain.run(&ChatRequest::default()).await;

        assert_eq!(blocked.unwrap().filter, "blocker");
        assert_eq!(verdicts.len(), 2);
        assert_eq!(after.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn flags_do_not_stop_the_chain() {
        let flagger = FixedFilter::new("flagger", FilterAction::Flag);
        let last = FixedFilter::new("last", FilterAction::Pass);
        let chain = FilterChain::new(vec![flagger, last.clone()]);

        let (verdicts, blocked) = chain.run(&ChatRequest::default()).await;

        assert!(blocked.is_none());
        assert_eq!(verdicts.len(), 2);
        assert_eq!(last.calls.load(Ordering::SeqCst), 1);
    }
}
