//! Policy evaluator. Rules are compiled once into a prepared set and swapped
//! atomically on reload; evaluation runs under a bounded budget and fails
//! closed, because policy is the authorization decision.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::error;

use crate::config::{PolicyFilterConfig, PolicyRuleConfig};
use crate::types::ChatRequest;

use super::{ContentFilter, FilterAction, FilterVerdict};

#[derive(Clone, Debug, Serialize)]
pub struct PolicyInput {
    pub user: PolicyUser,
    pub request: PolicyRequest,
    pub time: PolicyTime,
}

#[derive(Clone, Debug, Serialize)]
pub struct PolicyUser {
    pub id: String,
    pub org: String,
    pub team: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PolicyRequest {
    pub model: String,
    pub classification: String,
    pub provider_type: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PolicyTime {
    pub hour: u8,
    pub day: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Effect {
    Allow,
    Deny,
}

#[derive(Clone, Debug)]
struct CompiledRule {
    name: String,
    effect: Effect,
    reason: String,
    models: Vec<String>,
    classifications: Vec<String>,
    provider_types: Vec<String>,
    orgs: Vec<String>,
    teams: Vec<String>,
    hours: Option<(u8, u8)>,
    days: Vec<String>,
}

fn matches_list(list: &[String], value: &str) -> bool {
    if list.is_empty() {
        return true;
    }
    list.iter()
        .any(|entry| entry == "*" || entry.eq_ignore_ascii_case(value))
}

impl CompiledRule {
    fn matches(&self, input: &PolicyInput) -> bool {
        if !matches_list(&self.models, &input.request.model) {
            return false;
        }
        if !matches_list(&self.classifications, &input.request.classification) {
            return false;
        }
        if !matches_list(&self.provider_types, &input.request.provider_type) {
            return false;
        }
        if !matches_list(&self.orgs, &input.user.org) {
            return false;
        }
        if !matches_list(&self.teams, &input.user.team) {
            return false;
        }
        if let Some((start, end)) = self.hours {
            if input.time.hour < start || input.time.hour > end {
                return false;
            }
        }
        if !matches_list(&self.days, &input.time.day) {
            return false;
        }
        true
    }
}

/// A compiled, immutable rule set. First matching rule decides.
#[derive(Clone, Debug)]
pub struct PreparedPolicy {
    rules: Vec<CompiledRule>,
    default_allow: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("rule {name}: invalid effect {effect:?} (expected allow|deny)")]
    InvalidEffect { name: String, effect: String },
    #[error("rule {name}: hours must be [start, end] with start <= end <= 23")]
    InvalidHours { name: String },
}

impl PreparedPolicy {
    pub fn compile(
        rules: &[PolicyRuleConfig],
        default_allow: bool,
    ) -> Result<Self, PolicyError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let effect = match rule.effect.as_str() {
                "allow" => Effect::Allow,
                "deny" => Effect::Deny,
                other => {
                    return Err(PolicyError::InvalidEffect {
                        name: rule.name.clone(),
                        effect: other.to_string(),
                    })
                }
            };
            let hours = match rule.hours.as_slice() {
                [] => None,
                [start, end] if start <= end && *end <= 23 => Some((*start, *end)),
                _ => {
                    return Err(PolicyError::InvalidHours {
                        name: rule.name.clone(),
                    })
                }
            };
            compiled.push(CompiledRule {
                name: rule.name.clone(),
                effect,
                reason: rule.reason.clone(),
                models: rule.models.clone(),
                classifications: rule.classifications.clone(),
                provider_types: rule.provider_types.clone(),
                orgs: rule.orgs.clone(),
                teams: rule.teams.clone(),
                hours,
                days: rule.days.clone(),
            });
        }
        Ok(Self {
            rules: compiled,
            default_allow,
        })
    }

    /// Evaluate to `(allow, reason)`.
    pub fn evaluate(&self, input: &PolicyInput) -> (bool, String) {
        for rule in &self.rules {
            if !rule.matches(input) {
                continue;
            }
            let reason = if rule.reason.is_empty() {
                format!("matched rule {}", rule.name)
            } else {
                rule.reason.clone()
            };
            return (rule.effect == Effect::Allow, reason);
        }
        let reason = if self.default_allow {
            "no rule matched".to_string()
        } else {
            "denied by default".to_string()
        };
        (self.default_allow, reason)
    }
}

pub struct PolicyFilter {
    prepared: RwLock<Option<Arc<PreparedPolicy>>>,
    config: PolicyFilterConfig,
}

impl PolicyFilter {
    pub fn new(config: PolicyFilterConfig) -> Self {
        Self {
            prepared: RwLock::new(None),
            config,
        }
    }

    /// Build the filter and compile its rule set. A compile failure leaves no
    /// rule set loaded, which denies all traffic while the filter is enabled.
    pub fn from_config(config: PolicyFilterConfig) -> Self {
        let filter = Self::new(config.clone());
        if config.enabled {
            if let Err(err) = filter.load(&config.rules, config.default_allow) {
                error!(error = %err, "failed to compile policy rules");
            }
        }
        filter
    }

    /// Compile and swap in a new rule set. Called off the hot path.
    pub fn load(
        &self,
        rules: &[PolicyRuleConfig],
        default_allow: bool,
    ) -> Result<(), PolicyError> {
        let prepared = Arc::new(PreparedPolicy::compile(rules, default_allow)?);
        *self.prepared.write().unwrap_or_else(|e| e.into_inner()) = Some(prepared);
        Ok(())
    }

    fn snapshot(&self) -> Option<Arc<PreparedPolicy>> {
        self.prepared
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn blocked(reason: impl Into<String>) -> FilterVerdict {
        FilterVerdict {
            filter: "policy",
            action: FilterAction::Block,
            message: format!("Request denied by policy: {}", reason.into()),
            detections: 0,
            score: 0.0,
        }
    }
}

fn policy_input(request: &ChatRequest, provider_type: &str) -> PolicyInput {
    let now = time::OffsetDateTime::now_utc();
    PolicyInput {
        user: PolicyUser {
            id: request.user_id.clone(),
            org: request.organization_id.clone(),
            team: request.team_id.clone(),
        },
        request: PolicyRequest {
            model: request.model.clone(),
            classification: request.classification.as_str().to_string(),
            provider_type: provider_type.to_string(),
        },
        time: PolicyTime {
            hour: now.hour(),
            day: now.weekday().to_string(),
        },
    }
}

#[async_trait]
impl ContentFilter for PolicyFilter {
    fn name(&self) -> &'static str {
        "policy"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn scan(&self, request: &ChatRequest) -> FilterVerdict {
        let Some(prepared) = self.snapshot() else {
            // Fail closed: policy is the authorization decision.
            return Self::blocked("no policy rules loaded");
        };

        let input = policy_input(request, "");
        let budget = Duration::from_millis(self.config.evaluation_budget_ms.max(1));
        let evaluated = tokio::time::timeout(budget, async move {
            prepared.evaluate(&input)
        })
        .await;

        match evaluated {
            Ok((true, _reason)) => FilterVerdict::pass("policy"),
            Ok((false, reason)) => Self::blocked(reason),
            Err(_) => {
                error!("policy evaluation exceeded its budget");
                Self::blocked("evaluation timed out")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(model: &str, classification: &str, team: &str) -> PolicyInput {
        PolicyInput {
            user: PolicyUser {
                id: "u-1".to_string(),
                org: "org-1".to_string(),
                team: team.to_string(),
            },
            request: PolicyRequest {
                model: model.to_string(),
                classification: classification.to_string(),
                provider_type: String::new(),
            },
            time: PolicyTime {
                hour: 12,
                day: "Monday".to_string(),
            },
        }
    }

    fn deny_restricted_rule() -> PolicyRuleConfig {
        PolicyRuleConfig {
            name: "deny-restricted-offhours".to_string(),
            effect: "deny".to_string(),
            reason: "restricted data is not allowed for this team".to_string(),
            classifications: vec!["RESTRICTED".to_string()],
            teams: vec!["contractors".to_string()],
            ..PolicyRuleConfig::default()
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let prepared =
            PreparedPolicy::compile(&[deny_restricted_rule()], true).unwrap();
        let (allow, reason) = prepared.evaluate(&input("m", "RESTRICTED", "contractors"));
        assert!(!allow);
        assert!(reason.contains("restricted data"));

        let (allow, _) = prepared.evaluate(&input("m", "RESTRICTED", "platform"));
        assert!(allow);
    }

    #[test]
    fn default_decision_applies_without_match() {
        let prepared = PreparedPolicy::compile(&[], false).unwrap();
        let (allow, reason) = prepared.evaluate(&input("m", "PUBLIC", "t"));
        assert!(!allow);
        assert_eq!(reason, "denied by default");
    }

    #[test]
    fn hour_range_is_inclusive() {
        let rule = PolicyRuleConfig {
            name: "business-hours".to_string(),
            effect: "deny".to_string(),
            hours: vec![9, 17],
            ..PolicyRuleConfig::default()
        };
        let prepared = PreparedPolicy::compile(&[rule], true).unwrap();
        let mut i = input("m", "PUBLIC", "t");
        i.time.hour = 9;
        assert!(!prepared.evaluate(&i).0);
        i.time.hour = 18;
        assert!(prepared.evaluate(&i).0);
    }

    #[test]
    fn invalid_effect_is_a_compile_error() {
        let rule = PolicyRuleConfig {
            name: "broken".to_string(),
            effect: "reject".to_string(),
            ..PolicyRuleConfig::default()
        };
        assert!(PreparedPolicy::compile(&[rule], true).is_err());
    }

    #[tokio::test]
    async fn no_rule_set_fails_closed() {
        let filter = PolicyFilter::new(PolicyFilterConfig {
            enabled: true,
            ..PolicyFilterConfig::default()
        });
        let verdict = filter.scan(&ChatRequest::default()).await;
        assert_eq!(verdict.action, FilterAction::Block);
        assert!(verdict.message.contains("no policy rules loaded"));
    }

    #[tokio::test]
    async fn loaded_allow_rules_pass() {
        let filter = PolicyFilter::from_config(PolicyFilterConfig {
            enabled: true,
            default_allow: true,
            rules: vec![deny_restricted_rule()],
            ..PolicyFilterConfig::default()
        });
        let verdict = filter.scan(&ChatRequest::default()).await;
        assert_eq!(verdict.action, FilterAction::Pass);
    }
}
