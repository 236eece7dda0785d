//! Prompt-injection heuristic. Each rule carries a severity in [0,1]; the
//! filter acts on the maximum severity seen across all messages.

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};

use crate::config::InjectionFilterConfig;
use crate::types::{ChatRequest, Message};

use super::{ContentFilter, FilterAction, FilterVerdict};

pub struct InjectionRule {
    pub name: &'static str,
    pub regex: Regex,
    pub severity: f64,
    pub category: &'static str,
}

pub fn default_rules() -> Vec<InjectionRule> {
    let compile = |name: &'static str, pattern: &str, severity: f64, category: &'static str| {
        InjectionRule {
            name,
            regex: RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .unwrap(),
            severity,
            category,
        }
    };
    vec![
        compile(
            "ignore_previous",
            r"ignore\s+(all\s+)?previous\s+instructions",
            0.95,
            "instruction_bypass",
        ),
        compile(
            "disregard_prior",
            r"disregard\s+(all\s+)?prior\s+(instructions|context|rules)",
            0.95,
            "instruction_bypass",
        ),
        compile(
            "jailbreak",
            r"(DAN|do\s+anything\s+now|jailbreak|unrestricted\s+mode)",
            0.9,
            "role_override",
        ),
        compile("code_block_system", "```system", 0.9, "role_override"),
        compile("system_prefix", r"^\s*system\s*:\s*", 0.85, "role_override"),
        compile(
            "developer_mode",
            r"(developer|debug|admin|root)\s+mode\s+(enabled|activated|on)",
            0.85,
            "role_override",
        ),
        compile(
            "base64_instruction",
            r"(decode|execute|follow)\s+(the\s+)?base64",
            0.85,
            "encoding_trick",
        ),
        compile(
            "new_instructions",
            r"(new|updated|revised)\s+instructions?\s*:",
            0.8,
            "instruction_bypass",
        ),
        compile(
            "response_prefix",
            r"respond\s+with\s*:\s*(sure|absolutely|of course)",
            0.75,
            "output_steering",
        ),
        compile(
            "you_are_now",
            r"you\s+are\s+now\s+(a|an|the)\s+",
            0.7,
            "role_override",
        ),
    ]
}

#[derive(Clone, Debug)]
pub struct Detection {
    pub rule_name: &'static str,
    pub severity: f64,
    pub category: &'static str,
}

pub struct InjectionScanner {
    rules: Vec<InjectionRule>,
}

impl Default for InjectionScanner {
    fn default() -> Self {
        Self {
            rules: default_rules(),
        }
    }
}

impl InjectionScanner {
    pub fn scan(&self, text: &str) -> Vec<Detection> {
        let mut detections = Vec::new();
        for rule in &self.rules {
            for _found in rule.regex.find_iter(text) {
                detections.push(Detection {
                    rule_name: rule.name,
                    severity: rule.severity,
                    category: rule.category,
                });
            }
        }
        detections
    }

    /// All detections across messages plus the maximum severity seen.
    pub fn scan_messages(&self, messages: &[Message]) -> (Vec<Detection>, f64) {
        let mut all = Vec::new();
        let mut max_score: f64 = 0.0;
        for message in messages {
            let detections = self.scan(&message.content);
            for detection in &detections {
                max_score = max_score.max(detection.severity);
            }
            all.extend(detections);
        }
        (all, max_score)
    }
}

pub struct InjectionFilter {
    scanner: InjectionScanner,
    config: InjectionFilterConfig,
}

impl InjectionFilter {
    pub fn new(config: InjectionFilterConfig) -> Self {
        Self {
            scanner: InjectionScanner::default(),
            config,
        }
    }
}

#[async_trait]
impl ContentFilter for InjectionFilter {
    fn name(&self) -> &'static str {
        "injection"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn scan(&self, request: &ChatRequest) -> FilterVerdict {
        let (detections, score) = self.scanner.scan_messages(&request.messages);

        if score >= self.config.block_threshold {
            return FilterVerdict {
                filter: "injection",
                action: FilterAction::Block,
                message: format!(
                    "Request blocked: prompt injection detected (score {score:.2})"
                ),
                detections: detections.len(),
                score,
            };
        }
        if score >= self.config.flag_threshold {
            return FilterVerdict {
                filter: "injection",
                action: FilterAction::Flag,
                message: String::new(),
                detections: detections.len(),
                score,
            };
        }
        FilterVerdict {
            score,
            ..FilterVerdict::pass("injection")
        }
    }
}
