//! Rule-based checker
//!
//! Scores messages against a list of regex and structural rules. Works
//! without any external service.

use super::{CheckContext, MessageCheckResult, Module};
use crate::session::Message;
use async_trait::async_trait;
use mailsift_common::config::{RuleConfig, RuleType, RulesModuleConfig};
use mailsift_common::{Action, Error, Result};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct CompiledRule {
    rule: RuleConfig,
    regex: Option<Regex>,
}

/// Rule-based checker
pub struct RulesModule {
    config: RulesModuleConfig,
    rules: Vec<CompiledRule>,
}

impl RulesModule {
    pub fn new(config: RulesModuleConfig) -> Result<Self> {
        let mut module = Self {
            rules: Vec::new(),
            config,
        };

        if module.config.default_rules {
            for rule in default_rules() {
                module.add_rule(rule)?;
            }
        }
        for rule in module.config.rules.clone() {
            module.add_rule(rule)?;
        }

        Ok(module)
    }

    /// Add a rule, compiling its pattern where the type needs one
    pub fn add_rule(&mut self, rule: RuleConfig) -> Result<()> {
        let regex = match rule.rule_type {
            RuleType::Header | RuleType::Body | RuleType::From | RuleType::Subject | RuleType::Url => {
                Some(Regex::new(&rule.pattern).map_err(|e| {
                    Error::Config(format!("Invalid pattern in rule {}: {}", rule.name, e))
                })?)
            }
            RuleType::BodyLength => {
                rule.pattern.parse::<usize>().map_err(|e| {
                    Error::Config(format!("Invalid length in rule {}: {}", rule.name, e))
                })?;
                None
            }
            RuleType::HasHeader | RuleType::MissingHeader => None,
        };

        self.rules.push(CompiledRule { rule, regex });
        Ok(())
    }

    fn matches(compiled: &CompiledRule, message: &Message, body: &str) -> bool {
        let rule = &compiled.rule;
        let is_match = |text: &str| compiled.regex.as_ref().map_or(false, |r| r.is_match(text));

        match rule.rule_type {
            RuleType::Subject => is_match(message.header("Subject").unwrap_or("")),
            RuleType::From => is_match(message.header("From").unwrap_or("")),
            RuleType::Body => is_match(body),
            RuleType::Header => message
                .headers()
                .iter()
                .filter(|h| !h.deleted)
                .any(|h| is_match(&format!("{}: {}", h.key, h.value))),
            RuleType::Url => {
                is_match(body)
                    || message
                        .headers()
                        .iter()
                        .filter(|h| !h.deleted)
                        .any(|h| is_match(&h.value))
            }
            RuleType::HasHeader => message.header(&rule.pattern).is_some(),
            RuleType::MissingHeader => message.header(&rule.pattern).is_none(),
            RuleType::BodyLength => rule
                .pattern
                .parse::<usize>()
                .map_or(false, |max| body.trim().len() <= max),
        }
    }

    /// Score a message
    pub fn evaluate(&self, message: &Message) -> MessageCheckResult {
        let body = String::from_utf8_lossy(message.body());
        let mut score = 0.0;
        let mut matched = serde_json::Map::new();

        for compiled in self.rules.iter().filter(|c| c.rule.enabled) {
            if Self::matches(compiled, message, &body) {
                debug!("Rule {} matched, adding score {}", compiled.rule.name, compiled.rule.score);
                score += compiled.rule.score;
                matched.insert(compiled.rule.name.clone(), compiled.rule.score.into());
            }
        }

        let (action, text) = if self.config.reject_score > 0.0 && score >= self.config.reject_score {
            (Action::Reject, "Message content rejected")
        } else {
            (Action::Permit, "")
        };

        MessageCheckResult::new(action, score)
            .with_message(text)
            .with_determinant("rules", serde_json::Value::Object(matched))
    }
}

#[async_trait]
impl Module for RulesModule {
    fn name(&self) -> &str {
        "rules"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn message_check(
        &self,
        ctx: &CheckContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Option<MessageCheckResult>> {
        Ok(Some(self.evaluate(&ctx.message)))
    }
}

fn rule(name: &str, description: &str, rule_type: RuleType, pattern: &str, score: f64) -> RuleConfig {
    RuleConfig {
        name: name.to_string(),
        description: description.to_string(),
        rule_type,
        pattern: pattern.to_string(),
        score,
        enabled: true,
    }
}

fn default_rules() -> Vec<RuleConfig> {
    vec![
        rule(
            "SUBJECT_URGENCY",
            "Subject contains urgency words",
            RuleType::Subject,
            r"(?i)(urgent|immediate|action required|act now|limited time)",
            1.5,
        ),
        rule(
            "SUBJECT_MONEY",
            "Subject mentions money or prizes",
            RuleType::Subject,
            r"(?i)(lottery|prize|million|bitcoin|crypto)",
            2.0,
        ),
        rule(
            "BODY_CLICK_HERE",
            "Body contains 'click here' links",
            RuleType::Body,
            r"(?i)(click here|click below|click this link)",
            1.0,
        ),
        rule(
            "BODY_ADVANCE_FEE",
            "Body matches advance-fee scam patterns",
            RuleType::Body,
            r"(?i)(inheritance|beneficiary|next of kin)",
            4.0,
        ),
        rule(
            "BODY_PHISHING",
            "Body contains phishing patterns",
            RuleType::Body,
            r"(?i)(verify your account|confirm your identity|update your (password|details))",
            3.0,
        ),
        rule(
            "URL_IP_ADDRESS",
            "Contains URL with IP address",
            RuleType::Url,
            r"https?://\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}",
            3.0,
        ),
        rule(
            "MISSING_DATE",
            "Missing Date header",
            RuleType::MissingHeader,
            "Date",
            1.5,
        ),
        rule(
            "FROM_SUSPICIOUS_TLD",
            "From suspicious top-level domain",
            RuleType::From,
            r"(?i)\.(xyz|top|gq|ml|cf|tk|click|loan)>?$",
            2.0,
        ),
        rule(
            "BODY_EMPTY",
            "Message body is empty",
            RuleType::BodyLength,
            "0",
            2.0,
        ),
    ]
}
