//! Policy engine - evaluates ordered rules against request context

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::{json, Value};
use tracing::debug;

use super::expr::evaluate_condition;
use crate::models::{PolicyContext, PolicyDecision, PolicyRule, RuleEffect};
use crate::telemetry::TelemetryBus;

/// Evaluates policy rules before command execution
///
/// Rules are kept in registration order. Every rule is evaluated on every
/// pass; a rule whose condition fails to parse or evaluate is counted as
/// a deny with a validation reason, without aborting the other rules.
pub struct PolicyEngine {
    bus: TelemetryBus,
    rules: RwLock<Vec<PolicyRule>>,
}

impl PolicyEngine {
    pub fn new(bus: TelemetryBus) -> Self {
        Self {
            bus,
            rules: RwLock::new(Vec::new()),
        }
    }

    pub fn with_rules(bus: TelemetryBus, rules: Vec<PolicyRule>) -> Self {
        Self {
            bus,
            rules: RwLock::new(rules),
        }
    }

    /// Append a rule to the evaluation order
    pub fn add_rule(&self, rule: PolicyRule) {
        self.rules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(rule);
    }

    /// Snapshot of the registered rules
    pub fn rules(&self) -> Vec<PolicyRule> {
        self.rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Evaluate all rules and emit one `policy.evaluated` event
    ///
    /// Final decision: deny if any matched rule has effect deny (or any
    /// condition was invalid), otherwise allow.
    pub fn evaluate(
        &self,
        context: &PolicyContext,
        extra: Option<&HashMap<String, Value>>,
    ) -> PolicyDecision {
        let mut env: HashMap<String, Value> = HashMap::new();
        env.insert("device_ids".into(), json!(&context.device_ids));
        env.insert("action".into(), json!(&context.action));
        env.insert("requested_by".into(), json!(&context.requested_by));
        env.insert("arguments".into(), json!(&context.arguments));
        if let Some(extra) = extra {
            for (key, value) in extra {
                env.insert(key.clone(), value.clone());
            }
        }

        let mut denies: Vec<String> = Vec::new();
        let mut outcomes: Vec<Value> = Vec::new();

        for rule in self.rules.read().unwrap_or_else(|e| e.into_inner()).iter() {
            if rule.condition.is_empty() {
                continue;
            }
            let matched = match evaluate_condition(&rule.condition, &env) {
                Ok(matched) => matched,
                Err(err) => {
                    debug!(rule = %rule.name, "policy condition rejected: {err}");
                    denies.push(format!("Rule {} invalid: {err}", rule.name));
                    false
                }
            };
            outcomes.push(json!({
                "name": &rule.name,
                "matched": matched,
                "effect": rule.effect,
            }));
            if matched && rule.effect == RuleEffect::Deny {
                denies.push(if rule.description.is_empty() {
                    rule.name.clone()
                } else {
                    rule.description.clone()
                });
            }
        }

        let decision = if denies.is_empty() {
            PolicyDecision::allow()
        } else {
            PolicyDecision::deny(denies)
        };

        self.bus.emit(
            "policy.evaluated",
            json!({
                "action": &context.action,
                "requested_by": &context.requested_by,
                "allowed": decision.allowed,
                "denies": &decision.reasons,
                "matched_rules": outcomes,
            }),
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CommandRequest;
    use std::time::Duration;
    use tokio::time::timeout;

    fn context(requested_by: &str) -> PolicyContext {
        let mut request = CommandRequest::new("reboot", vec!["dev1".into()]);
        request.requested_by = requested_by.into();
        PolicyContext::from_request(&request)
    }

    #[tokio::test]
    async fn test_no_rules_allows() {
        let engine = PolicyEngine::new(TelemetryBus::new());
        let decision = engine.evaluate(&context("alice"), None);
        assert!(decision.allowed);
        assert!(decision.reasons.is_empty());
    }

    #[tokio::test]
    async fn test_matched_deny_rule_collects_description() {
        let engine = PolicyEngine::new(TelemetryBus::new());
        engine.add_rule(
            PolicyRule::new("block-bad-actor", "requested_by == 'blocked'", RuleEffect::Deny)
                .with_description("Requester is on the block list"),
        );

        let decision = engine.evaluate(&context("blocked"), None);
        assert!(!decision.allowed);
        assert_eq!(decision.reasons, vec!["Requester is on the block list"]);

        // Non-matching requester sails through.
        assert!(engine.evaluate(&context("alice"), None).allowed);
    }

    #[tokio::test]
    async fn test_deny_rule_without_description_uses_name() {
        let engine = PolicyEngine::new(TelemetryBus::new());
        engine.add_rule(PolicyRule::new(
            "no-reboots",
            "action == 'reboot'",
            RuleEffect::Deny,
        ));

        let decision = engine.evaluate(&context("alice"), None);
        assert_eq!(decision.reasons, vec!["no-reboots"]);
    }

    #[tokio::test]
    async fn test_matched_allow_rule_does_not_deny() {
        let engine = PolicyEngine::new(TelemetryBus::new());
        engine.add_rule(PolicyRule::new(
            "log-reboots",
            "action == 'reboot'",
            RuleEffect::Allow,
        ));
        assert!(engine.evaluate(&context("alice"), None).allowed);
    }

    #[tokio::test]
    async fn test_invalid_condition_denies_that_rule_only() {
        let engine = PolicyEngine::new(TelemetryBus::new());
        engine.add_rule(PolicyRule::new(
            "broken",
            "__import__('os').system('true')",
            RuleEffect::Deny,
        ));
        engine.add_rule(PolicyRule::new(
            "still-runs",
            "requested_by == 'alice'",
            RuleEffect::Allow,
        ));

        // The invalid rule denies with a validation reason on every
        // evaluation, and the second rule is still evaluated.
        for _ in 0..2 {
            let decision = engine.evaluate(&context("alice"), None);
            assert!(!decision.allowed);
            assert_eq!(decision.reasons.len(), 1);
            assert!(decision.reasons[0].starts_with("Rule broken invalid:"));
        }
    }

    #[tokio::test]
    async fn test_empty_condition_is_skipped() {
        let engine = PolicyEngine::new(TelemetryBus::new());
        engine.add_rule(PolicyRule::new("blank", "", RuleEffect::Deny));
        assert!(engine.evaluate(&context("alice"), None).allowed);
    }

    #[tokio::test]
    async fn test_extras_join_the_environment() {
        let engine = PolicyEngine::new(TelemetryBus::new());
        engine.add_rule(PolicyRule::new(
            "maintenance-freeze",
            "maintenance == true",
            RuleEffect::Deny,
        ));

        let mut extra = HashMap::new();
        extra.insert("maintenance".to_string(), json!(true));
        let decision = engine.evaluate(&context("alice"), Some(&extra));
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn test_evaluation_event_summarizes_every_rule() {
        let bus = TelemetryBus::new();
        let mut stream = bus.watch("policy.evaluated");
        let engine = PolicyEngine::with_rules(
            bus.clone(),
            vec![
                PolicyRule::new("matches", "action == 'reboot'", RuleEffect::Deny),
                PolicyRule::new("misses", "action == 'wipe'", RuleEffect::Deny),
            ],
        );

        let decision = engine.evaluate(&context("alice"), None);
        assert!(!decision.allowed);

        let event = timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload["allowed"], false);
        assert_eq!(event.payload["requested_by"], "alice");
        let rules = event.payload["matched_rules"].as_array().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0]["matched"], true);
        assert_eq!(rules[1]["matched"], false);
    }
}
