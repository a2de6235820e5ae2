//! Schema-keyed message router
//!
//! Rules are grouped by source schema id. Every rule whose condition holds
//! fires in declaration order, producing one derived message per target.

use crate::transform;
use chrono::{DateTime, Utc};
use event_bus_core::prelude::*;
use event_bus_core::CompiledRule;
use std::collections::HashMap;
use tracing::{error, trace};

/// One message addressed to one target topic
#[derive(Debug, Clone)]
pub struct Delivery {
    pub target: String,
    pub message: EventMessage,
    /// Name of the rule that produced the delivery (empty when unrouted)
    pub rule: String,
}

/// Result of routing a single message
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    /// `false` when no rules exist for the message's schema
    pub routed: bool,
    pub deliveries: Vec<Delivery>,
}

impl RouteOutcome {
    pub fn targets(&self) -> Vec<&str> {
        self.deliveries.iter().map(|d| d.target.as_str()).collect()
    }
}

enum Predicate {
    Always,
    Rule(CompiledRule),
    Invalid { raw: String, reason: String },
}

struct CompiledRoute {
    rule: RoutingRule,
    predicate: Predicate,
}

impl CompiledRoute {
    fn fires(&self, message: &EventMessage, now: DateTime<Utc>) -> bool {
        match &self.predicate {
            Predicate::Always => true,
            Predicate::Rule(rule) => rule.evaluate(message, now),
            Predicate::Invalid { raw, reason } => {
                error!(
                    rule = %self.rule.name,
                    condition = %raw,
                    reason = %reason,
                    message_id = %message.id,
                    "Routing condition is invalid, treating as false"
                );
                false
            }
        }
    }
}

/// Routing table, built once at startup
pub struct Router {
    routes: HashMap<String, Vec<CompiledRoute>>,
}

impl Router {
    /// Compile routing rules; declaration order is preserved per schema.
    /// A condition that fails to compile is kept as a rule that never fires.
    pub fn new(rules: Vec<RoutingRule>) -> Result<Self> {
        let mut routes: HashMap<String, Vec<CompiledRoute>> = HashMap::new();

        for rule in rules {
            let predicate = match &rule.condition {
                Condition::Always => Predicate::Always,
                Condition::Rule(filter) => match CompiledRule::compile(filter.clone()) {
                    Ok(compiled) => Predicate::Rule(compiled),
                    Err(e) => {
                        error!(
                            rule = %rule.name,
                            field = %filter.field,
                            error = %e,
                            "Routing condition failed to compile, rule will never fire"
                        );
                        Predicate::Invalid {
                            raw: format!("{} {}", filter.field, filter.operator.as_str()),
                            reason: e.to_string(),
                        }
                    }
                },
                Condition::Invalid { raw, reason } => Predicate::Invalid {
                    raw: raw.clone(),
                    reason: reason.clone(),
                },
            };
            routes
                .entry(rule.schema_id.clone())
                .or_default()
                .push(CompiledRoute { rule, predicate });
        }

        Ok(Self { routes })
    }

    pub fn route(&self, message: &EventMessage) -> RouteOutcome {
        self.route_at(message, Utc::now())
    }

    pub fn route_at(&self, message: &EventMessage, now: DateTime<Utc>) -> RouteOutcome {
        let Some(routes) = self.routes.get(&message.schema_id()) else {
            return RouteOutcome {
                routed: false,
                deliveries: vec![Delivery {
                    target: message.topic.clone(),
                    message: message.clone(),
                    rule: String::new(),
                }],
            };
        };

        let mut deliveries = Vec::new();
        for route in routes {
            if !route.fires(message, now) {
                continue;
            }
            let transformed = transform::apply_at(message.clone(), &route.rule.transform, now);
            for target in &route.rule.targets {
                deliveries.push(Delivery {
                    target: target.clone(),
                    message: transformed.derive(target.clone()),
                    rule: route.rule.name.clone(),
                });
            }
        }

        trace!(
            message_id = %message.id,
            schema = %message.schema_id(),
            deliveries = deliveries.len(),
            "Routed message"
        );

        RouteOutcome {
            routed: true,
            deliveries,
        }
    }

    /// Number of schemas with at least one rule
    pub fn schema_count(&self) -> usize {
        self.routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tick(symbol: &str) -> EventMessage {
        let payload = json!({"symbol": symbol, "bid": 1.1}).as_object().cloned().unwrap();
        EventMessage::new("eafix.price.tick", "PriceTick", "1.0", payload).with_trace_id("tr-1")
    }

    fn router() -> Router {
        Router::new(vec![
            RoutingRule::new(
                "PriceTick@1.0",
                Condition::parse("symbol == 'EURUSD'"),
                vec!["eafix.price.tick.eurusd".into()],
            )
            .with_name("eurusd")
            .with_transform(TransformKind::AddTimestamp),
            RoutingRule::new(
                "PriceTick@1.0",
                Condition::Always,
                vec!["eafix.price.tick".into(), "eafix.audit".into()],
            )
            .with_name("default"),
        ])
        .unwrap()
    }

    #[test]
    fn test_fan_out_in_declaration_order() {
        let original = tick("EURUSD");
        let outcome = router().route(&original);

        assert!(outcome.routed);
        assert_eq!(
            outcome.targets(),
            vec!["eafix.price.tick.eurusd", "eafix.price.tick", "eafix.audit"]
        );

        let eurusd = &outcome.deliveries[0].message;
        assert!(eurusd.payload.contains_key("processed_at"));
        assert_eq!(eurusd.topic, "eafix.price.tick.eurusd");
        assert_eq!(eurusd.trace_id.as_deref(), Some("tr-1"));
        assert_ne!(eurusd.id, original.id);

        let unmodified = &outcome.deliveries[1].message;
        assert_eq!(unmodified.payload, original.payload);
    }

    #[test]
    fn test_unmatched_rule_contributes_nothing() {
        let outcome = router().route(&tick("GBPUSD"));
        assert_eq!(outcome.targets(), vec!["eafix.price.tick", "eafix.audit"]);
    }

    #[test]
    fn test_no_rules_routes_to_own_topic() {
        let msg = EventMessage::new("eafix.signals", "SignalGenerated", "1.0", Payload::new());
        let outcome = router().route(&msg);

        assert!(!outcome.routed);
        assert_eq!(outcome.deliveries.len(), 1);
        assert_eq!(outcome.deliveries[0].message, msg);
    }

    #[test]
    fn test_invalid_condition_never_fires() {
        let router = Router::new(vec![RoutingRule::new(
            "PriceTick@1.0",
            Condition::parse("bid >= 1"),
            vec!["x".into()],
        )])
        .unwrap();
        let outcome = router.route(&tick("EURUSD"));
        assert!(outcome.routed);
        assert!(outcome.deliveries.is_empty());
    }

    #[test]
    fn test_numeric_condition() {
        let router = Router::new(vec![RoutingRule::new(
            "PriceTick@1.0",
            Condition::parse("bid > 1.0"),
            vec!["x".into()],
        )])
        .unwrap();
        assert_eq!(router.route(&tick("EURUSD")).targets(), vec!["x"]);
    }

    #[test]
    fn test_bad_regex_does_not_block_other_rules() {
        let bad = FilterRule::new("symbol", Operator::MatchesRegex, Some(json!("(")));
        let router = Router::new(vec![
            RoutingRule::new("PriceTick@1.0", Condition::Rule(bad), vec!["broken".into()])
                .with_name("broken"),
            RoutingRule::new("PriceTick@1.0", Condition::Always, vec!["eafix.price.tick".into()])
                .with_name("default"),
        ])
        .unwrap();

        let outcome = router.route(&tick("EURUSD"));
        assert!(outcome.routed);
        assert_eq!(outcome.targets(), vec!["eafix.price.tick"]);
    }
}
