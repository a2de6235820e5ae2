//! Routing rule configuration
//!
//! Rules are keyed by source schema id and carry a structured condition,
//! an ordered target list and a transform name. Everything here is parsed
//! once when configuration loads; nothing is re-parsed per message.

use crate::filter::{FilterRule, Operator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Condition deciding whether a routing rule fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ConditionSpec", into = "ConditionSpec")]
pub enum Condition {
    /// Fires for every message of the schema
    Always,
    /// Single field predicate
    Rule(FilterRule),
    /// Could not be parsed; never fires and is reported when evaluated
    Invalid { raw: String, reason: String },
}

/// Configuration form: either the compact text grammar or a structured rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionSpec {
    Text(String),
    Structured(FilterRule),
}

impl Default for Condition {
    fn default() -> Self {
        Self::Always
    }
}

impl Condition {
    /// Parse the compact text grammar.
    ///
    /// Supported forms are `always`, `field == 'literal'` (or a numeric
    /// literal) and `field > number`. Anything else becomes
    /// [`Condition::Invalid`].
    pub fn parse(raw: &str) -> Self {
        let text = raw.trim();
        if text.is_empty() || matches!(text, "always" | "true" | "*") {
            return Self::Always;
        }

        let invalid = |reason: &str| Self::Invalid {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };

        if let Some((field, literal)) = text.split_once("==") {
            let Some(field) = parse_field(field) else {
                return invalid("invalid field name");
            };
            return match parse_literal(literal) {
                Some(value) => Self::Rule(FilterRule::new(field, Operator::Eq, Some(value))),
                None => invalid("right-hand side must be a quoted string or a number"),
            };
        }

        if text.contains(">=") || text.contains('<') || text.contains("!=") {
            return invalid("only '==' and '>' are supported in text conditions");
        }

        if let Some((field, number)) = text.split_once('>') {
            let Some(field) = parse_field(field) else {
                return invalid("invalid field name");
            };
            return match number.trim().parse::<f64>() {
                Ok(n) => Self::Rule(FilterRule::new(field, Operator::Gt, Some(Value::from(n)))),
                Err(_) => invalid("right-hand side of '>' must be numeric"),
            };
        }

        invalid("unrecognised condition")
    }
}

fn parse_field(raw: &str) -> Option<String> {
    let field = raw.trim();
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    valid.then(|| field.to_string())
}

fn parse_literal(raw: &str) -> Option<Value> {
    let literal = raw.trim();
    for quote in ['\'', '"'] {
        if literal.len() >= 2 && literal.starts_with(quote) && literal.ends_with(quote) {
            return Some(Value::String(literal[1..literal.len() - 1].to_string()));
        }
    }
    literal.parse::<f64>().ok().map(Value::from)
}

impl From<ConditionSpec> for Condition {
    fn from(spec: ConditionSpec) -> Self {
        match spec {
            ConditionSpec::Text(text) => Condition::parse(&text),
            ConditionSpec::Structured(rule) => Condition::Rule(rule),
        }
    }
}

impl From<Condition> for ConditionSpec {
    fn from(condition: Condition) -> Self {
        match condition {
            Condition::Always => ConditionSpec::Text("always".to_string()),
            Condition::Rule(rule) => ConditionSpec::Structured(rule),
            Condition::Invalid { raw, .. } => ConditionSpec::Text(raw),
        }
    }
}

/// Named payload transformation applied to routed messages
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransformKind {
    #[default]
    None,
    /// Stamp `processed_at`
    AddTimestamp,
    /// Add `priority` / `high_priority`
    AddPriorityFlag,
    /// Collect execution fields into `fill_info`
    ExtractFillInfo,
    /// Collect rejection fields into `rejection_info`
    ExtractRejectionInfo,
    Unknown(String),
}

impl TransformKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::None => "none",
            Self::AddTimestamp => "add_timestamp",
            Self::AddPriorityFlag => "add_priority_flag",
            Self::ExtractFillInfo => "extract_fill_info",
            Self::ExtractRejectionInfo => "extract_rejection_info",
            Self::Unknown(name) => name,
        }
    }
}

impl From<String> for TransformKind {
    fn from(raw: String) -> Self {
        match raw.trim().replace('-', "_").as_str() {
            "" | "none" => Self::None,
            "add_timestamp" => Self::AddTimestamp,
            "add_priority_flag" => Self::AddPriorityFlag,
            "extract_fill_info" => Self::ExtractFillInfo,
            "extract_rejection_info" => Self::ExtractRejectionInfo,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<TransformKind> for String {
    fn from(kind: TransformKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing rule for one source schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Rule name for logs and metrics
    #[serde(default)]
    pub name: String,

    /// Source schema id, `event_type@schema_version`
    pub schema_id: String,

    #[serde(default)]
    pub condition: Condition,

    /// Ordered target topics
    pub targets: Vec<String>,

    #[serde(default)]
    pub transform: TransformKind,
}

impl RoutingRule {
    pub fn new(schema_id: impl Into<String>, condition: Condition, targets: Vec<String>) -> Self {
        Self {
            name: String::new(),
            schema_id: schema_id.into(),
            condition,
            targets,
            transform: TransformKind::None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_transform(mut self, transform: TransformKind) -> Self {
        self.transform = transform;
        self
    }
}
