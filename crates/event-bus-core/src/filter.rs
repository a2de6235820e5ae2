//! Filter engine
//!
//! Declarative field predicates grouped into named rule sets. A message
//! passes when every rule of every requested set holds.
//!
//! ## Fail-open policy
//!
//! Operators that are not recognised at load time are kept as
//! [`Operator::Unknown`]. When the field is present such a rule logs a
//! warning and evaluates to `true`. An absent field only satisfies
//! `not_exists`, whatever the operator. Rule-set names that do not exist are
//! skipped with a warning.
//!
//! ## Example
//!
//! ```rust,ignore
//! let engine = FilterEngine::new(rule_sets)?;
//! if engine.apply(&message, &["major_pairs".to_string()]) {
//!     // route it
//! }
//! ```

use crate::error::{GatewayError, Result};
use crate::message::EventMessage;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use tracing::{error, warn};

/// Comparison operator of a rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    NotIn,
    Contains,
    NotNull,
    IsNull,
    Exists,
    NotExists,
    RecentMinutes,
    MatchesRegex,
    /// Unrecognised operator name, kept for the fail-open warning
    Unknown(String),
}

impl Operator {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Contains => "contains",
            Self::NotNull => "not_null",
            Self::IsNull => "is_null",
            Self::Exists => "exists",
            Self::NotExists => "not_exists",
            Self::RecentMinutes => "recent_minutes",
            Self::MatchesRegex => "matches_regex",
            Self::Unknown(name) => name,
        }
    }
}

impl From<String> for Operator {
    fn from(raw: String) -> Self {
        match raw.trim() {
            "==" | "eq" => Self::Eq,
            "!=" | "ne" => Self::Ne,
            ">" | "gt" => Self::Gt,
            ">=" | "gte" => Self::Ge,
            "<" | "lt" => Self::Lt,
            "<=" | "lte" => Self::Le,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            "contains" => Self::Contains,
            "not_null" => Self::NotNull,
            "is_null" => Self::IsNull,
            "exists" => Self::Exists,
            "not_exists" => Self::NotExists,
            "recent_minutes" => Self::RecentMinutes,
            "matches_regex" => Self::MatchesRegex,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        op.as_str().to_string()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative field predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    /// Payload key (dotted path) or envelope attribute
    pub field: String,

    pub operator: Operator,

    /// Single comparison value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// Value set for `in` / `not_in`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
}

impl FilterRule {
    pub fn new(field: impl Into<String>, operator: Operator, value: Option<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            values: Vec::new(),
        }
    }

    /// Rule over a value set
    pub fn with_values(
        field: impl Into<String>,
        operator: Operator,
        values: impl IntoIterator<Item = Value>,
    ) -> Self {
        Self {
            field: field.into(),
            operator,
            value: None,
            values: values.into_iter().collect(),
        }
    }
}

/// A rule with its regex (if any) compiled once
#[derive(Debug, Clone)]
pub struct CompiledRule {
    rule: FilterRule,
    regex: Option<Regex>,
}

impl CompiledRule {
    pub fn compile(rule: FilterRule) -> Result<Self> {
        let regex = match rule.operator {
            Operator::MatchesRegex => {
                let pattern = rule.value.as_ref().and_then(Value::as_str).ok_or_else(|| {
                    GatewayError::config(format!(
                        "matches_regex on '{}' requires a string pattern",
                        rule.field
                    ))
                })?;
                Some(Regex::new(pattern).map_err(|e| {
                    GatewayError::config(format!("invalid regex for '{}': {}", rule.field, e))
                })?)
            }
            _ => None,
        };
        Ok(Self { rule, regex })
    }

    pub fn rule(&self) -> &FilterRule {
        &self.rule
    }

    /// Evaluate against a message at the given instant
    pub fn evaluate(&self, message: &EventMessage, now: DateTime<Utc>) -> bool {
        let rule = &self.rule;
        let Some(actual) = message.field(&rule.field) else {
            return rule.operator == Operator::NotExists;
        };

        match &rule.operator {
            Operator::Eq => self.expected().map(|v| values_equal(&actual, v)).unwrap_or(false),
            Operator::Ne => self.expected().map(|v| !values_equal(&actual, v)).unwrap_or(false),
            Operator::Gt => compare(&actual, self.expected()) == Some(Ordering::Greater),
            Operator::Ge => matches!(
                compare(&actual, self.expected()),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Lt => compare(&actual, self.expected()) == Some(Ordering::Less),
            Operator::Le => matches!(
                compare(&actual, self.expected()),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::In => self.value_set().iter().any(|v| values_equal(&actual, v)),
            Operator::NotIn => !self.value_set().iter().any(|v| values_equal(&actual, v)),
            Operator::Contains => self
                .expected()
                .map(|needle| contains(&actual, needle))
                .unwrap_or(false),
            Operator::NotNull => !actual.is_null(),
            Operator::IsNull => actual.is_null(),
            Operator::Exists => true,
            Operator::NotExists => false,
            Operator::RecentMinutes => {
                let Some(minutes) = self.expected().and_then(Value::as_f64) else {
                    error!(field = %rule.field, "recent_minutes requires a numeric value");
                    return false;
                };
                match actual.as_str().and_then(parse_timestamp) {
                    Some(ts) => {
                        now.signed_duration_since(ts)
                            < ChronoDuration::milliseconds((minutes * 60_000.0) as i64)
                    }
                    None => false,
                }
            }
            Operator::MatchesRegex => match (&self.regex, &actual) {
                (Some(re), Value::String(s)) => re.is_match(s),
                (Some(re), other) => re.is_match(&other.to_string()),
                (None, _) => false,
            },
            Operator::Unknown(name) => {
                warn!(operator = %name, field = %rule.field, "Unknown filter operator, passing");
                true
            }
        }
    }

    fn expected(&self) -> Option<&Value> {
        self.rule.value.as_ref()
    }

    fn value_set(&self) -> &[Value] {
        if !self.rule.values.is_empty() {
            return &self.rule.values;
        }
        match &self.rule.value {
            Some(Value::Array(items)) => items,
            Some(single) => std::slice::from_ref(single),
            None => &[],
        }
    }
}

/// Equality with numeric coercion (`1 == 1.0`)
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

/// Ordering for numbers and strings; other combinations are incomparable
pub fn compare(actual: &Value, expected: Option<&Value>) -> Option<Ordering> {
    let expected = expected?;
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
        (Value::Array(items), n) => items.iter().any(|item| values_equal(item, n)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

/// Parse an ISO-8601 timestamp; naive timestamps are read as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Outcome of evaluating rule sets against a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterResult {
    /// Message passes every requested rule set
    Pass,
    /// Message was rejected by a rule
    Reject { rule_set: String, field: String },
}

impl FilterResult {
    pub fn passes(&self) -> bool {
        matches!(self, FilterResult::Pass)
    }
}

/// Named rule sets, compiled once at startup and read-only afterwards
#[derive(Debug, Default)]
pub struct FilterEngine {
    rule_sets: HashMap<String, Vec<CompiledRule>>,
}

impl FilterEngine {
    /// Compile rule sets; invalid regex patterns are configuration errors
    pub fn new(rule_sets: HashMap<String, Vec<FilterRule>>) -> Result<Self> {
        let mut compiled = HashMap::with_capacity(rule_sets.len());
        for (name, rules) in rule_sets {
            let rules = rules
                .into_iter()
                .map(CompiledRule::compile)
                .collect::<Result<Vec<_>>>()?;
            compiled.insert(name, rules);
        }
        Ok(Self {
            rule_sets: compiled,
        })
    }

    /// `true` if the message passes every named rule set
    pub fn apply(&self, message: &EventMessage, rule_sets: &[String]) -> bool {
        self.evaluate(message, rule_sets).passes()
    }

    pub fn evaluate(&self, message: &EventMessage, rule_sets: &[String]) -> FilterResult {
        self.evaluate_at(message, rule_sets, Utc::now())
    }

    pub fn evaluate_at(
        &self,
        message: &EventMessage,
        rule_sets: &[String],
        now: DateTime<Utc>,
    ) -> FilterResult {
        for name in rule_sets {
            let Some(rules) = self.rule_sets.get(name) else {
                warn!(rule_set = %name, "Unknown filter rule set, skipping");
                continue;
            };
            for rule in rules {
                if !rule.evaluate(message, now) {
                    return FilterResult::Reject {
                        rule_set: name.clone(),
                        field: rule.rule().field.clone(),
                    };
                }
            }
        }
        FilterResult::Pass
    }

    pub fn contains(&self, rule_set: &str) -> bool {
        self.rule_sets.contains_key(rule_set)
    }

    pub fn len(&self) -> usize {
        self.rule_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rule_sets.is_empty()
    }
}
