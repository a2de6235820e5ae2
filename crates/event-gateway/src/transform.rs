//! Payload transformations applied to routed messages
//!
//! The set is closed: every [`TransformKind`] is dispatched here and only
//! the payload map is touched.

use chrono::{DateTime, Utc};
use event_bus_core::prelude::*;
use serde_json::{json, Value};
use tracing::warn;

/// Confidence at or above which a signal is flagged high priority
pub const HIGH_PRIORITY_CONFIDENCE: f64 = 0.8;

/// Apply `kind` to the message payload
pub fn apply(message: EventMessage, kind: &TransformKind) -> EventMessage {
    apply_at(message, kind, Utc::now())
}

/// Apply `kind` using `now` as the processing time
pub fn apply_at(mut message: EventMessage, kind: &TransformKind, now: DateTime<Utc>) -> EventMessage {
    match kind {
        TransformKind::None => {}
        TransformKind::AddTimestamp => add_timestamp(&mut message.payload, now),
        TransformKind::AddPriorityFlag => add_priority_flag(&mut message.payload),
        TransformKind::ExtractFillInfo => extract_fill_info(&mut message.payload),
        TransformKind::ExtractRejectionInfo => extract_rejection_info(&mut message.payload),
        TransformKind::Unknown(name) => {
            warn!(
                transform = %name,
                message_id = %message.id,
                "Unknown transform, leaving payload unchanged"
            );
        }
    }
    message
}

fn add_timestamp(payload: &mut Payload, now: DateTime<Utc>) {
    payload.insert("processed_at".into(), Value::String(now.to_rfc3339()));
}

fn add_priority_flag(payload: &mut Payload) {
    let confidence = payload.get("confidence").and_then(as_f64).unwrap_or(0.0);
    let urgent = payload.get("urgency").and_then(Value::as_str) == Some("high");
    let high = confidence >= HIGH_PRIORITY_CONFIDENCE || urgent;

    payload.insert("high_priority".into(), Value::Bool(high));
    payload.insert(
        "priority".into(),
        Value::String(if high { "high" } else { "normal" }.into()),
    );
}

fn extract_fill_info(payload: &mut Payload) {
    let info = json!({
        "order_id": first_of(payload, &["order_id"]),
        "symbol": first_of(payload, &["symbol"]),
        "fill_price": first_of(payload, &["fill_price", "price"]),
        "fill_quantity": first_of(payload, &["fill_quantity", "quantity"]),
        "side": first_of(payload, &["side"]),
    });
    payload.insert("fill_info".into(), info);
}

fn extract_rejection_info(payload: &mut Payload) {
    let info = json!({
        "order_id": first_of(payload, &["order_id"]),
        "reason": first_of(payload, &["reason", "rejection_reason"]),
        "code": first_of(payload, &["code", "error_code"]),
    });
    payload.insert("rejection_info".into(), info);
}

fn first_of(payload: &Payload, keys: &[&str]) -> Value {
    keys.iter()
        .find_map(|k| payload.get(*k).filter(|v| !v.is_null()))
        .cloned()
        .unwrap_or(Value::Null)
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(payload: Value) -> EventMessage {
        EventMessage::new("t", "E", "1.0", payload.as_object().cloned().unwrap())
    }

    #[test]
    fn test_add_timestamp() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let out = apply_at(message(json!({"symbol": "EURUSD"})), &TransformKind::AddTimestamp, now);
        assert_eq!(out.payload["processed_at"], json!(now.to_rfc3339()));
        assert_eq!(out.payload["symbol"], "EURUSD");
    }

    #[test]
    fn test_priority_flag() {
        let high = apply(message(json!({"confidence": 0.85})), &TransformKind::AddPriorityFlag);
        assert_eq!(high.payload["high_priority"], true);
        assert_eq!(high.payload["priority"], "high");

        let urgent = apply(
            message(json!({"confidence": "0.1", "urgency": "high"})),
            &TransformKind::AddPriorityFlag,
        );
        assert_eq!(urgent.payload["high_priority"], true);

        let normal = apply(message(json!({"confidence": 0.5})), &TransformKind::AddPriorityFlag);
        assert_eq!(normal.payload["high_priority"], false);
        assert_eq!(normal.payload["priority"], "normal");
    }

    #[test]
    fn test_extract_fill_and_rejection_info() {
        let fill = apply(
            message(json!({"order_id": "o-1", "symbol": "EURUSD", "price": 1.1, "quantity": 1000, "side": "buy"})),
            &TransformKind::ExtractFillInfo,
        );
        assert_eq!(
            fill.payload["fill_info"],
            json!({"order_id": "o-1", "symbol": "EURUSD", "fill_price": 1.1, "fill_quantity": 1000, "side": "buy"})
        );

        let rejected = apply(
            message(json!({"order_id": "o-2", "rejection_reason": "margin"})),
            &TransformKind::ExtractRejectionInfo,
        );
        assert_eq!(
            rejected.payload["rejection_info"],
            json!({"order_id": "o-2", "reason": "margin", "code": null})
        );
    }

    #[test]
    fn test_unknown_and_none_are_noops() {
        let original = message(json!({"a": 1}));
        let out = apply(original.clone(), &TransformKind::Unknown("shout".into()));
        assert_eq!(out, original);
        assert_eq!(apply(original.clone(), &TransformKind::None), original);
    }
}
