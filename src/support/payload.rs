//! Payload codec: captures a redacted snapshot of a job's invocation
//! envelope for storage, and restores a job instance from that snapshot for
//! retry. Restoration is a security boundary; capture is best-effort.

use serde_json::{json, Map, Value};

use crate::config::PayloadConfig;
use crate::jobs::{JobEvent, JobRegistry, QueueableJob};

pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Display attributes worth keeping when an entity reference is reduced.
const ENTITY_DISPLAY_ATTRS: [&str; 4] = ["name", "email", "title", "slug"];

/// The serialized command inside a live queue envelope.
pub fn command_value(payload: &Value) -> Option<&Value> {
    payload.pointer("/data/command")
}

/// Build the stored snapshot: the raw envelope verbatim, the job's declared
/// fields shaped down to JSON-safe primitives, and the identifying job info,
/// all passed through redaction. None when capture is disabled.
pub fn extract_payload(
    event: &JobEvent,
    command_data: Option<&Value>,
    config: &PayloadConfig,
) -> Option<Value> {
    if !config.store_payload {
        return None;
    }

    let shaped = match command_data {
        Some(Value::Object(fields)) => {
            let mut out = Map::new();
            for (key, value) in fields {
                out.insert(key.clone(), shape_value(value));
            }
            Value::Object(out)
        }
        Some(other) => shape_value(other),
        None => json!({}),
    };

    let mut full = json!({
        "raw_payload": event.payload,
        "command_data": shaped,
        "job_info": {
            "uuid": event.uuid,
            "job_id": event.job_id,
            "name": event.job_class,
            "queue": event.queue,
            "connection": event.connection,
            "attempts": event.attempt,
        },
    });

    redact_sensitive(&mut full, &config.redact_keys);

    Some(full)
}

/// Reduce one field value to something safe to store. Scalars pass, arrays
/// recurse element-wise, known object shapes reduce to small summaries, and
/// anything else keeps only its type marker and top-level scalars. Nested
/// objects are never walked further, which bounds size and breaks cycles.
fn shape_value(value: &Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(items) => Value::Array(items.iter().map(shape_value).collect()),
        Value::Object(fields) => shape_object(fields),
    }
}

fn shape_object(fields: &Map<String, Value>) -> Value {
    // Entity reference: {model, id, ...} keeps identity plus display attrs.
    if fields.get("model").map(Value::is_string).unwrap_or(false) && fields.contains_key("id") {
        let mut reduced = Map::new();
        reduced.insert("model".into(), fields["model"].clone());
        reduced.insert("id".into(), fields["id"].clone());
        for attr in ENTITY_DISPLAY_ATTRS {
            if let Some(v) = fields.get(attr) {
                if is_scalar(v) {
                    reduced.insert(attr.into(), v.clone());
                }
            }
        }
        return Value::Object(reduced);
    }

    // Date/time value: keep the formatted value and zone.
    if fields.get("date").map(Value::is_string).unwrap_or(false)
        && fields.contains_key("timezone")
    {
        let mut reduced = Map::new();
        if let Some(class) = fields.get("class") {
            reduced.insert("class".into(), class.clone());
        }
        reduced.insert("date".into(), fields["date"].clone());
        reduced.insert("timezone".into(), fields["timezone"].clone());
        return Value::Object(reduced);
    }

    // Unknown object: type marker plus top-level scalars only.
    let mut reduced = Map::new();
    if let Some(class) = fields.get("class") {
        reduced.insert("class".into(), class.clone());
    }
    for (key, v) in fields {
        if key != "class" && is_scalar(v) {
            reduced.insert(key.clone(), v.clone());
        }
    }
    Value::Object(reduced)
}

fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}

/// Replace the value of any field whose name case-insensitively matches the
/// deny-list, anywhere in the document.
pub fn redact_sensitive(value: &mut Value, redact_keys: &[String]) {
    match value {
        Value::Object(fields) => {
            for (key, field) in fields.iter_mut() {
                let lowered = key.to_lowercase();
                if redact_keys.iter().any(|k| k == &lowered) {
                    *field = Value::String(REDACTION_MARKER.to_string());
                } else {
                    redact_sensitive(field, redact_keys);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_sensitive(item, redact_keys);
            }
        }
        _ => {}
    }
}

/// Recover the embedded command from a stored snapshot. The current layout
/// nests the envelope under `raw_payload`; snapshots written before that
/// carried `data.command` at the top level, so both shapes are accepted,
/// newest first.
pub fn stored_command_value(stored: &Value) -> Option<&Value> {
    stored
        .pointer("/raw_payload/data/command")
        .or_else(|| stored.pointer("/data/command"))
}

/// Rebuild a job instance from a stored snapshot, restricted to exactly
/// `expected`. Missing command, malformed data, an unregistered type, or a
/// restored instance of the wrong type all return None; there is no looser
/// path.
pub fn restore_job(
    stored: &Value,
    expected: &str,
    registry: &JobRegistry,
) -> Option<Box<dyn QueueableJob>> {
    let command = stored_command_value(stored)?;
    if !command.is_object() {
        return None;
    }
    registry.restore(expected, command)
}

/// Retry marker embedded in a live envelope's command, for runs whose job
/// type is not registered with us.
pub fn extract_retry_of(payload: &Value) -> Option<i64> {
    command_value(payload)?.get("retry_of")?.as_i64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::registry_with_report_job;

    fn event_with_payload(payload: Value) -> JobEvent {
        JobEvent {
            uuid: Some("u1".into()),
            job_id: None,
            job_class: "ReportJob".into(),
            queue: Some("reports".into()),
            connection: Some("database".into()),
            attempt: 1,
            payload,
            released: false,
        }
    }

    fn config() -> PayloadConfig {
        PayloadConfig {
            store_payload: true,
            redact_keys: PayloadConfig::default_redact_keys(),
        }
    }

    #[test]
    fn capture_disabled_returns_none() {
        let cfg = PayloadConfig {
            store_payload: false,
            redact_keys: vec![],
        };
        let event = event_with_payload(json!({}));
        assert!(extract_payload(&event, None, &cfg).is_none());
    }

    #[test]
    fn snapshot_keeps_raw_envelope_and_job_info() {
        let event = event_with_payload(json!({"data": {"command": {"report_id": 3}}}));
        let stored = extract_payload(&event, None, &config()).unwrap();
        assert_eq!(stored["raw_payload"]["data"]["command"]["report_id"], 3);
        assert_eq!(stored["job_info"]["name"], "ReportJob");
        assert_eq!(stored["job_info"]["queue"], "reports");
        assert_eq!(stored["job_info"]["attempts"], 1);
    }

    #[test]
    fn redaction_is_recursive_and_case_insensitive() {
        let event = event_with_payload(json!({
            "data": {"command": {"Password": "hunter2", "nested": {"api_key": "k"}}}
        }));
        let command_data = json!({"TOKEN": "abc", "safe": 1});
        let stored = extract_payload(&event, Some(&command_data), &config()).unwrap();
        assert_eq!(
            stored["raw_payload"]["data"]["command"]["Password"],
            REDACTION_MARKER
        );
        assert_eq!(
            stored["raw_payload"]["data"]["command"]["nested"]["api_key"],
            REDACTION_MARKER
        );
        assert_eq!(stored["command_data"]["TOKEN"], REDACTION_MARKER);
        assert_eq!(stored["command_data"]["safe"], 1);
    }

    #[test]
    fn entity_references_reduce_to_identity_and_display_attrs() {
        let command_data = json!({
            "user": {"model": "app::User", "id": 9, "email": "a@b.c", "balance": {"cents": 100}},
        });
        let event = event_with_payload(json!({}));
        let stored = extract_payload(&event, Some(&command_data), &config()).unwrap();
        let user = &stored["command_data"]["user"];
        assert_eq!(user["model"], "app::User");
        assert_eq!(user["id"], 9);
        assert_eq!(user["email"], "a@b.c");
        assert!(user.get("balance").is_none());
    }

    #[test]
    fn unknown_objects_keep_scalars_only_one_level_deep() {
        let command_data = json!({
            "options": {"class": "app::Options", "verbose": true, "inner": {"deep": 1}},
        });
        let event = event_with_payload(json!({}));
        let stored = extract_payload(&event, Some(&command_data), &config()).unwrap();
        let options = &stored["command_data"]["options"];
        assert_eq!(options["class"], "app::Options");
        assert_eq!(options["verbose"], true);
        assert!(options.get("inner").is_none());
    }

    #[test]
    fn datetime_values_reduce_to_formatted_form() {
        let command_data = json!({
            "run_at": {"class": "DateTime", "date": "2026-01-02 03:04:05", "timezone": "UTC"},
        });
        let event = event_with_payload(json!({}));
        let stored = extract_payload(&event, Some(&command_data), &config()).unwrap();
        assert_eq!(
            stored["command_data"]["run_at"]["date"],
            "2026-01-02 03:04:05"
        );
        assert_eq!(stored["command_data"]["run_at"]["timezone"], "UTC");
    }

    #[test]
    fn restore_reads_new_shape_then_legacy_shape() {
        let registry = registry_with_report_job();
        let new_shape = json!({"raw_payload": {"data": {"command": {"report_id": 4}}}});
        let legacy = json!({"data": {"command": {"report_id": 5}}});
        let from_new = restore_job(&new_shape, "ReportJob", &registry).unwrap();
        let from_legacy = restore_job(&legacy, "ReportJob", &registry).unwrap();
        assert_eq!(from_new.command_data()["report_id"], 4);
        assert_eq!(from_legacy.command_data()["report_id"], 5);
    }

    #[test]
    fn restore_refuses_wrong_expected_type() {
        let registry = registry_with_report_job();
        let stored = json!({"raw_payload": {"data": {"command": {"report_id": 4}}}});
        assert!(restore_job(&stored, "EmailJob", &registry).is_none());
    }

    #[test]
    fn restore_refuses_non_object_command() {
        let registry = registry_with_report_job();
        let stored = json!({"raw_payload": {"data": {"command": "O:8:\"stdClass\""}}});
        assert!(restore_job(&stored, "ReportJob", &registry).is_none());
    }

    #[test]
    fn retry_marker_read_from_live_envelope() {
        let payload = json!({"data": {"command": {"report_id": 1, "retry_of": 42}}});
        assert_eq!(extract_retry_of(&payload), Some(42));
        assert_eq!(extract_retry_of(&json!({})), None);
    }
}
