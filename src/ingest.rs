//! Parsing of newline-delimited JSON input into log events

use crate::errors::{Result, SinkError};
use crate::event::{ExceptionInfo, LogEvent, LogLevel, PropertyValue};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<LogEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let json: Value = serde_json::from_str(line)?;
    let Some(object) = json.as_object() else {
        return Err(SinkError::Other(format!("expected a JSON object, got: {}", line)));
    };

    let timestamp = ["date", "timestamp", "@timestamp", "time"]
        .iter()
        .find_map(|key| object.get(*key).and_then(parse_timestamp))
        .unwrap_or_else(Utc::now);

    let level = ["level", "severity", "log_level"]
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .unwrap_or("INFO");

    let message = ["message", "msg", "text"]
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .unwrap_or("")
        .to_string();

    let mut event = LogEvent::new(LogLevel::from(level), message).with_timestamp(timestamp);

    for key in ["properties", "attributes"] {
        if let Some(properties) = object.get(key).and_then(Value::as_object) {
            for (name, value) in properties {
                event
                    .properties
                    .insert(name.clone(), PropertyValue::from(value.clone()));
            }
        }
    }

    if let Some(exception) = object.get("exception") {
        event.exception = parse_exception(exception).map(Arc::new);
    }

    Ok(Some(event))
}

fn parse_exception(value: &Value) -> Option<ExceptionInfo> {
    match value {
        Value::String(message) => Some(ExceptionInfo::new("Exception", message.clone())),
        Value::Object(object) => {
            let text = |keys: &[&str]| {
                keys.iter()
                    .find_map(|key| object.get(*key).and_then(Value::as_str))
                    .map(str::to_string)
            };

            let class_name = text(&["type", "class_name", "ClassName"])
                .unwrap_or_else(|| "Exception".to_string());
            let mut info =
                ExceptionInfo::new(class_name, text(&["message", "Message"]).unwrap_or_default());
            info.source = text(&["source", "Source"]);
            info.stack_trace = text(&["stack_trace", "stack", "StackTraceString"]);

            if let Some(data) = ["data", "Data"]
                .iter()
                .find_map(|key| object.get(*key).and_then(Value::as_object))
            {
                for (key, value) in data {
                    info.data.insert(key.clone(), PropertyValue::from(value.clone()));
                }
            }

            info.inner = ["inner", "InnerException"]
                .iter()
                .find_map(|key| object.get(*key).and_then(parse_exception))
                .map(Arc::new);

            Some(info)
        }
        _ => None,
    }
}

/// Parse RFC 3339, common SQL-style and Unix-seconds timestamps
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(seconds) = value.as_i64() {
        return Utc.timestamp_opt(seconds, 0).single();
    }

    let text = value.as_str()?;

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }

    let formats = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y/%m/%d %H:%M:%S",
    ];

    for format in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt.and_utc());
        }
    }

    text.parse::<i64>()
        .ok()
        .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_line_parsing() {
        let line = json!({
            "timestamp": 1701234567,
            "level": "ERROR",
            "message": "Test error",
            "properties": {"user": "bob", "attempt": 2}
        })
        .to_string();

        let event = parse_line(&line).unwrap().unwrap();
        assert_eq!(event.level, LogLevel::Error);
        assert_eq!(event.message, "Test error");
        assert_eq!(event.timestamp.timestamp(), 1701234567);
        assert!(matches!(
            event.properties.get("user"),
            Some(PropertyValue::String(s)) if s == "bob"
        ));
        assert!(matches!(event.properties.get("attempt"), Some(PropertyValue::Int(2))));
    }

    #[test]
    fn test_field_name_fallbacks() {
        let line = r#"{"@timestamp": "2025-01-01T10:30:45Z", "severity": "warning", "msg": "ok"}"#;

        let event = parse_line(line).unwrap().unwrap();
        assert_eq!(event.level, LogLevel::Warn);
        assert_eq!(event.message, "ok");
        assert_eq!(event.timestamp.to_rfc3339(), "2025-01-01T10:30:45+00:00");
    }

    #[test]
    fn test_exception_parsing() {
        let line = json!({
            "message": "failed",
            "exception": {
                "type": "IOError",
                "message": "disk full",
                "data": {"path.name": "/tmp"},
                "inner": "root cause"
            }
        })
        .to_string();

        let event = parse_line(&line).unwrap().unwrap();
        let exception = event.exception.unwrap();
        assert_eq!(exception.class_name, "IOError");
        assert_eq!(exception.message, "disk full");
        assert!(exception.data.contains_key("path.name"));
        assert_eq!(exception.inner.as_ref().unwrap().message, "root cause");
    }

    #[test]
    fn test_blank_and_invalid_lines() {
        assert!(parse_line("   ").unwrap().is_none());
        assert!(matches!(parse_line("not json"), Err(SinkError::Json(_))));
        assert!(matches!(parse_line("[1, 2]"), Err(SinkError::Other(_))));
    }

    #[test]
    fn test_timestamp_parsing() {
        assert!(parse_timestamp(&Value::from("2025-01-01 10:30:45")).is_some());
        assert!(parse_timestamp(&Value::from("1701234567")).is_some());
        assert!(parse_timestamp(&Value::from(1701234567)).is_some());
        assert!(parse_timestamp(&Value::from("invalid")).is_none());
    }
}
