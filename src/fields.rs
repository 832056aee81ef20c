//! Extra fields rendered per event and coerced to their declared type

use crate::errors::{Result, SinkError};
use crate::event::{LogEvent, NumberFormat, PropertyValue};
use crate::tree::TreeWalker;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Renders text from an event. Implemented by the host framework's layout
/// engine; [`TemplateLayout`] is the built-in renderer.
pub trait Layout: Send + Sync + fmt::Debug {
    fn render(&self, event: &LogEvent) -> String;
}

/// Type a rendered field value is coerced to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    #[serde(alias = "int", alias = "long")]
    Integer,
    #[serde(alias = "double", alias = "number")]
    Float,
    #[serde(alias = "bool")]
    Boolean,
    DateTime,
    #[serde(alias = "object")]
    Json,
}

/// An additional document field: a name, a layout and a declared type.
#[derive(Clone, Debug)]
pub struct ExtraField {
    pub name: String,
    pub layout: Arc<dyn Layout>,
    pub field_type: FieldType,
}

impl ExtraField {
    pub fn new(
        name: impl Into<String>,
        layout: impl Layout + 'static,
        field_type: FieldType,
    ) -> Self {
        Self {
            name: name.into(),
            layout: Arc::new(layout),
            field_type,
        }
    }

    /// Build a field whose layout is a template string.
    pub fn template(
        name: impl Into<String>,
        template: &str,
        field_type: FieldType,
    ) -> Result<Self> {
        Ok(Self::new(name, TemplateLayout::parse(template)?, field_type))
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Literal(String),
    Level,
    Message,
    Date,
    Exception,
    Property(String),
    Unknown(String),
}

/// Template layout supporting `${level}`, `${message}`, `${date}`,
/// `${exception}` and `${event-properties:item=NAME}`.
///
/// Unknown renderers produce empty text.
#[derive(Clone, Debug, PartialEq)]
pub struct TemplateLayout {
    segments: Vec<Segment>,
}

impl TemplateLayout {
    pub fn parse(template: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                SinkError::Config(format!("unterminated layout renderer in '{}'", template))
            })?;
            segments.push(Self::renderer(after[..end].trim()));
            rest = &after[end + 1..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    fn renderer(body: &str) -> Segment {
        let (name, options) = match body.split_once(':') {
            Some((name, options)) => (name.trim(), Some(options.trim())),
            None => (body, None),
        };

        match (name.to_lowercase().as_str(), options) {
            ("level", _) => Segment::Level,
            ("message", _) => Segment::Message,
            ("date" | "longdate", _) => Segment::Date,
            ("exception", _) => Segment::Exception,
            ("event-properties" | "event-property", Some(options)) => {
                let item = options
                    .split(':')
                    .filter_map(|opt| opt.split_once('='))
                    .find(|(key, _)| key.trim().eq_ignore_ascii_case("item"))
                    .map(|(_, value)| value.trim().to_string());
                match item {
                    Some(item) => Segment::Property(item),
                    None => Segment::Property(options.to_string()),
                }
            }
            _ => Segment::Unknown(body.to_string()),
        }
    }
}

impl Layout for TemplateLayout {
    fn render(&self, event: &LogEvent) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Level => out.push_str(event.level.as_str()),
                Segment::Message => out.push_str(&event.message),
                Segment::Date => {
                    out.push_str(&event.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true))
                }
                Segment::Exception => {
                    if let Some(exception) = &event.exception {
                        out.push_str(&exception.message);
                    }
                }
                Segment::Property(name) => {
                    if let Some(value) = event.properties.get(name) {
                        out.push_str(&property_text(value));
                    }
                }
                Segment::Unknown(_) => {}
            }
        }
        out
    }
}

/// Plain-text rendering of a property value.
pub fn property_text(value: &PropertyValue) -> String {
    match value {
        PropertyValue::Null => String::new(),
        PropertyValue::Bool(b) => b.to_string(),
        PropertyValue::Int(i) => i.to_string(),
        PropertyValue::UInt(u) => u.to_string(),
        PropertyValue::Float(f) => f.to_string(),
        PropertyValue::String(s) => s.clone(),
        PropertyValue::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        PropertyValue::List(_) | PropertyValue::Object(_) => TreeWalker::default()
            .property(value)
            .ok()
            .flatten()
            .map(|v| v.to_string())
            .unwrap_or_default(),
    }
}

/// String to typed value coercion under one number format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldConverter {
    format: NumberFormat,
}

impl FieldConverter {
    pub fn new(format: NumberFormat) -> Self {
        Self { format }
    }

    pub fn number_format(&self) -> NumberFormat {
        self.format
    }

    pub fn convert(&self, text: &str, field_type: FieldType) -> std::result::Result<Value, String> {
        match field_type {
            FieldType::String => Ok(Value::String(text.to_string())),
            FieldType::Integer => {
                let normalized = self.normalize_number(text);
                if let Ok(i) = normalized.parse::<i64>() {
                    Ok(Value::from(i))
                } else {
                    normalized
                        .parse::<u64>()
                        .map(Value::from)
                        .map_err(|e| format!("'{}' is not an integer: {}", text, e))
                }
            }
            FieldType::Float => {
                let normalized = self.normalize_number(text);
                let f = normalized
                    .parse::<f64>()
                    .map_err(|e| format!("'{}' is not a number: {}", text, e))?;
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(|| format!("'{}' is not a finite number", text))
            }
            FieldType::Boolean => {
                let trimmed = text.trim();
                if trimmed.eq_ignore_ascii_case("true") {
                    Ok(Value::Bool(true))
                } else if trimmed.eq_ignore_ascii_case("false") {
                    Ok(Value::Bool(false))
                } else {
                    Err(format!("'{}' is not a boolean", text))
                }
            }
            FieldType::DateTime => parse_datetime(text.trim())
                .map(|ts| Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
                .ok_or_else(|| format!("'{}' is not a date", text)),
            FieldType::Json => serde_json::from_str::<Value>(text)
                .map_err(|e| format!("'{}' is not valid JSON: {}", text, e)),
        }
    }

    fn normalize_number(&self, text: &str) -> String {
        text.trim()
            .chars()
            .filter(|c| Some(*c) != self.format.group_separator)
            .map(|c| if c == self.format.decimal_separator { '.' } else { c })
            .collect()
    }
}

fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }

    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}
