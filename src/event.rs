//! Log event data model consumed by the formatter

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// One unit of log data handed over by the host logging framework.
#[derive(Clone, Debug)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub exception: Option<Arc<ExceptionInfo>>,
    pub properties: BTreeMap<String, PropertyValue>,
    pub number_format: NumberFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Severity name as written to the `level` key.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "Trace",
            LogLevel::Debug => "Debug",
            LogLevel::Info => "Info",
            LogLevel::Warn => "Warn",
            LogLevel::Error => "Error",
            LogLevel::Fatal => "Fatal",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "TRACE" | "VERBOSE" => LogLevel::Trace,
            "DEBUG" => LogLevel::Debug,
            "INFO" | "INFORMATION" => LogLevel::Info,
            "WARN" | "WARNING" => LogLevel::Warn,
            "ERROR" | "ERR" => LogLevel::Error,
            "FATAL" | "CRITICAL" => LogLevel::Fatal,
            _ => LogLevel::Info, // Default fallback
        }
    }
}

/// Locale-dependent number formatting used when coercing rendered text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NumberFormat {
    pub decimal_separator: char,
    pub group_separator: Option<char>,
}

impl NumberFormat {
    /// The culture-neutral format: `.` decimals, no grouping.
    pub const INVARIANT: NumberFormat = NumberFormat {
        decimal_separator: '.',
        group_separator: None,
    };

    pub fn new(decimal_separator: char, group_separator: Option<char>) -> Self {
        Self {
            decimal_separator,
            group_separator,
        }
    }
}

impl Default for NumberFormat {
    fn default() -> Self {
        Self::INVARIANT
    }
}

/// Loosely typed property value attached to an event or an exception.
#[derive(Clone, Debug)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    List(Vec<PropertyValue>),
    Object(Arc<ObjectNode>),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(value.into())
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<u64> for PropertyValue {
    fn from(value: u64) -> Self {
        PropertyValue::UInt(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(value: DateTime<Utc>) -> Self {
        PropertyValue::Timestamp(value)
    }
}

impl From<Arc<ObjectNode>> for PropertyValue {
    fn from(value: Arc<ObjectNode>) -> Self {
        PropertyValue::Object(value)
    }
}

impl From<serde_json::Value> for PropertyValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => PropertyValue::Null,
            Value::Bool(b) => PropertyValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PropertyValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    PropertyValue::UInt(u)
                } else {
                    PropertyValue::Float(n.as_f64().unwrap_or_default())
                }
            }
            Value::String(s) => PropertyValue::String(s),
            Value::Array(items) => {
                PropertyValue::List(items.into_iter().map(PropertyValue::from).collect())
            }
            Value::Object(map) => {
                let node = ObjectNode::new();
                for (key, value) in map {
                    node.set(key, PropertyValue::from(value));
                }
                PropertyValue::Object(node)
            }
        }
    }
}

/// A shared, mutable object in a property graph.
///
/// Nodes are reference counted so the same object can be reachable from
/// several places, including itself. A node that references itself keeps
/// itself alive until [`ObjectNode::clear`] breaks the cycle.
#[derive(Default)]
pub struct ObjectNode {
    fields: RwLock<Vec<(String, PropertyValue)>>,
}

impl ObjectNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert or replace a field, keeping first-insertion order.
    pub fn set(&self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        let key = key.into();
        let value = value.into();
        let mut fields = self.fields.write().unwrap_or_else(PoisonError::into_inner);

        match fields.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = value,
            None => fields.push((key, value)),
        }
    }

    /// Snapshot of the fields in insertion order.
    pub fn fields(&self) -> Vec<(String, PropertyValue)> {
        self.fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.fields.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.fields
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl fmt::Debug for ObjectNode {
    // Field values are not printed: the graph may be cyclic.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.fields.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_set()
            .entries(fields.iter().map(|(key, _)| key))
            .finish()
    }
}

/// Error object carried by an event.
#[derive(Clone, Debug, Default)]
pub struct ExceptionInfo {
    pub class_name: String,
    pub message: String,
    pub source: Option<String>,
    pub stack_trace: Option<String>,
    pub data: BTreeMap<String, PropertyValue>,
    pub inner: Option<Arc<ExceptionInfo>>,
}

impl ExceptionInfo {
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    /// Capture a Rust error and its `source()` chain.
    pub fn from_error<E: std::error::Error + 'static>(err: &E) -> Self {
        let class_name = std::any::type_name::<E>()
            .rsplit("::")
            .next()
            .unwrap_or("Error")
            .to_string();

        let mut info = Self::new(class_name, err.to_string());
        info.inner = err.source().map(|source| Arc::new(Self::from_dyn(source)));
        info
    }

    fn from_dyn(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut info = Self::new("Error", err.to_string());
        info.inner = err.source().map(|source| Arc::new(Self::from_dyn(source)));
        info
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_inner(mut self, inner: ExceptionInfo) -> Self {
        self.inner = Some(Arc::new(inner));
        self
    }
}

impl LogEvent {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            exception: None,
            properties: BTreeMap::new(),
            number_format: NumberFormat::default(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_exception(mut self, exception: ExceptionInfo) -> Self {
        self.exception = Some(Arc::new(exception));
        self
    }

    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_number_format(mut self, number_format: NumberFormat) -> Self {
        self.number_format = number_format;
        self
    }

    pub fn has_properties(&self) -> bool {
        !self.properties.is_empty()
    }
}
