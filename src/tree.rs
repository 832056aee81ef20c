//! Conversion of loosely typed property graphs into JSON trees

use crate::errors::{Result, SinkError};
use crate::event::{ExceptionInfo, PropertyValue};
use chrono::SecondsFormat;
use serde_json::{Map, Number, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Maximum nesting depth before a branch is dropped.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Replacement for `.` in object keys; the intake reads dotted keys as paths.
pub const KEY_SEPARATOR: &str = "_";

/// Depth-bounded walk over a property graph.
///
/// Tracks the objects on the current path. A value that points back to one of
/// its ancestors is omitted, so cyclic graphs terminate; an object that is
/// merely shared between two branches is written in both.
#[derive(Debug)]
pub struct TreeWalker {
    max_depth: usize,
    ancestors: HashSet<usize>,
}

impl Default for TreeWalker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl TreeWalker {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            ancestors: HashSet::new(),
        }
    }

    /// Convert a property value. `Ok(None)` means the value must be omitted.
    pub fn property(&mut self, value: &PropertyValue) -> Result<Option<Value>> {
        self.walk_property(value, 0)
    }

    /// Convert an exception and its inner chain into a generic tree.
    pub fn exception(&mut self, exception: &ExceptionInfo) -> Result<Value> {
        Ok(self
            .walk_exception(exception, 0)?
            .unwrap_or_else(|| Value::Object(Map::new())))
    }

    fn walk_property(&mut self, value: &PropertyValue, depth: usize) -> Result<Option<Value>> {
        let converted = match value {
            PropertyValue::Null => Value::Null,
            PropertyValue::Bool(b) => Value::Bool(*b),
            PropertyValue::Int(i) => Value::from(*i),
            PropertyValue::UInt(u) => Value::from(*u),
            PropertyValue::Float(f) => Value::Number(Number::from_f64(*f).ok_or_else(|| {
                SinkError::Serialization(format!("non-finite number {} is not valid JSON", f))
            })?),
            PropertyValue::String(s) => Value::String(s.clone()),
            PropertyValue::Timestamp(ts) => {
                Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            PropertyValue::List(items) => {
                if depth >= self.max_depth {
                    return Ok(None);
                }
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(v) = self.walk_property(item, depth + 1)? {
                        out.push(v);
                    }
                }
                Value::Array(out)
            }
            PropertyValue::Object(node) => {
                if depth >= self.max_depth {
                    return Ok(None);
                }
                let id = Arc::as_ptr(node) as usize;
                if !self.ancestors.insert(id) {
                    return Ok(None);
                }

                let mut map = Map::new();
                let result = node.fields().iter().try_for_each(|(key, field)| {
                    if let Some(v) = self.walk_property(field, depth + 1)? {
                        map.insert(key.clone(), v);
                    }
                    Ok::<(), SinkError>(())
                });

                self.ancestors.remove(&id);
                result?;
                Value::Object(map)
            }
        };

        Ok(Some(converted))
    }

    fn walk_exception(&mut self, exception: &ExceptionInfo, depth: usize) -> Result<Option<Value>> {
        if depth >= self.max_depth {
            return Ok(None);
        }
        let id = exception as *const ExceptionInfo as usize;
        if !self.ancestors.insert(id) {
            return Ok(None);
        }

        let result = self.exception_fields(exception, depth);
        self.ancestors.remove(&id);
        result.map(|map| Some(Value::Object(map)))
    }

    fn exception_fields(
        &mut self,
        exception: &ExceptionInfo,
        depth: usize,
    ) -> Result<Map<String, Value>> {
        let mut map = Map::new();
        map.insert("ClassName".to_string(), Value::String(exception.class_name.clone()));
        map.insert("Message".to_string(), Value::String(exception.message.clone()));

        if !exception.data.is_empty() {
            let mut data = Map::new();
            for (key, value) in &exception.data {
                if let Some(v) = self.walk_property(value, depth + 2)? {
                    data.insert(key.clone(), v);
                }
            }
            map.insert("Data".to_string(), Value::Object(data));
        }

        if let Some(inner) = &exception.inner {
            if let Some(v) = self.walk_exception(inner, depth + 1)? {
                map.insert("InnerException".to_string(), v);
            }
        }

        if let Some(stack_trace) = &exception.stack_trace {
            map.insert("StackTraceString".to_string(), Value::String(stack_trace.clone()));
        }

        if let Some(source) = &exception.source {
            map.insert("Source".to_string(), Value::String(source.clone()));
        }

        Ok(map)
    }
}

/// Rewrite every object key containing `.` at any depth.
///
/// When a rewritten key collides with an existing one the first entry wins.
pub fn replace_dots_in_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, v) in map {
                let key = if key.contains('.') {
                    key.replace('.', KEY_SEPARATOR)
                } else {
                    key
                };
                out.entry(key).or_insert_with(|| replace_dots_in_keys(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(replace_dots_in_keys).collect()),
        other => other,
    }
}
