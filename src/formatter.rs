//! Event to JSON document formatting

use crate::config::Config;
use crate::errors::{Result, SinkError};
use crate::event::LogEvent;
use crate::fields::{ExtraField, FieldConverter};
use crate::tree::{DEFAULT_MAX_DEPTH, TreeWalker, replace_dots_in_keys};
use chrono::SecondsFormat;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::error;

/// Framework-internal properties that never reach the intake.
pub const DEFAULT_EXCLUDED_PROPERTIES: [&str; 5] = [
    "CallerMemberName",
    "CallerFilePath",
    "CallerLineNumber",
    "MachineName",
    "ThreadId",
];

/// Static identifiers attached to every document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoutingMetadata {
    pub source: Option<String>,
    pub service: Option<String>,
    pub host: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Builds one JSON document per event.
#[derive(Clone, Debug)]
pub struct PayloadFormatter {
    routing: RoutingMetadata,
    fields: Vec<ExtraField>,
    include_all_properties: bool,
    excluded_properties: HashSet<String>,
    max_depth: usize,
}

impl PayloadFormatter {
    pub fn new(routing: RoutingMetadata) -> Self {
        Self {
            routing,
            fields: Vec::new(),
            include_all_properties: false,
            excluded_properties: DEFAULT_EXCLUDED_PROPERTIES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Create a formatter from the sink configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let fields = config
            .fields
            .iter()
            .map(|field| ExtraField::template(&field.name, &field.layout, field.field_type))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(config.routing())
            .with_fields(fields)
            .include_all_properties(config.include_all_properties)
            .with_excluded_properties(config.excluded_properties.iter().cloned()))
    }

    pub fn with_field(mut self, field: ExtraField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_fields(mut self, fields: impl IntoIterator<Item = ExtraField>) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn include_all_properties(mut self, include: bool) -> Self {
        self.include_all_properties = include;
        self
    }

    /// Add to the excluded property set; the built-in entries stay excluded.
    pub fn with_excluded_properties(
        mut self,
        properties: impl IntoIterator<Item = String>,
    ) -> Self {
        self.excluded_properties.extend(properties);
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn routing(&self) -> &RoutingMetadata {
        &self.routing
    }

    pub fn is_excluded(&self, key: &str) -> bool {
        self.excluded_properties.contains(key)
    }

    /// Format one event as a compact JSON string.
    ///
    /// Only a failure to serialize the document as a whole is returned; a
    /// field that cannot be coerced is logged and left out.
    pub fn format(&self, event: &LogEvent) -> Result<String> {
        let mut document = self.document(event)?;
        document.retain(|_, value| !value.is_null());

        serde_json::to_string(&document).map_err(|e| SinkError::Serialization(e.to_string()))
    }

    /// Assemble the document. Earlier writers win on key collisions.
    pub fn document(&self, event: &LogEvent) -> Result<Map<String, Value>> {
        let mut document = Map::new();

        document.insert(
            "date".to_string(),
            Value::String(event.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        document.insert("level".to_string(), Value::String(event.level.as_str().to_string()));
        document.insert("message".to_string(), Value::String(event.message.clone()));

        if let Some(source) = &self.routing.source {
            document.insert("ddsource".to_string(), Value::String(source.clone()));
        }
        if let Some(service) = &self.routing.service {
            document.insert("service".to_string(), Value::String(service.clone()));
        }
        if let Some(host) = &self.routing.host {
            document.insert("host".to_string(), Value::String(host.clone()));
        }
        if let Some(tags) = &self.routing.tags {
            document.insert(
                "ddtags".to_string(),
                Value::Array(tags.iter().cloned().map(Value::String).collect()),
            );
        }

        if let Some(exception) = &event.exception {
            let tree = TreeWalker::new(self.max_depth).exception(exception)?;
            document.insert("exception".to_string(), replace_dots_in_keys(tree));
        }

        self.add_fields(event, &mut document);

        if self.include_all_properties && event.has_properties() {
            let mut walker = TreeWalker::new(self.max_depth);
            for (key, value) in &event.properties {
                if self.is_excluded(key) || document.contains_key(key) {
                    continue;
                }
                if let Some(value) = walker.property(value)? {
                    document.insert(key.clone(), value);
                }
            }
        }

        Ok(document)
    }

    fn add_fields(&self, event: &LogEvent, document: &mut Map<String, Value>) {
        if self.fields.is_empty() {
            return;
        }

        let converter = FieldConverter::new(event.number_format);

        for field in &self.fields {
            let rendered = field.layout.render(event);
            if rendered.trim().is_empty() || document.contains_key(&field.name) {
                continue;
            }

            match converter.convert(&rendered, field.field_type) {
                Ok(value) => {
                    document.insert(field.name.clone(), value);
                }
                Err(reason) => {
                    let err = SinkError::Coercion {
                        field: field.name.clone(),
                        reason,
                    };
                    error!("Error while formatting field: {}", err);
                }
            }
        }
    }
}
