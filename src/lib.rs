//! Datadog Log Sink Library
//!
//! This library turns structured log events into Datadog JSON documents and
//! ships them in batches to the Datadog intake over TCP (optionally TLS) or HTTP.

pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod event;
pub mod fields;
pub mod formatter;
pub mod ingest;
pub mod tcp;
pub mod transport;
pub mod tree;

pub use config::{Config, FailurePolicy};
pub use dispatcher::{BatchDispatcher, BlockingDispatcher, Outcome, PendingEvent};
pub use errors::{Result, SinkError};
pub use event::{ExceptionInfo, LogEvent, LogLevel, ObjectNode, PropertyValue};
pub use fields::{ExtraField, FieldType};
pub use formatter::{PayloadFormatter, RoutingMetadata};
pub use transport::{DeliveryClient, HttpTransport, RetryPolicy};
pub use tcp::TcpTransport;
