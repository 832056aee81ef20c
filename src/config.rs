//! Configuration management for the Datadog log sink

use crate::errors::{Result, SinkError};
use crate::fields::{FieldType, TemplateLayout};
use crate::formatter::RoutingMetadata;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Public TCP intake host.
pub const DD_TCP_HOST: &str = "intake.logs.datadoghq.com";

/// Public HTTP intake base URL.
pub const DD_HTTP_URL: &str = "https://http-intake.logs.datadoghq.com";

/// TCP intake port with TLS.
pub const DD_PORT: u16 = 10516;

/// TCP intake port without TLS.
pub const DD_PORT_NO_SSL: u16 = 10514;

/// What the dispatcher reports when delivery gives up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Completion callbacks report success even though nothing was delivered.
    #[default]
    FailOpen,
    /// Completion callbacks receive the delivery error.
    FailClosed,
}

impl FailurePolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "fail_open" | "open" => Some(FailurePolicy::FailOpen),
            "fail_closed" | "closed" => Some(FailurePolicy::FailClosed),
            _ => None,
        }
    }
}

/// An extra document field as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    pub layout: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Datadog API key
    pub api_key: String,

    /// Value of the `ddsource` attribute
    pub source: Option<String>,

    /// Value of the `service` attribute
    pub service: Option<String>,

    /// Value of the `host` attribute
    pub host: Option<String>,

    /// Value of the `ddtags` attribute
    pub tags: Option<Vec<String>>,

    /// Intake host (TCP) or base URL (HTTP); unset picks the public intake
    pub url: Option<String>,

    /// Intake port; 0 picks the default for the TLS setting
    pub port: u16,

    /// Encrypt the TCP stream
    pub use_ssl: bool,

    /// Use the TCP stream transport instead of HTTP
    pub use_tcp: bool,

    /// Merge every event property into the document
    pub include_all_properties: bool,

    /// Properties never merged, on top of the built-in set
    pub excluded_properties: Vec<String>,

    /// Extra fields rendered per event, in order
    pub fields: Vec<FieldConfig>,

    /// Outcome reported to callers after delivery gives up
    pub failure_policy: FailurePolicy,

    /// Maximum delivery attempts per batch
    pub max_retries: u32,

    /// Upper bound on the delay between attempts
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,

    /// HTTP timeout for intake requests
    #[serde(with = "duration_secs")]
    pub http_timeout: Duration,

    /// Events per batch when reading from a stream
    pub batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            source: None,
            service: None,
            host: None,
            tags: None,
            url: None,
            port: 0,
            use_ssl: true,
            use_tcp: true,
            include_all_properties: false,
            excluded_properties: Vec::new(),
            fields: Vec::new(),
            failure_policy: FailurePolicy::default(),
            max_retries: 5,
            max_backoff: Duration::from_secs(30),
            http_timeout: Duration::from_secs(10),
            batch_size: 100,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SinkError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Config::default().with_env_overrides()
    }

    /// Apply environment variables on top of this configuration
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(api_key) = env::var("DD_API_KEY") {
            self.api_key = api_key;
        }

        if let Ok(source) = env::var("DD_SOURCE") {
            self.source = Some(source);
        }

        if let Ok(service) = env::var("DD_SERVICE") {
            self.service = Some(service);
        }

        if let Ok(host) = env::var("DD_HOST") {
            self.host = Some(host);
        }

        if let Ok(tags) = env::var("DD_TAGS") {
            self.tags = Some(split_list(&tags));
        }

        if let Ok(url) = env::var("DD_URL") {
            self.url = Some(url);
        }

        if let Ok(port) = env::var("DD_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }

        if let Ok(use_ssl) = env::var("DD_USE_SSL") {
            self.use_ssl = use_ssl.to_lowercase() == "true";
        }

        if let Ok(use_tcp) = env::var("DD_USE_TCP") {
            self.use_tcp = use_tcp.to_lowercase() == "true";
        }

        if let Ok(include) = env::var("DD_INCLUDE_ALL_PROPERTIES") {
            self.include_all_properties = include.to_lowercase() == "true";
        }

        if let Ok(excluded) = env::var("DD_EXCLUDED_PROPERTIES") {
            self.excluded_properties = split_list(&excluded);
        }

        if let Ok(policy) = env::var("DD_FAILURE_POLICY") {
            if let Some(policy) = FailurePolicy::parse(&policy) {
                self.failure_policy = policy;
            }
        }

        if let Ok(batch_size) = env::var("DD_BATCH_SIZE") {
            if let Ok(size) = batch_size.parse() {
                self.batch_size = size;
            }
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(SinkError::Config("api_key cannot be empty".to_string()));
        }

        if self.batch_size == 0 {
            return Err(SinkError::Config("batch_size must be greater than 0".to_string()));
        }

        if self.max_retries == 0 {
            return Err(SinkError::Config("max_retries must be greater than 0".to_string()));
        }

        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(SinkError::Config("field name cannot be empty".to_string()));
            }
            TemplateLayout::parse(&field.layout)?;
        }

        Ok(())
    }

    /// Port to connect to, resolving 0 to the TLS-dependent default
    pub fn resolved_port(&self) -> u16 {
        match self.port {
            0 if self.use_ssl => DD_PORT,
            0 => DD_PORT_NO_SSL,
            port => port,
        }
    }

    /// Host for the TCP transport; a URL scheme, path or port is stripped
    pub fn tcp_host(&self) -> String {
        let url = match &self.url {
            Some(url) if !url.trim().is_empty() => url.trim(),
            _ => return DD_TCP_HOST.to_string(),
        };
        let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
        let authority = without_scheme.split('/').next().unwrap_or(without_scheme);

        // "[v6]" or "[v6]:port"
        if let Some(bracketed) = authority.strip_prefix('[') {
            return bracketed.split(']').next().unwrap_or(bracketed).to_string();
        }

        // A bare IPv6 address has several colons and no port.
        match authority.split_once(':') {
            Some((host, port))
                if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) =>
            {
                host.to_string()
            }
            _ => authority.to_string(),
        }
    }

    /// Base URL for the HTTP transport
    pub fn http_url(&self) -> String {
        match &self.url {
            Some(url) if url.contains("://") => url.trim_end_matches('/').to_string(),
            Some(url) if !url.trim().is_empty() => format!("https://{}", url.trim_end_matches('/')),
            _ => DD_HTTP_URL.to_string(),
        }
    }

    pub fn routing(&self) -> RoutingMetadata {
        RoutingMetadata {
            source: self.source.clone(),
            service: self.service.clone(),
            host: self.host.clone(),
            tags: self.tags.clone(),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_port_resolution() {
        let mut config = Config::default();
        assert_eq!(config.resolved_port(), DD_PORT);

        config.use_ssl = false;
        assert_eq!(config.resolved_port(), DD_PORT_NO_SSL);

        config.port = 1234;
        assert_eq!(config.resolved_port(), 1234);
    }

    #[test]
    fn test_tcp_host_and_http_url() {
        let mut config = Config::default();
        assert_eq!(config.tcp_host(), DD_TCP_HOST);
        assert_eq!(config.http_url(), DD_HTTP_URL);

        config.url = Some("https://tcp-intake.logs.datadoghq.eu:443/".to_string());
        assert_eq!(config.tcp_host(), "tcp-intake.logs.datadoghq.eu");
        assert_eq!(config.http_url(), "https://tcp-intake.logs.datadoghq.eu:443");

        config.url = Some("localhost".to_string());
        assert_eq!(config.tcp_host(), "localhost");
        assert_eq!(config.http_url(), "https://localhost");
    }

    #[test]
    fn test_tcp_host_handles_ipv6() {
        let host = |url: &str| {
            Config {
                url: Some(url.to_string()),
                ..Config::default()
            }
            .tcp_host()
        };

        assert_eq!(host("::1"), "::1");
        assert_eq!(host("[::1]"), "::1");
        assert_eq!(host("[::1]:10514"), "::1");
        assert_eq!(host("tcp://[2001:db8::7]:443/path"), "2001:db8::7");
        assert_eq!(host("intake.example.com:10516"), "intake.example.com");
        assert_eq!(host("10.0.0.5"), "10.0.0.5");
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.api_key = "key".to_string();
        assert!(config.validate().is_ok());

        config.fields.push(FieldConfig {
            name: "broken".to_string(),
            layout: "${level".to_string(),
            field_type: FieldType::String,
        });
        assert!(matches!(config.validate(), Err(SinkError::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "api_key": "abc",
                "service": "checkout",
                "tags": ["env:test"],
                "use_ssl": false,
                "include_all_properties": true,
                "failure_policy": "fail_closed",
                "max_backoff": 5,
                "fields": [
                    {{
                        "name": "elapsed",
                        "layout": "${{event-properties:item=elapsed}}",
                        "type": "integer"
                    }},
                    {{"name": "logger", "layout": "app"}}
                ]
            }}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.api_key, "abc");
        assert_eq!(config.service.as_deref(), Some("checkout"));
        assert_eq!(config.tags, Some(vec!["env:test".to_string()]));
        assert!(config.use_tcp);
        assert_eq!(config.resolved_port(), DD_PORT_NO_SSL);
        assert_eq!(config.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.max_backoff, Duration::from_secs(5));
        assert_eq!(config.fields[0].field_type, FieldType::Integer);
        assert_eq!(config.fields[1].field_type, FieldType::String);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_failure_policy_parse() {
        assert_eq!(FailurePolicy::parse("fail-closed"), Some(FailurePolicy::FailClosed));
        assert_eq!(FailurePolicy::parse("OPEN"), Some(FailurePolicy::FailOpen));
        assert_eq!(FailurePolicy::parse("maybe"), None);
    }
}
