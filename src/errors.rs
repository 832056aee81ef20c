//! Error types for the Datadog log sink

use std::fmt;

pub type Result<T> = std::result::Result<T, SinkError>;

#[derive(Debug)]
pub enum SinkError {
    /// IO operation failed
    Io(std::io::Error),

    /// HTTP request failed
    Http(reqwest::Error),

    /// JSON serialization/deserialization failed
    Json(serde_json::Error),

    /// Configuration error
    Config(String),

    /// A single extra field could not be coerced to its declared type
    Coercion { field: String, reason: String },

    /// The payload document as a whole could not be serialized
    Serialization(String),

    /// Could not establish a connection to the intake
    Connect(String),

    /// TLS setup or handshake failed
    Tls(String),

    /// The intake answered with a transient failure
    Unavailable(String),

    /// Transport error that retrying will not fix
    Transport(String),

    /// Every delivery attempt failed
    RetriesExhausted { attempts: u32 },

    /// Generic error with message
    Other(String),
}

impl SinkError {
    /// Whether the error reflects a transient condition worth retrying.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SinkError::Io(_)
                | SinkError::Http(_)
                | SinkError::Connect(_)
                | SinkError::Tls(_)
                | SinkError::Unavailable(_)
        )
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Io(err) => write!(f, "IO error: {}", err),
            SinkError::Http(err) => write!(f, "HTTP error: {}", err),
            SinkError::Json(err) => write!(f, "JSON error: {}", err),
            SinkError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SinkError::Coercion { field, reason } => {
                write!(f, "Could not format field {}: {}", field, reason)
            }
            SinkError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            SinkError::Connect(msg) => write!(f, "Connection error: {}", msg),
            SinkError::Tls(msg) => write!(f, "TLS error: {}", msg),
            SinkError::Unavailable(msg) => write!(f, "Intake unavailable: {}", msg),
            SinkError::Transport(msg) => write!(f, "Transport error: {}", msg),
            SinkError::RetriesExhausted { attempts } => {
                write!(f, "Delivery failed after {} attempts", attempts)
            }
            SinkError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::Io(err) => Some(err),
            SinkError::Http(err) => Some(err),
            SinkError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        SinkError::Io(err)
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        SinkError::Http(err)
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        SinkError::Json(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = SinkError::RetriesExhausted { attempts: 5 };
        assert_eq!(err.to_string(), "Delivery failed after 5 attempts");

        let err = SinkError::Coercion {
            field: "duration".to_string(),
            reason: "invalid digit".to_string(),
        };
        assert_eq!(err.to_string(), "Could not format field duration: invalid digit");
    }

    #[test]
    fn test_retriable_classification() {
        assert!(SinkError::Connect("refused".to_string()).is_retriable());
        assert!(SinkError::from(std::io::Error::other("reset")).is_retriable());
        assert!(!SinkError::Transport("403".to_string()).is_retriable());
        assert!(!SinkError::Serialization("NaN".to_string()).is_retriable());
    }
}
