//! The normalized error taxonomy every adapter surfaces.
//!
//! Vendor clients raise their own transport-level errors; adapters convert
//! those into exactly one of these shapes so callers never see a raw vendor
//! failure. Nothing is retried here; a failed call fails once.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Network unreachable, connect failure or timeout.
    #[error("provider api connection error: {message}")]
    Connection { message: String },

    /// Non-2xx HTTP or a vendor-level failure body.
    #[error("{message}")]
    Api {
        message: String,
        status: Option<u16>,
        /// Structured context for logs and telemetry.
        data: Value,
        /// Raw vendor response, trimmed by the client to a bounded length.
        debug: Option<String>,
    },

    /// A catalog lookup (image, plan, location, node group) found nothing.
    /// Always carries the original user-supplied search key.
    #[error("{resource} not found: {lookup}")]
    NotFound {
        resource: &'static str,
        lookup: String,
    },

    /// Business-rule rejection raised before any vendor call.
    #[error("{0}")]
    Denied(String),

    /// The vendor has no equivalent of the requested operation.
    #[error("Operation not supported")]
    Unsupported,

    /// The vendor body could not be decoded at all.
    #[error("Unknown provider API error")]
    Unparseable { debug: Option<String> },

    /// Missing or invalid provider configuration.
    #[error("invalid provider configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn api(message: impl Into<String>) -> Self {
        Error::Api {
            message: message.into(),
            status: None,
            data: Value::Null,
            debug: None,
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Error::Denied(message.into())
    }

    pub fn not_found(resource: &'static str, lookup: impl Into<String>) -> Self {
        Error::NotFound {
            resource,
            lookup: lookup.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Error::Connection {
            message: message.into(),
        }
    }

    /// HTTP/vendor status code, where one was observed.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => *status,
            _ => None,
        }
    }

    /// Structured context attached to the error.
    pub fn data(&self) -> Value {
        match self {
            Error::Api { data, .. } => data.clone(),
            Error::NotFound { resource, lookup } => {
                let mut data = serde_json::Map::new();
                data.insert((*resource).to_string(), Value::String(lookup.clone()));
                Value::Object(data)
            }
            _ => Value::Null,
        }
    }

    /// Raw vendor payload kept for debugging, if any.
    pub fn debug(&self) -> Option<&str> {
        match self {
            Error::Api { debug, .. } | Error::Unparseable { debug } => debug.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_keeps_the_original_lookup() {
        let err = Error::not_found("image", "ubuntu-20.04");
        assert_eq!(err.to_string(), "image not found: ubuntu-20.04");
        assert_eq!(err.data()["image"], "ubuntu-20.04");
    }

    #[test]
    fn api_errors_expose_status_and_debug() {
        let err = Error::Api {
            message: "Provider API error: field: bad".into(),
            status: Some(500),
            data: Value::Null,
            debug: Some(r#"{"errors":{"field":["bad"]}}"#.into()),
        };

        assert_eq!(err.status(), Some(500));
        assert!(err.debug().unwrap().contains("field"));
    }
}
