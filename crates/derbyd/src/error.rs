//! Error taxonomy shared by every public derbyd operation.
//!
//! Every failure is recoverable by the caller. The web layer maps an [`Error`]
//! onto a response with [`Error::body`], which carries a stable reason code
//! alongside the human-readable message.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Result type alias for derbyd operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the fleet and show components
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Unknown device or entity id
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Bad parameters, duplicate result positions, malformed ids
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// Timeout or connection failure while talking to a device
    #[error("device {device_id} unreachable: {message}")]
    Unreachable { device_id: String, message: String },

    /// The device answered with a non-2xx response
    #[error("device {device_id} reported an error: {message}")]
    DeviceReported { device_id: String, message: String },

    /// The operation is not allowed in the current state
    #[error("{0}")]
    Precondition(String),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// Stable machine-readable reason code
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::Validation { .. } => "validation",
            Error::Unreachable { .. } => "unreachable",
            Error::DeviceReported { .. } => "device_error",
            Error::Precondition(_) => "precondition",
        }
    }

    /// Serializable form for the web layer
    pub fn body(&self) -> ErrorBody {
        let field = match self {
            Error::Validation { field, .. } => Some(field.clone()),
            _ => None,
        };
        ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            field,
        }
    }
}

/// Wire form of an [`Error`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::not_found("device", "a").code(), "not_found");
        assert_eq!(Error::validation("win", "x").code(), "validation");
        assert_eq!(Error::precondition("nope").code(), "precondition");
        let e = Error::Unreachable {
            device_id: "a".into(),
            message: "timeout".into(),
        };
        assert_eq!(e.code(), "unreachable");
    }

    #[test]
    fn test_body_carries_field() {
        let body = Error::validation("place", "duplicate position").body();
        assert_eq!(body.code, "validation");
        assert_eq!(body.field.as_deref(), Some("place"));
        insta::assert_snapshot!(body.message, @"invalid place: duplicate position");

        let json = serde_json::to_value(Error::not_found("entity", "42").body()).unwrap();
        assert_eq!(json["code"], "not_found");
        assert!(json.get("field").is_none());
    }
}
