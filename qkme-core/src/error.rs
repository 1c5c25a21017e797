//! Error types for qkme

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One offending parameter, rendered into the ETSI error `details` array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub parameter: String,
    pub error: String,
}

impl ErrorDetail {
    pub fn new(parameter: impl Into<String>, error: impl Into<String>) -> Self {
        ErrorDetail {
            parameter: parameter.into(),
            error: error.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum KmeError {
    #[error("{message}")]
    Validation {
        message: String,
        details: Vec<ErrorDetail>,
    },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Key pool exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used for HTTP status mapping and audit records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Authentication,
    Authorization,
    ResourceExhausted,
    Internal,
}

impl KmeError {
    /// Validation failure for a single parameter
    pub fn invalid(parameter: &str, error: impl Into<String>) -> Self {
        let error = error.into();
        KmeError::Validation {
            message: format!("invalid parameter '{}'", parameter),
            details: vec![ErrorDetail::new(parameter, error)],
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            KmeError::Validation { .. } => ErrorClass::Validation,
            KmeError::Authentication(_) => ErrorClass::Authentication,
            KmeError::Authorization(_) => ErrorClass::Authorization,
            KmeError::ResourceExhausted(_) => ErrorClass::ResourceExhausted,
            KmeError::Storage(_)
            | KmeError::Serialization(_)
            | KmeError::Io(_)
            | KmeError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// HTTP status code mandated by ETSI GS QKD 014 for this error
    pub fn http_status(&self) -> u16 {
        match self.class() {
            ErrorClass::Validation => 400,
            ErrorClass::Authentication | ErrorClass::Authorization => 401,
            ErrorClass::ResourceExhausted | ErrorClass::Internal => 503,
        }
    }

    /// Message safe to return to a caller; internal failures stay generic
    pub fn public_message(&self) -> String {
        match self.class() {
            ErrorClass::Internal => "Service temporarily unavailable".to_string(),
            ErrorClass::Authentication => "Authentication failed".to_string(),
            _ => self.to_string(),
        }
    }

    /// Details array for the ETSI error body
    pub fn details(&self) -> &[ErrorDetail] {
        match self {
            KmeError::Validation { details, .. } => details,
            _ => &[],
        }
    }
}
