//! Service-level error handling for the inverter bridge
//!
//! Protocol and register errors live next to the code that raises them
//! (`inverter-modbus`, `invsrv::gateway`). This crate covers everything that
//! happens around them: configuration, startup and the API error body.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

// ============================================================================
// ErrorInfo - API error response type
// ============================================================================

/// Standard error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error code (HTTP status)
    pub code: u16,
    /// Error message
    pub message: String,
    /// Detailed error description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Field-specific errors for validation
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub field_errors: HashMap<String, Vec<String>>,
}

impl ErrorInfo {
    /// Create a new ErrorInfo with just a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: 500,
            message: message.into(),
            details: None,
            field_errors: HashMap::new(),
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: u16) -> Self {
        self.code = code;
        self
    }

    /// Add details
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Add a field error
    pub fn add_field_error(mut self, field: impl Into<String>, error: impl Into<String>) -> Self {
        self.field_errors
            .entry(field.into())
            .or_default()
            .push(error.into());
        self
    }
}

// ============================================================================
// BridgeError - Main error type
// ============================================================================

/// Main error type for the bridge service
#[derive(Debug, Error)]
pub enum BridgeError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Register map error: {0}")]
    RegisterMap(String),

    #[error("Parse error: {file}: {error}")]
    ParseError { file: String, error: String },

    // ======================================
    // Device & Communication Errors
    // ======================================
    #[error("Serial port error: {port}: {reason}")]
    Serial { port: String, reason: String },

    #[error("Device unreachable: {0}")]
    Unreachable(String),

    // ======================================
    // Service & Runtime Errors
    // ======================================
    #[error("Service startup failed: {0}")]
    StartupFailed(String),
}

/// Result type alias using BridgeError
pub type BridgeResult<T> = Result<T, BridgeError>;

// Helper macros for creating errors
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::BridgeError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::BridgeError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! invalid_config {
    ($field:expr, $reason:expr) => {
        $crate::BridgeError::InvalidConfig {
            field: $field.to_string(),
            reason: $reason.to_string(),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_info_builder() {
        let info = ErrorInfo::new("value rejected")
            .with_code(422)
            .with_details("outside range")
            .add_field_error("grid_export_limit", "above 8000")
            .add_field_error("grid_export_limit", "not a whole watt");
        assert_eq!(info.code, 422);
        assert_eq!(info.details.as_deref(), Some("outside range"));
        assert_eq!(info.field_errors["grid_export_limit"].len(), 2);
    }

    #[test]
    fn test_macros_build_configuration_errors() {
        let err = config_error!("config file not found: {}", "/etc/invsrv.yaml");
        assert_eq!(
            err.to_string(),
            "Configuration error: config file not found: /etc/invsrv.yaml"
        );

        let err = invalid_config!("serial.unit_id", "must be 1-247");
        assert!(matches!(
            err,
            BridgeError::InvalidConfig { ref field, .. } if field == "serial.unit_id"
        ));
        assert_eq!(
            err.to_string(),
            "Invalid configuration: serial.unit_id: must be 1-247"
        );
    }
}
