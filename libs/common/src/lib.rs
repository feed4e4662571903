//! Shared building blocks for the inverter bridge services
//!
//! - logging bootstrap
//! - shutdown signal handling
//! - API response models
//! - hex helpers for frame tracing

pub mod api_types;
pub mod hex;
pub mod logging;
pub mod shutdown;

// Re-export commonly used API types
pub use api_types::{ComponentHealth, ErrorResponse, HealthStatus, ServiceStatus, SuccessResponse};
pub use errors::ErrorInfo;

#[cfg(feature = "axum")]
pub use api_types::AppError;
