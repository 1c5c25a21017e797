//! Core data models and types for qkme

pub mod auth;
pub mod error;
pub mod extensions;
pub mod types;

pub use error::*;
pub use types::*;

/// Result type alias for qkme operations
pub type Result<T> = std::result::Result<T, KmeError>;
