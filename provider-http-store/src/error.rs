//! Error types for the HTTP object store provider

use bridge_traits::error::BridgeError;
use thiserror::Error;

/// HTTP object store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// API request returned a non-success status
    #[error("Archive API error (status {status_code}): {message}")]
    ApiError { status_code: u16, message: String },

    /// Failed to parse API response
    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    /// Key cannot be addressed through the API
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    /// Bridge error
    #[error(transparent)]
    BridgeError(#[from] BridgeError),
}

/// Result type for HTTP object store operations
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for BridgeError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::ApiError {
                status_code,
                message,
            } => BridgeError::from_status(status_code, message),
            StoreError::ParseError(msg) => {
                BridgeError::Permanent(format!("Parse error: {}", msg))
            }
            StoreError::InvalidKey(key) => {
                BridgeError::Permanent(format!("Invalid object key: {}", key))
            }
            StoreError::BridgeError(e) => e,
        }
    }
}
