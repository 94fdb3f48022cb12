use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Transient remote failure: {0}")]
    Transient(String),

    #[error("Permanent remote failure: {0}")]
    Permanent(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Map an HTTP status code to the matching error class.
    ///
    /// 404 is `NotFound`, 408/429/5xx are `Transient`, everything else is `Permanent`.
    pub fn from_status(status: u16, context: impl Into<String>) -> Self {
        let context = context.into();
        match status {
            404 => BridgeError::NotFound(context),
            408 | 429 | 500..=599 => {
                BridgeError::Transient(format!("HTTP {} ({})", status, context))
            }
            _ => BridgeError::Permanent(format!("HTTP {} ({})", status, context)),
        }
    }

    /// Whether a retry of the same call could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Transient(_) => true,
            BridgeError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BridgeError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(BridgeError::from_status(404, "db").is_not_found());
        assert!(BridgeError::from_status(503, "db").is_retryable());
        assert!(BridgeError::from_status(429, "db").is_retryable());
        assert!(BridgeError::from_status(408, "db").is_retryable());

        let forbidden = BridgeError::from_status(403, "db");
        assert!(!forbidden.is_retryable());
        assert!(matches!(forbidden, BridgeError::Permanent(_)));
    }

    #[test]
    fn test_io_retryability() {
        let reset = BridgeError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(reset.is_retryable());

        let denied = BridgeError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!denied.is_retryable());
        assert!(!BridgeError::NotFound("x".into()).is_retryable());
    }
}
