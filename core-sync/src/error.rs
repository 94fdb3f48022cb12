use bridge_traits::error::BridgeError;
use thiserror::Error;

use crate::retry::RetryError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transient remote error: {0}")]
    TransientRemote(String),

    #[error("Permanent remote error: {0}")]
    PermanentRemote(String),

    #[error("Lock {name} is held by {holder} until {expires_at}")]
    LockBusy {
        name: String,
        holder: String,
        expires_at: i64,
    },

    #[error("Timed out after {waited_secs}s waiting for lock {name}")]
    LockAcquisitionTimeout { name: String, waited_secs: u64 },

    #[error("Sync conflict on {key}: expected remote {expected}, found {found}")]
    SyncConflict {
        key: String,
        expected: String,
        found: String,
    },

    #[error("Gave up after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },

    #[error("Progress store error: {0}")]
    Progress(String),

    #[error("Run aborted after {completed} completed jobs: {source}")]
    RunAborted {
        completed: u64,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Process exit code for a run that ended with this error.
    ///
    /// 2 is a lock timeout, 3 a database sync failure, 1 everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::LockAcquisitionTimeout { .. } | SyncError::LockBusy { .. } => 2,
            SyncError::TransientRemote(_)
            | SyncError::PermanentRemote(_)
            | SyncError::MaxRetriesExceeded { .. }
            | SyncError::SyncConflict { .. } => 3,
            SyncError::RunAborted { source, .. } => source.exit_code(),
            _ => 1,
        }
    }
}

impl From<BridgeError> for SyncError {
    fn from(error: BridgeError) -> Self {
        let retryable = error.is_retryable();
        match error {
            BridgeError::Transient(msg) => SyncError::TransientRemote(msg),
            BridgeError::Io(e) if retryable => SyncError::TransientRemote(e.to_string()),
            BridgeError::Io(e) => SyncError::Io(e),
            BridgeError::NotFound(key) => SyncError::PermanentRemote(format!("Not found: {}", key)),
            other => SyncError::PermanentRemote(other.to_string()),
        }
    }
}

impl From<RetryError<BridgeError>> for SyncError {
    fn from(error: RetryError<BridgeError>) -> Self {
        match error {
            RetryError::Permanent(e) => e.into(),
            RetryError::Exhausted { attempts, last } => SyncError::MaxRetriesExceeded {
                attempts,
                last_error: last.to_string(),
            },
        }
    }
}

impl From<core_runtime::Error> for SyncError {
    fn from(error: core_runtime::Error) -> Self {
        SyncError::Config(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
