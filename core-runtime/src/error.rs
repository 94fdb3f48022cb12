use thiserror::Error;

/// Errors raised before the pipeline starts.
#[derive(Error, Debug)]
pub enum Error {
    /// A setting is missing, malformed or inconsistent with another one
    #[error("Configuration error: {0}")]
    Config(String),

    /// The tracing subscriber could not be installed
    #[error("Logging error: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, Error>;
