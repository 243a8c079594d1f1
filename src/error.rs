//! Error types for the GraphRAG router
//!
//! Backend failures never surface through this type: the vector and graph
//! clients turn them into [`crate::backends::BackendError`] values. `Error`
//! covers construction, configuration and persistence failures.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Vector store error: {0}")]
    VectorStoreError(String),

    #[error("Evaluator error: {0}")]
    EvaluatorError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Failed to acquire state lock: {0}")]
    LockError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::ConfigError(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::HttpError(err.to_string())
    }
}
