use datafusion::arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use thiserror::Error;

/// Unified error type for query engine failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Operation not supported: {0}")]
    NotSupported(String),
    #[error("Query engine is closed")]
    Closed,
    #[error("DataFusion error: {0}")]
    DataFusion(#[from] DataFusionError),
    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn execution(msg: impl Into<String>) -> Self {
        Error::Execution(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
