use arrow::error::ArrowError;
use hangar_common::Error as EngineError;
use std::net::{AddrParseError, SocketAddr};
use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid server address in configuration")]
    AddrParse(#[from] AddrParseError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("Invalid ticket: {0}")]
    InvalidTicket(String),

    #[error("Query failed for dataset {dataset}: {source}")]
    QueryFailure {
        dataset: String,
        #[source]
        source: EngineError,
    },

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("Server must be bound before it can serve")]
    NotBound,

    #[error("Server is not serving")]
    NotServing,

    #[error("Server is already serving")]
    AlreadyServing,

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("Query engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("An internal error occurred: {0}")]
    Internal(String),
}

impl ServerError {
    /// Maps the error to the status sent to a client.
    ///
    /// Engine messages can leak file paths and plan details, so they are only
    /// included when `expose_engine_errors` is set.
    pub fn into_status(self, expose_engine_errors: bool) -> Status {
        match self {
            ServerError::DatasetNotFound(name) => {
                Status::not_found(format!("dataset not found: {}", name))
            }
            ServerError::InvalidTicket(reason) => {
                Status::invalid_argument(format!("invalid ticket: {}", reason))
            }
            ServerError::QueryFailure { dataset, source } => {
                if expose_engine_errors {
                    Status::internal(format!("query failed for dataset {}: {}", dataset, source))
                } else {
                    Status::internal(format!("query failed for dataset {}", dataset))
                }
            }
            ServerError::Engine(source) => {
                if expose_engine_errors {
                    Status::internal(format!("query engine error: {}", source))
                } else {
                    Status::internal("query engine error")
                }
            }
            ServerError::NotImplemented(operation) => {
                Status::unimplemented(format!("{} is not implemented", operation))
            }
            ServerError::Transport(e) => Status::unavailable(e.to_string()),
            ServerError::ShuttingDown => Status::unavailable("server is shutting down"),
            err @ (ServerError::NotBound | ServerError::NotServing | ServerError::AlreadyServing) => {
                Status::failed_precondition(err.to_string())
            }
            other => Status::internal(other.to_string()),
        }
    }
}

impl From<ServerError> for Status {
    fn from(err: ServerError) -> Self {
        err.into_status(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Status::from(ServerError::DatasetNotFound("missing_table".into())).code(),
            Code::NotFound
        );
        assert_eq!(
            Status::from(ServerError::InvalidTicket("unknown".into())).code(),
            Code::InvalidArgument
        );
        assert_eq!(
            Status::from(ServerError::NotImplemented("DoPut")).code(),
            Code::Unimplemented
        );
        assert_eq!(
            Status::from(ServerError::NotServing).code(),
            Code::FailedPrecondition
        );
        assert_eq!(
            Status::from(ServerError::ShuttingDown).code(),
            Code::Unavailable
        );
    }

    #[test]
    fn test_query_failure_redacts_engine_text() {
        let err = || ServerError::QueryFailure {
            dataset: "orders".to_string(),
            source: EngineError::execution("file /secret/orders.parquet is corrupt"),
        };

        let redacted = err().into_status(false);
        assert_eq!(redacted.code(), Code::Internal);
        assert!(redacted.message().contains("orders"));
        assert!(!redacted.message().contains("/secret"));

        let exposed = err().into_status(true);
        assert_eq!(exposed.code(), Code::Internal);
        assert!(exposed.message().contains("/secret/orders.parquet"));
    }

    #[test]
    fn test_not_found_names_dataset() {
        let status = Status::from(ServerError::DatasetNotFound("missing_table".into()));
        assert!(status.message().contains("missing_table"));
    }
}
