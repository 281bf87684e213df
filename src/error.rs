use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Node run not found: job {job_id}, node {node_name}")]
    RunNotFound { job_id: Uuid, node_name: String },

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Dispatch to node {node_name} failed: {reason}")]
    DispatchFailure { node_name: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        DispatchError::InvalidRequest(msg.into())
    }

    pub fn storage(prefix: &str, err: impl std::fmt::Display) -> Self {
        DispatchError::StorageFailure(format!("{prefix}: {err}"))
    }
}

impl From<DispatchError> for tonic::Status {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::InvalidRequest(_) => tonic::Status::invalid_argument(err.to_string()),
            DispatchError::JobNotFound(_) | DispatchError::RunNotFound { .. } => {
                tonic::Status::not_found(err.to_string())
            }
            DispatchError::StorageFailure(_) => tonic::Status::unavailable(err.to_string()),
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
