use sluice_server::actor::ActorSendError;
use thiserror::Error;

pub type ExecutionResult<T> = Result<T, ExecutionError>;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("the pipe has been closed")]
    PipeClosed,
    #[error("error in worker RPC: {0}")]
    RpcError(#[from] tonic::Status),
    #[error("error in transport: {0}")]
    TransportError(#[from] tonic::transport::Error),
    #[error("error in IO: {0}")]
    IoError(#[from] std::io::Error),
    #[error("error in codec: {0}")]
    DecodeError(#[from] prost::DecodeError),
    #[error("error in task execution: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

impl From<ActorSendError> for ExecutionError {
    fn from(e: ActorSendError) -> Self {
        ExecutionError::InternalError(e.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ExecutionError {
    fn from(e: tokio::sync::oneshot::error::RecvError) -> Self {
        ExecutionError::InternalError(format!("failed to receive result: {e}"))
    }
}

impl From<ExecutionError> for tonic::Status {
    fn from(e: ExecutionError) -> Self {
        match e {
            ExecutionError::InvalidArgument(x) => tonic::Status::invalid_argument(x),
            ExecutionError::RpcError(x) => x,
            x => tonic::Status::internal(x.to_string()),
        }
    }
}
