use thiserror::Error;

use crate::NodeId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not connect to the coordination backend")]
    BackendConnect(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("coordination backend error: {0}")]
    Backend(String),

    #[error("failed to decode coordinator payload: {0}")]
    Decode(String),

    #[error("failed to encode coordinator payload: {0}")]
    Encode(String),

    #[error("lock '{0}' is already held by node {1}")]
    LockHeld(String, NodeId),

    #[error("lock '{0}' is not held by this node")]
    LockNotHeld(String),

    #[error("ephemeral registration failed: {0}")]
    RegistrationFailure(String),

    #[error("this node is not the election primary")]
    NotPrimary,

    #[error("the election has terminated: {0}")]
    ElectionTerminated(String),
}

pub type Result<T> = std::result::Result<T, Error>;
