use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed message frame: {0}")]
    BadFrame(#[from] iris_message::Error),

    #[error("could not create the bound socket: {0}")]
    SocketNotCreated(String),

    #[error("address already in use: {0}")]
    AddressInUse(String),

    #[error("failed to register service '{0}' with the coordinator: {1}")]
    RegistrationFailure(String, String),

    #[error("could not resolve address '{0}': {1}")]
    LookupFailure(String, String),

    #[error("timed out waiting for a reply")]
    Timeout,

    #[error("channel is already closed")]
    ChannelClosed,

    #[error("remote reported an error of kind '{0}': {1}")]
    RpcError(String, String),

    #[error("coordinator error: {0}")]
    CoordinatorError(String),

    #[error("service type '{0}' is already installed")]
    DuplicateService(String),

    #[error("container is not running")]
    NotRunning,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<iris_registry::Error> for Error {
    fn from(error: iris_registry::Error) -> Self {
        match error {
            iris_registry::Error::RegistrationFailure(service_type, detail) => {
                Error::RegistrationFailure(service_type, detail)
            }
            iris_registry::Error::Unknown(service_type) => {
                Error::LookupFailure(service_type, "no known instance".to_string())
            }
            iris_registry::Error::Coordinator(error) => Error::CoordinatorError(error.to_string()),
        }
    }
}

impl From<iris_events::Error> for Error {
    fn from(error: iris_events::Error) -> Self {
        Error::CoordinatorError(error.to_string())
    }
}
