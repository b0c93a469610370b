use thiserror::Error;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, HubError>;
