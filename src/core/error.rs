use thiserror::Error;

/// Errors raised by the APDU builder and the polling reader
#[derive(Error, Debug)]
pub enum Error {
    /// A numeric bound was violated (payload length, Le, polling interval)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation was called in a state that does not allow it
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    /// The card reader failed while executing a polling round
    #[error("card reader failure: {0:#}")]
    Collaborator(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
