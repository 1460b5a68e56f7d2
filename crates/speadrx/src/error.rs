//! Error taxonomy for the DAQ public surface

use thiserror::Error;

/// Convenience alias used throughout the crate
pub type DaqResult<T> = Result<T, DaqError>;

/// Error returned by the DAQ public API
///
/// Fatal start-up conditions (sockets, memory mappings, privileges) and
/// recoverable lifecycle errors share this type; hot-path packet failures
/// never surface here. They are counted and dropped instead.
#[derive(Error, Debug)]
pub enum DaqError {
    /// No receiver has been started in this process
    #[error("receiver has not been initialised")]
    ReceiverUninitialised,

    /// A consumer with this name is already loaded or running
    #[error("consumer \"{0}\" is already initialised")]
    ConsumerAlreadyInitialised(String),

    /// The named consumer was never loaded or initialised
    #[error("consumer \"{0}\" is not initialised")]
    ConsumerNotInitialised(String),

    /// No factory is registered under the requested name
    #[error("no consumer factory named \"{0}\"")]
    UnknownConsumer(String),

    /// A configuration document is missing a key or holds the wrong type
    #[error("configuration error: {0}")]
    Config(String),

    /// The receiver's port allowlist is full
    #[error("port allowlist is full ({0} ports)")]
    TooManyPorts(usize),

    /// The receiver cannot accept further consumers
    #[error("maximum number of consumers reached ({0})")]
    TooManyConsumers(usize),

    /// Raw socket creation, binding or option failure
    ///
    /// Opening a packet socket requires elevated privileges; this is the
    /// error produced when they are missing.
    #[error("socket error: {0}")]
    Socket(String),

    /// Kernel ring / memory mapping failure
    #[error("memory mapping error: {0}")]
    Mmap(String),

    /// Filesystem failure outside the capture hot path
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Catch-all for lifecycle failures with no better classification
    #[error("{0}")]
    Failure(String),
}

impl DaqError {
    /// Configuration error for a missing mandatory key
    pub(crate) fn missing_key(consumer: &str, key: &str) -> Self {
        DaqError::Config(format!("{consumer}: missing configuration key \"{key}\""))
    }
}
