//! Error types
//!
//! Errors surfaced by channel lifecycle operations and by transports.

use std::fmt;
use std::io;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by receivers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// The transport failed to be created, connected, or to send
    Transport(TransportError),
    /// The channel has already been released to zero references
    ChannelDestroyed(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "Transport error: {}", e),
            Error::ChannelDestroyed(name) => write!(f, "Channel already destroyed: {}", name),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            Error::ChannelDestroyed(_) => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Transport(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Transport(TransportError::Io(err))
    }
}

/// Errors reported by a transport implementation
#[derive(Debug)]
pub enum TransportError {
    /// Operation requires a connected transport
    NotConnected,
    /// The transport is already connected to a group
    AlreadyConnected,
    /// The transport has been closed
    Closed,
    /// The transport refused the operation
    Rejected(String),
    /// Underlying I/O failure
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NotConnected => write!(f, "Transport not connected"),
            TransportError::AlreadyConnected => write!(f, "Transport already connected"),
            TransportError::Closed => write!(f, "Transport closed"),
            TransportError::Rejected(reason) => write!(f, "Rejected: {}", reason),
            TransportError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err)
    }
}
