use std::fmt::Display;

/// emberdb errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// On-disk data failed validation: CRC mismatch, bad footer magic, or a
    /// malformed manifest/WAL frame.
    Corruption(String),
    /// An underlying filesystem failure.
    IO(String),
    /// Invalid caller input: empty key, oversized key/value, bad option.
    InvalidArgument(String),
    /// The store is not in the `Open` lifecycle state.
    NotOpen,
    /// Another process (or handle) holds the directory lock.
    AlreadyOpen,
    /// Write backpressure: level 0 has reached its stop threshold.
    Busy,
    /// A write was attempted on a read-only structure (frozen memtable,
    /// finished table, or a store opened/degraded read-only).
    ReadOnly,
    /// An operation was invoked on a component in the wrong state.
    InvalidOperation(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::NotOpen => write!(f, "store is not open"),
            Error::AlreadyOpen => write!(f, "store directory is locked by another handle"),
            Error::Busy => write!(f, "write stalled: too many level-0 tables"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
            Error::InvalidOperation(msg) => write!(f, "invalid operation: {msg}"),
        }
    }
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::IO(err.to_string())
    }
}
