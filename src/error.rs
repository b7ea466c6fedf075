use serde_derive::{Deserialize, Serialize};

/// repnode errors. All errors here are recoverable at some level: invariant
/// violations (out-of-order commits, GTID epoch mismatches, commit-order
/// misuse) are not represented at all -- they panic and take the process
/// down, since continuing would diverge the node from the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// The node is not, or is no longer, connected to a primary component.
    /// Master workers respond by waiting for the next SYNCED event.
    Disconnected,
    /// Invalid internal data, e.g. a corrupt snapshot or write-set.
    InvalidData(String),
    /// Invalid user input or configuration.
    InvalidInput(String),
    /// An IO error. Transient at the worker level, fatal at initialization.
    IO(String),
    /// A read-view or certification conflict. The transaction was rolled
    /// back and can be retried.
    Serialization,
}

/// Constructs a Result::Err(Error::InvalidData) via format!().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidData(format!($($args)*))) };
}

/// Constructs a Result::Err(Error::InvalidInput) via format!().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidInput(format!($($args)*))) };
}

impl Error {
    /// Returns true if the error is transient at the worker level: the
    /// worker rolls back, backs off, and retries with a fresh transaction.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Serialization => true,
            Error::Disconnected
            | Error::InvalidData(_)
            | Error::InvalidInput(_)
            | Error::IO(_) => false,
        }
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Disconnected => write!(f, "disconnected from primary component"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Serialization => write!(f, "serialization failure, retry transaction"),
        }
    }
}

/// A repnode Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(err: crossbeam::channel::RecvError) -> Self {
        Error::IO(err.to_string())
    }
}
