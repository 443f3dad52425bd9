use serde_derive::{Deserialize, Serialize};

/// Crate-wide result alias.
pub type CResult<T> = Result<T, Error>;

/// geokv errors. Everything that can go wrong inside the storage, replication
/// and transaction layers surfaces as one of these; the daemons translate them
/// into wire return codes at the dispatch boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Internal error, e.g. an I/O failure of the durable store.
    Internal(String),

    /// A malformed or truncated encoding, on the wire or on disk.
    Parse(String),

    /// The caller asked for something the protocol forbids, e.g. a
    /// zero-length value outside of a tombstone.
    Invalid(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::Invalid(msg) => write!(f, "invalid argument: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}
