//! Error types for the redb storage adapter.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Database operation error
    Db(String),
    /// I/O error opening or creating the database file
    Io(String),
    /// Serialization error (KV values, stats)
    Serialization(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Db(msg) => write!(f, "redb error: {msg}"),
            Error::Io(msg) => write!(f, "I/O error: {msg}"),
            Error::Serialization(msg) => write!(f, "serialization error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<Error> for crdtsync_types::error::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Db(msg) | Error::Io(msg) => crdtsync_types::error::Error::PersistenceWrite(msg),
            Error::Serialization(msg) => crdtsync_types::error::Error::Serde(msg),
        }
    }
}

// vim: ts=4
