//! Shared error taxonomy for the key-value service.
//!
//! Every crate in the workspace reports failures as a [`Error`], which wraps
//! a [`Kind`] plus whatever context (path, peer address, ...) is useful for a
//! log line. [`Kind::wire_message`] is the single place that maps a failure
//! onto one of the wire-level strings in the protocol (`SUCCESS`,
//! `ERROR: NO KEY`, ...).

use std::path::PathBuf;

/// The small, wire-mappable error taxonomy from the design's error handling
/// section: Validation, Lookup, Resource, Protocol, Transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Kind {
    #[error("key exceeds the maximum length")]
    KeyLen,
    #[error("value exceeds the maximum length")]
    ValLen,
    #[error("key not found")]
    NoKey,
    #[error("malformed or unparseable request")]
    InvalidRequest,
    #[error("message type not valid for this log or state")]
    InvalidMessage,
    #[error("operation is not implemented by this server")]
    NotImplemented,
    #[error("unable to process request")]
    Generic,
}

impl Kind {
    /// The exact string sent on the wire in a response's `message` field.
    pub fn wire_message(self) -> &'static str {
        match self {
            Kind::KeyLen => "ERROR: IMPROPER KEY LENGTH",
            Kind::ValLen => "ERROR: VALUE TOO LONG",
            Kind::NoKey => "ERROR: NO KEY",
            Kind::InvalidRequest => "ERROR: INVALID REQUEST",
            Kind::InvalidMessage => "ERROR: INVALID REQUEST",
            Kind::NotImplemented => "ERROR: NOT IMPLEMENTED",
            Kind::Generic => "ERROR: UNABLE TO PROCESS REQUEST",
        }
    }
}

/// The string sent on the wire for a successful request with no payload.
pub const SUCCESS: &str = "SUCCESS";

/// A crate-wide error, carrying a [`Kind`] plus whatever context is useful
/// for diagnosing the failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Kind(#[from] Kind),

    #[error("I/O error accessing {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("filename too long for entry hash {hash} chain position {chain}")]
    FilenameTooLong { hash: u64, chain: u64 },

    #[error("failed to connect to {peer}")]
    Connect {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out waiting on {peer}")]
    Timeout { peer: String },

    #[error("corrupt log entry at {path}: {reason}")]
    CorruptLog { path: PathBuf, reason: String },

    #[error("corrupt store entry at {path}: {reason}")]
    CorruptEntry { path: PathBuf, reason: String },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Maps this error onto the wire-level taxonomy. Context-carrying
    /// variants (I/O, transport, corruption) all collapse to `Kind::Generic`
    /// from the client's point of view; the context survives in the log line
    /// emitted when the error is first observed.
    pub fn kind(&self) -> Kind {
        match self {
            Error::Kind(kind) => *kind,
            Error::Io { .. }
            | Error::FilenameTooLong { .. }
            | Error::Connect { .. }
            | Error::Timeout { .. }
            | Error::CorruptLog { .. }
            | Error::CorruptEntry { .. } => Kind::Generic,
        }
    }

    pub fn wire_message(&self) -> &'static str {
        self.kind().wire_message()
    }
}
