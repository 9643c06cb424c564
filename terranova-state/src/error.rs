use std::{io, path::PathBuf};

use crate::database::ResourceKey;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification of [`Error`], for callers that decide between
/// aborting the run and reporting a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller finalized a resource it never announced.
    ProtocolViolation,
    /// The state file could not be read, parsed, locked or replaced.
    Persistence,
    /// A stored typed state does not have the shape the caller expects.
    Decode,
    /// The state file belongs to a different deployment history.
    LineageMismatch,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no pre-write recorded for resource {key}; finalize must follow record_pre_create or record_pre_update")]
    ProtocolViolation { key: ResourceKey },

    #[error("could not read state file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state file {} is invalid", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not serialize state")]
    Serialize(#[source] serde_json::Error),

    #[error("could not write state file {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not lock state file {}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "state file {} was modified by another process (expected {expected}, found {found}); refusing to overwrite",
        path.display()
    )]
    ConcurrentModification {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("stored state of resource {key} does not match the expected shape")]
    Decode {
        key: ResourceKey,
        #[source]
        source: DecodeError,
    },

    #[error("state lineage mismatch: expected {expected}, found {found}")]
    LineageMismatch { expected: String, found: String },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            Error::Read { .. }
            | Error::Parse { .. }
            | Error::Serialize(_)
            | Error::Write { .. }
            | Error::Lock { .. }
            | Error::ConcurrentModification { .. } => ErrorKind::Persistence,
            Error::Decode { .. } => ErrorKind::Decode,
            Error::LineageMismatch { .. } => ErrorKind::LineageMismatch,
        }
    }
}

/// Failure of [`crate::codec::decode_typed`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Shape(#[from] serde_json::Error),

    #[error("unknown field `{path}`")]
    UnknownField { path: String },
}
