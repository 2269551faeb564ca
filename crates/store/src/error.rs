use std::fmt;

use thiserror::Error;

use crate::metadata::Version;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("cannot open trace database: {0}")]
    OpenFailed(String),

    #[error("incompatible version {found}: {relation} version")]
    IncompatibleVersion {
        found: Version,
        relation: VersionRelation,
    },

    #[error("could not find interrupt block: {0}")]
    MissingInterruptBlock(String),

    #[error("unknown block handle {0}")]
    UnknownBlockHandle(i64),

    #[error("fingerprint collision between distinct blocks")]
    Collision,

    #[error("logic error: {0}")]
    Logic(&'static str),

    #[error("database error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Whether an unsupported format version predates or postdates the supported one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRelation {
    Past,
    Future,
}

impl fmt::Display for VersionRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionRelation::Past => f.write_str("past"),
            VersionRelation::Future => f.write_str("future"),
        }
    }
}

pub type Result<T> = std::result::Result<T, TraceError>;
