//! Error types for graphstore-core.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias using [`StorageError`].
pub type Result<T> = std::result::Result<T, StorageError>;

/// Every failure the storage engine surfaces to its caller.
///
/// Nothing here is recovered inside the engine; each variant carries the
/// graph, path or version labels needed to diagnose it.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A stream is already registered under this key.
    #[error("stream already open: {key}")]
    StreamAlreadyOpen { key: String },

    /// `append_triple` was called without an open canonical-text stream.
    #[error("no open stream: {key}")]
    StreamNotOpen { key: String },

    /// The storage format is reserved and cannot be written yet.
    #[error("unsupported storage format {format} for graph {graph}")]
    UnsupportedFormat { graph: String, format: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("schema of database {database} failed to compile: {reason}")]
    SchemaCompilation { database: String, reason: String },

    #[error("database not found: {name}")]
    DatabaseNotFound { name: String },

    #[error("no upgrade path from version {from} to version {to}")]
    NoUpgradePath { from: String, to: String },

    #[error("upgrade step {from} -> {to} failed: {reason}")]
    UpgradeStepFailed {
        from: String,
        to: String,
        reason: String,
    },

    /// A complete record in a checkpoint or journal file did not parse.
    #[error("corrupt record in {} line {line}: {reason}", path.display())]
    CorruptRecord {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("corrupt index {}: {reason}", path.display())]
    CorruptIndex { path: PathBuf, reason: String },

    /// A statement contains a part the record encoding cannot represent.
    #[error("statement for graph {graph} cannot be recorded: {reason}")]
    InvalidTerm { graph: String, reason: String },

    #[error("invalid graph identifier: {graph}")]
    InvalidGraphIdentifier { graph: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Failure reported by the query-engine collaborator.
    #[error("query engine error: {reason}")]
    Query { reason: String },
}

impl StorageError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        StorageError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn query(reason: impl Into<String>) -> Self {
        StorageError::Query {
            reason: reason.into(),
        }
    }
}

/// Attach a path to a bare `io::Result`.
pub(crate) trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|e| StorageError::io(path, e))
    }
}
