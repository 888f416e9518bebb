//! Configuration for graphstore.
//!
//! On-disk naming, vocabulary IRIs and version labels are compile-time
//! constants. Runtime settings live in [`StoreConfig`], loaded from a TOML
//! file and overridden by CLI flags in the `graphstore` binary.

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk layout version this build of the engine reads and writes.
pub const CURRENT_STORE_VERSION: &str = "1.2.0";

/// Version assumed for a populated store that predates the version file.
pub const INITIAL_STORE_VERSION: &str = "1.0.0";

/// Name of the version file at the storage root.
pub const VERSION_FILE: &str = "VERSION";

/// Extension of canonical text files (checkpoint logs and journal layers).
pub const TEXT_EXTENSION: &str = "ntr";

/// Extension of compacted checkpoint index files.
pub const INDEX_EXTENSION: &str = "idx";

/// Default storage root.
pub const DEFAULT_STORAGE_ROOT: &str = "./storage";

/// Default server identifier used to derive the administrative database name.
pub const DEFAULT_SERVER_NAME: &str = "http://127.0.0.1:6363";

/// Default config file looked up by the CLI.
pub const DEFAULT_CONFIG_FILE: &str = "graphstore.toml";

/// Suffix appended to the server identifier to name the administrative database.
pub const ADMIN_DATABASE_SUFFIX: &str = "/admin";

/// Number of checkpoint pairs kept per graph role after compaction.
pub const DEFAULT_RETAIN_CHECKPOINTS: usize = 2;

/// Namespace of the registry vocabulary stored in the administrative database.
pub const SYSTEM_NS: &str = "http://graphstore.dev/system#";

/// Class of registered databases.
pub const SYSTEM_DATABASE_CLASS: &str = "http://graphstore.dev/system#Database";

/// Links a database to one of its instance graphs.
pub const SYSTEM_INSTANCE: &str = "http://graphstore.dev/system#instance";

/// Links a database to one of its schema graphs.
pub const SYSTEM_SCHEMA: &str = "http://graphstore.dev/system#schema";

/// Links a database to one of its inference graphs.
pub const SYSTEM_INFERENCE: &str = "http://graphstore.dev/system#inference";

pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
pub const RDFS_SUB_CLASS_OF: &str = "http://www.w3.org/2000/01/rdf-schema#subClassOf";

pub const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";
/// Historical prefixed spelling of the string datatype, rewritten on read and write.
pub const XSD_STRING_PREFIXED: &str = "xsd:string";
pub const XSD_DATE: &str = "http://www.w3.org/2001/XMLSchema#date";
pub const XSD_TIME: &str = "http://www.w3.org/2001/XMLSchema#time";
pub const XSD_DATE_TIME: &str = "http://www.w3.org/2001/XMLSchema#dateTime";
pub const XSD_DATE_TIME_STAMP: &str = "http://www.w3.org/2001/XMLSchema#dateTimeStamp";

/// Runtime settings for a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the version file and one subdirectory per database.
    pub storage_root: PathBuf,
    /// Server identifier; the administrative database is named after it.
    pub server_name: String,
    /// fsync every journal record before `append_triple` returns.
    pub sync_on_append: bool,
    /// Checkpoint pairs kept per graph role after compaction (at least 1).
    pub retain_checkpoints: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            sync_on_append: true,
            retain_checkpoints: DEFAULT_RETAIN_CHECKPOINTS,
        }
    }
}

impl StoreConfig {
    /// Config rooted at `storage_root` with every other field defaulted.
    pub fn with_root(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            ..Self::default()
        }
    }

    /// Read a TOML config file. A missing file yields `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path).map_err(|e| StorageError::io(path, e))?;
        let config: StoreConfig = toml::from_str(&contents).map_err(|e| StorageError::InvalidConfig {
            reason: format!("{}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(Some(config))
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_name.trim().is_empty() {
            return Err(StorageError::InvalidConfig {
                reason: "server_name must not be empty".to_string(),
            });
        }
        if self.retain_checkpoints == 0 {
            return Err(StorageError::InvalidConfig {
                reason: "retain_checkpoints must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Name of the administrative database for this server.
    pub fn admin_database_name(&self) -> String {
        format!(
            "{}{}",
            self.server_name.trim_end_matches('/'),
            ADMIN_DATABASE_SUFFIX
        )
    }
}
