//! # graphstore-core
//!
//! Durable storage engine for a multi-graph triple store. Databases group
//! graphs by role; every mutation is appended to a write-ahead journal
//! before it becomes visible and is later folded into a numbered,
//! compacted checkpoint. The on-disk format is versioned and walked forward
//! through a declared upgrade chain at startup.
//!
//! This is a synchronous library crate with no async runtime. Query
//! evaluation and schema compilation are consumed through the
//! [`query::QueryEngine`] and [`database::SchemaCompiler`] traits.

/// Global configuration constants and the runtime `StoreConfig`.
pub mod config;
/// Database composition model, graph identifiers, and name resolution.
pub mod database;
/// Error types.
pub mod error;
/// Database creation, deletion, and administrative bootstrap.
pub mod lifecycle;
/// Triple patterns and the query-engine collaborator interface.
pub mod query;
/// Class-hierarchy validation for schema graphs.
pub mod schema;
/// Storage layer: layout, journal, checkpoint indexes, and compaction.
pub mod storage;
/// The opened store.
pub mod store;
/// RDF terms and the canonical record encoding.
pub mod term;
/// On-disk format version chain.
pub mod upgrade;

pub use config::StoreConfig;
pub use database::{Database, DatabaseFields, DatabaseRef, GraphId, GraphRole, Resolver, SchemaCompiler};
pub use error::{Result, StorageError};
pub use query::QueryEngine;
pub use store::Store;
pub use term::{Literal, Node, Object, Triple};
