//! Database lifecycle: registering databases in the administrative
//! registry and keeping their on-disk layout in step with it.

use crate::database::{
    admin_database, admin_database_raw, Database, DatabaseFields, DatabaseRef, SchemaCompiler,
};
use crate::error::{Result, StorageError};
use crate::query::QueryEngine;
use crate::store::Store;

/// Create the administrative database's layout if it does not exist yet.
///
/// The registry cannot validate itself before it exists, so the returned
/// database is raw.
pub fn bootstrap_admin(store: &Store) -> Result<Database> {
    let admin = admin_database_raw(store.config());
    if store.database_exists(admin.name()) {
        tracing::debug!("Administrative database '{}' already present", admin.name());
    } else {
        store.create_database_layout(admin.name())?;
        tracing::info!("Bootstrapped administrative database '{}'", admin.name());
    }
    Ok(admin)
}

/// Validate, lay out and register a new database.
///
/// On any failure after the layout was started, the partial layout is
/// deleted before the error is returned.
pub fn create_database(
    store: &Store,
    engine: &dyn QueryEngine,
    compiler: &dyn SchemaCompiler,
    fields: DatabaseFields,
) -> Result<Database> {
    reject_admin(store, &fields.name)?;
    let database = Database::construct(fields, compiler)?;
    let admin = admin_database(store.config(), compiler)?;

    if let Err(e) = store.create_database_layout(database.name()) {
        if store.database_exists(database.name()) && !is_already_exists(&e) {
            discard_partial(store, database.name());
        }
        return Err(e);
    }
    if let Err(e) = engine.insert(&admin, &database.registry_statements()) {
        discard_partial(store, database.name());
        return Err(e);
    }
    tracing::info!("Created database '{}'", database.name());
    Ok(database)
}

/// Unregister a database and delete its files.
pub fn delete_database(
    store: &Store,
    engine: &dyn QueryEngine,
    compiler: &dyn SchemaCompiler,
    name: &str,
) -> Result<()> {
    reject_admin(store, name)?;
    let database = store.resolver(engine, compiler).resolve_by_name(name)?;
    let admin = admin_database(store.config(), compiler)?;
    engine.delete(&admin, &database.registry_statements())?;
    store.delete_database_layout(name)?;
    tracing::info!("Deleted database '{}'", name);
    Ok(())
}

fn reject_admin(store: &Store, name: &str) -> Result<()> {
    match DatabaseRef::classify(store.config(), name) {
        DatabaseRef::Admin => Err(StorageError::InvalidConfig {
            reason: format!("'{}' is the administrative database", name),
        }),
        DatabaseRef::Other(_) => Ok(()),
    }
}

fn is_already_exists(e: &StorageError) -> bool {
    matches!(e, StorageError::Io { source, .. } if source.kind() == std::io::ErrorKind::AlreadyExists)
}

fn discard_partial(store: &Store, name: &str) {
    if let Err(e) = store.delete_database_layout(name) {
        tracing::warn!("Failed to remove partial layout of '{}': {}", name, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StoreConfig, RDF_TYPE, SYSTEM_DATABASE_CLASS};
    use crate::query::{Bindings, TriplePattern};
    use crate::term::{Node, Object, Triple};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    struct AcceptAll;

    impl SchemaCompiler for AcceptAll {
        fn compile_and_validate(&self, _database: &Database) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Registry {
        triples: Mutex<Vec<Triple>>,
        fail_insert: bool,
    }

    impl QueryEngine for Registry {
        fn ask(&self, _database: &Database, pattern: &[TriplePattern]) -> Result<Vec<Bindings>> {
            Ok(self
                .triples
                .lock()
                .iter()
                .filter_map(|t| pattern[0].matches(t))
                .collect())
        }

        fn insert(&self, _database: &Database, statements: &[Triple]) -> Result<()> {
            if self.fail_insert {
                return Err(StorageError::query("registry is read-only"));
            }
            self.triples.lock().extend_from_slice(statements);
            Ok(())
        }

        fn delete(&self, _database: &Database, statements: &[Triple]) -> Result<()> {
            self.triples.lock().retain(|t| !statements.contains(t));
            Ok(())
        }
    }

    fn store(dir: &TempDir) -> Store {
        Store::open(StoreConfig::with_root(dir.path())).unwrap()
    }

    fn name(store: &Store, db: &str) -> String {
        format!("{}/{}", store.config().server_name, db)
    }

    #[test]
    fn test_create_registers_and_lays_out() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let registry = Registry::default();
        let name = name(&store, "D");

        let db = create_database(&store, &registry, &AcceptAll, DatabaseFields::standard(&name)).unwrap();
        assert!(db.is_validated());
        assert!(store.database_exists(&name));
        assert!(registry.triples.lock().contains(&Triple::new(
            Node::iri(name.clone()),
            RDF_TYPE,
            Object::iri(SYSTEM_DATABASE_CLASS)
        )));

        let resolved = store.resolver(&registry, &AcceptAll).resolve_by_name(&name).unwrap();
        assert_eq!(resolved.instance(), db.instance());
    }

    #[test]
    fn test_failed_registration_removes_layout() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let registry = Registry {
            fail_insert: true,
            ..Registry::default()
        };
        let name = name(&store, "D");
        let err = create_database(&store, &registry, &AcceptAll, DatabaseFields::standard(&name)).unwrap_err();
        assert!(matches!(err, StorageError::Query { .. }));
        assert!(!store.database_exists(&name));
    }

    #[test]
    fn test_create_existing_keeps_layout() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let registry = Registry::default();
        let name = name(&store, "D");
        create_database(&store, &registry, &AcceptAll, DatabaseFields::standard(&name)).unwrap();
        assert!(create_database(&store, &registry, &AcceptAll, DatabaseFields::standard(&name)).is_err());
        assert!(store.database_exists(&name));
    }

    #[test]
    fn test_delete_unregisters() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let registry = Registry::default();
        let name = name(&store, "D");
        create_database(&store, &registry, &AcceptAll, DatabaseFields::standard(&name)).unwrap();

        delete_database(&store, &registry, &AcceptAll, &name).unwrap();
        assert!(!store.database_exists(&name));
        assert!(registry.triples.lock().is_empty());
        assert!(matches!(
            delete_database(&store, &registry, &AcceptAll, &name),
            Err(StorageError::DatabaseNotFound { .. })
        ));
    }

    #[test]
    fn test_admin_is_bootstrapped_not_created() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let registry = Registry::default();
        let admin_name = store.config().admin_database_name();
        assert!(matches!(
            create_database(&store, &registry, &AcceptAll, DatabaseFields::standard(&admin_name)),
            Err(StorageError::InvalidConfig { .. })
        ));

        let admin = bootstrap_admin(&store).unwrap();
        assert!(!admin.is_validated());
        assert!(store.database_exists(&admin_name));
        // Second bootstrap is a no-op.
        bootstrap_admin(&store).unwrap();
    }
}
