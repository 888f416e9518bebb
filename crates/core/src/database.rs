//! Graph identifiers and the database composition model.
//!
//! A [`Database`] groups graphs by role under one name. It is built either
//! through [`Database::construct`], which compiles and validates the schema
//! graphs, or through [`Database::construct_raw`], which skips that step and
//! is only meant for bootstrap.
//!
//! Name resolution goes through [`Resolver`]. The administrative database
//! is built from configuration and fixed graph-name templates, never by
//! querying itself.

use crate::config::{
    StoreConfig, RDF_TYPE, SYSTEM_DATABASE_CLASS, SYSTEM_INFERENCE, SYSTEM_INSTANCE, SYSTEM_SCHEMA,
};
use crate::error::{Result, StorageError};
use crate::query::{PatternTerm, QueryEngine, TriplePattern};
use crate::term::{Node, Object, Triple};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of a graph inside a database; also the name of its directory on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GraphRole {
    Document,
    Schema,
    Inference,
    ErrorDocument,
    ErrorSchema,
}

impl GraphRole {
    pub const ALL: [GraphRole; 5] = [
        GraphRole::Document,
        GraphRole::Schema,
        GraphRole::Inference,
        GraphRole::ErrorDocument,
        GraphRole::ErrorSchema,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            GraphRole::Document => "document",
            GraphRole::Schema => "schema",
            GraphRole::Inference => "inference",
            GraphRole::ErrorDocument => "error-document",
            GraphRole::ErrorSchema => "error-schema",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        GraphRole::ALL.into_iter().find(|r| r.suffix() == suffix)
    }
}

impl fmt::Display for GraphRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Name of one graph: `<database>/<role suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphId(String);

impl GraphId {
    pub fn new(id: impl Into<String>) -> Self {
        GraphId(id.into())
    }

    pub fn for_role(database: &str, role: GraphRole) -> Self {
        GraphId(format!("{}/{}", database, role.suffix()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Split into database name and role.
    pub fn split(&self) -> Result<(&str, GraphRole)> {
        self.0
            .rsplit_once('/')
            .and_then(|(db, suffix)| {
                let role = GraphRole::from_suffix(suffix)?;
                (!db.is_empty()).then_some((db, role))
            })
            .ok_or_else(|| StorageError::InvalidGraphIdentifier {
                graph: self.0.clone(),
            })
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Input to database construction. `None` means the field was not supplied.
#[derive(Debug, Clone, Default)]
pub struct DatabaseFields {
    pub name: String,
    pub instance: Option<Vec<GraphId>>,
    pub inference: Option<Vec<GraphId>>,
    pub schema: Option<Vec<GraphId>>,
    pub error_instance: Option<Vec<GraphId>>,
    pub error_schema: Option<Vec<GraphId>>,
}

impl DatabaseFields {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Fields using the fixed `<name>/<role>` templates for every role.
    pub fn standard(name: impl Into<String>) -> Self {
        let name = name.into();
        let one = |role| Some(vec![GraphId::for_role(&name, role)]);
        Self {
            instance: one(GraphRole::Document),
            inference: one(GraphRole::Inference),
            schema: one(GraphRole::Schema),
            error_instance: one(GraphRole::ErrorDocument),
            error_schema: one(GraphRole::ErrorSchema),
            name,
        }
    }

    pub fn instance(mut self, graphs: Vec<GraphId>) -> Self {
        self.instance = Some(graphs);
        self
    }

    pub fn inference(mut self, graphs: Vec<GraphId>) -> Self {
        self.inference = Some(graphs);
        self
    }

    pub fn schema(mut self, graphs: Vec<GraphId>) -> Self {
        self.schema = Some(graphs);
        self
    }
}

/// Graphs of a database, grouped by role.
///
/// A role that was never supplied to validated construction holds `None`;
/// raw construction fills missing roles with an empty list instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    name: String,
    instance: Option<Vec<GraphId>>,
    inference: Option<Vec<GraphId>>,
    schema: Option<Vec<GraphId>>,
    error_instance: Option<Vec<GraphId>>,
    error_schema: Option<Vec<GraphId>>,
    validated: bool,
}

impl Database {
    /// Build a database and compile its schema graphs.
    ///
    /// Fails with [`StorageError::SchemaCompilation`] when the compiler rejects the schema.
    pub fn construct(fields: DatabaseFields, compiler: &dyn SchemaCompiler) -> Result<Self> {
        let mut database = Self::from_fields(fields, None);
        compiler
            .compile_and_validate(&database)
            .map_err(|reason| StorageError::SchemaCompilation {
                database: database.name.clone(),
                reason,
            })?;
        database.validated = true;
        Ok(database)
    }

    /// Build a database without schema compilation. Bootstrap only.
    pub fn construct_raw(fields: DatabaseFields) -> Self {
        Self::from_fields(fields, Some(Vec::new()))
    }

    fn from_fields(fields: DatabaseFields, missing: Option<Vec<GraphId>>) -> Self {
        let fill = |graphs: Option<Vec<GraphId>>| graphs.or_else(|| missing.clone());
        Self {
            name: fields.name,
            instance: fill(fields.instance),
            inference: fill(fields.inference),
            schema: fill(fields.schema),
            error_instance: fill(fields.error_instance),
            error_schema: fill(fields.error_schema),
            validated: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False for raw databases, which must not back query evaluation.
    pub fn is_validated(&self) -> bool {
        self.validated
    }

    pub fn instance(&self) -> &[GraphId] {
        self.instance.as_deref().unwrap_or_default()
    }

    pub fn inference(&self) -> &[GraphId] {
        self.inference.as_deref().unwrap_or_default()
    }

    pub fn schema(&self) -> &[GraphId] {
        self.schema.as_deref().unwrap_or_default()
    }

    pub fn error_instance(&self) -> &[GraphId] {
        self.error_instance.as_deref().unwrap_or_default()
    }

    pub fn error_schema(&self) -> &[GraphId] {
        self.error_schema.as_deref().unwrap_or_default()
    }

    /// Every physical graph backing this database, in role order
    /// (instance, inference, schema, error_instance, error_schema).
    pub fn identifiers(&self) -> Vec<GraphId> {
        [
            &self.instance,
            &self.inference,
            &self.schema,
            &self.error_instance,
            &self.error_schema,
        ]
        .into_iter()
        .flatten()
        .flatten()
        .filter(|g| !g.is_empty())
        .cloned()
        .collect()
    }

    /// Statements that register this database in the administrative registry.
    pub fn registry_statements(&self) -> Vec<Triple> {
        let subject = Node::iri(self.name.clone());
        let mut statements = vec![Triple::new(
            subject.clone(),
            RDF_TYPE,
            Object::iri(SYSTEM_DATABASE_CLASS),
        )];
        for (predicate, graphs) in [
            (SYSTEM_INSTANCE, self.instance()),
            (SYSTEM_SCHEMA, self.schema()),
            (SYSTEM_INFERENCE, self.inference()),
        ] {
            for graph in graphs.iter().filter(|g| !g.is_empty()) {
                statements.push(Triple::new(
                    subject.clone(),
                    predicate,
                    Object::iri(graph.as_str()),
                ));
            }
        }
        statements
    }
}

/// The schema-compilation collaborator.
///
/// Compiles the schema graphs of a database into a namespace scoped to that
/// database and checks them for structural consistency. Returns the reason
/// on failure.
pub trait SchemaCompiler: Send + Sync {
    fn compile_and_validate(&self, database: &Database) -> std::result::Result<(), String>;
}

/// The administrative database for `config`, built from fixed templates.
pub fn admin_database(config: &StoreConfig, compiler: &dyn SchemaCompiler) -> Result<Database> {
    Database::construct(admin_fields(config), compiler)
}

/// The administrative database without schema compilation, for bootstrap.
pub fn admin_database_raw(config: &StoreConfig) -> Database {
    Database::construct_raw(admin_fields(config))
}

fn admin_fields(config: &StoreConfig) -> DatabaseFields {
    let name = config.admin_database_name();
    let graph = |role| vec![GraphId::for_role(&name, role)];
    DatabaseFields::new(name.clone())
        .instance(graph(GraphRole::Document))
        .schema(graph(GraphRole::Schema))
        .inference(graph(GraphRole::Inference))
}

/// What a name refers to. Resolving [`DatabaseRef::Admin`] never queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseRef<'a> {
    Admin,
    Other(&'a str),
}

impl<'a> DatabaseRef<'a> {
    pub fn classify(config: &StoreConfig, name: &'a str) -> Self {
        if name == config.admin_database_name() {
            DatabaseRef::Admin
        } else {
            DatabaseRef::Other(name)
        }
    }
}

/// Resolves database names against the administrative registry.
pub struct Resolver<'a> {
    config: &'a StoreConfig,
    engine: &'a dyn QueryEngine,
    compiler: &'a dyn SchemaCompiler,
}

impl<'a> Resolver<'a> {
    pub fn new(
        config: &'a StoreConfig,
        engine: &'a dyn QueryEngine,
        compiler: &'a dyn SchemaCompiler,
    ) -> Self {
        Self {
            config,
            engine,
            compiler,
        }
    }

    pub fn resolve_by_name(&self, name: &str) -> Result<Database> {
        match DatabaseRef::classify(self.config, name) {
            DatabaseRef::Admin => admin_database(self.config, self.compiler),
            DatabaseRef::Other(name) => self.resolve_registered(name),
        }
    }

    fn resolve_registered(&self, name: &str) -> Result<Database> {
        let admin = admin_database(self.config, self.compiler)?;
        let is_registered = TriplePattern::new(
            PatternTerm::iri(name),
            PatternTerm::iri(RDF_TYPE),
            PatternTerm::iri(SYSTEM_DATABASE_CLASS),
        );
        if self.engine.ask(&admin, &[is_registered])?.is_empty() {
            return Err(StorageError::DatabaseNotFound {
                name: name.to_string(),
            });
        }

        let mut fields = DatabaseFields::new(name);
        fields.instance = self.registered_graphs(&admin, name, SYSTEM_INSTANCE)?;
        fields.schema = self.registered_graphs(&admin, name, SYSTEM_SCHEMA)?;
        fields.inference = self.registered_graphs(&admin, name, SYSTEM_INFERENCE)?;
        tracing::debug!("Resolved database '{}' from registry", name);
        Database::construct(fields, self.compiler)
    }

    fn registered_graphs(
        &self,
        admin: &Database,
        name: &str,
        predicate: &str,
    ) -> Result<Option<Vec<GraphId>>> {
        let pattern = TriplePattern::new(
            PatternTerm::iri(name),
            PatternTerm::iri(predicate),
            PatternTerm::var("graph"),
        );
        let graphs: Vec<GraphId> = self
            .engine
            .ask(admin, &[pattern])?
            .into_iter()
            .filter_map(|mut b| match b.remove("graph") {
                Some(Object::Node(Node::Iri(iri))) => Some(GraphId::new(iri)),
                _ => None,
            })
            .collect();
        Ok((!graphs.is_empty()).then_some(graphs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Bindings;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AcceptAll;

    impl SchemaCompiler for AcceptAll {
        fn compile_and_validate(&self, _database: &Database) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    struct RejectAll;

    impl SchemaCompiler for RejectAll {
        fn compile_and_validate(&self, _database: &Database) -> std::result::Result<(), String> {
            Err("cyclic class Person".to_string())
        }
    }

    /// Registry held as plain triples; counts `ask` calls.
    #[derive(Default)]
    struct FakeRegistry {
        triples: Mutex<Vec<Triple>>,
        asks: AtomicUsize,
    }

    impl QueryEngine for FakeRegistry {
        fn ask(&self, _database: &Database, pattern: &[TriplePattern]) -> Result<Vec<Bindings>> {
            self.asks.fetch_add(1, Ordering::SeqCst);
            let triples = self.triples.lock();
            Ok(triples
                .iter()
                .filter_map(|t| pattern[0].matches(t))
                .collect())
        }

        fn insert(&self, _database: &Database, statements: &[Triple]) -> Result<()> {
            self.triples.lock().extend_from_slice(statements);
            Ok(())
        }

        fn delete(&self, _database: &Database, statements: &[Triple]) -> Result<()> {
            self.triples.lock().retain(|t| !statements.contains(t));
            Ok(())
        }
    }

    fn config() -> StoreConfig {
        StoreConfig {
            server_name: "http://localhost:6363".to_string(),
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_graph_id_split() {
        let g = GraphId::for_role("http://localhost:6363/D", GraphRole::Schema);
        assert_eq!(g.as_str(), "http://localhost:6363/D/schema");
        assert_eq!(g.split().unwrap(), ("http://localhost:6363/D", GraphRole::Schema));
        assert!(GraphId::new("D/unknown").split().is_err());
        assert!(GraphId::new("/document").split().is_err());
    }

    #[test]
    fn test_construct_leaves_missing_roles_none() {
        let db = Database::construct(
            DatabaseFields::new("D").instance(vec![GraphId::new("D/document")]),
            &AcceptAll,
        )
        .unwrap();
        assert!(db.is_validated());
        assert_eq!(db.schema, None);
        assert_eq!(db.identifiers(), vec![GraphId::new("D/document")]);
    }

    #[test]
    fn test_construct_raw_fills_empty() {
        let db = Database::construct_raw(DatabaseFields::new("D"));
        assert!(!db.is_validated());
        assert_eq!(db.schema, Some(Vec::new()));
        assert!(db.identifiers().is_empty());
    }

    #[test]
    fn test_construct_schema_failure() {
        let err = Database::construct(DatabaseFields::standard("D"), &RejectAll).unwrap_err();
        match err {
            StorageError::SchemaCompilation { database, reason } => {
                assert_eq!(database, "D");
                assert!(reason.contains("cyclic"));
            }
            other => panic!("expected SchemaCompilation, got {:?}", other),
        }
    }

    #[test]
    fn test_identifiers_role_order_and_skip_empty() {
        let fields = DatabaseFields {
            name: "D".to_string(),
            instance: Some(vec![GraphId::new("D/i1"), GraphId::new(""), GraphId::new("D/i2")]),
            inference: Some(vec![GraphId::new("D/inf")]),
            schema: Some(vec![GraphId::new("D/s")]),
            error_instance: None,
            error_schema: Some(vec![GraphId::new("D/es")]),
        };
        let ids: Vec<String> = Database::construct_raw(fields)
            .identifiers()
            .into_iter()
            .map(|g| g.to_string())
            .collect();
        assert_eq!(ids, vec!["D/i1", "D/i2", "D/inf", "D/s", "D/es"]);
    }

    #[test]
    fn test_admin_resolves_without_query() {
        let config = config();
        let registry = FakeRegistry::default();
        let resolver = Resolver::new(&config, &registry, &AcceptAll);
        let admin = resolver
            .resolve_by_name("http://localhost:6363/admin")
            .unwrap();
        assert_eq!(admin.name(), "http://localhost:6363/admin");
        assert_eq!(
            admin.instance(),
            &[GraphId::new("http://localhost:6363/admin/document")]
        );
        assert_eq!(registry.asks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_resolve_registered_database() {
        let config = config();
        let registry = FakeRegistry::default();
        let raw = Database::construct_raw(DatabaseFields::standard("http://localhost:6363/D"));
        registry
            .insert(&admin_database_raw(&config), &raw.registry_statements())
            .unwrap();

        let resolver = Resolver::new(&config, &registry, &AcceptAll);
        let db = resolver.resolve_by_name("http://localhost:6363/D").unwrap();
        assert!(db.is_validated());
        assert_eq!(db.instance(), raw.instance());
        assert_eq!(db.schema(), raw.schema());
        assert_eq!(db.inference(), raw.inference());
        assert!(db.error_instance().is_empty());
        assert!(registry.asks.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_resolve_unknown_database() {
        let config = config();
        let registry = FakeRegistry::default();
        let resolver = Resolver::new(&config, &registry, &AcceptAll);
        let err = resolver.resolve_by_name("http://localhost:6363/missing").unwrap_err();
        assert!(matches!(err, StorageError::DatabaseNotFound { name } if name.ends_with("missing")));
    }

    #[test]
    fn test_classify() {
        let config = config();
        assert_eq!(
            DatabaseRef::classify(&config, "http://localhost:6363/admin"),
            DatabaseRef::Admin
        );
        assert_eq!(
            DatabaseRef::classify(&config, "http://localhost:6363/D"),
            DatabaseRef::Other("http://localhost:6363/D")
        );
    }
}
