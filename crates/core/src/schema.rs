//! Structural checks on schema graphs.

use crate::config::RDFS_SUB_CLASS_OF;
use crate::database::{Database, SchemaCompiler};
use crate::store::Store;
use crate::term::{Node, Object};
use std::collections::{BTreeMap, BTreeSet};

/// Rejects schemas whose `rdfs:subClassOf` relation has a cycle.
///
/// Reads the current content of every schema graph of the database from the
/// store. Graphs without any files read as empty.
pub struct ClassHierarchyValidator<'a> {
    store: &'a Store,
}

impl<'a> ClassHierarchyValidator<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }
}

impl SchemaCompiler for ClassHierarchyValidator<'_> {
    fn compile_and_validate(&self, database: &Database) -> Result<(), String> {
        let mut parents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for graph in database.schema() {
            let content = self
                .store
                .graph_content(graph)
                .map_err(|e| format!("reading {}: {}", graph, e))?;
            for triple in content.iter().filter(|t| t.predicate == RDFS_SUB_CLASS_OF) {
                if let (Node::Iri(child), Object::Node(Node::Iri(parent))) =
                    (&triple.subject, &triple.object)
                {
                    parents.entry(child.clone()).or_default().insert(parent.clone());
                }
            }
        }
        match find_cycle(&parents) {
            Some(class) => Err(format!("class hierarchy cycle through <{}>", class)),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Iterative depth-first search; returns a class that lies on a cycle.
fn find_cycle(parents: &BTreeMap<String, BTreeSet<String>>) -> Option<String> {
    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    for start in parents.keys() {
        if marks.contains_key(start.as_str()) {
            continue;
        }
        let mut stack: Vec<(&str, Vec<&str>)> = vec![(start.as_str(), edges(parents, start))];
        marks.insert(start.as_str(), Mark::Visiting);
        while let Some((node, pending)) = stack.last_mut() {
            match pending.pop() {
                Some(next) => match marks.get(next) {
                    Some(Mark::Visiting) => return Some(next.to_string()),
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(next, Mark::Visiting);
                        stack.push((next, edges(parents, next)));
                    }
                },
                None => {
                    marks.insert(*node, Mark::Done);
                    stack.pop();
                }
            }
        }
    }
    None
}

fn edges<'a>(parents: &'a BTreeMap<String, BTreeSet<String>>, class: &str) -> Vec<&'a str> {
    parents
        .get(class)
        .map(|p| p.iter().map(String::as_str).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::database::{DatabaseFields, GraphId, GraphRole};
    use crate::error::StorageError;
    use crate::term::Triple;
    use tempfile::TempDir;

    fn sub_class(child: &str, parent: &str) -> Triple {
        Triple::new(Node::iri(child), RDFS_SUB_CLASS_OF, Object::iri(parent))
    }

    #[test]
    fn test_acyclic_hierarchy_accepted() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(StoreConfig::with_root(dir.path())).unwrap();
        store.create_database_layout("D").unwrap();
        store
            .insert(
                &GraphId::for_role("D", GraphRole::Schema),
                &[
                    sub_class("http://ex/Dog", "http://ex/Animal"),
                    sub_class("http://ex/Cat", "http://ex/Animal"),
                    sub_class("http://ex/Animal", "http://ex/Thing"),
                ],
            )
            .unwrap();
        let validator = ClassHierarchyValidator::new(&store);
        let db = Database::construct(DatabaseFields::standard("D"), &validator).unwrap();
        assert!(db.is_validated());
    }

    #[test]
    fn test_cycle_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(StoreConfig::with_root(dir.path())).unwrap();
        store.create_database_layout("D").unwrap();
        store
            .insert(
                &GraphId::for_role("D", GraphRole::Schema),
                &[
                    sub_class("http://ex/A", "http://ex/B"),
                    sub_class("http://ex/B", "http://ex/C"),
                    sub_class("http://ex/C", "http://ex/A"),
                ],
            )
            .unwrap();
        let validator = ClassHierarchyValidator::new(&store);
        let err = Database::construct(DatabaseFields::standard("D"), &validator).unwrap_err();
        assert!(matches!(err, StorageError::SchemaCompilation { reason, .. } if reason.contains("cycle")));
    }

    #[test]
    fn test_find_cycle_self_loop() {
        let mut parents = BTreeMap::new();
        parents.insert("a".to_string(), BTreeSet::from(["a".to_string()]));
        assert_eq!(find_cycle(&parents).as_deref(), Some("a"));
        assert_eq!(find_cycle(&BTreeMap::new()), None);
    }
}
