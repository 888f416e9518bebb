//! Narrow interface to the external query engine.
//!
//! The storage engine never evaluates a query language itself. It hands
//! basic graph patterns to a [`QueryEngine`] and reads back variable bindings.

use crate::database::Database;
use crate::error::Result;
use crate::term::{Node, Object, Triple};
use std::collections::HashMap;

/// One solution: variable name to bound value.
pub type Bindings = HashMap<String, Object>;

/// A position in a triple pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternTerm {
    Var(String),
    Value(Object),
}

impl PatternTerm {
    pub fn var(name: impl Into<String>) -> Self {
        PatternTerm::Var(name.into())
    }

    pub fn iri(iri: impl Into<String>) -> Self {
        PatternTerm::Value(Object::iri(iri))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriplePattern {
    pub subject: PatternTerm,
    pub predicate: PatternTerm,
    pub object: PatternTerm,
}

impl TriplePattern {
    pub fn new(subject: PatternTerm, predicate: PatternTerm, object: PatternTerm) -> Self {
        Self {
            subject,
            predicate,
            object,
        }
    }

    /// Bindings produced by matching this pattern against one triple, if it matches.
    pub fn matches(&self, triple: &Triple) -> Option<Bindings> {
        let mut bindings = Bindings::new();
        let positions = [
            (&self.subject, Object::Node(triple.subject.clone())),
            (&self.predicate, Object::Node(Node::Iri(triple.predicate.clone()))),
            (&self.object, triple.object.clone()),
        ];
        for (term, value) in positions {
            match term {
                PatternTerm::Value(expected) if *expected != value => return None,
                PatternTerm::Value(_) => {}
                PatternTerm::Var(name) => match bindings.get(name) {
                    Some(bound) if *bound != value => return None,
                    Some(_) => {}
                    None => {
                        bindings.insert(name.clone(), value);
                    }
                },
            }
        }
        Some(bindings)
    }
}

/// The query-engine collaborator.
///
/// `ask` returns one [`Bindings`] per solution; a pattern without variables
/// that matches yields a single empty binding.
pub trait QueryEngine: Send + Sync {
    fn ask(&self, database: &Database, pattern: &[TriplePattern]) -> Result<Vec<Bindings>>;

    fn insert(&self, database: &Database, statements: &[Triple]) -> Result<()>;

    fn delete(&self, database: &Database, statements: &[Triple]) -> Result<()>;
}
