//! A storage root opened for use.
//!
//! [`Store`] ties the layout, the journal writer, the per-role gates and the
//! checkpoint manager together and addresses graphs by [`GraphId`] instead of
//! `(database, role)` pairs.

use crate::config::StoreConfig;
use crate::database::{GraphId, Resolver, SchemaCompiler};
use crate::error::{IoContext, Result};
use crate::query::QueryEngine;
use crate::storage::checkpoint::{CheckpointManager, Replay};
use crate::storage::index::{CheckpointIndex, IndexPattern};
use crate::storage::journal::{DeltaClass, JournalWriter, RoleGates, StorageFormat, StreamGuard};
use crate::storage::layout::StoreLayout;
use crate::term::Triple;
use crate::upgrade::{UpgradeChain, UpgradeOutcome};
use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;

pub struct Store {
    config: StoreConfig,
    layout: StoreLayout,
    journal: Arc<JournalWriter>,
    checkpoints: CheckpointManager,
    upgrade: UpgradeOutcome,
}

impl Store {
    /// Open (and create if needed) the storage root named by `config`.
    ///
    /// The root is brought to the current format version before anything
    /// else touches it. A fresh root gets the current version recorded; a
    /// root whose version has no upgrade path fails to open unchanged.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.storage_root).at(&config.storage_root)?;

        let layout = StoreLayout::new(config.storage_root.clone());
        let upgrade = UpgradeChain::standard().maybe_upgrade(&layout)?;
        let gates = Arc::new(RoleGates::default());
        let journal = Arc::new(JournalWriter::new(
            layout.clone(),
            Arc::clone(&gates),
            config.sync_on_append,
        ));
        let checkpoints = CheckpointManager::new(
            layout.clone(),
            Arc::clone(&journal),
            gates,
            config.retain_checkpoints,
        );
        tracing::info!("Opened store at {:?} ({:?})", config.storage_root, upgrade);
        Ok(Self {
            config,
            layout,
            journal,
            checkpoints,
            upgrade,
        })
    }

    /// What opening did to the root's format version.
    pub fn upgrade_outcome(&self) -> &UpgradeOutcome {
        &self.upgrade
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn journal(&self) -> &JournalWriter {
        &self.journal
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Run the standard upgrade chain against this root again. After a
    /// successful open this reports [`UpgradeOutcome::UpToDate`].
    pub fn maybe_upgrade(&self) -> Result<UpgradeOutcome> {
        UpgradeChain::standard().maybe_upgrade(&self.layout)
    }

    pub fn create_database_layout(&self, database: &str) -> Result<()> {
        self.checkpoints.create_database_layout(database)
    }

    pub fn delete_database_layout(&self, database: &str) -> Result<()> {
        self.checkpoints.delete_database_layout(database)
    }

    pub fn database_exists(&self, database: &str) -> bool {
        self.layout.database_dir(database).is_dir()
    }

    pub fn list_databases(&self) -> Result<Vec<String>> {
        self.layout.list_databases()
    }

    pub fn resolver<'a>(
        &'a self,
        engine: &'a dyn QueryEngine,
        compiler: &'a dyn SchemaCompiler,
    ) -> Resolver<'a> {
        Resolver::new(&self.config, engine, compiler)
    }

    pub fn open_stream(&self, graph: &GraphId, class: DeltaClass) -> Result<StreamGuard<'_>> {
        self.journal.open_stream(graph, class, StorageFormat::Text)
    }

    /// Record one delete-then-insert transaction as a single journal layer.
    pub fn apply_delta(&self, graph: &GraphId, removals: &[Triple], additions: &[Triple]) -> Result<()> {
        let neg = (!removals.is_empty())
            .then(|| self.open_stream(graph, DeltaClass::Neg))
            .transpose()?;
        let pos = (!additions.is_empty())
            .then(|| self.open_stream(graph, DeltaClass::Pos))
            .transpose()?;
        if let Some(neg) = neg {
            neg.append_all(removals)?;
            neg.close()?;
        }
        if let Some(pos) = pos {
            pos.append_all(additions)?;
            pos.close()?;
        }
        Ok(())
    }

    pub fn insert(&self, graph: &GraphId, triples: &[Triple]) -> Result<()> {
        self.apply_delta(graph, &[], triples)
    }

    pub fn remove(&self, graph: &GraphId, triples: &[Triple]) -> Result<()> {
        self.apply_delta(graph, triples, &[])
    }

    pub fn replay(&self, graph: &GraphId) -> Result<Replay> {
        let (database, role) = graph.split()?;
        self.checkpoints.replay_pending_deltas(database, role)
    }

    pub fn compact(&self, graph: &GraphId) -> Result<u64> {
        let (database, role) = graph.split()?;
        self.checkpoints.compact(database, role)
    }

    /// Current content of a graph: its newest checkpoint plus pending deltas.
    pub fn graph_content(&self, graph: &GraphId) -> Result<BTreeSet<Triple>> {
        Ok(self.replay(graph)?.triples)
    }

    /// Current triples of a graph matching `pattern`.
    ///
    /// Answers from the checkpoint index when no journal is pending,
    /// otherwise from a replay.
    pub fn lookup(&self, graph: &GraphId, pattern: &IndexPattern) -> Result<Vec<Triple>> {
        let (database, role) = graph.split()?;
        let files = self.layout.scan_role(database, role)?;
        let checkpoint = files.latest_checkpoint();
        let index = if checkpoint > 0 && files.layers_after(checkpoint).is_empty() {
            match self.checkpoints.latest_index(database, role)? {
                Some(index) => index,
                None => CheckpointIndex::build(checkpoint, Vec::new()),
            }
        } else {
            let replay = self.checkpoints.replay_pending_deltas(database, role)?;
            CheckpointIndex::build(replay.checkpoint, replay.triples)
        };
        Ok(index.lookup(pattern).into_iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RDF_TYPE;
    use crate::database::GraphRole;
    use crate::term::{Literal, Node, Object};
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Store {
        Store::open(StoreConfig::with_root(dir.path())).unwrap()
    }

    fn typed(subject: &str) -> Triple {
        Triple::new(Node::iri(subject), RDF_TYPE, Object::iri("http://ex/Thing"))
    }

    #[test]
    fn test_apply_delta_shares_one_layer() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.create_database_layout("D").unwrap();
        let graph = GraphId::for_role("D", GraphRole::Document);

        store.insert(&graph, &[typed("http://ex/1"), typed("http://ex/2")]).unwrap();
        store
            .apply_delta(&graph, &[typed("http://ex/1")], &[typed("http://ex/3")])
            .unwrap();

        let files = store.layout().scan_role("D", GraphRole::Document).unwrap();
        assert_eq!(files.layers_after(1), vec![1, 2]);
        let content = store.graph_content(&graph).unwrap();
        assert_eq!(
            content,
            BTreeSet::from([typed("http://ex/2"), typed("http://ex/3")])
        );
        assert_eq!(store.journal().open_stream_count(), 0);
    }

    #[test]
    fn test_lookup_uses_index_and_journal() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.create_database_layout("D").unwrap();
        let graph = GraphId::for_role("D", GraphRole::Document);
        let named = Triple::new(Node::iri("http://ex/1"), "http://ex/name", Literal::string("one"));
        store.insert(&graph, &[typed("http://ex/1"), named.clone()]).unwrap();

        let by_subject = IndexPattern {
            subject: Some(Node::iri("http://ex/1")),
            ..IndexPattern::default()
        };
        assert_eq!(store.lookup(&graph, &by_subject).unwrap().len(), 2);

        store.compact(&graph).unwrap();
        let by_predicate = IndexPattern {
            predicate: Some("http://ex/name".to_string()),
            ..IndexPattern::default()
        };
        assert_eq!(store.lookup(&graph, &by_predicate).unwrap(), vec![named]);
    }

    #[test]
    fn test_invalid_graph_identifier() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert!(matches!(
            store.compact(&GraphId::new("no-role")),
            Err(crate::error::StorageError::InvalidGraphIdentifier { .. })
        ));
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            retain_checkpoints: 0,
            ..StoreConfig::with_root(dir.path())
        };
        assert!(Store::open(config).is_err());
    }
}
