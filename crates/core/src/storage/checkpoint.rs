//! Checkpoints, compaction and delta replay.
//!
//! A checkpoint is a numbered pair of files per graph role: the canonical
//! text of every live triple (`<N>-ckp.ntr`, written through a `chk` journal
//! stream) and its compacted index (`<N>-ckp.idx`). The index is written
//! last; a checkpoint without one is not authoritative and is ignored.
//!
//! Checkpoint numbers are allocated as one past the highest number ever seen
//! in the role directory, so a number is never handed out twice.

use crate::database::{GraphId, GraphRole};
use crate::error::{IoContext, Result, StorageError};
use crate::storage::index::{load_index, save_index, CheckpointIndex};
use crate::storage::journal::{read_records, DeltaClass, JournalWriter, RoleGates, StorageFormat};
use crate::storage::layout::StoreLayout;
use crate::term::Triple;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Roles that get a directory and an initial checkpoint at creation.
pub const LAYOUT_ROLES: [GraphRole; 2] = [GraphRole::Document, GraphRole::Schema];

/// Diagnostic statistics from a delta replay.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    /// Triples read from the base checkpoint text.
    pub base_triples: usize,
    /// Journal layers applied.
    pub layers: usize,
    /// `pos` records applied.
    pub added: usize,
    /// `neg` records applied.
    pub removed: usize,
    /// Files that ended in an incomplete record.
    pub truncated_files: usize,
}

/// Current logical content of one graph role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replay {
    /// Base checkpoint the journal was replayed over (0 = none).
    pub checkpoint: u64,
    pub triples: BTreeSet<Triple>,
    pub stats: ReplayStats,
}

/// Creates, compacts and replays checkpoints for every database in a store.
pub struct CheckpointManager {
    layout: StoreLayout,
    journal: Arc<JournalWriter>,
    gates: Arc<RoleGates>,
    retain_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new(
        layout: StoreLayout,
        journal: Arc<JournalWriter>,
        gates: Arc<RoleGates>,
        retain_checkpoints: usize,
    ) -> Self {
        Self {
            layout,
            journal,
            gates,
            retain_checkpoints: retain_checkpoints.max(1),
        }
    }

    /// Create the role directories and checkpoint 1 for document and schema,
    /// then replay both roles.
    ///
    /// Fails if the database directory already exists. A failure part-way
    /// leaves a partial layout that the caller must delete.
    pub fn create_database_layout(&self, database: &str) -> Result<()> {
        let db_dir = self.layout.database_dir(database);
        if db_dir.exists() {
            return Err(StorageError::io(
                &db_dir,
                io::Error::new(io::ErrorKind::AlreadyExists, "database layout already exists"),
            ));
        }
        for role in LAYOUT_ROLES {
            let dir = self.layout.role_dir(database, role);
            fs::create_dir_all(&dir).at(&dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)).at(&dir)?;
            }
            let checkpoint = self.write_checkpoint(database, role, &BTreeSet::new())?;
            debug_assert_eq!(checkpoint, 1);
        }
        for role in LAYOUT_ROLES {
            let replay = self.replay_pending_deltas(database, role)?;
            tracing::debug!(
                "Replayed {}/{}: {} triples at checkpoint {}",
                database,
                role,
                replay.triples.len(),
                replay.checkpoint
            );
        }
        tracing::info!("Created layout for database '{}'", database);
        Ok(())
    }

    /// Remove every file of a database. Waits for open streams on it to close,
    /// then forgets the database's role gates.
    pub fn delete_database_layout(&self, database: &str) -> Result<()> {
        let removed = {
            let gates: Vec<_> = GraphRole::ALL
                .iter()
                .map(|&role| self.gates.gate(database, role))
                .collect();
            let _exclusive: Vec<_> = gates.iter().map(|g| g.write()).collect();
            let db_dir = self.layout.database_dir(database);
            fs::remove_dir_all(&db_dir).at(&db_dir)
        };
        self.gates.release(database);
        removed?;
        tracing::info!("Deleted layout for database '{}'", database);
        Ok(())
    }

    /// Rebuild the current content of a role: the newest checkpoint's text,
    /// then every journal layer after it in ascending order, `neg` before
    /// `pos` within a layer, records in file order.
    pub fn replay_pending_deltas(&self, database: &str, role: GraphRole) -> Result<Replay> {
        let files = self.layout.scan_role(database, role)?;
        let checkpoint = files.latest_checkpoint();
        let mut stats = ReplayStats::default();
        let mut triples = BTreeSet::new();

        if checkpoint > 0 {
            let path = self.layout.checkpoint_text(database, role, checkpoint);
            let (base, read) = read_records(&path)?;
            stats.base_triples = base.len();
            stats.truncated_files += usize::from(read.truncated);
            triples.extend(base);
        }

        for layer in files.layers_after(checkpoint) {
            let neg = self
                .layout
                .journal(database, role, checkpoint, layer, DeltaClass::Neg);
            let (removed, read) = read_records(&neg)?;
            stats.truncated_files += usize::from(read.truncated);
            stats.removed += removed.len();
            for triple in &removed {
                triples.remove(triple);
            }

            let pos = self
                .layout
                .journal(database, role, checkpoint, layer, DeltaClass::Pos);
            let (added, read) = read_records(&pos)?;
            stats.truncated_files += usize::from(read.truncated);
            stats.added += added.len();
            triples.extend(added);
            stats.layers += 1;
        }

        Ok(Replay {
            checkpoint,
            triples,
            stats,
        })
    }

    /// Fold the newest checkpoint and its journal into a new checkpoint.
    ///
    /// Blocks until every open `pos`/`neg` stream of the role has closed, and
    /// keeps new ones out until done. Journals of superseded checkpoints are
    /// deleted only after the new index is durable.
    pub fn compact(&self, database: &str, role: GraphRole) -> Result<u64> {
        let gate = self.gates.gate(database, role);
        let _exclusive = gate.write();

        let replay = self.replay_pending_deltas(database, role)?;
        let checkpoint = self.write_checkpoint(database, role, &replay.triples)?;
        self.discard_superseded(database, role, checkpoint)?;
        tracing::info!(
            "Compacted {}/{} into checkpoint {} ({} triples, {} layers folded)",
            database,
            role,
            checkpoint,
            replay.triples.len(),
            replay.stats.layers
        );
        Ok(checkpoint)
    }

    /// Index of the newest complete checkpoint, if any.
    pub fn latest_index(&self, database: &str, role: GraphRole) -> Result<Option<CheckpointIndex>> {
        let checkpoint = self.layout.scan_role(database, role)?.latest_checkpoint();
        if checkpoint == 0 {
            return Ok(None);
        }
        load_index(&self.layout.checkpoint_index(database, role, checkpoint)).map(Some)
    }

    /// Complete checkpoints of a role, ascending.
    pub fn checkpoints(&self, database: &str, role: GraphRole) -> Result<Vec<u64>> {
        Ok(self
            .layout
            .scan_role(database, role)?
            .complete_checkpoints
            .into_iter()
            .collect())
    }

    /// Write `triples` as the next checkpoint: text through a `chk` stream,
    /// then the index. Returns the new checkpoint number.
    fn write_checkpoint(
        &self,
        database: &str,
        role: GraphRole,
        triples: &BTreeSet<Triple>,
    ) -> Result<u64> {
        let graph = GraphId::for_role(database, role);
        let stream = self
            .journal
            .open_stream(&graph, DeltaClass::Chk, StorageFormat::Text)?;
        let checkpoint = stream.target().checkpoint;
        stream.append_all(triples)?;
        stream.close()?;

        let index = CheckpointIndex::build(checkpoint, triples.iter().cloned());
        save_index(
            &index,
            &self.layout.checkpoint_index(database, role, checkpoint),
        )?;
        Ok(checkpoint)
    }

    fn discard_superseded(&self, database: &str, role: GraphRole, current: u64) -> Result<()> {
        let files = self.layout.scan_role(database, role)?;

        for &(checkpoint, layer) in files.journal_layers.iter().filter(|(c, _)| *c < current) {
            for class in [DeltaClass::Pos, DeltaClass::Neg] {
                remove_if_present(&self.layout.journal(database, role, checkpoint, layer, class))?;
            }
        }

        let keep_from = files
            .complete_checkpoints
            .iter()
            .rev()
            .nth(self.retain_checkpoints - 1)
            .copied()
            .unwrap_or(0);
        let stale = files
            .complete_checkpoints
            .iter()
            .filter(|&&c| c < keep_from)
            .chain(files.text_only_checkpoints.iter().filter(|&&c| c < current));
        for &checkpoint in stale {
            remove_if_present(&self.layout.checkpoint_index(database, role, checkpoint))?;
            remove_if_present(&self.layout.checkpoint_text(database, role, checkpoint))?;
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(path, e)),
    }
}
