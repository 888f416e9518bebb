//! On-disk layout of a store.
//!
//! ```text
//! <root>/VERSION
//! <root>/<percent-encoded database name>/<role>/<N>-ckp.ntr      checkpoint text
//! <root>/<percent-encoded database name>/<role>/<N>-ckp.idx      compacted index
//! <root>/<percent-encoded database name>/<role>/<N>-<L>-pos.ntr  journal layer L after checkpoint N
//! <root>/<percent-encoded database name>/<role>/<N>-<L>-neg.ntr
//! ```
//!
//! Checkpoint `0` is never written; it stands for the empty base of a role
//! that has journal layers but no checkpoint yet.

use crate::config::{INDEX_EXTENSION, TEXT_EXTENSION, VERSION_FILE};
use crate::database::GraphRole;
use crate::error::{IoContext, Result};
use crate::storage::journal::DeltaClass;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Path arithmetic and directory scans for one storage root.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version_file(&self) -> PathBuf {
        self.root.join(VERSION_FILE)
    }

    pub fn database_dir(&self, database: &str) -> PathBuf {
        self.root.join(urlencoding::encode(database).as_ref())
    }

    pub fn role_dir(&self, database: &str, role: GraphRole) -> PathBuf {
        self.database_dir(database).join(role.suffix())
    }

    pub fn checkpoint_text(&self, database: &str, role: GraphRole, checkpoint: u64) -> PathBuf {
        self.role_dir(database, role)
            .join(format!("{}-ckp.{}", checkpoint, TEXT_EXTENSION))
    }

    pub fn checkpoint_index(&self, database: &str, role: GraphRole, checkpoint: u64) -> PathBuf {
        self.role_dir(database, role)
            .join(format!("{}-ckp.{}", checkpoint, INDEX_EXTENSION))
    }

    pub fn journal(
        &self,
        database: &str,
        role: GraphRole,
        checkpoint: u64,
        layer: u64,
        class: DeltaClass,
    ) -> PathBuf {
        self.role_dir(database, role).join(format!(
            "{}-{}-{}.{}",
            checkpoint,
            layer,
            class.as_str(),
            TEXT_EXTENSION
        ))
    }

    /// Scan a role directory. A missing directory scans as empty.
    pub fn scan_role(&self, database: &str, role: GraphRole) -> Result<RoleFiles> {
        scan_dir(&self.role_dir(database, role))
    }

    /// Names of every database directory under the root, decoded.
    pub fn list_databases(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root).at(&self.root)? {
            let entry = entry.at(&self.root)?;
            if !entry.path().is_dir() {
                continue;
            }
            let raw = entry.file_name().to_string_lossy().to_string();
            match urlencoding::decode(&raw) {
                Ok(name) => names.push(name.into_owned()),
                Err(e) => tracing::warn!("Skipping undecodable database dir {:?}: {}", raw, e),
            }
        }
        names.sort();
        Ok(names)
    }
}

/// What a scan of one role directory found.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoleFiles {
    /// Checkpoints with both text and index present.
    pub complete_checkpoints: BTreeSet<u64>,
    /// Checkpoints with text but no index (in-progress or legacy).
    pub text_only_checkpoints: BTreeSet<u64>,
    /// `(checkpoint, layer)` pairs with at least one journal file.
    pub journal_layers: BTreeSet<(u64, u64)>,
}

impl RoleFiles {
    /// The authoritative base: the newest complete checkpoint, or 0.
    pub fn latest_checkpoint(&self) -> u64 {
        self.complete_checkpoints.last().copied().unwrap_or(0)
    }

    /// Highest checkpoint number present in any form.
    pub fn highest_checkpoint_seen(&self) -> u64 {
        let from_ckp = self
            .complete_checkpoints
            .iter()
            .chain(self.text_only_checkpoints.iter())
            .max()
            .copied()
            .unwrap_or(0);
        let from_journal = self
            .journal_layers
            .iter()
            .map(|(c, _)| *c)
            .max()
            .unwrap_or(0);
        from_ckp.max(from_journal)
    }

    /// Journal layers recorded after `checkpoint`, ascending.
    pub fn layers_after(&self, checkpoint: u64) -> Vec<u64> {
        self.journal_layers
            .range((checkpoint, 0)..=(checkpoint, u64::MAX))
            .map(|(_, l)| *l)
            .collect()
    }
}

fn scan_dir(dir: &Path) -> Result<RoleFiles> {
    let mut files = RoleFiles::default();
    if !dir.exists() {
        return Ok(files);
    }
    let mut text = BTreeSet::new();
    let mut index = BTreeSet::new();
    for entry in fs::read_dir(dir).at(dir)? {
        let entry = entry.at(dir)?;
        let name = entry.file_name().to_string_lossy().to_string();
        match parse_file_name(&name) {
            Some(FileKind::CheckpointText(n)) => {
                text.insert(n);
            }
            Some(FileKind::CheckpointIndex(n)) => {
                index.insert(n);
            }
            Some(FileKind::Journal(n, layer)) => {
                files.journal_layers.insert((n, layer));
            }
            None => {}
        }
    }
    for n in text {
        if index.contains(&n) {
            files.complete_checkpoints.insert(n);
        } else {
            files.text_only_checkpoints.insert(n);
        }
    }
    Ok(files)
}

enum FileKind {
    CheckpointText(u64),
    CheckpointIndex(u64),
    Journal(u64, u64),
}

fn parse_file_name(name: &str) -> Option<FileKind> {
    let (stem, ext) = name.rsplit_once('.')?;
    let parts: Vec<&str> = stem.split('-').collect();
    match (parts.as_slice(), ext) {
        ([n, "ckp"], TEXT_EXTENSION) => n.parse().ok().map(FileKind::CheckpointText),
        ([n, "ckp"], INDEX_EXTENSION) => n.parse().ok().map(FileKind::CheckpointIndex),
        ([n, layer, class], TEXT_EXTENSION) if DeltaClass::parse(class).is_some() => {
            Some(FileKind::Journal(n.parse().ok()?, layer.parse().ok()?))
        }
        _ => None,
    }
}
