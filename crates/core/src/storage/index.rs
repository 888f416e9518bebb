//! Compacted checkpoint index.
//!
//! The `.idx` file of a checkpoint is the read-optimized form of its text
//! log: the triple set sorted in subject-predicate-object order plus a
//! predicate-object-subject permutation, serialized with bincode.
//! Writes use temp-file + fsync + rename; the rename is what makes a
//! checkpoint authoritative. A CRC32 footer guards the payload.

use crate::error::{IoContext, Result, StorageError};
use crate::term::{Node, Object, Triple};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Magic bytes written before the CRC32 footer.
const INDEX_CRC_MAGIC: &[u8; 4] = b"GCI1";

/// Sorted, deduplicated triple set of one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointIndex {
    pub checkpoint: u64,
    triples: Vec<Triple>,
    /// Positions into `triples`, ordered by predicate, object, subject.
    by_predicate: Vec<u32>,
}

/// Triple pattern for index lookups; `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexPattern {
    pub subject: Option<Node>,
    pub predicate: Option<String>,
    pub object: Option<Object>,
}

impl IndexPattern {
    fn matches(&self, triple: &Triple) -> bool {
        self.subject.as_ref().map_or(true, |s| *s == triple.subject)
            && self.predicate.as_ref().map_or(true, |p| *p == triple.predicate)
            && self.object.as_ref().map_or(true, |o| *o == triple.object)
    }
}

impl CheckpointIndex {
    pub fn build(checkpoint: u64, triples: impl IntoIterator<Item = Triple>) -> Self {
        let triples: Vec<Triple> = triples.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let mut by_predicate: Vec<u32> = (0..triples.len() as u32).collect();
        by_predicate.sort_by(|&a, &b| {
            let (ta, tb) = (&triples[a as usize], &triples[b as usize]);
            (&ta.predicate, &ta.object, &ta.subject).cmp(&(&tb.predicate, &tb.object, &tb.subject))
        });
        Self {
            checkpoint,
            triples,
            by_predicate,
        }
    }

    pub fn len(&self) -> usize {
        self.triples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    /// All triples in subject-predicate-object order.
    pub fn triples(&self) -> &[Triple] {
        &self.triples
    }

    pub fn contains(&self, triple: &Triple) -> bool {
        self.triples.binary_search(triple).is_ok()
    }

    /// Triples matching `pattern`, using the subject or predicate order when bound.
    pub fn lookup(&self, pattern: &IndexPattern) -> Vec<&Triple> {
        if let Some(subject) = &pattern.subject {
            let start = self.triples.partition_point(|t| t.subject < *subject);
            let end = self.triples.partition_point(|t| t.subject <= *subject);
            return self.triples[start..end]
                .iter()
                .filter(|t| pattern.matches(t))
                .collect();
        }
        if let Some(predicate) = &pattern.predicate {
            let start = self
                .by_predicate
                .partition_point(|&i| self.triples[i as usize].predicate < *predicate);
            let end = self
                .by_predicate
                .partition_point(|&i| self.triples[i as usize].predicate <= *predicate);
            return self.by_predicate[start..end]
                .iter()
                .map(|&i| &self.triples[i as usize])
                .filter(|t| pattern.matches(t))
                .collect();
        }
        self.triples.iter().filter(|t| pattern.matches(t)).collect()
    }

    /// Check ordering and permutation invariants after deserialization.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Some(i) = self.triples.windows(2).position(|w| w[0] >= w[1]) {
            return Err(format!("triples out of order at position {}", i + 1));
        }
        if self.by_predicate.len() != self.triples.len() {
            return Err(format!(
                "by_predicate length {} != triple count {}",
                self.by_predicate.len(),
                self.triples.len()
            ));
        }
        let mut seen = vec![false; self.triples.len()];
        for &i in &self.by_predicate {
            match seen.get_mut(i as usize) {
                Some(slot) if !*slot => *slot = true,
                Some(_) => return Err(format!("position {} repeated in by_predicate", i)),
                None => return Err(format!("position {} out of bounds", i)),
            }
        }
        Ok(())
    }
}

/// Write an index atomically: temp file, fsync, rename, fsync directory.
/// Layout: `[bincode payload][magic "GCI1"][u32 CRC32 BE]`.
pub fn save_index(index: &CheckpointIndex, path: &Path) -> Result<()> {
    let bytes = bincode::serialize(index).map_err(|e| StorageError::CorruptIndex {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let crc = crc32fast::hash(&bytes);

    let mut output = Vec::with_capacity(bytes.len() + 8);
    output.extend_from_slice(&bytes);
    output.extend_from_slice(INDEX_CRC_MAGIC);
    output.extend_from_slice(&crc.to_be_bytes());

    let tmp_path = path.with_extension("idx.tmp");
    {
        let mut tmp = File::create(&tmp_path).at(&tmp_path)?;
        tmp.write_all(&output).at(&tmp_path)?;
        tmp.sync_all().at(&tmp_path)?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600)).at(&tmp_path)?;
    }
    fs::rename(&tmp_path, path).at(path)?;
    sync_parent(path)?;

    tracing::debug!(
        "Saved checkpoint index {:?} ({} triples, CRC32={:#010x})",
        path,
        index.len(),
        crc
    );
    Ok(())
}

/// Load an index, verifying its CRC32 footer and invariants.
pub fn load_index(path: &Path) -> Result<CheckpointIndex> {
    let raw = fs::read(path).at(path)?;
    let corrupt = |reason: String| StorageError::CorruptIndex {
        path: path.to_path_buf(),
        reason,
    };

    if raw.len() < 8 || &raw[raw.len() - 8..raw.len() - 4] != INDEX_CRC_MAGIC {
        return Err(corrupt("missing CRC32 footer".to_string()));
    }
    let payload = &raw[..raw.len() - 8];
    let stored_crc = u32::from_be_bytes([
        raw[raw.len() - 4],
        raw[raw.len() - 3],
        raw[raw.len() - 2],
        raw[raw.len() - 1],
    ]);
    let computed_crc = crc32fast::hash(payload);
    if computed_crc != stored_crc {
        return Err(corrupt(format!(
            "CRC32 mismatch: expected {:#010x}, got {:#010x}",
            stored_crc, computed_crc
        )));
    }

    let index: CheckpointIndex =
        bincode::deserialize(payload).map_err(|e| corrupt(e.to_string()))?;
    index.validate().map_err(corrupt)?;
    Ok(index)
}

/// fsync the directory holding `path` so a rename inside it is durable.
pub(crate) fn sync_parent(path: &Path) -> Result<()> {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        File::open(parent).and_then(|d| d.sync_all()).at(parent)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
