//! On-disk format upgrades.
//!
//! The store root holds a `VERSION` file with one label. At startup
//! [`UpgradeChain::maybe_upgrade`] compares it to the version this build
//! expects, finds a path through the declared upgrade steps and runs them
//! in order. The version file is rewritten only after every step succeeded,
//! so a crash mid-chain is retried from the start on the next startup.
//! Every step must therefore be safe to re-run from its start version.

use crate::config::{CURRENT_STORE_VERSION, INITIAL_STORE_VERSION, XSD_STRING, XSD_STRING_PREFIXED};
use crate::database::GraphRole;
use crate::error::{IoContext, Result, StorageError};
use crate::storage::index::{save_index, sync_parent, CheckpointIndex};
use crate::storage::journal::{read_records, DeltaClass};
use crate::storage::layout::StoreLayout;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

type StepFn = Box<dyn Fn(&StoreLayout) -> Result<()> + Send + Sync>;

/// One declared edge `from -> to` with its transformation.
pub struct UpgradeStep {
    pub from: String,
    pub to: String,
    pub description: &'static str,
    apply: StepFn,
}

impl UpgradeStep {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        description: &'static str,
        apply: impl Fn(&StoreLayout) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            description,
            apply: Box::new(apply),
        }
    }
}

/// Outcome of [`UpgradeChain::maybe_upgrade`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// Empty store; the target version was written.
    Initialized,
    /// Already at the target version.
    UpToDate,
    /// Steps were applied along `path`.
    Upgraded { path: Vec<String> },
}

/// A static table of upgrade steps and the version they lead to.
pub struct UpgradeChain {
    steps: Vec<UpgradeStep>,
    target: String,
}

impl UpgradeChain {
    pub fn new(steps: Vec<UpgradeStep>, target: impl Into<String>) -> Self {
        Self {
            steps,
            target: target.into(),
        }
    }

    /// The steps shipped with this build, targeting [`CURRENT_STORE_VERSION`].
    pub fn standard() -> Self {
        Self::new(
            vec![
                UpgradeStep::new(
                    "1.0.0",
                    "1.1.0",
                    "build missing checkpoint indexes",
                    build_missing_indexes,
                ),
                UpgradeStep::new(
                    "1.1.0",
                    "1.2.0",
                    "rewrite prefixed xsd:string datatypes to the full IRI",
                    rewrite_string_datatype,
                ),
            ],
            CURRENT_STORE_VERSION,
        )
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// A path `[from, .., to]` through the declared steps, found depth-first.
    /// `from == to` yields `[from]`.
    pub fn accessible(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let mut visited = HashSet::new();
        let mut path = vec![from.to_string()];
        if self.search(from, to, &mut visited, &mut path) {
            Ok(path)
        } else {
            Err(StorageError::NoUpgradePath {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }

    fn search<'a>(
        &'a self,
        at: &str,
        to: &str,
        visited: &mut HashSet<&'a str>,
        path: &mut Vec<String>,
    ) -> bool {
        if at == to {
            return true;
        }
        for step in self.steps.iter().filter(|s| s.from == at) {
            if !visited.insert(step.to.as_str()) {
                continue;
            }
            path.push(step.to.clone());
            if self.search(&step.to, to, visited, path) {
                return true;
            }
            path.pop();
        }
        false
    }

    /// Apply each step along `path` in order. Stops at the first failure.
    pub fn run_upgrade(&self, layout: &StoreLayout, path: &[String]) -> Result<()> {
        for pair in path.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            let step = self
                .steps
                .iter()
                .find(|s| s.from == *from && s.to == *to)
                .ok_or_else(|| StorageError::NoUpgradePath {
                    from: from.clone(),
                    to: to.clone(),
                })?;
            tracing::info!("Upgrading store {} -> {}: {}", from, to, step.description);
            (step.apply)(layout).map_err(|e| StorageError::UpgradeStepFailed {
                from: from.clone(),
                to: to.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Bring the store at `layout` to the target version.
    pub fn maybe_upgrade(&self, layout: &StoreLayout) -> Result<UpgradeOutcome> {
        let current = match read_version(layout)? {
            Some(version) => version,
            None if layout.list_databases()?.is_empty() => {
                write_version(layout, &self.target)?;
                tracing::info!("Initialized store at version {}", self.target);
                return Ok(UpgradeOutcome::Initialized);
            }
            None => INITIAL_STORE_VERSION.to_string(),
        };
        if current == self.target {
            return Ok(UpgradeOutcome::UpToDate);
        }
        let path = self.accessible(&current, &self.target)?;
        self.run_upgrade(layout, &path)?;
        write_version(layout, &self.target)?;
        tracing::info!("Store upgraded from {} to {}", current, self.target);
        Ok(UpgradeOutcome::Upgraded { path })
    }
}

/// Read the version label. `None` if the file does not exist.
pub fn read_version(layout: &StoreLayout) -> Result<Option<String>> {
    let path = layout.version_file();
    match fs::read_to_string(&path) {
        Ok(contents) => Ok(Some(contents.trim_end_matches(['\n', '\r']).to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::io(&path, e)),
    }
}

/// Write the version label with its terminator, atomically.
pub fn write_version(layout: &StoreLayout, version: &str) -> Result<()> {
    let path = layout.version_file();
    fs::create_dir_all(layout.root()).at(layout.root())?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp).at(&tmp)?;
        file.write_all(format!("{}\n", version).as_bytes()).at(&tmp)?;
        file.sync_all().at(&tmp)?;
    }
    fs::rename(&tmp, &path).at(&path)?;
    sync_parent(&path)
}

/// 1.0.0 -> 1.1.0: every checkpoint with text but no index gets one.
fn build_missing_indexes(layout: &StoreLayout) -> Result<()> {
    for database in layout.list_databases()? {
        for role in GraphRole::ALL {
            let files = layout.scan_role(&database, role)?;
            for &checkpoint in &files.text_only_checkpoints {
                let (triples, _) = read_records(&layout.checkpoint_text(&database, role, checkpoint))?;
                let index = CheckpointIndex::build(checkpoint, triples);
                save_index(&index, &layout.checkpoint_index(&database, role, checkpoint))?;
            }
        }
    }
    Ok(())
}

/// 1.1.0 -> 1.2.0: `^^<xsd:string>` becomes `^^<http://www.w3.org/2001/XMLSchema#string>`
/// in every checkpoint and journal file.
fn rewrite_string_datatype(layout: &StoreLayout) -> Result<()> {
    let legacy = format!("^^<{}>", XSD_STRING_PREFIXED);
    let canonical = format!("^^<{}>", XSD_STRING);
    for database in layout.list_databases()? {
        for role in GraphRole::ALL {
            let files = layout.scan_role(&database, role)?;
            let checkpoints = files
                .complete_checkpoints
                .iter()
                .chain(files.text_only_checkpoints.iter())
                .map(|&c| layout.checkpoint_text(&database, role, c));
            let journals = files.journal_layers.iter().flat_map(|&(c, l)| {
                [DeltaClass::Pos, DeltaClass::Neg]
                    .map(|class| layout.journal(&database, role, c, l, class))
            });
            for path in checkpoints.chain(journals) {
                rewrite_file(&path, &legacy, &canonical)?;
            }
        }
    }
    Ok(())
}

fn rewrite_file(path: &Path, from: &str, to: &str) -> Result<()> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    if !contents.contains(from) {
        return Ok(());
    }
    let tmp = path.with_extension("rewrite");
    fs::write(&tmp, contents.replace(from, to)).at(&tmp)?;
    fs::rename(&tmp, path).at(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn counting_step(from: &str, to: &str, counter: &Arc<AtomicUsize>) -> UpgradeStep {
        let counter = Arc::clone(counter);
        UpgradeStep::new(from, to, "count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn abc(counter: &Arc<AtomicUsize>) -> UpgradeChain {
        UpgradeChain::new(
            vec![counting_step("a", "b", counter), counting_step("b", "c", counter)],
            "c",
        )
    }

    #[test]
    fn test_accessible_chain() {
        let chain = abc(&Arc::new(AtomicUsize::new(0)));
        assert_eq!(chain.accessible("a", "c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(chain.accessible("c", "c").unwrap(), vec!["c"]);
    }

    #[test]
    fn test_no_path() {
        let chain = abc(&Arc::new(AtomicUsize::new(0)));
        match chain.accessible("x", "c") {
            Err(StorageError::NoUpgradePath { from, to }) => {
                assert_eq!(from, "x");
                assert_eq!(to, "c");
            }
            other => panic!("expected NoUpgradePath, got {:?}", other),
        }
    }

    #[test]
    fn test_search_terminates_on_cycle() {
        let counter = Arc::new(AtomicUsize::new(0));
        let chain = UpgradeChain::new(
            vec![
                counting_step("a", "b", &counter),
                counting_step("b", "a", &counter),
            ],
            "z",
        );
        assert!(chain.accessible("a", "z").is_err());
    }

    #[test]
    fn test_maybe_upgrade_runs_steps_then_writes_version() {
        let dir = TempDir::new().unwrap();
        let layout = StoreLayout::new(dir.path());
        write_version(&layout, "a").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let outcome = abc(&counter).maybe_upgrade(&layout).unwrap();
        assert_eq!(
            outcome,
            UpgradeOutcome::Upgraded {
                path: vec!["a".into(), "b".into(), "c".into()]
            }
        );
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(read_version(&layout).unwrap().as_deref(), Some("c"));
        assert_eq!(fs::read_to_string(layout.version_file()).unwrap(), "c\n");

        assert_eq!(abc(&counter).maybe_upgrade(&layout).unwrap(), UpgradeOutcome::UpToDate);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_step_leaves_version() {
        let dir = TempDir::new().unwrap();
        let layout = StoreLayout::new(dir.path());
        write_version(&layout, "a").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let chain = UpgradeChain::new(
            vec![
                counting_step("a", "b", &counter),
                UpgradeStep::new("b", "c", "fails", |layout| {
                    Err(StorageError::io(
                        layout.root(),
                        io::Error::other("disk full"),
                    ))
                }),
            ],
            "c",
        );
        assert!(matches!(
            chain.maybe_upgrade(&layout),
            Err(StorageError::UpgradeStepFailed { .. })
        ));
        assert_eq!(read_version(&layout).unwrap().as_deref(), Some("a"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_version_untouched() {
        let dir = TempDir::new().unwrap();
        let layout = StoreLayout::new(dir.path());
        write_version(&layout, "0.9.0").unwrap();
        assert!(matches!(
            UpgradeChain::standard().maybe_upgrade(&layout),
            Err(StorageError::NoUpgradePath { .. })
        ));
        assert_eq!(read_version(&layout).unwrap().as_deref(), Some("0.9.0"));
    }

    #[test]
    fn test_empty_store_initialized() {
        let dir = TempDir::new().unwrap();
        let layout = StoreLayout::new(dir.path().join("fresh"));
        let outcome = UpgradeChain::standard().maybe_upgrade(&layout).unwrap();
        assert_eq!(outcome, UpgradeOutcome::Initialized);
        assert_eq!(
            read_version(&layout).unwrap().as_deref(),
            Some(CURRENT_STORE_VERSION)
        );
    }

    #[test]
    fn test_standard_chain_upgrades_legacy_store() {
        let dir = TempDir::new().unwrap();
        let layout = StoreLayout::new(dir.path());
        let role_dir = layout.role_dir("D", GraphRole::Document);
        fs::create_dir_all(&role_dir).unwrap();
        fs::write(
            layout.checkpoint_text("D", GraphRole::Document, 1),
            "<http://a> <http://b> \"x\"^^<xsd:string> .\n",
        )
        .unwrap();
        fs::write(
            layout.journal("D", GraphRole::Document, 1, 1, DeltaClass::Pos),
            "<http://a> <http://c> \"y\"^^<xsd:string> .\n",
        )
        .unwrap();

        let outcome = UpgradeChain::standard().maybe_upgrade(&layout).unwrap();
        assert_eq!(
            outcome,
            UpgradeOutcome::Upgraded {
                path: vec!["1.0.0".into(), "1.1.0".into(), "1.2.0".into()]
            }
        );
        assert!(layout.checkpoint_index("D", GraphRole::Document, 1).exists());
        let text = fs::read_to_string(layout.checkpoint_text("D", GraphRole::Document, 1)).unwrap();
        assert!(text.contains(XSD_STRING));
        assert!(!text.contains("<xsd:string>"));
        let journal = fs::read_to_string(layout.journal("D", GraphRole::Document, 1, 1, DeltaClass::Pos)).unwrap();
        assert!(journal.contains(XSD_STRING));

        // Re-running both steps from 1.0.0 is harmless.
        let path: Vec<String> = vec!["1.0.0".into(), "1.1.0".into(), "1.2.0".into()];
        UpgradeChain::standard().run_upgrade(&layout, &path).unwrap();
    }
}
