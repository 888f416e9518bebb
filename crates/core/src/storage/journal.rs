//! Write-ahead delta journal.
//!
//! Every triple mutation is appended to a per-graph, per-delta-class text
//! stream before it becomes visible. A record is one canonical line
//! (see [`crate::term`]); it is rendered into a single buffer and written
//! with one `write_all` under the stream's mutex, so concurrent writers on a
//! stream never tear a record.
//!
//! Streams are registered in a [`JournalWriter`] under a
//! `(graph, delta class, format)` key. At most one registration per key may
//! exist. [`JournalWriter::open_stream`] returns a [`StreamGuard`] that
//! closes the stream when dropped.
//!
//! `pos` and `neg` streams of a graph that are open at the same time share a
//! journal layer. The layer is sealed when the last of them closes. Replay
//! reads a layer's `neg` file before its `pos` file, so a `neg` append that
//! follows a `pos` append moves the open streams on to a fresh layer. While a
//! `pos`/`neg` stream is open it holds the shared side of its graph role's
//! gate, which keeps compaction of that role out.

use crate::database::{GraphId, GraphRole};
use crate::error::{IoContext, Result, StorageError};
use crate::storage::index::sync_parent;
use crate::storage::layout::StoreLayout;
use crate::term::Triple;
use parking_lot::{ArcRwLockReadGuard, Mutex, RawRwLock, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Kind of delta a stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeltaClass {
    /// Assertions.
    Pos,
    /// Retractions.
    Neg,
    /// Checkpoint consolidation: the full triple set of a new checkpoint.
    Chk,
}

impl DeltaClass {
    pub fn as_str(self) -> &'static str {
        match self {
            DeltaClass::Pos => "pos",
            DeltaClass::Neg => "neg",
            DeltaClass::Chk => "chk",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pos" => Some(DeltaClass::Pos),
            "neg" => Some(DeltaClass::Neg),
            "chk" => Some(DeltaClass::Chk),
            _ => None,
        }
    }
}

/// Storage format of a stream. Only [`StorageFormat::Text`] is writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageFormat {
    /// Canonical one-statement-per-line text.
    Text,
    /// Compressed, read-optimized index snapshot.
    Index,
    /// Reserved; not implemented for live writes.
    Binary,
}

impl StorageFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageFormat::Text => "text",
            StorageFormat::Index => "index",
            StorageFormat::Binary => "binary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub graph: GraphId,
    pub class: DeltaClass,
    pub format: StorageFormat,
}

impl StreamKey {
    pub fn new(graph: GraphId, class: DeltaClass, format: StorageFormat) -> Self {
        Self {
            graph,
            class,
            format,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.graph,
            self.class.as_str(),
            self.format.as_str()
        )
    }
}

/// Where an open stream writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTarget {
    /// Base checkpoint for `pos`/`neg`; the checkpoint being written for `chk`.
    pub checkpoint: u64,
    /// Journal layer for `pos`/`neg`; `None` for `chk`.
    pub layer: Option<u64>,
}

/// Per-`(database, role)` reader/writer gates.
///
/// Open `pos`/`neg` streams hold the read side; compaction and layout
/// deletion take the write side.
#[derive(Debug, Default)]
pub struct RoleGates {
    gates: Mutex<HashMap<(String, GraphRole), Arc<RwLock<()>>>>,
}

impl RoleGates {
    pub fn gate(&self, database: &str, role: GraphRole) -> Arc<RwLock<()>> {
        let mut gates = self.gates.lock();
        Arc::clone(
            gates
                .entry((database.to_string(), role))
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        )
    }

    /// Forget the gates of `database` that nobody holds any more.
    pub fn release(&self, database: &str) {
        self.gates
            .lock()
            .retain(|(db, _), gate| db != database || Arc::strong_count(gate) > 1);
    }

    pub fn len(&self) -> usize {
        self.gates.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.lock().is_empty()
    }
}

struct Stream {
    current: Mutex<StreamFile>,
}

struct StreamFile {
    path: PathBuf,
    target: StreamTarget,
    file: File,
}

impl Stream {
    fn new(path: PathBuf, target: StreamTarget, file: File) -> Self {
        Self {
            current: Mutex::new(StreamFile { path, target, file }),
        }
    }

    fn write(&self, buf: &[u8], sync: bool) -> Result<()> {
        let mut guard = self.current.lock();
        let current = &mut *guard;
        current.file.write_all(buf).at(&current.path)?;
        if sync {
            current.file.sync_data().at(&current.path)?;
        }
        Ok(())
    }

    fn target(&self) -> StreamTarget {
        self.current.lock().target
    }

    /// Flush the current file and continue writing into `path`.
    fn move_to(&self, path: PathBuf, target: StreamTarget) -> Result<()> {
        let mut guard = self.current.lock();
        let current = &mut *guard;
        current.file.sync_all().at(&current.path)?;
        current.file = open_file(&path, false)?;
        current.path = path;
        current.target = target;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let current = self.current.lock();
        current.file.sync_all().at(&current.path)
    }
}

struct OpenLayer {
    checkpoint: u64,
    layer: u64,
    open_streams: usize,
    /// A `pos` record went into this layer; the next `neg` record starts a new one.
    pos_written: bool,
    /// Shared side of the role gate, held until the layer is sealed.
    _gate: Option<ArcRwLockReadGuard<RawRwLock, ()>>,
}

#[derive(Default)]
struct Registry {
    streams: HashMap<StreamKey, Arc<Stream>>,
    layers: HashMap<GraphId, OpenLayer>,
}

/// Owns every open journal stream of a store.
pub struct JournalWriter {
    layout: StoreLayout,
    gates: Arc<RoleGates>,
    sync_on_append: bool,
    registry: Mutex<Registry>,
}

impl JournalWriter {
    pub fn new(layout: StoreLayout, gates: Arc<RoleGates>, sync_on_append: bool) -> Self {
        Self {
            layout,
            gates,
            sync_on_append,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Register a stream and open its file.
    ///
    /// Fails with [`StorageError::StreamAlreadyOpen`] if the key is taken and
    /// with [`StorageError::UnsupportedFormat`] for any non-text format.
    /// A `pos`/`neg` open blocks while the graph role is being compacted.
    pub fn open_stream(
        &self,
        graph: &GraphId,
        class: DeltaClass,
        format: StorageFormat,
    ) -> Result<StreamGuard<'_>> {
        if format != StorageFormat::Text {
            return Err(StorageError::UnsupportedFormat {
                graph: graph.to_string(),
                format: format.as_str().to_string(),
            });
        }
        let (database, role) = graph.split()?;
        let key = StreamKey::new(graph.clone(), class, format);

        // The first pos/neg stream of a graph takes the role gate for its
        // layer. It is acquired without the registry lock held, since
        // compaction holds the write side while opening its `chk` stream.
        let mut gate = None;
        let mut registry = loop {
            let registry = self.registry.lock();
            if class == DeltaClass::Chk || gate.is_some() || registry.layers.contains_key(graph) {
                break registry;
            }
            drop(registry);
            gate = Some(self.gates.gate(database, role).read_arc());
        };
        if registry.streams.contains_key(&key) {
            return Err(StorageError::StreamAlreadyOpen {
                key: key.to_string(),
            });
        }

        let (path, target, create_new) = match class {
            DeltaClass::Chk => {
                let files = self.layout.scan_role(database, role)?;
                let checkpoint = files.highest_checkpoint_seen() + 1;
                let path = self.layout.checkpoint_text(database, role, checkpoint);
                (path, StreamTarget { checkpoint, layer: None }, true)
            }
            DeltaClass::Pos | DeltaClass::Neg => {
                let (checkpoint, layer) = match registry.layers.get(graph) {
                    Some(open) => (open.checkpoint, open.layer),
                    None => {
                        let files = self.layout.scan_role(database, role)?;
                        let checkpoint = files.latest_checkpoint();
                        let layer = files.layers_after(checkpoint).last().copied().unwrap_or(0) + 1;
                        (checkpoint, layer)
                    }
                };
                let path = self
                    .layout
                    .journal(database, role, checkpoint, layer, class);
                let target = StreamTarget {
                    checkpoint,
                    layer: Some(layer),
                };
                (path, target, false)
            }
        };

        let file = open_file(&path, create_new)?;
        if let Some(layer) = target.layer {
            let open = registry.layers.entry(graph.clone()).or_insert_with(|| OpenLayer {
                checkpoint: target.checkpoint,
                layer,
                open_streams: 0,
                pos_written: false,
                _gate: gate.take(),
            });
            open.open_streams += 1;
        }
        registry
            .streams
            .insert(key.clone(), Arc::new(Stream::new(path.clone(), target, file)));
        tracing::debug!("Opened stream {} at {:?}", key, path);

        Ok(StreamGuard {
            writer: self,
            key: Some(key),
            target,
        })
    }

    /// Append one statement to the open text stream for `(graph, class)`.
    ///
    /// Fails with [`StorageError::InvalidTerm`] before anything is written if
    /// the statement cannot be encoded.
    pub fn append_triple(&self, graph: &GraphId, class: DeltaClass, triple: &Triple) -> Result<()> {
        check_encodable(graph, triple)?;
        let record = triple.to_record();
        self.stream_for_append(graph, class)?
            .write(record.as_bytes(), self.sync_on_append)
    }

    /// Append several statements with a single write.
    pub fn append_triples<'t>(
        &self,
        graph: &GraphId,
        class: DeltaClass,
        triples: impl IntoIterator<Item = &'t Triple>,
    ) -> Result<()> {
        let mut buf = String::new();
        for triple in triples {
            check_encodable(graph, triple)?;
            buf.push_str(&triple.to_record());
        }
        if buf.is_empty() {
            return Ok(());
        }
        self.stream_for_append(graph, class)?
            .write(buf.as_bytes(), self.sync_on_append)
    }

    /// Flush and release a stream. Closing an unregistered key is a no-op.
    ///
    /// The registration is removed even when the final flush fails.
    pub fn close_stream(
        &self,
        graph: &GraphId,
        class: DeltaClass,
        format: StorageFormat,
    ) -> Result<()> {
        let key = StreamKey::new(graph.clone(), class, format);
        let stream = {
            let mut registry = self.registry.lock();
            let Some(stream) = registry.streams.remove(&key) else {
                return Ok(());
            };
            if class != DeltaClass::Chk {
                if let Some(open) = registry.layers.get_mut(graph) {
                    open.open_streams -= 1;
                    if open.open_streams == 0 {
                        registry.layers.remove(graph);
                    }
                }
            }
            stream
        };
        tracing::debug!("Closing stream {}", key);
        stream.sync()
    }

    pub fn is_open(&self, graph: &GraphId, class: DeltaClass, format: StorageFormat) -> bool {
        self.registry
            .lock()
            .streams
            .contains_key(&StreamKey::new(graph.clone(), class, format))
    }

    pub fn open_stream_count(&self) -> usize {
        self.registry.lock().streams.len()
    }

    fn current_target(&self, key: &StreamKey) -> Option<StreamTarget> {
        self.registry.lock().streams.get(key).map(|s| s.target())
    }

    /// Look up the stream for an append and keep the layer in append order:
    /// a `neg` record after a `pos` record of the same layer moves every
    /// open stream of the graph into the next layer first.
    fn stream_for_append(&self, graph: &GraphId, class: DeltaClass) -> Result<Arc<Stream>> {
        let key = StreamKey::new(graph.clone(), class, StorageFormat::Text);
        let mut registry = self.registry.lock();
        let Registry { streams, layers } = &mut *registry;
        let stream = streams
            .get(&key)
            .cloned()
            .ok_or_else(|| StorageError::StreamNotOpen {
                key: key.to_string(),
            })?;
        let Some(open) = layers.get_mut(graph) else {
            return Ok(stream);
        };
        match class {
            DeltaClass::Pos => open.pos_written = true,
            DeltaClass::Neg if open.pos_written => {
                let (database, role) = graph.split()?;
                open.layer += 1;
                open.pos_written = false;
                let target = StreamTarget {
                    checkpoint: open.checkpoint,
                    layer: Some(open.layer),
                };
                for other in [DeltaClass::Neg, DeltaClass::Pos] {
                    let other_key = StreamKey::new(graph.clone(), other, StorageFormat::Text);
                    if let Some(s) = streams.get(&other_key) {
                        let path = self
                            .layout
                            .journal(database, role, open.checkpoint, open.layer, other);
                        s.move_to(path, target)?;
                    }
                }
                tracing::debug!("Graph {} moved to journal layer {}", graph, open.layer);
            }
            _ => {}
        }
        Ok(stream)
    }
}

fn check_encodable(graph: &GraphId, triple: &Triple) -> Result<()> {
    triple.validate().map_err(|reason| StorageError::InvalidTerm {
        graph: graph.to_string(),
        reason,
    })
}

/// Open a stream file. A newly created file or directory is made durable
/// by syncing the directory that holds it.
fn open_file(path: &Path, create_new: bool) -> Result<File> {
    let existed = path.exists();
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).at(parent)?;
            sync_parent(parent)?;
        }
    }
    let mut opts = OpenOptions::new();
    if create_new {
        opts.write(true).create_new(true);
    } else {
        opts.create(true).append(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let file = opts.open(path).at(path)?;
    if !existed {
        sync_parent(path)?;
    }
    Ok(file)
}

/// An open stream. Closes the stream on drop; call [`StreamGuard::close`]
/// to observe flush errors.
pub struct StreamGuard<'a> {
    writer: &'a JournalWriter,
    key: Option<StreamKey>,
    target: StreamTarget,
}

impl StreamGuard<'_> {
    /// Where the stream writes now; a layer move changes it.
    pub fn target(&self) -> StreamTarget {
        self.key
            .as_ref()
            .and_then(|key| self.writer.current_target(key))
            .unwrap_or(self.target)
    }

    pub fn append(&self, triple: &Triple) -> Result<()> {
        let key = self.key()?;
        self.writer.append_triple(&key.graph, key.class, triple)
    }

    pub fn append_all<'t>(&self, triples: impl IntoIterator<Item = &'t Triple>) -> Result<()> {
        let key = self.key()?;
        self.writer.append_triples(&key.graph, key.class, triples)
    }

    pub fn close(mut self) -> Result<()> {
        match self.key.take() {
            Some(key) => self.writer.close_stream(&key.graph, key.class, key.format),
            None => Ok(()),
        }
    }

    fn key(&self) -> Result<&StreamKey> {
        self.key.as_ref().ok_or_else(|| StorageError::StreamNotOpen {
            key: "<closed guard>".to_string(),
        })
    }
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            if let Err(e) = self.writer.close_stream(&key.graph, key.class, key.format) {
                tracing::warn!("Failed to close stream {} on drop: {}", key, e);
            }
        }
    }
}

/// Diagnostics from reading one record file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadStats {
    pub records: usize,
    /// The file ended in an incomplete record, which was ignored.
    pub truncated: bool,
}

/// Read every complete record of a text file, in file order.
///
/// A missing file reads as empty. A trailing line without its terminator is
/// an interrupted append and is skipped with a warning; any other line that
/// does not parse is [`StorageError::CorruptRecord`].
pub fn read_records(path: &Path) -> Result<(Vec<Triple>, ReadStats)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok((Vec::new(), ReadStats::default()))
        }
        Err(e) => return Err(StorageError::io(path, e)),
    };
    let mut reader = BufReader::new(file);
    let mut triples = Vec::new();
    let mut stats = ReadStats::default();
    let mut line = String::new();
    let mut line_no = 0;
    loop {
        line.clear();
        if reader.read_line(&mut line).at(path)? == 0 {
            break;
        }
        line_no += 1;
        if !line.ends_with('\n') {
            tracing::warn!("{:?} ends in an incomplete record, ignoring it", path);
            stats.truncated = true;
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let triple = Triple::parse_record(&line).map_err(|reason| StorageError::CorruptRecord {
            path: path.to_path_buf(),
            line: line_no,
            reason,
        })?;
        triples.push(triple);
        stats.records += 1;
    }
    Ok((triples, stats))
}
