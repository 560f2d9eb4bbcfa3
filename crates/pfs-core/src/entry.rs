//! Lazily materialized entry tree shared by every filesystem reader.
//!
//! Entries live in an arena and are addressed by [`EntryId`]. A directory
//! node caches its decoded children the first time it is listed; nothing
//! links back to a parent, so the tree holds no reference cycles.

use parking_lot::{Mutex, RwLock};
use pfs_error::{PfsError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{trace, warn};

/// Arena index of an entry within one mounted filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// How names are matched during lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameRule {
    CaseSensitive,
    CaseInsensitive,
}

impl NameRule {
    #[must_use]
    pub fn matches(self, a: &str, b: &str) -> bool {
        match self {
            Self::CaseSensitive => a == b,
            Self::CaseInsensitive => a
                .chars()
                .flat_map(char::to_lowercase)
                .eq(b.chars().flat_map(char::to_lowercase)),
        }
    }
}

/// Format-independent metadata. Timestamps are Unix seconds; `None` when
/// the format leaves them unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub name: String,
    pub kind: EntryKind,
    /// Bytes of file data; 0 for directories.
    pub length: u64,
    pub created: Option<i64>,
    pub modified: Option<i64>,
    pub accessed: Option<i64>,
    /// Identity of the entry on disk (FAT first cluster, HFS+ catalog node
    /// id). Two entries with the same id name the same object.
    pub node_id: Option<u64>,
}

impl EntryMeta {
    #[must_use]
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
            length: 0,
            created: None,
            modified: None,
            accessed: None,
            node_id: None,
        }
    }

    #[must_use]
    pub fn file(name: impl Into<String>, length: u64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            length,
            created: None,
            modified: None,
            accessed: None,
            node_id: None,
        }
    }
}

/// Handle to an entry plus a snapshot of its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    id: EntryId,
    meta: EntryMeta,
}

impl FsEntry {
    #[must_use]
    pub fn id(&self) -> EntryId {
        self.id
    }

    #[must_use]
    pub fn meta(&self) -> &EntryMeta {
        &self.meta
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    #[must_use]
    pub fn kind(&self) -> EntryKind {
        self.meta.kind
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.meta.kind == EntryKind::Directory
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.meta.kind == EntryKind::File
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.meta.length
    }

    #[must_use]
    pub fn created(&self) -> Option<i64> {
        self.meta.created
    }

    #[must_use]
    pub fn modified(&self) -> Option<i64> {
        self.meta.modified
    }

    #[must_use]
    pub fn accessed(&self) -> Option<i64> {
        self.meta.accessed
    }

    #[must_use]
    pub fn node_id(&self) -> Option<u64> {
        self.meta.node_id
    }
}

/// A directory child that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryError {
    /// Best-effort name; may be empty.
    pub name: String,
    pub detail: String,
}

impl fmt::Display for EntryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.detail)
        } else {
            write!(f, "{}: {}", self.name, self.detail)
        }
    }
}

/// One position in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySlot {
    Entry(FsEntry),
    Error(EntryError),
}

impl EntrySlot {
    #[must_use]
    pub fn entry(&self) -> Option<&FsEntry> {
        match self {
            Self::Entry(entry) => Some(entry),
            Self::Error(_) => None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Entry(entry) => entry.name(),
            Self::Error(err) => &err.name,
        }
    }
}

/// Output of a reader for one entry: metadata plus whatever the reader
/// needs to find the entry's data again.
#[derive(Debug, Clone)]
pub struct DecodedEntry<L> {
    pub meta: EntryMeta,
    pub locator: L,
}

pub type DecodedSlot<L> = std::result::Result<DecodedEntry<L>, EntryError>;

/// Per-format decoding behind an [`EntryTree`].
pub trait VolumeReader: Send + Sync {
    type Locator: Clone + fmt::Debug + Send + Sync + 'static;

    fn type_name(&self) -> &'static str;

    fn volume_name(&self) -> String;

    fn total_space(&self) -> u64;

    fn free_space(&self) -> Result<u64>;

    fn usable_space(&self) -> Result<u64> {
        self.free_space()
    }

    fn name_rule(&self) -> NameRule;

    fn root(&self) -> Result<DecodedEntry<Self::Locator>>;

    /// Children of a directory in on-disk order.
    fn children(&self, dir: &Self::Locator) -> Result<Vec<DecodedSlot<Self::Locator>>>;

    /// Read up to `len` bytes at `offset` of a file `length` bytes long.
    fn read(&self, file: &Self::Locator, length: u64, offset: u64, len: usize) -> Result<Vec<u8>>;
}

struct EntryNode<L> {
    meta: EntryMeta,
    locator: L,
    children: Mutex<Option<Arc<[EntrySlot]>>>,
}

impl<L> EntryNode<L> {
    fn new(decoded: DecodedEntry<L>) -> Self {
        Self {
            meta: decoded.meta,
            locator: decoded.locator,
            children: Mutex::new(None),
        }
    }
}

/// Arena of entries decoded so far, rooted at the volume root.
pub struct EntryTree<R: VolumeReader> {
    reader: R,
    nodes: RwLock<Vec<Arc<EntryNode<R::Locator>>>>,
    root: FsEntry,
}

impl<R: VolumeReader> fmt::Debug for EntryTree<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryTree")
            .field("type", &self.reader.type_name())
            .field("nodes", &self.nodes.read().len())
            .finish_non_exhaustive()
    }
}

impl<R: VolumeReader> EntryTree<R> {
    pub fn new(reader: R) -> Result<Self> {
        let root = reader.root()?;
        if root.meta.kind != EntryKind::Directory {
            return Err(PfsError::Format("volume root is not a directory".into()));
        }
        let root_entry = FsEntry {
            id: EntryId(0),
            meta: root.meta.clone(),
        };
        Ok(Self {
            reader,
            nodes: RwLock::new(vec![Arc::new(EntryNode::new(root))]),
            root: root_entry,
        })
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    #[must_use]
    pub fn root(&self) -> &FsEntry {
        &self.root
    }

    /// Entries materialized so far, the root included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    fn node(&self, id: EntryId) -> Result<Arc<EntryNode<R::Locator>>> {
        self.nodes
            .read()
            .get(id.0)
            .cloned()
            .ok_or_else(|| PfsError::NotFound(format!("entry {}", id.0)))
    }

    /// Children of `dir`, decoded on first call and cached afterwards.
    pub fn list(&self, dir: &FsEntry) -> Result<Arc<[EntrySlot]>> {
        let node = self.node(dir.id)?;
        if node.meta.kind != EntryKind::Directory {
            return Err(PfsError::NotDirectory);
        }
        if let Some(children) = node.children.lock().as_ref() {
            return Ok(Arc::clone(children));
        }

        let decoded = self.reader.children(&node.locator)?;
        trace!(dir = %node.meta.name, count = decoded.len(), "entry: decoded children");

        // Lock order is arena, then cache. The first lister to publish wins.
        let mut nodes = self.nodes.write();
        let mut guard = node.children.lock();
        if let Some(children) = guard.as_ref() {
            return Ok(Arc::clone(children));
        }
        let mut slots = Vec::with_capacity(decoded.len());
        for slot in decoded {
            match slot {
                Ok(child) => {
                    let id = EntryId(nodes.len());
                    slots.push(EntrySlot::Entry(FsEntry {
                        id,
                        meta: child.meta.clone(),
                    }));
                    nodes.push(Arc::new(EntryNode::new(child)));
                }
                Err(err) => {
                    warn!(dir = %node.meta.name, name = %err.name, detail = %err.detail, "entry: child failed to decode");
                    slots.push(EntrySlot::Error(err));
                }
            }
        }
        let slots: Arc<[EntrySlot]> = slots.into();
        *guard = Some(Arc::clone(&slots));
        Ok(slots)
    }

    /// Read file bytes. Directories fail with `IsDirectory`.
    pub fn read(&self, file: &FsEntry, offset: u64, len: usize) -> Result<Vec<u8>> {
        let node = self.node(file.id)?;
        if node.meta.kind == EntryKind::Directory {
            return Err(PfsError::IsDirectory);
        }
        self.reader.read(&node.locator, node.meta.length, offset, len)
    }
}
