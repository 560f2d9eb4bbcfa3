//! The mounted-filesystem surface and path resolution.

use crate::entry::{EntrySlot, EntryTree, FsEntry, NameRule, VolumeReader};
use parking_lot::Mutex;
use pfs_block::BlockDevice;
use pfs_error::{PfsError, Result};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A mounted filesystem.
pub trait FileSystem: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn volume_name(&self) -> String;

    fn total_space(&self) -> u64;

    fn free_space(&self) -> Result<u64>;

    fn usable_space(&self) -> Result<u64>;

    fn root_entry(&self) -> FsEntry;

    fn list_entries(&self, dir: &FsEntry) -> Result<Vec<EntrySlot>>;

    /// Up to `len` bytes at `offset`; short or empty at end of file.
    fn read(&self, file: &FsEntry, offset: u64, len: usize) -> Result<Vec<u8>>;

    fn name_rule(&self) -> NameRule;

    fn is_read_only(&self) -> bool;

    fn flush(&self) -> Result<()>;
}

impl fmt::Debug for dyn FileSystem + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystem")
            .field("type", &self.type_name())
            .field("volume", &self.volume_name())
            .finish_non_exhaustive()
    }
}

impl dyn FileSystem + '_ {
    pub fn directory(&self, entry: &FsEntry) -> Result<FsDirectory<'_>> {
        if !entry.is_directory() {
            return Err(PfsError::NotDirectory);
        }
        Ok(FsDirectory {
            fs: self,
            entry: entry.clone(),
        })
    }

    pub fn file(&self, entry: &FsEntry) -> Result<FsFile<'_>> {
        if entry.is_directory() {
            return Err(PfsError::IsDirectory);
        }
        Ok(FsFile {
            fs: self,
            entry: entry.clone(),
        })
    }

    #[must_use]
    pub fn root_directory(&self) -> FsDirectory<'_> {
        FsDirectory {
            fs: self,
            entry: self.root_entry(),
        }
    }

    /// Resolve a '/'-separated path from the root.
    ///
    /// Empty components and "." are skipped. ".." is never resolvable
    /// because entries hold no parent links.
    pub fn resolve_path(&self, path: &str) -> Result<FsEntry> {
        let mut current = self.root_entry();
        for component in path.split('/') {
            if component.is_empty() || component == "." {
                continue;
            }
            if component == ".." {
                return Err(PfsError::NotFound(format!("{path}: parent references are not supported")));
            }
            let dir = self.directory(&current)?;
            current = dir
                .entry(component)?
                .ok_or_else(|| PfsError::NotFound(path.to_owned()))?;
        }
        Ok(current)
    }
}

/// Directory view over a mounted filesystem.
#[derive(Debug)]
pub struct FsDirectory<'a> {
    fs: &'a dyn FileSystem,
    entry: FsEntry,
}

impl FsDirectory<'_> {
    #[must_use]
    pub fn as_entry(&self) -> &FsEntry {
        &self.entry
    }

    pub fn list_entries(&self) -> Result<Vec<EntrySlot>> {
        self.fs.list_entries(&self.entry)
    }

    /// First decodable child whose name matches under the filesystem's
    /// name rule.
    pub fn entry(&self, name: &str) -> Result<Option<FsEntry>> {
        let rule = self.fs.name_rule();
        Ok(self
            .list_entries()?
            .into_iter()
            .find_map(|slot| match slot {
                EntrySlot::Entry(entry) if rule.matches(entry.name(), name) => Some(entry),
                _ => None,
            }))
    }
}

/// File view over a mounted filesystem.
#[derive(Debug)]
pub struct FsFile<'a> {
    fs: &'a dyn FileSystem,
    entry: FsEntry,
}

impl FsFile<'_> {
    #[must_use]
    pub fn as_entry(&self) -> &FsEntry {
        &self.entry
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.entry.length()
    }

    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.fs.read(&self.entry, offset, len)
    }

    pub fn read_to_end(&self) -> Result<Vec<u8>> {
        let len = usize::try_from(self.entry.length()).map_err(|_| {
            PfsError::Format(format!("file of {} bytes exceeds memory", self.entry.length()))
        })?;
        self.read(0, len)
    }
}

/// A [`FileSystem`] over an [`EntryTree`].
///
/// `flush` and any future structural change serialize on `write_gate`;
/// reads never take it.
pub struct TreeFileSystem<R: VolumeReader> {
    device: Arc<dyn BlockDevice>,
    tree: EntryTree<R>,
    read_only: bool,
    write_gate: Mutex<()>,
}

impl<R: VolumeReader> fmt::Debug for TreeFileSystem<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeFileSystem")
            .field("tree", &self.tree)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl<R: VolumeReader> TreeFileSystem<R> {
    pub fn new(device: Arc<dyn BlockDevice>, reader: R, read_only: bool) -> Result<Self> {
        let tree = EntryTree::new(reader)?;
        debug!(
            fs = tree.reader().type_name(),
            volume = %tree.reader().volume_name(),
            read_only,
            "mounted"
        );
        Ok(Self {
            read_only: read_only || device.is_read_only(),
            device,
            tree,
            write_gate: Mutex::new(()),
        })
    }

    pub fn tree(&self) -> &EntryTree<R> {
        &self.tree
    }
}

impl<R: VolumeReader> FileSystem for TreeFileSystem<R> {
    fn type_name(&self) -> &'static str {
        self.tree.reader().type_name()
    }

    fn volume_name(&self) -> String {
        self.tree.reader().volume_name()
    }

    fn total_space(&self) -> u64 {
        self.tree.reader().total_space()
    }

    fn free_space(&self) -> Result<u64> {
        self.tree.reader().free_space()
    }

    fn usable_space(&self) -> Result<u64> {
        self.tree.reader().usable_space()
    }

    fn root_entry(&self) -> FsEntry {
        self.tree.root().clone()
    }

    fn list_entries(&self, dir: &FsEntry) -> Result<Vec<EntrySlot>> {
        Ok(self.tree.list(dir)?.to_vec())
    }

    fn read(&self, file: &FsEntry, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.tree.read(file, offset, len)
    }

    fn name_rule(&self) -> NameRule {
        self.tree.reader().name_rule()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn flush(&self) -> Result<()> {
        let _gate = self.write_gate.lock();
        if self.read_only {
            return Ok(());
        }
        self.device.sync()
    }
}
