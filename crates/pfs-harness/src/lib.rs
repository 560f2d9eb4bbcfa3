#![forbid(unsafe_code)]
//! Synthetic volume images and structure listings.
//!
//! The builders lay a [`TreeNode`] hierarchy out as an HFS+ or FAT volume,
//! optionally wrapped in an MBR or GPT disk. [`structure_listing`] walks a
//! mounted filesystem and prints one line per entry with a BLAKE3 digest of
//! each file, so two volumes storing the same tree in the same order produce
//! the same body.

pub mod disk;
pub mod fat_image;
pub mod hfs_image;

use anyhow::{Context, Result};
use pfs::{
    BlockDevice, EntrySlot, FileByteDevice, FileSystem, FileSystemRegistry, FsEntry,
    MemoryByteDevice, MountOptions, SectorBlockDevice, Volume,
};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Timestamp written on every entry by the builders: 2021-03-04 05:06:08 UTC.
pub const FIXTURE_TIME: i64 = 1_614_834_368;

/// A file tree to lay out on a fresh volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeNode {
    File { name: String, data: Vec<u8> },
    Directory { name: String, children: Vec<TreeNode> },
}

impl TreeNode {
    #[must_use]
    pub fn file(name: &str, data: impl Into<Vec<u8>>) -> Self {
        Self::File {
            name: name.to_owned(),
            data: data.into(),
        }
    }

    #[must_use]
    pub fn dir(name: &str, children: Vec<Self>) -> Self {
        Self::Directory {
            name: name.to_owned(),
            children,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::File { name, .. } | Self::Directory { name, .. } => name,
        }
    }
}

/// `dir1/test.txt`, `dir2/test.txt` and `test.txt`, 18 bytes each.
#[must_use]
pub fn sample_tree() -> Vec<TreeNode> {
    vec![
        TreeNode::dir("dir1", vec![TreeNode::file("test.txt", *b"dir1 test content\n")]),
        TreeNode::dir("dir2", vec![TreeNode::file("test.txt", *b"dir2 test content\n")]),
        TreeNode::file("test.txt", *b"root test content\n"),
    ]
}

/// Header line plus [`tree_listing`].
pub fn structure_listing(fs: &dyn FileSystem) -> Result<String> {
    let mut out = format!(
        "type: {} vol: {} total: {} free: {}\n",
        fs.type_name(),
        fs.volume_name(),
        fs.total_space(),
        fs.free_space().context("free space")?
    );
    out.push_str(&tree_listing(fs)?);
    Ok(out)
}

/// Deepest directory nesting [`tree_listing`] descends into.
pub const MAX_LISTING_DEPTH: usize = 256;

/// Every entry below the root, depth first, siblings in the order the
/// volume lists them.
///
/// Directories print as `name/`, files as `name; length; blake3`. Entries
/// that failed to decode print as `!name; error`, as does a directory that
/// is its own ancestor or lies deeper than [`MAX_LISTING_DEPTH`].
pub fn tree_listing(fs: &dyn FileSystem) -> Result<String> {
    let mut out = String::new();
    let root = fs.root_entry();
    let mut ancestors: Vec<u64> = root.node_id().into_iter().collect();
    list_into(fs, &root, 0, &mut ancestors, &mut out)?;
    Ok(out)
}

fn list_into(
    fs: &dyn FileSystem,
    dir: &FsEntry,
    depth: usize,
    ancestors: &mut Vec<u64>,
    out: &mut String,
) -> Result<()> {
    let slots = fs
        .list_entries(dir)
        .with_context(|| format!("listing {:?}", dir.name()))?;
    let indent = "  ".repeat(depth);
    for slot in slots {
        match slot {
            EntrySlot::Entry(entry) if entry.is_directory() => {
                let id = entry.node_id();
                if id.is_some_and(|id| ancestors.contains(&id)) {
                    debug!(name = entry.name(), ?id, "listing: directory cycle");
                    writeln!(out, "{indent}!{}; directory cycle", entry.name())?;
                    continue;
                }
                if depth + 1 >= MAX_LISTING_DEPTH {
                    writeln!(out, "{indent}!{}; directory nesting too deep", entry.name())?;
                    continue;
                }
                writeln!(out, "{indent}{}/", entry.name())?;
                ancestors.extend(id);
                list_into(fs, &entry, depth + 1, ancestors, out)?;
                if id.is_some() {
                    ancestors.pop();
                }
            }
            EntrySlot::Entry(entry) => {
                let data = fs
                    .file(&entry)?
                    .read_to_end()
                    .with_context(|| format!("reading {:?}", entry.name()))?;
                writeln!(
                    out,
                    "{indent}{}; {}; {}",
                    entry.name(),
                    entry.length(),
                    blake3::hash(&data).to_hex()
                )?;
            }
            EntrySlot::Error(err) => {
                writeln!(out, "{indent}!{}; {}", err.name, err.detail)?;
            }
        }
    }
    Ok(())
}

/// Scan an in-memory image with the default registry, read-only.
pub fn scan_bytes(image: Vec<u8>) -> Result<Vec<Volume>> {
    let device = SectorBlockDevice::new(MemoryByteDevice::read_only(image), 512)?;
    scan_device(Arc::new(device))
}

/// Scan an image file with the default registry, read-only.
pub fn scan_path(path: &Path) -> Result<Vec<Volume>> {
    let file = FileByteDevice::open_read_only(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let device = SectorBlockDevice::new(file, 512)?;
    scan_device(Arc::new(device))
}

fn scan_device(device: Arc<dyn BlockDevice>) -> Result<Vec<Volume>> {
    let registry = FileSystemRegistry::with_defaults();
    let volumes = registry
        .scan(device, &MountOptions::default())
        .context("scanning device")?;
    debug!(volumes = volumes.len(), "scan finished");
    Ok(volumes)
}
