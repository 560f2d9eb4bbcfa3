#![forbid(unsafe_code)]
//! Filesystem registry, mount resolution and the mounted-filesystem API.
//!
//! A [`FileSystemRegistry`] holds [`FileSystemType`]s (HFS+ and FAT by
//! default) and resolves a device or partition to exactly one of them.
//! Mounted filesystems expose a lazily decoded [`EntryTree`] through the
//! [`FileSystem`] trait object.

pub mod entry;
pub mod fat;
pub mod fs;
pub mod hfsplus;
pub mod registry;

use pfs_types::ParseError;

pub use entry::{
    DecodedEntry, DecodedSlot, EntryError, EntryId, EntryKind, EntryMeta, EntrySlot, EntryTree,
    FsEntry, NameRule, VolumeReader,
};
pub use fat::{FatFsType, FatLocator, FatReader};
pub use fs::{FileSystem, FsDirectory, FsFile, TreeFileSystem};
pub use hfsplus::{HfsLocator, HfsPlusReader, HfsPlusType};
pub use pfs_block::{
    BlockDevice, ByteDevice, FileByteDevice, MemoryByteDevice, PartitionDevice, SectorBlockDevice,
};
pub use pfs_error::{PfsError, Result};
pub use pfs_partition::{PartitionTable, PartitionTableEntry, PartitionTableRegistry};
pub use registry::{FileSystemRegistry, FileSystemType, MountOptions, Volume, VolumeInfo};

/// Attribute a decoding failure to the block (or node, or cluster) whose
/// bytes were being decoded.
#[must_use]
pub fn parse_to_pfs_error(block: u64, err: &ParseError) -> PfsError {
    PfsError::from_parse(block, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_map_by_kind() {
        let short = ParseError::OutOfRange {
            needed: 4,
            offset: 10,
            actual: 12,
        };
        assert!(matches!(parse_to_pfs_error(7, &short), PfsError::OutOfRange(_)));

        let magic = ParseError::InvalidMagic {
            expected: 0x482B,
            actual: 0,
        };
        match parse_to_pfs_error(2, &magic) {
            PfsError::Corruption { block, detail } => {
                assert_eq!(block, 2);
                assert!(detail.contains("magic"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
