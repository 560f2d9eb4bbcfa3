#![forbid(unsafe_code)]
//! Partition table detection.
//!
//! A [`PartitionTableRegistry`] holds table types in priority order and
//! returns the first one that claims the start of a device. GPT is tried
//! before MBR because every GPT disk also carries a protective MBR.
//!
//! Detected tables are plain values: entries are never re-read after
//! detection and extended MBR chains are materialized as nested
//! [`PartitionTable`]s hanging off the entry that points at them.

pub mod gpt;
pub mod mbr;

use pfs_block::{BlockDevice, read_probe_region};
use pfs_error::{PfsError, Result};
use pfs_types::Guid;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

pub use gpt::{GptEntry, GptHeader, GptLayout, GptPartitionTableType, gpt_type_name};
pub use mbr::{MbrEntry, MbrLayout, MbrPartitionTableType, contains_partition_table, mbr_type_name};

/// Bytes read from the start of a device for detection.
pub const PROBE_LEN: usize = 16 * 1024;

/// Deepest chain of nested tables (extended boot records) followed before
/// the chain is treated as corrupt.
pub const MAX_TABLE_NESTING: usize = 64;

/// Partition type tag as stored in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionType {
    Mbr(u8),
    Gpt(Guid),
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mbr(tag) => write!(f, "0x{tag:02X} ({})", mbr_type_name(*tag)),
            Self::Gpt(guid) => match gpt_type_name(guid) {
                Some(name) => write!(f, "{guid} ({name})"),
                None => write!(f, "{guid}"),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableKind {
    Mbr,
    /// Extended boot record inside an MBR extended partition.
    MbrExtended,
    Gpt,
}

/// One usable partition. Sector values are absolute on the device the
/// table was detected on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTableEntry {
    /// Slot within the table that holds the entry.
    pub index: usize,
    pub start_sector: u64,
    pub sector_count: u64,
    pub type_tag: PartitionType,
    pub boot_flag: bool,
    /// GPT partition name; `None` for MBR entries.
    pub name: Option<String>,
    /// Table stored at the start of this partition (MBR extended types).
    pub child_table: Option<Box<PartitionTable>>,
}

impl PartitionTableEntry {
    /// First sector past the partition.
    #[must_use]
    pub fn end_sector(&self) -> u64 {
        self.start_sector.saturating_add(self.sector_count)
    }

    #[must_use]
    pub fn has_child_table(&self) -> bool {
        self.child_table.is_some()
    }
}

/// An entry that was present in the table but cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidEntry {
    pub index: usize,
    pub start_sector: u64,
    pub sector_count: u64,
    pub type_tag: PartitionType,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTable {
    pub kind: TableKind,
    /// Usable entries in table order.
    pub entries: Vec<PartitionTableEntry>,
    pub invalid: Vec<InvalidEntry>,
}

impl PartitionTable {
    #[must_use]
    pub fn new(kind: TableKind) -> Self {
        Self {
            kind,
            entries: Vec::new(),
            invalid: Vec::new(),
        }
    }

    /// Partitions that can hold a filesystem, depth first in table order.
    /// Entries that only carry a nested table are replaced by that table's
    /// data partitions.
    #[must_use]
    pub fn data_partitions(&self) -> Vec<&PartitionTableEntry> {
        let mut out = Vec::new();
        self.collect_data(&mut out);
        out
    }

    fn collect_data<'a>(&'a self, out: &mut Vec<&'a PartitionTableEntry>) {
        for entry in &self.entries {
            match &entry.child_table {
                Some(child) => child.collect_data(out),
                None => out.push(entry),
            }
        }
    }

    /// Invalid entries of this table and every nested table.
    #[must_use]
    pub fn all_invalid(&self) -> Vec<&InvalidEntry> {
        let mut out: Vec<&InvalidEntry> = self.invalid.iter().collect();
        for entry in &self.entries {
            if let Some(child) = &entry.child_table {
                out.extend(child.all_invalid());
            }
        }
        out
    }
}

/// A partition table format.
pub trait PartitionTableType: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap signature check on the first bytes of the device.
    fn supports(&self, first_bytes: &[u8]) -> bool;

    /// Decode the table. Only called after `supports` returned true.
    fn create(&self, first_bytes: &[u8], device: &dyn BlockDevice) -> Result<PartitionTable>;
}

/// Ordered set of partition table types.
pub struct PartitionTableRegistry {
    types: Vec<Box<dyn PartitionTableType>>,
}

impl fmt::Debug for PartitionTableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionTableRegistry")
            .field("types", &self.names())
            .finish()
    }
}

impl Default for PartitionTableRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PartitionTableRegistry {
    /// An empty registry; nothing is ever detected.
    #[must_use]
    pub fn new() -> Self {
        Self { types: Vec::new() }
    }

    /// GPT, then MBR.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            types: vec![Box::new(GptPartitionTableType), Box::new(MbrPartitionTableType)],
        }
    }

    /// Append a type at the lowest priority.
    pub fn register(&mut self, table_type: Box<dyn PartitionTableType>) -> Result<()> {
        if self.types.iter().any(|t| t.name() == table_type.name()) {
            return Err(PfsError::Config(format!(
                "partition table type '{}' already registered",
                table_type.name()
            )));
        }
        self.types.push(table_type);
        Ok(())
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.types.iter().map(|t| t.name()).collect()
    }

    /// First registered type that claims `first_bytes`.
    #[must_use]
    pub fn find(&self, first_bytes: &[u8]) -> Option<&dyn PartitionTableType> {
        self.types
            .iter()
            .find(|t| t.supports(first_bytes))
            .map(AsRef::as_ref)
    }

    /// Detect and decode the partition table of `device`.
    ///
    /// Returns `Ok(None)` for an unpartitioned device.
    pub fn detect(&self, device: &dyn BlockDevice) -> Result<Option<PartitionTable>> {
        let first_bytes = read_probe_region(device, PROBE_LEN)?;
        let Some(table_type) = self.find(&first_bytes) else {
            debug!(len = first_bytes.len(), "no partition table detected");
            return Ok(None);
        };
        debug!(table = table_type.name(), "partition table detected");
        table_type.create(&first_bytes, device).map(Some)
    }
}

/// Copy `(sector, bytes)` pairs produced by a table serializer into a disk
/// image.
pub fn write_sectors(image: &mut [u8], sector_size: u32, sectors: &[(u64, Vec<u8>)]) -> Result<()> {
    for (sector, bytes) in sectors {
        let start = sector
            .checked_mul(u64::from(sector_size))
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| PfsError::Format(format!("sector {sector} offset overflow")))?;
        let end = start + bytes.len();
        let Some(dst) = image.get_mut(start..end) else {
            return Err(PfsError::OutOfRange(format!(
                "sector {sector} outside image of {} bytes",
                image.len()
            )));
        };
        dst.copy_from_slice(bytes);
    }
    Ok(())
}
