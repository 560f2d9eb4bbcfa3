//! Filesystem type registry and mount resolution.

use crate::fat::FatFsType;
use crate::fs::FileSystem;
use crate::hfsplus::HfsPlusType;
use pfs_block::{BlockDevice, PartitionDevice, read_probe_region};
use pfs_error::{PfsError, Result};
use pfs_partition::{PROBE_LEN, PartitionTable, PartitionTableEntry, PartitionTableRegistry};
use pfs_types::SectorNumber;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Options applied when instantiating a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    pub read_only: bool,
    /// B-tree nodes kept per tree.
    pub node_cache_capacity: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: true,
            node_cache_capacity: 64,
        }
    }
}

/// A filesystem format the registry can recognize and mount.
pub trait FileSystemType: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bytes from the start of the device that `supports` needs.
    fn probe_len(&self) -> usize;

    /// Signature check. Must not mutate the device.
    fn supports(&self, probe: &[u8], device: &dyn BlockDevice) -> bool;

    fn create(
        &self,
        device: Arc<dyn BlockDevice>,
        options: &MountOptions,
    ) -> Result<Box<dyn FileSystem>>;
}

impl fmt::Debug for dyn FileSystemType + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystemType")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// One usable region of a scanned device and what was found on it.
pub struct Volume {
    /// `None` when the device carries no partition table.
    pub partition: Option<PartitionTableEntry>,
    pub filesystem: Result<Box<dyn FileSystem>>,
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("partition", &self.partition)
            .field("filesystem", &self.filesystem.as_ref().map(|fs| fs.type_name()))
            .finish()
    }
}

/// Serializable summary of a [`Volume`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub partition_index: Option<usize>,
    pub start_sector: u64,
    pub sector_count: Option<u64>,
    pub partition_type: Option<String>,
    pub filesystem: Option<String>,
    pub volume_name: Option<String>,
    pub total_space: Option<u64>,
    pub free_space: Option<u64>,
    pub error: Option<String>,
}

impl Volume {
    #[must_use]
    pub fn info(&self) -> VolumeInfo {
        let mut info = VolumeInfo {
            partition_index: self.partition.as_ref().map(|p| p.index),
            start_sector: self.partition.as_ref().map_or(0, |p| p.start_sector),
            sector_count: self.partition.as_ref().map(|p| p.sector_count),
            partition_type: self.partition.as_ref().map(|p| p.type_tag.to_string()),
            filesystem: None,
            volume_name: None,
            total_space: None,
            free_space: None,
            error: None,
        };
        match &self.filesystem {
            Ok(fs) => {
                info.filesystem = Some(fs.type_name().to_owned());
                info.volume_name = Some(fs.volume_name());
                info.total_space = Some(fs.total_space());
                match fs.free_space() {
                    Ok(free) => info.free_space = Some(free),
                    Err(err) => info.error = Some(err.to_string()),
                }
            }
            Err(err) => info.error = Some(err.to_string()),
        }
        info
    }
}

/// Ordered set of filesystem types plus the partition table registry used
/// by [`FileSystemRegistry::scan`].
pub struct FileSystemRegistry {
    types: Vec<Box<dyn FileSystemType>>,
    partitions: PartitionTableRegistry,
}

impl fmt::Debug for FileSystemRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystemRegistry")
            .field("types", &self.names())
            .field("partitions", &self.partitions)
            .finish()
    }
}

impl Default for FileSystemRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl FileSystemRegistry {
    /// No filesystem types; default partition tables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            types: Vec::new(),
            partitions: PartitionTableRegistry::with_defaults(),
        }
    }

    /// HFS+ and FAT.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            types: vec![Box::new(HfsPlusType), Box::new(FatFsType)],
            partitions: PartitionTableRegistry::with_defaults(),
        }
    }

    #[must_use]
    pub fn with_partition_tables(mut self, partitions: PartitionTableRegistry) -> Self {
        self.partitions = partitions;
        self
    }

    #[must_use]
    pub fn partition_tables(&self) -> &PartitionTableRegistry {
        &self.partitions
    }

    pub fn register(&mut self, fs_type: Box<dyn FileSystemType>) -> Result<()> {
        if self.types.iter().any(|t| t.name() == fs_type.name()) {
            return Err(PfsError::Config(format!(
                "filesystem type '{}' already registered",
                fs_type.name()
            )));
        }
        self.types.push(fs_type);
        Ok(())
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.types.iter().map(|t| t.name()).collect()
    }

    /// The single registered type that claims `device`.
    pub fn resolve(&self, device: &dyn BlockDevice) -> Result<&dyn FileSystemType> {
        let probe_len = self
            .types
            .iter()
            .map(|t| t.probe_len())
            .max()
            .unwrap_or(0)
            .min(PROBE_LEN);
        let probe = read_probe_region(device, probe_len)?;
        let matches: Vec<&dyn FileSystemType> = self
            .types
            .iter()
            .filter(|t| t.supports(&probe, device))
            .map(AsRef::as_ref)
            .collect();
        match matches.as_slice() {
            [] => {
                debug!(probed = probe.len(), "no filesystem type matched");
                Err(PfsError::UnsupportedFormat(format!(
                    "no registered filesystem matched {} probe bytes",
                    probe.len()
                )))
            }
            [only] => {
                debug!(fs = only.name(), "filesystem type matched");
                Ok(*only)
            }
            many => Err(PfsError::AmbiguousFormat {
                candidates: many.iter().map(|t| t.name().to_owned()).collect(),
            }),
        }
    }

    /// Resolve the filesystem inside one partition. Returns the type and the
    /// partition window to mount it on.
    pub fn resolve_partition(
        &self,
        device: &Arc<dyn BlockDevice>,
        entry: &PartitionTableEntry,
    ) -> Result<(&dyn FileSystemType, Arc<dyn BlockDevice>)> {
        if entry.has_child_table() {
            return Err(PfsError::InvalidPartition(format!(
                "partition {} holds a nested partition table",
                entry.index
            )));
        }
        let window: Arc<dyn BlockDevice> = Arc::new(PartitionDevice::new(
            Arc::clone(device),
            SectorNumber(entry.start_sector),
            entry.sector_count,
        )?);
        let fs_type = self.resolve(window.as_ref())?;
        Ok((fs_type, window))
    }

    /// Instantiate `fs_type` on `device`. The device is never written.
    pub fn mount(
        &self,
        fs_type: &dyn FileSystemType,
        device: Arc<dyn BlockDevice>,
        options: &MountOptions,
    ) -> Result<Box<dyn FileSystem>> {
        if options.node_cache_capacity == 0 {
            return Err(PfsError::Config("node_cache_capacity must be non-zero".into()));
        }
        if !options.read_only && device.is_read_only() {
            return Err(PfsError::ReadOnly);
        }
        debug!(fs = fs_type.name(), read_only = options.read_only, "mounting");
        fs_type.create(device, options)
    }

    /// Resolve and mount a whole, unpartitioned device.
    pub fn open(
        &self,
        device: Arc<dyn BlockDevice>,
        options: &MountOptions,
    ) -> Result<Box<dyn FileSystem>> {
        let fs_type = self.resolve(device.as_ref())?;
        self.mount(fs_type, device, options)
    }

    /// Detect the partition table and mount every data partition, or the
    /// whole device when there is no table. Per-partition failures are
    /// attached to their [`Volume`]; only table detection errors abort.
    pub fn scan(&self, device: Arc<dyn BlockDevice>, options: &MountOptions) -> Result<Vec<Volume>> {
        let Some(table) = self.partitions.detect(device.as_ref())? else {
            return Ok(vec![Volume {
                partition: None,
                filesystem: self.open(device, options),
            }]);
        };
        Ok(self.scan_table(&device, &table, options))
    }

    fn scan_table(
        &self,
        device: &Arc<dyn BlockDevice>,
        table: &PartitionTable,
        options: &MountOptions,
    ) -> Vec<Volume> {
        table
            .data_partitions()
            .into_iter()
            .map(|entry| {
                let filesystem = self
                    .resolve_partition(device, entry)
                    .and_then(|(fs_type, window)| self.mount(fs_type, window, options));
                if let Err(err) = &filesystem {
                    warn!(partition = entry.index, start = entry.start_sector, %err, "partition not mounted");
                }
                Volume {
                    partition: Some(entry.clone()),
                    filesystem,
                }
            })
            .collect()
    }
}
