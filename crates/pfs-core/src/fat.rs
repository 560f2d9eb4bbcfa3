//! FAT12/16/32 volumes.

use crate::entry::{DecodedEntry, DecodedSlot, EntryError, EntryMeta, NameRule, VolumeReader};
use crate::fs::{FileSystem, TreeFileSystem};
use crate::parse_to_pfs_error;
use crate::registry::{FileSystemType, MountOptions};
use parking_lot::Mutex;
use pfs_block::{BlockDevice, read_bytes};
use pfs_error::{PfsError, Result};
use pfs_extent::{ExtentMap, ExtentReader, SparsePolicy, extents_from_chain};
use pfs_ondisk::fat::{
    FatBootSector, FatEntry, FatGeometry, FatShortEntry, FatType, fat_datetime_to_unix,
    parse_directory, read_fat_entry,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Registry entry for FAT12, FAT16 and FAT32.
#[derive(Debug, Clone, Copy, Default)]
pub struct FatFsType;

impl FileSystemType for FatFsType {
    fn name(&self) -> &'static str {
        "fat"
    }

    fn probe_len(&self) -> usize {
        512
    }

    fn supports(&self, probe: &[u8], _device: &dyn BlockDevice) -> bool {
        probe
            .get(..512)
            .and_then(|sector| FatBootSector::parse(sector).ok())
            .is_some_and(|boot| boot.geometry().is_ok())
    }

    fn create(
        &self,
        device: Arc<dyn BlockDevice>,
        options: &MountOptions,
    ) -> Result<Box<dyn FileSystem>> {
        let reader = FatReader::open(Arc::clone(&device))?;
        Ok(Box::new(TreeFileSystem::new(device, reader, options.read_only)?))
    }
}

/// Where a FAT entry's data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatLocator {
    /// FAT12/16 root directory region.
    FixedRoot,
    Directory(u32),
    File(u32),
}

/// [`VolumeReader`] over a mounted FAT volume. The first allocation table
/// is loaded at mount.
pub struct FatReader {
    device: Arc<dyn BlockDevice>,
    boot: FatBootSector,
    geometry: FatGeometry,
    fat: Vec<u8>,
    free_clusters: Mutex<Option<u64>>,
}

impl fmt::Debug for FatReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FatReader")
            .field("geometry", &self.geometry)
            .field("label", &self.boot.label())
            .finish_non_exhaustive()
    }
}

impl FatReader {
    pub fn open(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let mut sector = [0_u8; 512];
        read_bytes(device.as_ref(), 0, &mut sector)?;
        let boot = FatBootSector::parse(&sector).map_err(|e| parse_to_pfs_error(0, &e))?;
        let geometry = boot.geometry().map_err(|e| parse_to_pfs_error(0, &e))?;
        let volume_bytes = u64::from(geometry.total_sectors) * u64::from(geometry.bytes_per_sector);
        if volume_bytes > device.len_bytes() {
            error!(volume_bytes, device = device.len_bytes(), "fat: volume larger than device");
            return Err(PfsError::corruption(
                0,
                format!("volume of {volume_bytes} bytes exceeds device"),
            ));
        }

        let fat_len = usize::try_from(geometry.fat_bytes())
            .map_err(|_| PfsError::Format("allocation table exceeds memory".into()))?;
        let mut fat = vec![0_u8; fat_len];
        read_bytes(device.as_ref(), geometry.fat_offset(), &mut fat)?;
        debug!(
            fat_type = geometry.fat_type.name(),
            clusters = geometry.cluster_count,
            cluster_size = geometry.cluster_size,
            "fat: mounted"
        );
        Ok(Self {
            device,
            boot,
            geometry,
            fat,
            free_clusters: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &FatGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn fat_type(&self) -> FatType {
        self.geometry.fat_type
    }

    fn entry(&self, cluster: u32) -> Result<FatEntry> {
        let raw = read_fat_entry(&self.fat, self.geometry.fat_type, cluster)
            .map_err(|e| parse_to_pfs_error(u64::from(cluster), &e))?;
        Ok(FatEntry::classify(self.geometry.fat_type, raw))
    }

    /// Clusters of the chain starting at `start`, in order. A chain longer
    /// than the cluster count must revisit a cluster.
    pub fn chain(&self, start: u32) -> Result<Vec<u32>> {
        if start == 0 {
            return Ok(Vec::new());
        }
        let limit = self.geometry.cluster_count as usize;
        let mut clusters = Vec::new();
        let mut cluster = start;
        loop {
            if !self.geometry.is_valid_cluster(cluster) {
                return Err(PfsError::corruption(
                    u64::from(cluster),
                    format!("chain from cluster {start} leaves the data area"),
                ));
            }
            if clusters.len() >= limit {
                error!(start, cluster, "fat: cluster chain loops");
                return Err(PfsError::corruption(
                    u64::from(cluster),
                    format!("chain from cluster {start} loops"),
                ));
            }
            clusters.push(cluster);
            match self.entry(cluster)? {
                FatEntry::EndOfChain => break,
                FatEntry::Next(next) => cluster = next,
                other => {
                    return Err(PfsError::corruption(
                        u64::from(cluster),
                        format!("chain from cluster {start} reaches {other:?}"),
                    ));
                }
            }
        }
        trace!(start, clusters = clusters.len(), "fat: walked chain");
        Ok(clusters)
    }

    fn chain_map(&self, start: u32) -> Result<(ExtentMap, u64)> {
        let clusters = self.chain(start)?;
        let size = self.geometry.cluster_size;
        let bytes = clusters.len() as u64 * u64::from(size);
        let map = ExtentMap::new(size, extents_from_chain(&clusters, size), SparsePolicy::Deny)?;
        Ok((map, bytes))
    }

    fn reader<'a>(&'a self, map: &'a ExtentMap, len: u64) -> ExtentReader<'a> {
        let data_offset =
            u64::from(self.geometry.first_data_sector) * u64::from(self.geometry.bytes_per_sector);
        ExtentReader::new(self.device.as_ref(), map, len).with_origin(data_offset, 2)
    }

    fn directory_bytes(&self, dir: &FatLocator) -> Result<Vec<u8>> {
        match dir {
            FatLocator::FixedRoot => {
                let len = usize::try_from(self.geometry.root_dir_bytes())
                    .map_err(|_| PfsError::Format("root directory exceeds memory".into()))?;
                let mut bytes = vec![0_u8; len];
                read_bytes(self.device.as_ref(), self.geometry.root_dir_offset(), &mut bytes)?;
                Ok(bytes)
            }
            FatLocator::Directory(start) => {
                let (map, len) = self.chain_map(*start)?;
                self.reader(&map, len).read_to_end()
            }
            FatLocator::File(_) => Err(PfsError::NotDirectory),
        }
    }

    fn count_free(&self) -> Result<u64> {
        let mut free = 0_u64;
        for cluster in 2..self.geometry.cluster_count.saturating_add(2) {
            if self.entry(cluster)? == FatEntry::Free {
                free += 1;
            }
        }
        Ok(free)
    }
}

fn decode(short: &FatShortEntry, name: String) -> DecodedSlot<FatLocator> {
    let created = fat_datetime_to_unix(short.create_date, short.create_time);
    let modified = fat_datetime_to_unix(short.write_date, short.write_time);
    let accessed = fat_datetime_to_unix(short.access_date, 0);
    let (mut meta, locator) = if short.is_directory() {
        if short.first_cluster == 0 {
            return Err(EntryError {
                name,
                detail: "directory has no clusters".into(),
            });
        }
        (EntryMeta::directory(name), FatLocator::Directory(short.first_cluster))
    } else {
        (
            EntryMeta::file(name, u64::from(short.file_size)),
            FatLocator::File(short.first_cluster),
        )
    };
    meta.node_id = (short.first_cluster != 0).then_some(u64::from(short.first_cluster));
    meta.created = created;
    meta.modified = modified;
    meta.accessed = accessed;
    Ok(DecodedEntry { meta, locator })
}

impl VolumeReader for FatReader {
    type Locator = FatLocator;

    fn type_name(&self) -> &'static str {
        "fat"
    }

    fn volume_name(&self) -> String {
        self.boot.label()
    }

    fn total_space(&self) -> u64 {
        self.geometry.data_bytes()
    }

    fn free_space(&self) -> Result<u64> {
        if let Some(free) = *self.free_clusters.lock() {
            return Ok(free * u64::from(self.geometry.cluster_size));
        }
        let free = self.count_free()?;
        *self.free_clusters.lock() = Some(free);
        Ok(free * u64::from(self.geometry.cluster_size))
    }

    fn name_rule(&self) -> NameRule {
        NameRule::CaseInsensitive
    }

    fn root(&self) -> Result<DecodedEntry<FatLocator>> {
        // Cluster 0 never holds a subdirectory, so it stands in for the
        // fixed FAT12/16 root.
        let (locator, cluster) = match self.geometry.fat_type {
            FatType::Fat32 => (
                FatLocator::Directory(self.geometry.root_cluster),
                self.geometry.root_cluster,
            ),
            FatType::Fat12 | FatType::Fat16 => (FatLocator::FixedRoot, 0),
        };
        let mut meta = EntryMeta::directory(self.boot.label());
        meta.node_id = Some(u64::from(cluster));
        Ok(DecodedEntry { meta, locator })
    }

    fn children(&self, dir: &FatLocator) -> Result<Vec<DecodedSlot<FatLocator>>> {
        let bytes = self.directory_bytes(dir)?;
        Ok(parse_directory(&bytes)
            .into_iter()
            .map(|slot| match slot {
                Ok(entry) => decode(&entry.short, entry.name),
                Err(bad) => Err(EntryError {
                    name: bad.name,
                    detail: format!("slot {}: {}", bad.slot, bad.error),
                }),
            })
            .collect())
    }

    fn read(&self, file: &FatLocator, length: u64, offset: u64, len: usize) -> Result<Vec<u8>> {
        let FatLocator::File(start) = file else {
            return Err(PfsError::IsDirectory);
        };
        if length == 0 || offset >= length {
            return Ok(Vec::new());
        }
        let (map, chain_bytes) = self.chain_map(*start)?;
        if chain_bytes < length {
            return Err(PfsError::corruption(
                u64::from(*start),
                format!("file of {length} bytes has {chain_bytes} bytes of clusters"),
            ));
        }
        self.reader(&map, length).read(offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_block::SectorBlockDevice;
    use pfs_ondisk::fat::{ATTR_ARCHIVE, ATTR_DIRECTORY, fat_datetime, lfn_entries_for, write_fat_entry};

    const SECTOR: usize = 512;
    const TOTAL_SECTORS: usize = 64;
    const ROOT_SECTOR: usize = 3;
    const DATA_SECTOR: usize = 4;

    fn short(name: &[u8; 11], attributes: u8, first_cluster: u32, file_size: u32) -> FatShortEntry {
        let (date, time) = fat_datetime(2020, 6, 15, 12, 30, 10);
        FatShortEntry {
            name: *name,
            attributes,
            nt_case: 0,
            create_time_tenths: 0,
            create_time: time,
            create_date: date,
            access_date: date,
            first_cluster,
            write_time: time,
            write_date: date,
            file_size,
        }
    }

    fn cluster_at(cluster: usize) -> usize {
        (DATA_SECTOR + cluster - 2) * SECTOR
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
    }

    /// FAT12, 512-byte clusters, 60 clusters, 16 root entries.
    fn image() -> Vec<u8> {
        let mut img = vec![0_u8; TOTAL_SECTORS * SECTOR];
        let boot = FatBootSector {
            oem_name: *b"PROBEFS ",
            bytes_per_sector: 512,
            sectors_per_cluster: 1,
            reserved_sectors: 1,
            num_fats: 2,
            root_entry_count: 16,
            total_sectors_16: TOTAL_SECTORS as u16,
            media: 0xF8,
            fat_size_16: 1,
            sectors_per_track: 32,
            num_heads: 2,
            hidden_sectors: 0,
            total_sectors_32: 0,
            fat_size_32: 0,
            root_cluster: 0,
            fs_info_sector: 0,
            volume_id: 0x1234_5678,
            volume_label: *b"TESTVOL    ",
            fs_type_label: *b"FAT12   ",
        };
        img[..SECTOR].copy_from_slice(&boot.encode().expect("boot"));

        let mut fat = vec![0_u8; SECTOR];
        let links: [(u32, u32); 10] = [
            (0, 0xFF8),
            (1, 0xFFF),
            (2, 3),
            (3, 0xFFF),
            (5, 0xFFF),
            (6, 0xFFF),
            (7, 9),
            (9, 0xFFF),
            (10, 11),
            (11, 10),
        ];
        for (cluster, value) in links {
            write_fat_entry(&mut fat, FatType::Fat12, cluster, value).expect("fat");
        }
        img[SECTOR..2 * SECTOR].copy_from_slice(&fat);
        img[2 * SECTOR..3 * SECTOR].copy_from_slice(&fat);

        let root = [
            short(b"HELLO   TXT", ATTR_ARCHIVE, 2, 600),
            short(b"SUB        ", ATTR_DIRECTORY, 5, 0),
            short(b"FRAG    BIN", ATTR_ARCHIVE, 7, 1024),
            short(b"LOOP    BIN", ATTR_ARCHIVE, 10, 1024),
        ];
        for (i, entry) in root.iter().enumerate() {
            let at = ROOT_SECTOR * SECTOR + i * 32;
            img[at..at + 32].copy_from_slice(&entry.encode());
        }

        let long = short(b"LONGNA~1TXT", ATTR_ARCHIVE, 6, 5);
        let mut sub = Vec::new();
        for lfn in lfn_entries_for("Long name.txt", long.checksum()).expect("lfn") {
            sub.extend_from_slice(&lfn.encode());
        }
        sub.extend_from_slice(&long.encode());
        img[cluster_at(5)..cluster_at(5) + sub.len()].copy_from_slice(&sub);

        img[cluster_at(2)..cluster_at(2) + 600].copy_from_slice(&pattern(600, 1));
        img[cluster_at(6)..cluster_at(6) + 5].copy_from_slice(b"hello");
        img[cluster_at(7)..cluster_at(8)].copy_from_slice(&pattern(512, 2));
        img[cluster_at(9)..cluster_at(10)].copy_from_slice(&pattern(512, 3));
        img
    }

    fn mount(img: Vec<u8>) -> Box<dyn FileSystem> {
        let device: Arc<dyn BlockDevice> = Arc::new(SectorBlockDevice::from_bytes(img).expect("device"));
        FatFsType.create(device, &MountOptions::default()).expect("mount")
    }

    #[test]
    fn probes_boot_sector() {
        let img = image();
        let device = SectorBlockDevice::from_bytes(img.clone()).expect("device");
        assert!(FatFsType.supports(&img[..512], &device));
        assert!(!FatFsType.supports(&img[..100], &device));
        let mut broken = img[..512].to_vec();
        broken[510] = 0;
        assert!(!FatFsType.supports(&broken, &device));
    }

    #[test]
    fn lists_root_in_slot_order() {
        let fs = mount(image());
        assert_eq!(fs.type_name(), "fat");
        assert_eq!(fs.volume_name(), "TESTVOL");
        let names: Vec<String> = fs
            .root_directory()
            .list_entries()
            .expect("list")
            .iter()
            .map(|slot| slot.name().to_owned())
            .collect();
        assert_eq!(names, vec!["HELLO.TXT", "SUB", "FRAG.BIN", "LOOP.BIN"]);
        let hello = fs.resolve_path("hello.txt").expect("hello");
        let (date, time) = fat_datetime(2020, 6, 15, 12, 30, 10);
        assert!(hello.modified().is_some());
        assert_eq!(hello.modified(), fat_datetime_to_unix(date, time));
        assert_eq!(hello.accessed(), fat_datetime_to_unix(date, 0));
    }

    #[test]
    fn reads_across_clusters_and_clamps() {
        let fs = mount(image());
        let hello = fs.file(&fs.resolve_path("/HELLO.TXT").expect("path")).expect("file");
        assert_eq!(hello.read_to_end().expect("read"), pattern(600, 1));
        assert_eq!(hello.read(510, 10).expect("read"), pattern(600, 1)[510..520].to_vec());
        assert_eq!(hello.read(590, 100).expect("read").len(), 10);
        assert!(hello.read(600, 10).expect("read").is_empty());

        let frag = fs.file(&fs.resolve_path("/frag.bin").expect("path")).expect("file");
        let mut expected = pattern(512, 2);
        expected.extend(pattern(512, 3));
        assert_eq!(frag.read_to_end().expect("read"), expected);
    }

    #[test]
    fn long_names_in_subdirectories() {
        let fs = mount(image());
        let file = fs.resolve_path("/sub/LONG NAME.TXT").expect("path");
        assert_eq!(file.name(), "Long name.txt");
        assert_eq!(fs.file(&file).expect("file").read_to_end().expect("read"), b"hello");
    }

    #[test]
    fn looping_chain_is_corruption() {
        let fs = mount(image());
        let looped = fs.resolve_path("/LOOP.BIN").expect("path");
        let err = fs.read(&looped, 0, 10).unwrap_err();
        assert!(matches!(err, PfsError::Corruption { .. }), "{err:?}");
    }

    #[test]
    fn space_is_counted_from_the_table() {
        let fs = mount(image());
        assert_eq!(fs.total_space(), 60 * 512);
        // Clusters 2, 3, 5, 6, 7, 9, 10 and 11 are in use.
        assert_eq!(fs.free_space().expect("free"), 52 * 512);
        assert_eq!(fs.usable_space().expect("usable"), 52 * 512);
    }

    #[test]
    fn truncated_device_is_rejected() {
        let mut img = image();
        img.truncate(32 * SECTOR);
        let device: Arc<dyn BlockDevice> = Arc::new(SectorBlockDevice::from_bytes(img).expect("device"));
        let err = FatReader::open(device).unwrap_err();
        assert!(matches!(err, PfsError::Corruption { block: 0, .. }));
    }
}
