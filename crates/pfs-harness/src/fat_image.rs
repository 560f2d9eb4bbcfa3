//! FAT12/16/32 volume builder with VFAT long names.
//!
//! Clusters are handed out depth first in tree order, so every chain is
//! contiguous. Names that are valid 8.3 in a single case per part are
//! stored as short entries with the NT lower-case flags; anything else
//! gets a numeric-tail alias and a long-name run.

use crate::{FIXTURE_TIME, TreeNode};
use anyhow::{Context, Result, bail, ensure};
use pfs_ondisk::fat::{
    ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_VOLUME_ID, DIR_ENTRY_SIZE, FatBootSector, FatShortEntry,
    FatType, LFN_UNITS_PER_ENTRY, NT_LOWER_BASE, NT_LOWER_EXT, fat_datetime,
    fat_datetime_to_unix, lfn_entries_for, short_name_checksum, write_fat_entry,
};
use std::collections::HashSet;
use tracing::debug;

const SECTOR_SIZE: u32 = 512;
const INVALID_SHORT_CHARS: &[u8] = b"\"*+,./:;<=>?[\\]|";
const MEDIA_FIXED_DISK: u8 = 0xF8;
const FSINFO_LEAD_SIGNATURE: u32 = 0x4161_5252;
const FSINFO_STRUCT_SIGNATURE: u32 = 0x6141_7272;
const FSINFO_TRAIL_SIGNATURE: u32 = 0xAA55_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatImageOptions {
    pub label: String,
    pub fat_type: FatType,
    pub sectors_per_cluster: u8,
    /// Clusters left free beyond what the tree needs; the type's minimum
    /// cluster count may add more.
    pub spare_clusters: u32,
}

impl Default for FatImageOptions {
    fn default() -> Self {
        Self {
            label: "TESTVOL".to_owned(),
            fat_type: FatType::Fat12,
            sectors_per_cluster: 1,
            spare_clusters: 16,
        }
    }
}

impl FatImageOptions {
    #[must_use]
    pub fn with_type(fat_type: FatType) -> Self {
        Self {
            fat_type,
            ..Self::default()
        }
    }
}

struct Planned<'a> {
    node: &'a TreeNode,
    short: [u8; 11],
    nt_case: u8,
    /// Store a long-name run before the short entry.
    long: bool,
    first_cluster: u32,
    clusters: u32,
    children: Vec<Planned<'a>>,
}

impl Planned<'_> {
    fn slots(&self) -> usize {
        if self.long {
            1 + self.node.name().encode_utf16().count().div_ceil(LFN_UNITS_PER_ENTRY)
        } else {
            1
        }
    }
}

fn directory_slots(children: &[Planned<'_>]) -> usize {
    children.iter().map(Planned::slots).sum()
}

fn plan<'a>(nodes: &'a [TreeNode]) -> Result<Vec<Planned<'a>>> {
    let mut taken = HashSet::new();
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        let exact = exact_short_name(node.name()).filter(|(raw, _)| taken.insert(*raw));
        let (short, nt_case, long) = match exact {
            Some((raw, nt_case)) => (raw, nt_case, false),
            None => (alias(node.name(), &mut taken)?, 0, true),
        };
        let children = match node {
            TreeNode::Directory { children, .. } => plan(children)?,
            TreeNode::File { .. } => Vec::new(),
        };
        out.push(Planned {
            node,
            short,
            nt_case,
            long,
            first_cluster: 0,
            clusters: 0,
            children,
        });
    }
    Ok(out)
}

/// Valid 8.3 names whose base and extension are each in a single case.
fn exact_short_name(name: &str) -> Option<([u8; 11], u8)> {
    if !name.is_ascii() || name.starts_with('.') || name.ends_with('.') {
        return None;
    }
    let (base, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return None;
    }
    let valid = |part: &str| {
        part.bytes()
            .all(|b| b > 0x20 && !INVALID_SHORT_CHARS.contains(&b))
    };
    if !valid(base) || !valid(ext) {
        return None;
    }
    // Some(true): lower case only; None: mixed.
    let lower = |part: &str| {
        let has_lower = part.bytes().any(|b| b.is_ascii_lowercase());
        let has_upper = part.bytes().any(|b| b.is_ascii_uppercase());
        (!(has_lower && has_upper)).then_some(has_lower)
    };
    let base_lower = lower(base)?;
    let ext_lower = lower(ext)?;

    let mut raw = [b' '; 11];
    raw[..base.len()].copy_from_slice(base.to_ascii_uppercase().as_bytes());
    raw[8..8 + ext.len()].copy_from_slice(ext.to_ascii_uppercase().as_bytes());
    let mut nt_case = 0;
    if base_lower {
        nt_case |= NT_LOWER_BASE;
    }
    if ext_lower {
        nt_case |= NT_LOWER_EXT;
    }
    Some((raw, nt_case))
}

/// `BASE~N.EXT`, with the smallest `N` not yet used in the directory.
fn alias(name: &str, taken: &mut HashSet<[u8; 11]>) -> Result<[u8; 11]> {
    let (base, ext) = match name.rsplit_once('.') {
        Some((base, ext)) if !base.trim_start_matches('.').is_empty() => (base, ext),
        _ => (name, ""),
    };
    let clean = |part: &str, max: usize| -> Vec<u8> {
        part.chars()
            .filter_map(|c| u8::try_from(c.to_ascii_uppercase()).ok())
            .filter(|b| *b > 0x20 && *b < 0x7F && !INVALID_SHORT_CHARS.contains(b))
            .take(max)
            .collect()
    };
    let base = clean(base, 8);
    let ext = clean(ext, 3);
    for n in 1..1_000_000_u32 {
        let tail = format!("~{n}");
        let keep = (8 - tail.len()).min(base.len());
        let mut raw = [b' '; 11];
        raw[..keep].copy_from_slice(&base[..keep]);
        raw[keep..keep + tail.len()].copy_from_slice(tail.as_bytes());
        raw[8..8 + ext.len()].copy_from_slice(&ext);
        if taken.insert(raw) {
            return Ok(raw);
        }
    }
    bail!("no free short alias for {name:?}")
}

fn allocate(children: &mut [Planned<'_>], next: &mut u32, cluster_size: u32) -> Result<()> {
    for child in children {
        match child.node {
            TreeNode::File { data, .. } => {
                child.clusters = u32::try_from(data.len().div_ceil(cluster_size as usize))
                    .with_context(|| format!("{} is too large", child.node.name()))?;
                child.first_cluster = if child.clusters == 0 { 0 } else { *next };
                *next += child.clusters;
            }
            TreeNode::Directory { .. } => {
                let bytes = (2 + directory_slots(&child.children)) * DIR_ENTRY_SIZE;
                child.clusters = u32::try_from(bytes.div_ceil(cluster_size as usize))?;
                child.first_cluster = *next;
                *next += child.clusters;
                allocate(&mut child.children, next, cluster_size)?;
            }
        }
    }
    Ok(())
}

fn label_field(label: &str) -> Result<[u8; 11]> {
    let upper = label.to_ascii_uppercase();
    ensure!(
        upper.is_ascii() && upper.len() <= 11,
        "label {label:?} is not up to 11 ASCII characters"
    );
    let mut raw = *b"NO NAME    ";
    if !upper.is_empty() {
        raw = [b' '; 11];
        raw[..upper.len()].copy_from_slice(upper.as_bytes());
    }
    Ok(raw)
}

/// Lay `tree` out as a fresh FAT volume of the requested type.
pub fn build_fat(tree: &[TreeNode], options: &FatImageOptions) -> Result<Vec<u8>> {
    let fat_type = options.fat_type;
    let spc = u32::from(options.sectors_per_cluster);
    ensure!(
        spc > 0 && spc.is_power_of_two(),
        "sectors per cluster must be a power of two"
    );
    let cluster_size = spc * SECTOR_SIZE;
    let label = label_field(&options.label)?;
    let has_label = !options.label.is_empty();

    let mut entries = plan(tree)?;
    let root_slots = directory_slots(&entries) + usize::from(has_label);
    let mut next = 2_u32;
    let root_clusters = if fat_type == FatType::Fat32 {
        let bytes = root_slots * DIR_ENTRY_SIZE;
        let clusters = u32::try_from(bytes.div_ceil(cluster_size as usize))?.max(1);
        next += clusters;
        clusters
    } else {
        0
    };
    allocate(&mut entries, &mut next, cluster_size)?;
    let used_clusters = next - 2;

    let (reserved, root_entries, min_clusters, max_clusters) = match fat_type {
        FatType::Fat12 => {
            let root = u32::try_from(root_slots)?.next_multiple_of(16).max(64);
            (1_u32, root, 1, 4084)
        }
        FatType::Fat16 => (1, 512, 4200, 65524),
        FatType::Fat32 => (32, 0, 65600, 0x0FFF_FFF5),
    };
    ensure!(
        fat_type == FatType::Fat32 || root_slots <= root_entries as usize,
        "{root_slots} root entries exceed the fixed root of {root_entries}"
    );
    let clusters = (used_clusters + options.spare_clusters).max(min_clusters);
    ensure!(
        clusters <= max_clusters,
        "{clusters} clusters do not fit {}",
        fat_type.name()
    );

    let fat_size = u32::try_from(fat_type.table_bytes(clusters).div_ceil(u64::from(SECTOR_SIZE)))?;
    let root_sectors = root_entries * DIR_ENTRY_SIZE as u32 / SECTOR_SIZE;
    let first_data = reserved + 2 * fat_size + root_sectors;
    let total = first_data + clusters * spc;
    let small = fat_type != FatType::Fat32 && total < 0x1_0000;

    let boot = FatBootSector {
        oem_name: *b"MSWIN4.1",
        bytes_per_sector: 512,
        sectors_per_cluster: options.sectors_per_cluster,
        reserved_sectors: u16::try_from(reserved)?,
        num_fats: 2,
        root_entry_count: u16::try_from(root_entries)?,
        total_sectors_16: if small { u16::try_from(total)? } else { 0 },
        media: MEDIA_FIXED_DISK,
        fat_size_16: if fat_type == FatType::Fat32 {
            0
        } else {
            u16::try_from(fat_size)?
        },
        sectors_per_track: 32,
        num_heads: 64,
        hidden_sectors: 0,
        total_sectors_32: if small { 0 } else { total },
        fat_size_32: if fat_type == FatType::Fat32 { fat_size } else { 0 },
        root_cluster: if fat_type == FatType::Fat32 { 2 } else { 0 },
        fs_info_sector: if fat_type == FatType::Fat32 { 1 } else { 0 },
        volume_id: 0x1234_5678,
        volume_label: label,
        fs_type_label: match fat_type {
            FatType::Fat12 => *b"FAT12   ",
            FatType::Fat16 => *b"FAT16   ",
            FatType::Fat32 => *b"FAT32   ",
        },
    };
    let geometry = boot.geometry()?;
    ensure!(
        geometry.fat_type == fat_type,
        "layout produced {} instead of {}",
        geometry.fat_type.name(),
        fat_type.name()
    );

    let sector = |n: u32| n as usize * SECTOR_SIZE as usize;
    let cluster_at = |c: u32| sector(first_data + (c - 2) * spc);
    let mut image = vec![0_u8; sector(total)];
    image[..512].copy_from_slice(&boot.encode()?);
    if fat_type == FatType::Fat32 {
        let info = &mut image[sector(1)..sector(2)];
        info[..4].copy_from_slice(&FSINFO_LEAD_SIGNATURE.to_le_bytes());
        info[484..488].copy_from_slice(&FSINFO_STRUCT_SIGNATURE.to_le_bytes());
        info[488..492].copy_from_slice(&(clusters - used_clusters).to_le_bytes());
        info[492..496].copy_from_slice(&next.to_le_bytes());
        info[508..512].copy_from_slice(&FSINFO_TRAIL_SIGNATURE.to_le_bytes());
    }

    let mut fat = vec![0_u8; sector(fat_size)];
    let end = fat_type.end_of_chain();
    write_fat_entry(&mut fat, fat_type, 0, (end & !0xFF) | u32::from(MEDIA_FIXED_DISK))?;
    write_fat_entry(&mut fat, fat_type, 1, end)?;
    if root_clusters > 0 {
        write_chain(&mut fat, fat_type, 2, root_clusters)?;
    }
    chain_all(&mut fat, fat_type, &entries)?;
    for copy in 0..2 {
        let at = sector(reserved + copy * fat_size);
        image[at..at + fat.len()].copy_from_slice(&fat);
    }

    let (date, time) = fixture_datetime();
    let stamp = Stamp { date, time };
    let root_bytes = directory_bytes(&entries, None, has_label.then_some(label), stamp)?;
    let (root_at, root_capacity) = if fat_type == FatType::Fat32 {
        (cluster_at(2), root_clusters as usize * cluster_size as usize)
    } else {
        (sector(reserved + 2 * fat_size), sector(root_sectors))
    };
    ensure!(root_bytes.len() <= root_capacity, "root directory overflow");
    image[root_at..root_at + root_bytes.len()].copy_from_slice(&root_bytes);
    write_contents(&mut image, &entries, 0, stamp, &cluster_at)?;

    debug!(
        fat = fat_type.name(),
        clusters,
        used = used_clusters,
        total_sectors = total,
        "built fat image"
    );
    Ok(image)
}

/// The FAT encoding of the builders' fixed timestamp.
#[must_use]
pub fn fixture_datetime() -> (u16, u16) {
    let (date, time) = fat_datetime(2021, 3, 4, 5, 6, 8);
    debug_assert_eq!(fat_datetime_to_unix(date, time), Some(FIXTURE_TIME));
    (date, time)
}

#[derive(Debug, Clone, Copy)]
struct Stamp {
    date: u16,
    time: u16,
}

fn write_chain(fat: &mut [u8], fat_type: FatType, first: u32, count: u32) -> Result<()> {
    for i in 0..count {
        let cluster = first + i;
        let value = if i + 1 < count {
            cluster + 1
        } else {
            fat_type.end_of_chain()
        };
        write_fat_entry(fat, fat_type, cluster, value)?;
    }
    Ok(())
}

fn chain_all(fat: &mut [u8], fat_type: FatType, entries: &[Planned<'_>]) -> Result<()> {
    for entry in entries {
        if entry.clusters > 0 {
            write_chain(fat, fat_type, entry.first_cluster, entry.clusters)?;
        }
        chain_all(fat, fat_type, &entry.children)?;
    }
    Ok(())
}

fn short_entry(
    name: [u8; 11],
    attributes: u8,
    first_cluster: u32,
    size: u32,
    stamp: Stamp,
) -> FatShortEntry {
    FatShortEntry {
        name,
        attributes,
        nt_case: 0,
        create_time_tenths: 0,
        create_time: stamp.time,
        create_date: stamp.date,
        access_date: stamp.date,
        first_cluster,
        write_time: stamp.time,
        write_date: stamp.date,
        file_size: size,
    }
}

/// Encoded slots of one directory. `dots` is `(self, parent)` for
/// subdirectories; the parent is 0 when it is the root.
fn directory_bytes(
    entries: &[Planned<'_>],
    dots: Option<(u32, u32)>,
    label: Option<[u8; 11]>,
    stamp: Stamp,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    if let Some(label) = label {
        out.extend_from_slice(&short_entry(label, ATTR_VOLUME_ID, 0, 0, stamp).encode());
    }
    if let Some((this, parent)) = dots {
        for (name, cluster) in [(*b".          ", this), (*b"..         ", parent)] {
            out.extend_from_slice(&short_entry(name, ATTR_DIRECTORY, cluster, 0, stamp).encode());
        }
    }
    for entry in entries {
        if entry.long {
            for piece in lfn_entries_for(entry.node.name(), short_name_checksum(&entry.short))? {
                out.extend_from_slice(&piece.encode());
            }
        }
        let (attributes, size) = match entry.node {
            TreeNode::File { data, .. } => (ATTR_ARCHIVE, u32::try_from(data.len())?),
            TreeNode::Directory { .. } => (ATTR_DIRECTORY, 0),
        };
        let mut short = short_entry(entry.short, attributes, entry.first_cluster, size, stamp);
        short.nt_case = entry.nt_case;
        out.extend_from_slice(&short.encode());
    }
    Ok(out)
}

fn write_contents(
    image: &mut [u8],
    entries: &[Planned<'_>],
    parent: u32,
    stamp: Stamp,
    cluster_at: &dyn Fn(u32) -> usize,
) -> Result<()> {
    for entry in entries {
        if entry.clusters == 0 {
            continue;
        }
        let at = cluster_at(entry.first_cluster);
        match entry.node {
            TreeNode::File { data, .. } => image[at..at + data.len()].copy_from_slice(data),
            TreeNode::Directory { .. } => {
                let bytes = directory_bytes(
                    &entry.children,
                    Some((entry.first_cluster, parent)),
                    None,
                    stamp,
                )?;
                image[at..at + bytes.len()].copy_from_slice(&bytes);
                write_contents(image, &entry.children, entry.first_cluster, stamp, cluster_at)?;
            }
        }
    }
    Ok(())
}
