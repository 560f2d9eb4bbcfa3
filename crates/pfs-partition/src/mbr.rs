//! IBM PC master boot record with extended (logical) partition chains.

use crate::{
    InvalidEntry, MAX_TABLE_NESTING, PartitionTable, PartitionTableEntry, PartitionTableType,
    PartitionType, TableKind,
};
use pfs_block::{BlockDevice, read_bytes};
use pfs_error::{PfsError, Result};
use pfs_types::{Endian, ParseError, Record, read_le_u16, read_le_u32};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, trace, warn};

pub const MBR_SIZE: usize = 512;
pub const MBR_SIGNATURE: u16 = 0xAA55;
pub const ENTRY_TABLE_OFFSET: usize = 446;
pub const ENTRY_SIZE: usize = 16;
pub const TABLE_SIZE: usize = 4;
pub const BOOT_ACTIVE: u8 = 0x80;

/// OEM names of filesystem boot sectors that also end in 0xAA55.
const FILESYSTEM_OEM_NAMES: [&[u8; 8]; 7] = [
    b"MSDOS5.0",
    b"MSWIN4.1",
    b"IBM  3.3",
    b"IBM  7.1",
    b"mkdosfs\0",
    b"FreeDOS ",
    b"NTFS    ",
];

/// Raw 16-byte partition entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MbrEntry {
    pub index: usize,
    pub boot_indicator: u8,
    pub start_chs: [u8; 3],
    pub type_tag: u8,
    pub end_chs: [u8; 3],
    pub start_lba: u32,
    pub sector_count: u32,
}

impl MbrEntry {
    /// Decode entry `index` of the table in `sector`.
    ///
    /// Only the bytes of the entry itself need to be present.
    pub fn parse(sector: &[u8], index: usize) -> std::result::Result<Self, ParseError> {
        if index >= TABLE_SIZE {
            return Err(ParseError::InvalidField {
                field: "partition_index",
                reason: "must be below 4",
            });
        }
        let rec = Record::new(sector, ENTRY_TABLE_OFFSET + index * ENTRY_SIZE, Endian::Little)?;
        Ok(Self {
            index,
            boot_indicator: rec.u8(0)?,
            start_chs: rec.fixed(1)?,
            type_tag: rec.u8(4)?,
            end_chs: rec.fixed(5)?,
            start_lba: rec.u32(8)?,
            sector_count: rec.u32(12)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut out = [0_u8; ENTRY_SIZE];
        out[0] = self.boot_indicator;
        out[1..4].copy_from_slice(&self.start_chs);
        out[4] = self.type_tag;
        out[5..8].copy_from_slice(&self.end_chs);
        out[8..12].copy_from_slice(&self.start_lba.to_le_bytes());
        out[12..16].copy_from_slice(&self.sector_count.to_le_bytes());
        out
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.type_tag == 0
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.is_empty()
            && matches!(self.boot_indicator, 0 | BOOT_ACTIVE)
            && self.start_lba > 0
            && self.sector_count > 0
    }

    #[must_use]
    pub fn is_bootable(&self) -> bool {
        self.boot_indicator == BOOT_ACTIVE
    }

    /// Extended partition types whose first sector holds another table.
    #[must_use]
    pub fn has_child_partition_table(&self) -> bool {
        matches!(self.type_tag, 0x05 | 0x0F | 0x85)
    }

    fn last_lba(&self) -> u64 {
        u64::from(self.start_lba) + u64::from(self.sector_count) - 1
    }

    fn overlaps(&self, other: &Self) -> bool {
        u64::from(self.start_lba) <= other.last_lba()
            && u64::from(other.start_lba) <= self.last_lba()
    }

    fn invalid_reason(&self) -> Option<&'static str> {
        if !matches!(self.boot_indicator, 0 | BOOT_ACTIVE) {
            Some("boot indicator is neither 0x00 nor 0x80")
        } else if self.start_lba == 0 {
            Some("start sector is zero")
        } else if self.sector_count == 0 {
            Some("sector count is zero")
        } else {
            None
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// BSD name table entry: a name whose last character has the high bit set.
fn has_bsd_nametab(sector: &[u8]) -> bool {
    let table = &sector[416..432];
    [&b"Linu"[..], &b"FreeBS"[..]].iter().any(|prefix| {
        table
            .windows(prefix.len() + 1)
            .any(|w| w.starts_with(prefix) && w[prefix.len()] >= 0x80)
    })
}

fn le16(sector: &[u8], offset: usize) -> u16 {
    read_le_u16(sector, offset).unwrap_or(0)
}

fn le32(sector: &[u8], offset: usize) -> u32 {
    read_le_u32(sector, offset).unwrap_or(0)
}

/// Whether the first sector looks like an MBR rather than a filesystem
/// boot sector or a kernel image.
///
/// Known boot-loader signatures are accepted outright. Otherwise a Linux
/// kernel header or a filesystem OEM name rejects the sector, and as a last
/// resort the table must hold at least one valid entry with no two valid
/// entries overlapping.
#[must_use]
pub fn contains_partition_table(bytes: &[u8]) -> bool {
    if bytes.len() < MBR_SIZE {
        return false;
    }
    if le16(bytes, 510) != MBR_SIGNATURE {
        trace!("mbr: no 0xAA55 signature");
        return false;
    }
    let sector = &bytes[..MBR_SIZE];

    let signatures: [(&str, bool); 8] = [
        ("AAP", le16(sector, 428) == 0x5678),
        ("AST/NEC", le16(sector, 380) == 0xA55A),
        ("Disk Manager", le16(sector, 252) == 0x55AA),
        ("NEWLDR", le32(sector, 2) == 0x4C57_454E),
        ("LILO", le32(sector, 6) == 0x4F4C_494C),
        (
            "HP boot code",
            sector[..8] == [0x33, 0xFF, 0xBE, 0x00, 0x02, 0x8E, 0xD7, 0xBC],
        ),
        ("Windows 2000 boot code", le32(sector, 296) == 0xC3F9_61D6),
        ("TCPA", le32(sector, 241) == 0x4150_4354),
    ];
    if let Some((name, _)) = signatures.iter().find(|(_, hit)| *hit) {
        debug!(signature = name, "mbr: matched boot code signature");
        return true;
    }

    let strings: [(&str, &[u8]); 7] = [
        (
            "DOS 2.0",
            b"Invalid partition table\x1eError loading operating system\x18Missing operating system",
        ),
        (
            "Microsoft",
            b"Invalid partition table\0Error loading operating system\0Missing operating system",
        ),
        ("BSD", b"Read\0Boot\0 error\r\n\0"),
        ("GRUB", b"GRUB \0Geom\0Hard Disk\0Read\0 Error"),
        ("SYSLINUX", b"\0Multiple active partitions.\r\n"),
        ("MAKEBOOT", b"MAKEBOOT"),
        ("MBR", b"MBR \x10\0"),
    ];
    if let Some((name, _)) = strings.iter().find(|(_, s)| contains(sector, s)) {
        debug!(signature = name, "mbr: matched boot code string");
        return true;
    }
    if has_bsd_nametab(sector) {
        debug!("mbr: matched BSD name table");
        return true;
    }

    if bytes.len() > 520 && &bytes[514..518] == b"HdrS" {
        debug!("mbr: Linux kernel header, not a partition table");
        return false;
    }
    if FILESYSTEM_OEM_NAMES.iter().any(|oem| &sector[3..11] == *oem) {
        debug!("mbr: filesystem boot sector, not a partition table");
        return false;
    }
    if le32(sector, 0x0C) == 0x504E_0000 {
        debug!(signature = "NP", "mbr: matched boot code signature");
        return true;
    }

    let valid: Vec<MbrEntry> = (0..TABLE_SIZE)
        .filter_map(|i| MbrEntry::parse(sector, i).ok())
        .filter(MbrEntry::is_valid)
        .collect();
    for (i, a) in valid.iter().enumerate() {
        if let Some(b) = valid[i + 1..].iter().find(|b| a.overlaps(b)) {
            debug!(first = a.index, second = b.index, "mbr: overlapping entries");
            return false;
        }
    }
    !valid.is_empty()
}

/// The IBM PC partition table.
#[derive(Debug, Clone, Copy, Default)]
pub struct MbrPartitionTableType;

impl PartitionTableType for MbrPartitionTableType {
    fn name(&self) -> &'static str {
        "mbr"
    }

    fn supports(&self, first_bytes: &[u8]) -> bool {
        contains_partition_table(first_bytes)
    }

    fn create(&self, first_bytes: &[u8], device: &dyn BlockDevice) -> Result<PartitionTable> {
        let sector = first_bytes
            .get(..MBR_SIZE)
            .ok_or_else(|| PfsError::OutOfRange("MBR needs 512 bytes".to_owned()))?;
        let mut visited = HashSet::from([0_u64]);
        decode_table(device, sector, 0, None, 0, &mut visited)
    }
}

/// Decode one table sector.
///
/// `extended_base` is the start of the outermost extended partition once
/// inside a chain; links to further boot records are relative to it, while
/// data partitions are relative to the boot record that lists them.
fn decode_table(
    device: &dyn BlockDevice,
    sector: &[u8],
    table_sector: u64,
    extended_base: Option<u64>,
    depth: usize,
    visited: &mut HashSet<u64>,
) -> Result<PartitionTable> {
    let kind = if extended_base.is_some() {
        TableKind::MbrExtended
    } else {
        TableKind::Mbr
    };
    let mut table = PartitionTable::new(kind);
    let device_sectors = device.sector_count();

    for index in 0..TABLE_SIZE {
        let raw = MbrEntry::parse(sector, index)
            .map_err(|err| PfsError::from_parse(table_sector, &err))?;
        if raw.is_empty() {
            continue;
        }
        let base = if raw.has_child_partition_table() {
            extended_base.unwrap_or(0)
        } else {
            table_sector
        };
        let start_sector = base + u64::from(raw.start_lba);
        let sector_count = u64::from(raw.sector_count);
        if extended_base.is_some()
            && raw.has_child_partition_table()
            && visited.contains(&start_sector)
        {
            return Err(PfsError::corruption(
                table_sector,
                format!("entry {index} links back to boot record {start_sector}"),
            ));
        }

        let reason = match raw.invalid_reason() {
            Some(reason) => Some(reason),
            None if start_sector + sector_count > device_sectors => {
                Some("extends past the end of the device")
            }
            None => None,
        };
        if let Some(reason) = reason {
            warn!(
                table_sector,
                index,
                type_tag = raw.type_tag,
                reason,
                "mbr: ignoring invalid partition entry"
            );
            table.invalid.push(InvalidEntry {
                index,
                start_sector,
                sector_count,
                type_tag: PartitionType::Mbr(raw.type_tag),
                reason: reason.to_owned(),
            });
            continue;
        }

        let child_table = if raw.has_child_partition_table() {
            let base = extended_base.unwrap_or(start_sector);
            Some(Box::new(read_extended(
                device,
                start_sector,
                base,
                depth + 1,
                visited,
            )?))
        } else {
            None
        };
        trace!(table_sector, index, start_sector, sector_count, "mbr: entry");
        table.entries.push(PartitionTableEntry {
            index,
            start_sector,
            sector_count,
            type_tag: PartitionType::Mbr(raw.type_tag),
            boot_flag: raw.is_bootable(),
            name: None,
            child_table,
        });
    }
    Ok(table)
}

fn read_extended(
    device: &dyn BlockDevice,
    ebr_sector: u64,
    extended_base: u64,
    depth: usize,
    visited: &mut HashSet<u64>,
) -> Result<PartitionTable> {
    if depth > MAX_TABLE_NESTING {
        return Err(PfsError::corruption(
            ebr_sector,
            format!("extended partition chain deeper than {MAX_TABLE_NESTING}"),
        ));
    }
    if !visited.insert(ebr_sector) {
        return Err(PfsError::corruption(
            ebr_sector,
            "extended partition chain revisits a boot record",
        ));
    }
    let mut sector = vec![0_u8; MBR_SIZE];
    let offset = ebr_sector
        .checked_mul(u64::from(device.sector_size()))
        .ok_or_else(|| PfsError::corruption(ebr_sector, "boot record offset overflows"))?;
    read_bytes(device, offset, &mut sector)?;
    let signature =
        read_le_u16(&sector, 510).map_err(|err| PfsError::from_parse(ebr_sector, &err))?;
    if signature != MBR_SIGNATURE {
        return Err(PfsError::corruption(
            ebr_sector,
            format!("extended boot record signature {signature:#06x}"),
        ));
    }
    debug!(ebr_sector, depth, "mbr: reading extended boot record");
    decode_table(
        device,
        &sector,
        ebr_sector,
        Some(extended_base),
        depth,
        visited,
    )
}

/// Serializes a [`PartitionTable`] of kind [`TableKind::Mbr`] into the
/// boot sector and every extended boot record it implies.
#[derive(Debug, Clone)]
pub struct MbrLayout {
    table: PartitionTable,
    disk_signature: u32,
}

impl MbrLayout {
    #[must_use]
    pub fn new(table: PartitionTable) -> Self {
        Self {
            table,
            disk_signature: 0,
        }
    }

    #[must_use]
    pub fn with_disk_signature(mut self, signature: u32) -> Self {
        self.disk_signature = signature;
        self
    }

    /// `(sector, 512 bytes)` pairs: the MBR first, then each extended boot
    /// record in chain order.
    pub fn to_sectors(&self) -> Result<Vec<(u64, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut root = encode_table(&self.table, 0, None)?;
        root[440..444].copy_from_slice(&self.disk_signature.to_le_bytes());
        out.push((0, root));
        for entry in &self.table.entries {
            if let Some(child) = &entry.child_table {
                encode_chain(child, entry.start_sector, entry.start_sector, 1, &mut out)?;
            }
        }
        Ok(out)
    }
}

fn encode_chain(
    table: &PartitionTable,
    ebr_sector: u64,
    extended_base: u64,
    depth: usize,
    out: &mut Vec<(u64, Vec<u8>)>,
) -> Result<()> {
    if depth > MAX_TABLE_NESTING {
        return Err(PfsError::Format(format!(
            "extended chain deeper than {MAX_TABLE_NESTING}"
        )));
    }
    out.push((ebr_sector, encode_table(table, ebr_sector, Some(extended_base))?));
    for entry in &table.entries {
        if let Some(child) = &entry.child_table {
            encode_chain(child, entry.start_sector, extended_base, depth + 1, out)?;
        }
    }
    Ok(())
}

/// CHS fields are filled with the "use LBA" marker.
const CHS_LBA: [u8; 3] = [0xFE, 0xFF, 0xFF];

fn encode_table(
    table: &PartitionTable,
    table_sector: u64,
    extended_base: Option<u64>,
) -> Result<Vec<u8>> {
    let mut sector = vec![0_u8; MBR_SIZE];
    for entry in &table.entries {
        if entry.index >= TABLE_SIZE {
            return Err(PfsError::Format(format!(
                "MBR entry index {} out of range",
                entry.index
            )));
        }
        let PartitionType::Mbr(type_tag) = entry.type_tag else {
            return Err(PfsError::Format("GPT type tag in an MBR table".to_owned()));
        };
        let base = if entry.child_table.is_some() {
            extended_base.unwrap_or(0)
        } else {
            table_sector
        };
        let relative = entry.start_sector.checked_sub(base).ok_or_else(|| {
            PfsError::Format(format!(
                "entry {} starts before its base sector {base}",
                entry.index
            ))
        })?;
        let raw = MbrEntry {
            index: entry.index,
            boot_indicator: if entry.boot_flag { BOOT_ACTIVE } else { 0 },
            start_chs: CHS_LBA,
            type_tag,
            end_chs: CHS_LBA,
            start_lba: u32::try_from(relative)
                .map_err(|_| PfsError::Format("start sector exceeds 32 bits".to_owned()))?,
            sector_count: u32::try_from(entry.sector_count)
                .map_err(|_| PfsError::Format("sector count exceeds 32 bits".to_owned()))?,
        };
        let at = ENTRY_TABLE_OFFSET + entry.index * ENTRY_SIZE;
        sector[at..at + ENTRY_SIZE].copy_from_slice(&raw.encode());
    }
    sector[510..512].copy_from_slice(&MBR_SIGNATURE.to_le_bytes());
    Ok(sector)
}

/// Human-readable name of an MBR partition type tag.
#[must_use]
pub fn mbr_type_name(tag: u8) -> &'static str {
    match tag {
        0x00 => "Empty",
        0x01 => "FAT12",
        0x04 => "FAT16 <32M",
        0x05 => "Extended",
        0x06 => "FAT16",
        0x07 => "NTFS/HPFS/exFAT",
        0x0B => "FAT32",
        0x0C => "FAT32 (LBA)",
        0x0E => "FAT16 (LBA)",
        0x0F => "Extended (LBA)",
        0x11 => "Hidden FAT12",
        0x14 => "Hidden FAT16 <32M",
        0x16 => "Hidden FAT16",
        0x17 => "Hidden NTFS/HPFS",
        0x1B => "Hidden FAT32",
        0x1C => "Hidden FAT32 (LBA)",
        0x1E => "Hidden FAT16 (LBA)",
        0x27 => "Windows recovery",
        0x39 => "Plan 9",
        0x42 => "Windows dynamic",
        0x4D..=0x4F => "QNX",
        0x63 => "GNU HURD / System V",
        0x80 => "Minix (old)",
        0x81 => "Minix",
        0x82 => "Linux swap",
        0x83 => "Linux",
        0x84 => "OS/2 hidden C:",
        0x85 => "Linux extended",
        0x86 | 0x87 => "NTFS volume set",
        0x8E => "Linux LVM",
        0x9F => "BSD/OS",
        0xA5 => "FreeBSD",
        0xA6 => "OpenBSD",
        0xA8 => "Darwin UFS",
        0xA9 => "NetBSD",
        0xAB => "Darwin boot",
        0xAF => "HFS / HFS+",
        0xBE => "Solaris boot",
        0xBF => "Solaris",
        0xEB => "BeOS BFS",
        0xEE => "GPT protective",
        0xEF => "EFI System",
        0xFB => "VMware VMFS",
        0xFC => "VMware swap",
        0xFD => "Linux RAID",
        _ => "Unknown",
    }
}
