//! FAT12/16/32 on-disk structures.
//!
//! Boot sector (BPB), allocation table entries and 32-byte directory
//! entries, including VFAT long-name entries. All fields are little-endian.

use pfs_types::{
    ParseError, Record, ensure_slice, read_le_u16, read_le_u32, write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

pub const BOOT_SIGNATURE: u16 = 0xAA55;
pub const DIR_ENTRY_SIZE: usize = 32;
pub const LFN_UNITS_PER_ENTRY: usize = 13;
pub const MAX_LFN_ENTRIES: u8 = 20;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LONG_NAME: u8 = 0x0F;

/// `DIR_NTRes` flag: base name is stored upper case but displayed lower.
pub const NT_LOWER_BASE: u8 = 0x08;
/// `DIR_NTRes` flag: extension displayed lower case.
pub const NT_LOWER_EXT: u8 = 0x10;

const SLOT_END: u8 = 0x00;
const SLOT_DELETED: u8 = 0xE5;
/// A leading 0xE5 in a real name is stored as 0x05.
const SLOT_KANJI_E5: u8 = 0x05;
const LFN_LAST_FLAG: u8 = 0x40;
const EXT_BOOT_SIGNATURE: u8 = 0x29;

const INVALID_SHORT_CHARS: &[u8] = b"\"*+,./:;<=>?[\\]|";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    /// FAT type is determined by cluster count alone.
    #[must_use]
    pub fn from_cluster_count(clusters: u32) -> Self {
        if clusters < 4085 {
            Self::Fat12
        } else if clusters < 65525 {
            Self::Fat16
        } else {
            Self::Fat32
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Fat12 => "FAT12",
            Self::Fat16 => "FAT16",
            Self::Fat32 => "FAT32",
        }
    }

    #[must_use]
    pub fn entry_bits(self) -> u32 {
        match self {
            Self::Fat12 => 12,
            Self::Fat16 => 16,
            Self::Fat32 => 32,
        }
    }

    /// Smallest value that marks end of chain.
    #[must_use]
    pub fn end_of_chain(self) -> u32 {
        match self {
            Self::Fat12 => 0x0FF8,
            Self::Fat16 => 0xFFF8,
            Self::Fat32 => 0x0FFF_FFF8,
        }
    }

    #[must_use]
    pub fn bad_cluster(self) -> u32 {
        match self {
            Self::Fat12 => 0x0FF7,
            Self::Fat16 => 0xFFF7,
            Self::Fat32 => 0x0FFF_FFF7,
        }
    }

    /// First reserved value above the cluster range.
    fn reserved_start(self) -> u32 {
        match self {
            Self::Fat12 => 0x0FF0,
            Self::Fat16 => 0xFFF0,
            Self::Fat32 => 0x0FFF_FFF0,
        }
    }

    /// Bytes occupied by the entries for `clusters` clusters plus the two
    /// reserved entries.
    #[must_use]
    pub fn table_bytes(self, clusters: u32) -> u64 {
        let entries = u64::from(clusters) + 2;
        match self {
            Self::Fat12 => (entries * 3).div_ceil(2),
            Self::Fat16 => entries * 2,
            Self::Fat32 => entries * 4,
        }
    }
}

// ── Boot sector ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatBootSector {
    pub oem_name: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entry_count: u16,
    pub total_sectors_16: u16,
    pub media: u8,
    pub fat_size_16: u16,
    pub sectors_per_track: u16,
    pub num_heads: u16,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
    /// FAT32 only.
    pub fat_size_32: u32,
    /// FAT32 only.
    pub root_cluster: u32,
    /// FAT32 only.
    pub fs_info_sector: u16,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_type_label: [u8; 8],
}

impl FatBootSector {
    /// Parse and validate the first sector of a FAT volume.
    pub fn parse(sector: &[u8]) -> Result<Self, ParseError> {
        let rec = Record::little_endian(sector);
        let signature = rec.u16(510)?;
        if signature != BOOT_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(BOOT_SIGNATURE),
                actual: u64::from(signature),
            });
        }
        let jump = rec.u8(0)?;
        if jump != 0xEB && jump != 0xE9 {
            return Err(ParseError::InvalidField {
                field: "jump_boot",
                reason: "expected 0xEB or 0xE9",
            });
        }

        let bytes_per_sector = rec.u16(11)?;
        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(ParseError::InvalidField {
                field: "bytes_per_sector",
                reason: "must be 512, 1024, 2048 or 4096",
            });
        }
        let sectors_per_cluster = rec.u8(13)?;
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "sectors_per_cluster",
                reason: "must be a non-zero power of two",
            });
        }
        let reserved_sectors = rec.u16(14)?;
        if reserved_sectors == 0 {
            return Err(ParseError::InvalidField {
                field: "reserved_sectors",
                reason: "must be non-zero",
            });
        }
        let num_fats = rec.u8(16)?;
        if num_fats == 0 {
            return Err(ParseError::InvalidField {
                field: "num_fats",
                reason: "must be non-zero",
            });
        }

        let fat_size_16 = rec.u16(22)?;
        let is_fat32_layout = fat_size_16 == 0;
        let (fat_size_32, root_cluster, fs_info_sector, ext) = if is_fat32_layout {
            (rec.u32(36)?, rec.u32(44)?, rec.u16(48)?, 64)
        } else {
            (0, 0, 0, 36)
        };
        let (volume_id, volume_label, fs_type_label) = if rec.u8(ext + 2)? == EXT_BOOT_SIGNATURE {
            (rec.u32(ext + 3)?, rec.fixed(ext + 7)?, rec.fixed(ext + 18)?)
        } else {
            (0, [b' '; 11], [b' '; 8])
        };

        let boot = Self {
            oem_name: rec.fixed(3)?,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            root_entry_count: rec.u16(17)?,
            total_sectors_16: rec.u16(19)?,
            media: rec.u8(21)?,
            fat_size_16,
            sectors_per_track: rec.u16(24)?,
            num_heads: rec.u16(26)?,
            hidden_sectors: rec.u32(28)?,
            total_sectors_32: rec.u32(32)?,
            fat_size_32,
            root_cluster,
            fs_info_sector,
            volume_id,
            volume_label,
            fs_type_label,
        };
        if boot.fat_size() == 0 {
            return Err(ParseError::InvalidField {
                field: "fat_size",
                reason: "must be non-zero",
            });
        }
        if boot.total_sectors() == 0 {
            return Err(ParseError::InvalidField {
                field: "total_sectors",
                reason: "must be non-zero",
            });
        }
        Ok(boot)
    }

    /// Encode a 512-byte boot sector.
    pub fn encode(&self) -> Result<[u8; 512], ParseError> {
        let mut out = [0_u8; 512];
        out[0] = 0xEB;
        out[1] = 0x3C;
        out[2] = 0x90;
        out[3..11].copy_from_slice(&self.oem_name);
        write_le_u16(&mut out, 11, self.bytes_per_sector)?;
        out[13] = self.sectors_per_cluster;
        write_le_u16(&mut out, 14, self.reserved_sectors)?;
        out[16] = self.num_fats;
        write_le_u16(&mut out, 17, self.root_entry_count)?;
        write_le_u16(&mut out, 19, self.total_sectors_16)?;
        out[21] = self.media;
        write_le_u16(&mut out, 22, self.fat_size_16)?;
        write_le_u16(&mut out, 24, self.sectors_per_track)?;
        write_le_u16(&mut out, 26, self.num_heads)?;
        write_le_u32(&mut out, 28, self.hidden_sectors)?;
        write_le_u32(&mut out, 32, self.total_sectors_32)?;
        let ext = if self.fat_size_16 == 0 {
            out[1] = 0x58;
            write_le_u32(&mut out, 36, self.fat_size_32)?;
            write_le_u32(&mut out, 44, self.root_cluster)?;
            write_le_u16(&mut out, 48, self.fs_info_sector)?;
            64
        } else {
            36
        };
        out[ext] = 0x80;
        out[ext + 2] = EXT_BOOT_SIGNATURE;
        write_le_u32(&mut out, ext + 3, self.volume_id)?;
        out[ext + 7..ext + 18].copy_from_slice(&self.volume_label);
        out[ext + 18..ext + 26].copy_from_slice(&self.fs_type_label);
        write_le_u16(&mut out, 510, BOOT_SIGNATURE)?;
        Ok(out)
    }

    #[must_use]
    pub fn fat_size(&self) -> u32 {
        if self.fat_size_16 != 0 {
            u32::from(self.fat_size_16)
        } else {
            self.fat_size_32
        }
    }

    #[must_use]
    pub fn total_sectors(&self) -> u32 {
        if self.total_sectors_16 != 0 {
            u32::from(self.total_sectors_16)
        } else {
            self.total_sectors_32
        }
    }

    /// Volume label from the extended BPB, trimmed. Empty when unset.
    #[must_use]
    pub fn label(&self) -> String {
        let label = pfs_types::trim_nul_padded(&self.volume_label);
        if label == "NO NAME" {
            String::new()
        } else {
            label
        }
    }

    /// Derive and validate the volume layout.
    pub fn geometry(&self) -> Result<FatGeometry, ParseError> {
        let bytes_per_sector = u32::from(self.bytes_per_sector);
        let sectors_per_cluster = u32::from(self.sectors_per_cluster);
        let root_entry_count = u32::from(self.root_entry_count);
        let root_dir_sectors =
            (root_entry_count * DIR_ENTRY_SIZE as u32).div_ceil(bytes_per_sector);
        let fat_size = self.fat_size();
        let fats_total = u32::from(self.num_fats)
            .checked_mul(fat_size)
            .ok_or(ParseError::IntegerConversion { field: "fat_size" })?;
        let first_data_sector = u32::from(self.reserved_sectors)
            .checked_add(fats_total)
            .and_then(|v| v.checked_add(root_dir_sectors))
            .ok_or(ParseError::IntegerConversion {
                field: "first_data_sector",
            })?;
        let total_sectors = self.total_sectors();
        if first_data_sector >= total_sectors {
            return Err(ParseError::InvalidField {
                field: "total_sectors",
                reason: "metadata area fills the whole volume",
            });
        }
        let cluster_count = (total_sectors - first_data_sector) / sectors_per_cluster;
        let fat_type = FatType::from_cluster_count(cluster_count);

        let is_fat32_layout = self.fat_size_16 == 0;
        if is_fat32_layout != (fat_type == FatType::Fat32) {
            return Err(ParseError::InvalidField {
                field: "fat_size_16",
                reason: "BPB layout disagrees with cluster count",
            });
        }
        if fat_type == FatType::Fat32 && root_entry_count != 0 {
            return Err(ParseError::InvalidField {
                field: "root_entry_count",
                reason: "must be zero on FAT32",
            });
        }
        if fat_type != FatType::Fat32 && root_entry_count == 0 {
            return Err(ParseError::InvalidField {
                field: "root_entry_count",
                reason: "must be non-zero on FAT12/16",
            });
        }
        if fat_type.table_bytes(cluster_count) > u64::from(fat_size) * u64::from(bytes_per_sector)
        {
            return Err(ParseError::InvalidField {
                field: "fat_size",
                reason: "table too small for cluster count",
            });
        }
        if fat_type == FatType::Fat32
            && !(2..cluster_count.saturating_add(2)).contains(&self.root_cluster)
        {
            return Err(ParseError::InvalidField {
                field: "root_cluster",
                reason: "outside the cluster range",
            });
        }

        Ok(FatGeometry {
            fat_type,
            bytes_per_sector,
            sectors_per_cluster,
            cluster_size: bytes_per_sector * sectors_per_cluster,
            reserved_sectors: u32::from(self.reserved_sectors),
            num_fats: u32::from(self.num_fats),
            fat_size_sectors: fat_size,
            root_entry_count,
            root_dir_sectors,
            first_data_sector,
            cluster_count,
            total_sectors,
            root_cluster: self.root_cluster,
        })
    }
}

/// Volume layout derived from the BPB. All sector values are relative to
/// the start of the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatGeometry {
    pub fat_type: FatType,
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub cluster_size: u32,
    pub reserved_sectors: u32,
    pub num_fats: u32,
    pub fat_size_sectors: u32,
    pub root_entry_count: u32,
    pub root_dir_sectors: u32,
    pub first_data_sector: u32,
    pub cluster_count: u32,
    pub total_sectors: u32,
    pub root_cluster: u32,
}

impl FatGeometry {
    /// Byte offset of the first FAT.
    #[must_use]
    pub fn fat_offset(&self) -> u64 {
        u64::from(self.reserved_sectors) * u64::from(self.bytes_per_sector)
    }

    #[must_use]
    pub fn fat_bytes(&self) -> u64 {
        u64::from(self.fat_size_sectors) * u64::from(self.bytes_per_sector)
    }

    /// Byte offset of the fixed FAT12/16 root directory region.
    #[must_use]
    pub fn root_dir_offset(&self) -> u64 {
        (u64::from(self.reserved_sectors)
            + u64::from(self.num_fats) * u64::from(self.fat_size_sectors))
            * u64::from(self.bytes_per_sector)
    }

    #[must_use]
    pub fn root_dir_bytes(&self) -> u64 {
        u64::from(self.root_entry_count) * DIR_ENTRY_SIZE as u64
    }

    #[must_use]
    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster < self.cluster_count.saturating_add(2)
    }

    /// Byte offset of `cluster`'s first sector, or `None` outside the
    /// cluster range.
    #[must_use]
    pub fn cluster_offset(&self, cluster: u32) -> Option<u64> {
        if !self.is_valid_cluster(cluster) {
            return None;
        }
        let sector = u64::from(self.first_data_sector)
            + u64::from(cluster - 2) * u64::from(self.sectors_per_cluster);
        Some(sector * u64::from(self.bytes_per_sector))
    }

    #[must_use]
    pub fn data_bytes(&self) -> u64 {
        u64::from(self.cluster_count) * u64::from(self.cluster_size)
    }
}

// ── Allocation table ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatEntry {
    Free,
    Next(u32),
    Bad,
    EndOfChain,
    Reserved(u32),
}

impl FatEntry {
    #[must_use]
    pub fn classify(fat_type: FatType, raw: u32) -> Self {
        if raw == 0 {
            Self::Free
        } else if raw >= fat_type.end_of_chain() {
            Self::EndOfChain
        } else if raw == fat_type.bad_cluster() {
            Self::Bad
        } else if raw == 1 || raw >= fat_type.reserved_start() {
            Self::Reserved(raw)
        } else {
            Self::Next(raw)
        }
    }
}

/// Read the raw table value for `cluster`.
pub fn read_fat_entry(fat: &[u8], fat_type: FatType, cluster: u32) -> Result<u32, ParseError> {
    let index = cluster as usize;
    match fat_type {
        FatType::Fat12 => {
            let raw = read_le_u16(fat, index + index / 2)?;
            Ok(u32::from(if cluster & 1 == 1 { raw >> 4 } else { raw & 0x0FFF }))
        }
        FatType::Fat16 => Ok(u32::from(read_le_u16(fat, index * 2)?)),
        FatType::Fat32 => Ok(read_le_u32(fat, index * 4)? & 0x0FFF_FFFF),
    }
}

/// Store `value` for `cluster`, preserving neighbouring FAT12 nibbles and
/// the reserved top bits of FAT32 entries.
pub fn write_fat_entry(
    fat: &mut [u8],
    fat_type: FatType,
    cluster: u32,
    value: u32,
) -> Result<(), ParseError> {
    let index = cluster as usize;
    match fat_type {
        FatType::Fat12 => {
            let at = index + index / 2;
            let existing = read_le_u16(fat, at)?;
            let value = u16::try_from(value & 0x0FFF)
                .map_err(|_| ParseError::IntegerConversion { field: "fat12_entry" })?;
            let merged = if cluster & 1 == 1 {
                (existing & 0x000F) | (value << 4)
            } else {
                (existing & 0xF000) | value
            };
            write_le_u16(fat, at, merged)
        }
        FatType::Fat16 => {
            let value = u16::try_from(value)
                .map_err(|_| ParseError::IntegerConversion { field: "fat16_entry" })?;
            write_le_u16(fat, index * 2, value)
        }
        FatType::Fat32 => {
            let existing = read_le_u32(fat, index * 4)?;
            write_le_u32(fat, index * 4, (existing & 0xF000_0000) | (value & 0x0FFF_FFFF))
        }
    }
}

// ── Directory entries ───────────────────────────────────────────────────────

/// 8.3 directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatShortEntry {
    pub name: [u8; 11],
    pub attributes: u8,
    pub nt_case: u8,
    pub create_time_tenths: u8,
    pub create_time: u16,
    pub create_date: u16,
    pub access_date: u16,
    pub first_cluster: u32,
    pub write_time: u16,
    pub write_date: u16,
    pub file_size: u32,
}

impl FatShortEntry {
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        let raw = ensure_slice(bytes, offset, DIR_ENTRY_SIZE)?;
        let rec = Record::little_endian(raw);
        let hi = u32::from(rec.u16(20)?);
        let lo = u32::from(rec.u16(26)?);
        Ok(Self {
            name: rec.fixed(0)?,
            attributes: rec.u8(11)?,
            nt_case: rec.u8(12)?,
            create_time_tenths: rec.u8(13)?,
            create_time: rec.u16(14)?,
            create_date: rec.u16(16)?,
            access_date: rec.u16(18)?,
            first_cluster: (hi << 16) | lo,
            write_time: rec.u16(22)?,
            write_date: rec.u16(24)?,
            file_size: rec.u32(28)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut out = [0_u8; DIR_ENTRY_SIZE];
        out[..11].copy_from_slice(&self.name);
        out[11] = self.attributes;
        out[12] = self.nt_case;
        out[13] = self.create_time_tenths;
        out[14..16].copy_from_slice(&self.create_time.to_le_bytes());
        out[16..18].copy_from_slice(&self.create_date.to_le_bytes());
        out[18..20].copy_from_slice(&self.access_date.to_le_bytes());
        out[20..22].copy_from_slice(&((self.first_cluster >> 16) as u16).to_le_bytes());
        out[22..24].copy_from_slice(&self.write_time.to_le_bytes());
        out[24..26].copy_from_slice(&self.write_date.to_le_bytes());
        out[26..28].copy_from_slice(&((self.first_cluster & 0xFFFF) as u16).to_le_bytes());
        out[28..32].copy_from_slice(&self.file_size.to_le_bytes());
        out
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    #[must_use]
    pub fn is_volume_label(&self) -> bool {
        self.attributes & ATTR_VOLUME_ID != 0 && self.attributes & ATTR_LONG_NAME != ATTR_LONG_NAME
    }

    /// "." and ".." entries.
    #[must_use]
    pub fn is_dot_entry(&self) -> bool {
        self.name[0] == b'.'
    }

    /// Checksum of the 11-byte name, stored in each long-name entry.
    #[must_use]
    pub fn checksum(&self) -> u8 {
        short_name_checksum(&self.name)
    }

    /// Display form: "BASE.EXT" with NT lower-case flags applied.
    #[must_use]
    pub fn display_name(&self) -> String {
        let mut base = self.name[..8].to_vec();
        if base[0] == SLOT_KANJI_E5 {
            base[0] = SLOT_DELETED;
        }
        let base = decode_oem(&base, self.nt_case & NT_LOWER_BASE != 0);
        let ext = decode_oem(&self.name[8..], self.nt_case & NT_LOWER_EXT != 0);
        if ext.is_empty() {
            base
        } else {
            format!("{base}.{ext}")
        }
    }

    fn validate_name(&self) -> Result<(), ParseError> {
        for (i, byte) in self.name.iter().enumerate() {
            let allowed_first = i == 0 && *byte == SLOT_KANJI_E5;
            if (*byte < 0x20 && !allowed_first) || INVALID_SHORT_CHARS.contains(byte) {
                return Err(ParseError::InvalidField {
                    field: "short_name",
                    reason: "contains a character not allowed in 8.3 names",
                });
            }
        }
        if self.name[0] == b' ' {
            return Err(ParseError::InvalidField {
                field: "short_name",
                reason: "starts with a space",
            });
        }
        Ok(())
    }
}

/// Bytes are interpreted as Latin-1, which covers ASCII names exactly.
fn decode_oem(bytes: &[u8], lower: bool) -> String {
    let end = bytes
        .iter()
        .rposition(|b| *b != b' ')
        .map_or(0, |pos| pos + 1);
    bytes[..end]
        .iter()
        .map(|b| {
            let c = char::from(*b);
            if lower { c.to_ascii_lowercase() } else { c }
        })
        .collect()
}

#[must_use]
pub fn short_name_checksum(name: &[u8; 11]) -> u8 {
    name.iter()
        .fold(0_u8, |sum, byte| sum.rotate_right(1).wrapping_add(*byte))
}

/// One VFAT long-name entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LfnEntry {
    /// 1-based position of this piece within the name.
    pub ordinal: u8,
    pub is_last: bool,
    pub checksum: u8,
    pub units: [u16; LFN_UNITS_PER_ENTRY],
}

impl LfnEntry {
    const UNIT_OFFSETS: [usize; LFN_UNITS_PER_ENTRY] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        let raw = ensure_slice(bytes, offset, DIR_ENTRY_SIZE)?;
        let mut units = [0_u16; LFN_UNITS_PER_ENTRY];
        for (slot, at) in units.iter_mut().zip(Self::UNIT_OFFSETS) {
            *slot = read_le_u16(raw, at)?;
        }
        Ok(Self {
            ordinal: raw[0] & 0x1F,
            is_last: raw[0] & LFN_LAST_FLAG != 0,
            checksum: raw[13],
            units,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut out = [0_u8; DIR_ENTRY_SIZE];
        out[0] = self.ordinal | if self.is_last { LFN_LAST_FLAG } else { 0 };
        out[11] = ATTR_LONG_NAME;
        out[13] = self.checksum;
        for (unit, at) in self.units.iter().zip(Self::UNIT_OFFSETS) {
            out[at..at + 2].copy_from_slice(&unit.to_le_bytes());
        }
        out
    }
}

/// Long-name entries for `name` in on-disk order (highest ordinal first).
pub fn lfn_entries_for(name: &str, checksum: u8) -> Result<Vec<LfnEntry>, ParseError> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.is_empty() || units.len() > 255 {
        return Err(ParseError::InvalidField {
            field: "long_name",
            reason: "must be 1..=255 UTF-16 units",
        });
    }
    let chunks: Vec<&[u16]> = units.chunks(LFN_UNITS_PER_ENTRY).collect();
    let count = chunks.len();
    let mut out = Vec::with_capacity(count);
    for (i, chunk) in chunks.iter().enumerate().rev() {
        let mut piece = [0xFFFF_u16; LFN_UNITS_PER_ENTRY];
        piece[..chunk.len()].copy_from_slice(chunk);
        if chunk.len() < LFN_UNITS_PER_ENTRY {
            piece[chunk.len()] = 0;
        }
        out.push(LfnEntry {
            ordinal: u8::try_from(i + 1)
                .map_err(|_| ParseError::IntegerConversion { field: "lfn_ordinal" })?,
            is_last: i + 1 == count,
            checksum,
            units: piece,
        });
    }
    Ok(out)
}

/// Classification of one 32-byte directory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirSlot {
    End,
    Deleted,
    Long(LfnEntry),
    Short(FatShortEntry),
}

pub fn parse_dir_slot(bytes: &[u8], offset: usize) -> Result<DirSlot, ParseError> {
    let raw = ensure_slice(bytes, offset, DIR_ENTRY_SIZE)?;
    match raw[0] {
        SLOT_END => Ok(DirSlot::End),
        SLOT_DELETED => Ok(DirSlot::Deleted),
        _ if raw[11] & 0x3F == ATTR_LONG_NAME => Ok(DirSlot::Long(LfnEntry::parse(raw, 0)?)),
        _ => Ok(DirSlot::Short(FatShortEntry::parse(raw, 0)?)),
    }
}

/// A decoded directory member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatDirEntry {
    /// Long name when a valid long-name run precedes the entry, otherwise
    /// the display form of the short name.
    pub name: String,
    pub short: FatShortEntry,
    /// Index of the short entry's slot within the directory.
    pub slot: usize,
}

/// A directory slot that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSlotError {
    pub slot: usize,
    /// Best-effort name for diagnostics.
    pub name: String,
    pub error: ParseError,
}

#[derive(Debug, Default)]
struct LongNameRun {
    checksum: u8,
    expected_next: u8,
    pieces: Vec<[u16; LFN_UNITS_PER_ENTRY]>,
}

impl LongNameRun {
    fn start(entry: &LfnEntry) -> Option<Self> {
        if entry.ordinal == 0 || entry.ordinal > MAX_LFN_ENTRIES {
            return None;
        }
        Some(Self {
            checksum: entry.checksum,
            expected_next: entry.ordinal - 1,
            pieces: vec![entry.units],
        })
    }

    /// Accept the next piece; `false` breaks the run.
    fn push(&mut self, entry: &LfnEntry) -> bool {
        if entry.is_last || entry.ordinal != self.expected_next || entry.checksum != self.checksum
        {
            return false;
        }
        self.expected_next -= 1;
        self.pieces.push(entry.units);
        true
    }

    fn finish(self, short: &FatShortEntry) -> Option<String> {
        if self.expected_next != 0 || self.checksum != short.checksum() {
            return None;
        }
        let units: Vec<u16> = self
            .pieces
            .iter()
            .rev()
            .flat_map(|piece| piece.iter().copied())
            .take_while(|unit| *unit != 0 && *unit != 0xFFFF)
            .collect();
        if units.is_empty() {
            None
        } else {
            Some(String::from_utf16_lossy(&units))
        }
    }
}

/// Decode every live entry of a directory region, in slot order.
///
/// Stops at the first end-of-directory slot. Volume labels and the "." and
/// ".." entries are skipped. A slot that cannot be decoded is returned as an
/// error in its position; the remaining slots are still decoded.
#[must_use]
pub fn parse_directory(bytes: &[u8]) -> Vec<Result<FatDirEntry, DirSlotError>> {
    let mut out = Vec::new();
    let mut run: Option<LongNameRun> = None;

    for slot in 0..bytes.len() / DIR_ENTRY_SIZE {
        let parsed = match parse_dir_slot(bytes, slot * DIR_ENTRY_SIZE) {
            Ok(parsed) => parsed,
            Err(error) => {
                out.push(Err(DirSlotError {
                    slot,
                    name: String::new(),
                    error,
                }));
                run = None;
                continue;
            }
        };
        match parsed {
            DirSlot::End => break,
            DirSlot::Deleted => run = None,
            DirSlot::Long(entry) => {
                run = if entry.is_last {
                    LongNameRun::start(&entry)
                } else {
                    run.and_then(|mut current| current.push(&entry).then_some(current))
                };
            }
            DirSlot::Short(short) => {
                let long = run.take().and_then(|current| current.finish(&short));
                if short.is_volume_label() || short.is_dot_entry() {
                    continue;
                }
                let name = long.unwrap_or_else(|| short.display_name());
                match short.validate_name() {
                    Ok(()) => out.push(Ok(FatDirEntry { name, short, slot })),
                    Err(error) => out.push(Err(DirSlotError { slot, name, error })),
                }
            }
        }
    }
    out
}

// ── Timestamps ──────────────────────────────────────────────────────────────

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Convert a FAT date/time pair (local time, treated as UTC) to Unix
/// seconds. Returns `None` for an unset or malformed date.
#[must_use]
pub fn fat_datetime_to_unix(date: u16, time: u16) -> Option<i64> {
    let year = 1980 + i64::from(date >> 9);
    let month = i64::from((date >> 5) & 0x0F);
    let day = i64::from(date & 0x1F);
    if !(1..=12).contains(&month) || day == 0 {
        return None;
    }
    let hour = i64::from(time >> 11);
    let minute = i64::from((time >> 5) & 0x3F);
    let second = i64::from(time & 0x1F) * 2;
    if hour > 23 || minute > 59 || second > 59 {
        return None;
    }
    Some(days_from_civil(year, month, day) * 86_400 + hour * 3600 + minute * 60 + second)
}

/// Encode a calendar date and time as a FAT `(date, time)` pair.
#[must_use]
pub fn fat_datetime(
    year: u16,
    month: u16,
    day: u16,
    hour: u16,
    minute: u16,
    second: u16,
) -> (u16, u16) {
    let date = ((year.saturating_sub(1980)) << 9) | (month << 5) | day;
    let time = (hour << 11) | (minute << 5) | (second / 2);
    (date, time)
}
