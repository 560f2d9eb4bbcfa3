//! GUID partition table.

use crate::{
    InvalidEntry, PartitionTable, PartitionTableEntry, PartitionTableType, PartitionType,
    TableKind,
};
use pfs_block::{BlockDevice, read_bytes};
use pfs_error::{PfsError, Result};
use pfs_types::{Guid, ParseError, Record, usize_from};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const GPT_REVISION_1_0: u32 = 0x0001_0000;
pub const HEADER_SIZE: u32 = 92;
pub const ENTRY_SIZE: u32 = 128;
pub const DEFAULT_ENTRY_COUNT: u32 = 128;
pub const NAME_UNITS: usize = 36;
/// Attribute bit 2: legacy BIOS bootable.
pub const ATTR_LEGACY_BIOS_BOOTABLE: u64 = 1 << 2;

const MAX_ENTRY_COUNT: u32 = 16_384;
const HEADER_CRC_OFFSET: usize = 16;

/// Well-known partition type GUIDs.
pub mod type_guids {
    use pfs_types::Guid;

    pub const EFI_SYSTEM: Guid = Guid::from_fields(
        0xC12A_7328,
        0xF81F,
        0x11D2,
        [0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9, 0x3B],
    );
    pub const BIOS_BOOT: Guid = Guid::from_fields(
        0x2168_6148,
        0x6449,
        0x6E6F,
        [0x74, 0x4E, 0x65, 0x65, 0x64, 0x45, 0x46, 0x49],
    );
    pub const MS_RESERVED: Guid = Guid::from_fields(
        0xE3C9_E316,
        0x0B5C,
        0x4DB8,
        [0x81, 0x7D, 0xF9, 0x2D, 0xF0, 0x02, 0x15, 0xAE],
    );
    pub const MS_BASIC_DATA: Guid = Guid::from_fields(
        0xEBD0_A0A2,
        0xB9E5,
        0x4433,
        [0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7],
    );
    pub const LINUX_FS: Guid = Guid::from_fields(
        0x0FC6_3DAF,
        0x8483,
        0x4772,
        [0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47, 0x7D, 0xE4],
    );
    pub const LINUX_SWAP: Guid = Guid::from_fields(
        0x0657_FD6D,
        0xA4AB,
        0x43C4,
        [0x84, 0xE5, 0x09, 0x33, 0xC8, 0x4B, 0x4F, 0x4F],
    );
    pub const APPLE_HFS: Guid = Guid::from_fields(
        0x4846_5300,
        0x0000,
        0x11AA,
        [0xAA, 0x11, 0x00, 0x30, 0x65, 0x43, 0xEC, 0xAC],
    );
    pub const APPLE_APFS: Guid = Guid::from_fields(
        0x7C34_74A4,
        0x0000,
        0x11AA,
        [0xAA, 0x11, 0x00, 0x30, 0x65, 0x43, 0xEC, 0xAC],
    );
}

#[must_use]
pub fn gpt_type_name(guid: &Guid) -> Option<&'static str> {
    let known = [
        (type_guids::EFI_SYSTEM, "EFI System"),
        (type_guids::BIOS_BOOT, "BIOS boot"),
        (type_guids::MS_RESERVED, "Microsoft reserved"),
        (type_guids::MS_BASIC_DATA, "Microsoft basic data"),
        (type_guids::LINUX_FS, "Linux filesystem"),
        (type_guids::LINUX_SWAP, "Linux swap"),
        (type_guids::APPLE_HFS, "Apple HFS/HFS+"),
        (type_guids::APPLE_APFS, "Apple APFS"),
    ];
    known
        .iter()
        .find(|(known, _)| known == guid)
        .map(|(_, name)| *name)
}

fn read_guid(rec: &Record<'_>, offset: usize) -> std::result::Result<Guid, ParseError> {
    rec.fixed(offset).map(Guid)
}

/// GPT header (92 bytes used; the rest of the sector is reserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Guid,
    pub entries_lba: u64,
    pub entry_count: u32,
    pub entry_size: u32,
    pub entries_crc32: u32,
}

impl GptHeader {
    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, ParseError> {
        let rec = Record::little_endian(bytes);
        let signature: [u8; 8] = rec.fixed(0)?;
        if &signature != GPT_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from_le_bytes(*GPT_SIGNATURE),
                actual: u64::from_le_bytes(signature),
            });
        }
        Ok(Self {
            revision: rec.u32(8)?,
            header_size: rec.u32(12)?,
            header_crc32: rec.u32(16)?,
            current_lba: rec.u64(24)?,
            backup_lba: rec.u64(32)?,
            first_usable_lba: rec.u64(40)?,
            last_usable_lba: rec.u64(48)?,
            disk_guid: read_guid(&rec, 56)?,
            entries_lba: rec.u64(72)?,
            entry_count: rec.u32(80)?,
            entry_size: rec.u32(84)?,
            entries_crc32: rec.u32(88)?,
        })
    }

    /// Encode with a freshly computed header CRC.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut out = [0_u8; HEADER_SIZE as usize];
        out[..8].copy_from_slice(GPT_SIGNATURE);
        out[8..12].copy_from_slice(&self.revision.to_le_bytes());
        out[12..16].copy_from_slice(&HEADER_SIZE.to_le_bytes());
        out[24..32].copy_from_slice(&self.current_lba.to_le_bytes());
        out[32..40].copy_from_slice(&self.backup_lba.to_le_bytes());
        out[40..48].copy_from_slice(&self.first_usable_lba.to_le_bytes());
        out[48..56].copy_from_slice(&self.last_usable_lba.to_le_bytes());
        out[56..72].copy_from_slice(&self.disk_guid.0);
        out[72..80].copy_from_slice(&self.entries_lba.to_le_bytes());
        out[80..84].copy_from_slice(&self.entry_count.to_le_bytes());
        out[84..88].copy_from_slice(&self.entry_size.to_le_bytes());
        out[88..92].copy_from_slice(&self.entries_crc32.to_le_bytes());
        let crc = header_crc(&out);
        out[16..20].copy_from_slice(&crc.to_le_bytes());
        out
    }
}

/// CRC32 of a header with its own CRC field treated as zero.
fn header_crc(header: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[..HEADER_CRC_OFFSET]);
    hasher.update(&[0_u8; 4]);
    hasher.update(&header[HEADER_CRC_OFFSET + 4..]);
    hasher.finalize()
}

/// One 128-byte partition entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GptEntry {
    pub type_guid: Guid,
    pub unique_guid: Guid,
    pub first_lba: u64,
    /// Inclusive.
    pub last_lba: u64,
    pub attributes: u64,
    pub name: String,
}

impl GptEntry {
    pub fn parse(bytes: &[u8], offset: usize) -> std::result::Result<Self, ParseError> {
        let rec = Record::new(bytes, offset, pfs_types::Endian::Little)?;
        let units: Vec<u16> = (0..NAME_UNITS)
            .map(|i| rec.u16(56 + i * 2))
            .collect::<std::result::Result<_, _>>()?;
        let end = units.iter().position(|u| *u == 0).unwrap_or(units.len());
        Ok(Self {
            type_guid: read_guid(&rec, 0)?,
            unique_guid: read_guid(&rec, 16)?,
            first_lba: rec.u64(32)?,
            last_lba: rec.u64(40)?,
            attributes: rec.u64(48)?,
            name: String::from_utf16_lossy(&units[..end]),
        })
    }

    pub fn encode(&self) -> std::result::Result<[u8; ENTRY_SIZE as usize], ParseError> {
        let units: Vec<u16> = self.name.encode_utf16().collect();
        if units.len() > NAME_UNITS {
            return Err(ParseError::InvalidField {
                field: "gpt_name",
                reason: "longer than 36 UTF-16 units",
            });
        }
        let mut out = [0_u8; ENTRY_SIZE as usize];
        out[..16].copy_from_slice(&self.type_guid.0);
        out[16..32].copy_from_slice(&self.unique_guid.0);
        out[32..40].copy_from_slice(&self.first_lba.to_le_bytes());
        out[40..48].copy_from_slice(&self.last_lba.to_le_bytes());
        out[48..56].copy_from_slice(&self.attributes.to_le_bytes());
        for (i, unit) in units.iter().enumerate() {
            out[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        Ok(out)
    }

    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.type_guid.is_nil()
    }
}

/// Sector offsets at which a GPT header may sit: LBA 1 for 512-byte and
/// 4096-byte sectors.
const HEADER_PROBE_OFFSETS: [usize; 2] = [512, 4096];

/// Primary header sector and the table's own sector size.
///
/// LBA 1 is tried at the device's sector size first, then at the larger
/// probe offsets that are whole multiples of it, so a disk partitioned
/// with 4 KiB sectors still decodes through a 512-byte view.
fn read_primary_header(device: &dyn BlockDevice) -> Result<(u32, Vec<u8>)> {
    let device_sector = device.sector_size();
    let larger = HEADER_PROBE_OFFSETS
        .iter()
        .filter_map(|at| u32::try_from(*at).ok())
        .filter(|at| *at > device_sector && at % device_sector == 0);
    for size in std::iter::once(device_sector).chain(larger) {
        if device.len_bytes() < 2 * u64::from(size) {
            break;
        }
        let mut raw = vec![0_u8; size as usize];
        read_bytes(device, u64::from(size), &mut raw)?;
        if raw.starts_with(GPT_SIGNATURE) {
            return Ok((size, raw));
        }
        trace!(size, "gpt: no header at this sector size");
    }
    Err(PfsError::UnsupportedFormat(format!(
        "no GPT header at LBA 1 for {device_sector}-byte sectors"
    )))
}

/// The UEFI GUID partition table.
#[derive(Debug, Clone, Copy, Default)]
pub struct GptPartitionTableType;

impl PartitionTableType for GptPartitionTableType {
    fn name(&self) -> &'static str {
        "gpt"
    }

    fn supports(&self, first_bytes: &[u8]) -> bool {
        HEADER_PROBE_OFFSETS
            .iter()
            .any(|at| first_bytes.get(*at..at + 8) == Some(&GPT_SIGNATURE[..]))
    }

    fn create(&self, _first_bytes: &[u8], device: &dyn BlockDevice) -> Result<PartitionTable> {
        let (table_sector_size, header_sector) = read_primary_header(device)?;
        // Device sectors per table LBA; 8 for a 4 KiB table on 512-byte sectors.
        let scale = u64::from(table_sector_size / device.sector_size());
        let raw = header_sector.as_slice();
        let header = GptHeader::parse(raw).map_err(|err| PfsError::from_parse(scale, &err))?;

        let header_size = usize_from(u64::from(header.header_size), "header_size")
            .map_err(|err| PfsError::from_parse(scale, &err))?;
        if header.header_size < HEADER_SIZE || header_size > raw.len() {
            return Err(PfsError::corruption(
                scale,
                format!("GPT header size {} out of range", header.header_size),
            ));
        }
        let computed = header_crc(&raw[..header_size]);
        if computed != header.header_crc32 {
            return Err(PfsError::corruption(
                scale,
                format!(
                    "GPT header CRC mismatch: stored {:#010x}, computed {computed:#010x}",
                    header.header_crc32
                ),
            ));
        }
        if header.entry_size < ENTRY_SIZE || header.entry_size % 8 != 0 {
            return Err(PfsError::corruption(
                scale,
                format!("GPT entry size {} invalid", header.entry_size),
            ));
        }
        if header.entry_count > MAX_ENTRY_COUNT {
            return Err(PfsError::corruption(
                scale,
                format!("GPT entry count {} too large", header.entry_count),
            ));
        }

        let entry_size = header.entry_size as usize;
        let mut array = vec![0_u8; header.entry_count as usize * entry_size];
        let array_block = header
            .entries_lba
            .checked_mul(scale)
            .ok_or_else(|| PfsError::corruption(scale, "GPT entry array offset overflows"))?;
        let array_offset = header
            .entries_lba
            .checked_mul(u64::from(table_sector_size))
            .ok_or_else(|| PfsError::corruption(scale, "GPT entry array offset overflows"))?;
        read_bytes(device, array_offset, &mut array)?;
        let computed = crc32fast::hash(&array);
        if computed != header.entries_crc32 {
            return Err(PfsError::corruption(
                array_block,
                format!(
                    "GPT entry array CRC mismatch: stored {:#010x}, computed {computed:#010x}",
                    header.entries_crc32
                ),
            ));
        }
        debug!(
            entries = header.entry_count,
            disk_guid = %header.disk_guid,
            table_sector_size,
            "gpt: header validated"
        );

        let device_sectors = device.sector_count();
        let mut table = PartitionTable::new(TableKind::Gpt);
        for index in 0..header.entry_count as usize {
            let entry = GptEntry::parse(&array, index * entry_size)
                .map_err(|err| PfsError::from_parse(array_block, &err))?;
            if entry.is_unused() {
                continue;
            }
            let type_tag = PartitionType::Gpt(entry.type_guid);
            let start_sector = entry.first_lba.saturating_mul(scale);
            let end_sector = entry
                .last_lba
                .checked_add(1)
                .and_then(|end| end.checked_mul(scale));
            let reason = if entry.last_lba < entry.first_lba {
                Some("last LBA precedes first LBA")
            } else if entry.first_lba == 0 {
                Some("partition starts at sector zero")
            } else if end_sector.is_none_or(|end| end > device_sectors) {
                Some("extends past the end of the device")
            } else {
                None
            };
            let sector_count = entry
                .last_lba
                .checked_sub(entry.first_lba)
                .map_or(0, |span| (span + 1).saturating_mul(scale));
            if let Some(reason) = reason {
                warn!(index, reason, "gpt: ignoring invalid partition entry");
                table.invalid.push(InvalidEntry {
                    index,
                    start_sector,
                    sector_count,
                    type_tag,
                    reason: reason.to_owned(),
                });
                continue;
            }
            trace!(index, first = entry.first_lba, last = entry.last_lba, "gpt: entry");
            table.entries.push(PartitionTableEntry {
                index,
                start_sector,
                sector_count,
                type_tag,
                boot_flag: entry.attributes & ATTR_LEGACY_BIOS_BOOTABLE != 0,
                name: Some(entry.name),
                child_table: None,
            });
        }
        Ok(table)
    }
}

/// Serializes a GPT disk: protective MBR, primary header and entry array,
/// and the backup entry array and header at the end of the disk.
#[derive(Debug, Clone)]
pub struct GptLayout {
    pub disk_guid: Guid,
    pub sector_size: u32,
    pub total_sectors: u64,
    /// `(slot, entry)` pairs; slots are below [`DEFAULT_ENTRY_COUNT`].
    pub entries: Vec<(usize, GptEntry)>,
}

impl GptLayout {
    /// Build a layout from a detected-style table of GPT entries.
    pub fn from_table(
        table: &PartitionTable,
        disk_guid: Guid,
        sector_size: u32,
        total_sectors: u64,
    ) -> Result<Self> {
        let mut entries = Vec::with_capacity(table.entries.len());
        for entry in &table.entries {
            let PartitionType::Gpt(type_guid) = entry.type_tag else {
                return Err(PfsError::Format("MBR type tag in a GPT table".to_owned()));
            };
            let mut unique = disk_guid.0;
            unique[15] ^= 0x80 | u8::try_from(entry.index & 0x7F).unwrap_or(0);
            unique[14] ^= u8::try_from(entry.index >> 7).unwrap_or(0xFF);
            entries.push((
                entry.index,
                GptEntry {
                    type_guid,
                    unique_guid: Guid(unique),
                    first_lba: entry.start_sector,
                    last_lba: entry.end_sector().saturating_sub(1),
                    attributes: if entry.boot_flag {
                        ATTR_LEGACY_BIOS_BOOTABLE
                    } else {
                        0
                    },
                    name: entry.name.clone().unwrap_or_default(),
                },
            ));
        }
        Ok(Self {
            disk_guid,
            sector_size,
            total_sectors,
            entries,
        })
    }

    /// Sectors occupied by one copy of the entry array.
    #[must_use]
    pub fn entry_array_sectors(&self) -> u64 {
        (u64::from(DEFAULT_ENTRY_COUNT) * u64::from(ENTRY_SIZE))
            .div_ceil(u64::from(self.sector_size))
    }

    #[must_use]
    pub fn first_usable_lba(&self) -> u64 {
        2 + self.entry_array_sectors()
    }

    #[must_use]
    pub fn last_usable_lba(&self) -> u64 {
        self.total_sectors
            .saturating_sub(2 + self.entry_array_sectors())
    }

    /// `(sector, bytes)` pairs, each exactly one sector long.
    pub fn to_sectors(&self) -> Result<Vec<(u64, Vec<u8>)>> {
        let ss = self.sector_size as usize;
        let array_sectors = self.entry_array_sectors();
        if self.total_sectors < 2 * array_sectors + 4 {
            return Err(PfsError::Format(format!(
                "disk of {} sectors is too small for a GPT",
                self.total_sectors
            )));
        }

        let mut array = vec![0_u8; usize_from(array_sectors, "array_sectors")
            .map_err(|err| PfsError::from_parse(0, &err))?
            * ss];
        for (slot, entry) in &self.entries {
            if *slot >= DEFAULT_ENTRY_COUNT as usize {
                return Err(PfsError::Format(format!("GPT slot {slot} out of range")));
            }
            if entry.first_lba < self.first_usable_lba() || entry.last_lba > self.last_usable_lba()
            {
                return Err(PfsError::Format(format!(
                    "GPT slot {slot} outside the usable area"
                )));
            }
            let at = slot * ENTRY_SIZE as usize;
            let encoded = entry.encode().map_err(|err| PfsError::from_parse(0, &err))?;
            array[at..at + ENTRY_SIZE as usize].copy_from_slice(&encoded);
        }
        let array_len = (DEFAULT_ENTRY_COUNT * ENTRY_SIZE) as usize;
        let entries_crc32 = crc32fast::hash(&array[..array_len]);

        let last = self.total_sectors - 1;
        let backup_array = last - array_sectors;
        let primary = GptHeader {
            revision: GPT_REVISION_1_0,
            header_size: HEADER_SIZE,
            header_crc32: 0,
            current_lba: 1,
            backup_lba: last,
            first_usable_lba: self.first_usable_lba(),
            last_usable_lba: self.last_usable_lba(),
            disk_guid: self.disk_guid,
            entries_lba: 2,
            entry_count: DEFAULT_ENTRY_COUNT,
            entry_size: ENTRY_SIZE,
            entries_crc32,
        };
        let backup = GptHeader {
            current_lba: last,
            backup_lba: 1,
            entries_lba: backup_array,
            ..primary
        };

        let mut out = vec![(0, self.protective_mbr())];
        out.push((1, pad_sector(&primary.encode(), ss)));
        for (i, chunk) in array.chunks(ss).enumerate() {
            out.push((2 + i as u64, chunk.to_vec()));
        }
        for (i, chunk) in array.chunks(ss).enumerate() {
            out.push((backup_array + i as u64, chunk.to_vec()));
        }
        out.push((last, pad_sector(&backup.encode(), ss)));
        Ok(out)
    }

    fn protective_mbr(&self) -> Vec<u8> {
        let mut sector = vec![0_u8; self.sector_size as usize];
        let count = u32::try_from(self.total_sectors - 1).unwrap_or(u32::MAX);
        let entry = crate::MbrEntry {
            index: 0,
            boot_indicator: 0,
            start_chs: [0x00, 0x02, 0x00],
            type_tag: 0xEE,
            end_chs: [0xFF, 0xFF, 0xFF],
            start_lba: 1,
            sector_count: count,
        };
        sector[446..462].copy_from_slice(&entry.encode());
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }
}

fn pad_sector(bytes: &[u8], sector_size: usize) -> Vec<u8> {
    let mut sector = vec![0_u8; sector_size];
    sector[..bytes.len()].copy_from_slice(bytes);
    sector
}
