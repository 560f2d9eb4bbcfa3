//! HFS+ and HFSX on-disk structures.
//!
//! All multi-byte fields are big-endian. Layouts follow Apple TN1150.

use pfs_types::{
    CatalogNodeId, Endian, ParseError, Record, ensure_slice, read_be_u16, write_be_u16,
    write_be_u32, write_be_u64, write_bytes, write_u8,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const VOLUME_HEADER_OFFSET: usize = 1024;
pub const VOLUME_HEADER_SIZE: usize = 512;
/// "H+"
pub const HFSPLUS_SIGNATURE: u16 = 0x482B;
/// "HX"
pub const HFSX_SIGNATURE: u16 = 0x4858;
pub const HFSPLUS_VERSION: u16 = 4;
pub const HFSX_VERSION: u16 = 5;

/// Seconds between 1904-01-01 and 1970-01-01.
pub const HFS_EPOCH_OFFSET: i64 = 2_082_844_800;

pub const FORK_DATA_SIZE: usize = 80;
pub const EXTENT_RECORD_LEN: usize = 8;
pub const EXTENT_DESCRIPTOR_SIZE: usize = 8;

pub const NODE_DESCRIPTOR_SIZE: usize = 14;
pub const HEADER_RECORD_SIZE: usize = 106;
pub const BT_BIG_KEYS_MASK: u32 = 0x0000_0002;
pub const BT_VARIABLE_INDEX_KEYS_MASK: u32 = 0x0000_0004;
pub const KEY_COMPARE_CASE_FOLDING: u8 = 0xCF;
pub const KEY_COMPARE_BINARY: u8 = 0xBC;

pub const CATALOG_FOLDER_SIZE: usize = 88;
pub const CATALOG_FILE_SIZE: usize = 248;
pub const CATALOG_KEY_MIN_LENGTH: u16 = 6;
pub const CATALOG_KEY_MAX_LENGTH: u16 = 516;
pub const MAX_NAME_UNITS: usize = 255;

pub const EXTENT_KEY_LENGTH: u16 = 10;

/// Convert an HFS+ timestamp (seconds since 1904, UTC) to Unix seconds.
#[must_use]
pub fn hfs_time_to_unix(seconds: u32) -> i64 {
    i64::from(seconds) - HFS_EPOCH_OFFSET
}

/// Convert Unix seconds to an HFS+ timestamp, clamping to the representable
/// range.
#[must_use]
pub fn unix_to_hfs_time(seconds: i64) -> u32 {
    u32::try_from((seconds + HFS_EPOCH_OFFSET).clamp(0, i64::from(u32::MAX))).unwrap_or(u32::MAX)
}

// ── Fork data ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HfsPlusExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

impl HfsPlusExtentDescriptor {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.block_count == 0
    }
}

/// Parse an 8-entry extent record (64 bytes).
pub fn parse_extent_record(
    bytes: &[u8],
    offset: usize,
) -> Result<[HfsPlusExtentDescriptor; EXTENT_RECORD_LEN], ParseError> {
    let rec = Record::new(bytes, offset, Endian::Big)?;
    let mut out = [HfsPlusExtentDescriptor::default(); EXTENT_RECORD_LEN];
    for (i, slot) in out.iter_mut().enumerate() {
        let at = i * EXTENT_DESCRIPTOR_SIZE;
        *slot = HfsPlusExtentDescriptor {
            start_block: rec.u32(at)?,
            block_count: rec.u32(at + 4)?,
        };
    }
    Ok(out)
}

pub fn write_extent_record(
    buf: &mut [u8],
    offset: usize,
    extents: &[HfsPlusExtentDescriptor; EXTENT_RECORD_LEN],
) -> Result<(), ParseError> {
    for (i, ext) in extents.iter().enumerate() {
        let at = offset + i * EXTENT_DESCRIPTOR_SIZE;
        write_be_u32(buf, at, ext.start_block)?;
        write_be_u32(buf, at + 4, ext.block_count)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HfsPlusForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: [HfsPlusExtentDescriptor; EXTENT_RECORD_LEN],
}

impl HfsPlusForkData {
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        let rec = Record::new(bytes, offset, Endian::Big)?;
        Ok(Self {
            logical_size: rec.u64(0)?,
            clump_size: rec.u32(8)?,
            total_blocks: rec.u32(12)?,
            extents: parse_extent_record(bytes, offset + 16)?,
        })
    }

    pub fn write_into(&self, buf: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_be_u64(buf, offset, self.logical_size)?;
        write_be_u32(buf, offset + 8, self.clump_size)?;
        write_be_u32(buf, offset + 12, self.total_blocks)?;
        write_extent_record(buf, offset + 16, &self.extents)
    }

    /// Blocks covered by the inline extent record.
    #[must_use]
    pub fn inline_blocks(&self) -> u64 {
        self.extents
            .iter()
            .map(|ext| u64::from(ext.block_count))
            .sum()
    }
}

// ── Volume header ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HfsPlusVolumeHeader {
    pub signature: u16,
    pub version: u16,
    pub attributes: u32,
    pub last_mounted_version: u32,
    pub journal_info_block: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub checked_date: u32,
    pub file_count: u32,
    pub folder_count: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub next_allocation: u32,
    pub rsrc_clump_size: u32,
    pub data_clump_size: u32,
    pub next_catalog_id: u32,
    pub write_count: u32,
    pub encodings_bitmap: u64,
    pub finder_info: [u32; 8],
    pub allocation_file: HfsPlusForkData,
    pub extents_file: HfsPlusForkData,
    pub catalog_file: HfsPlusForkData,
    pub attributes_file: HfsPlusForkData,
    pub startup_file: HfsPlusForkData,
}

impl HfsPlusVolumeHeader {
    /// Parse from a full image (header at byte 1024).
    pub fn parse_from_image(image: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(image, VOLUME_HEADER_OFFSET, VOLUME_HEADER_SIZE)?;
        Self::parse_region(region)
    }

    /// Parse the 512-byte header region.
    pub fn parse_region(region: &[u8]) -> Result<Self, ParseError> {
        let rec = Record::big_endian(region);
        let signature = rec.u16(0)?;
        if signature != HFSPLUS_SIGNATURE && signature != HFSX_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(HFSPLUS_SIGNATURE),
                actual: u64::from(signature),
            });
        }
        let version = rec.u16(2)?;
        if version != HFSPLUS_VERSION && version != HFSX_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "expected 4 (HFS+) or 5 (HFSX)",
            });
        }
        let block_size = rec.u32(40)?;
        if block_size < 512 || !block_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a power of two >= 512",
            });
        }
        let total_blocks = rec.u32(44)?;
        let free_blocks = rec.u32(48)?;
        if free_blocks > total_blocks {
            return Err(ParseError::InvalidField {
                field: "free_blocks",
                reason: "exceeds total_blocks",
            });
        }

        let mut finder_info = [0_u32; 8];
        for (i, slot) in finder_info.iter_mut().enumerate() {
            *slot = rec.u32(80 + i * 4)?;
        }

        Ok(Self {
            signature,
            version,
            attributes: rec.u32(4)?,
            last_mounted_version: rec.u32(8)?,
            journal_info_block: rec.u32(12)?,
            create_date: rec.u32(16)?,
            modify_date: rec.u32(20)?,
            backup_date: rec.u32(24)?,
            checked_date: rec.u32(28)?,
            file_count: rec.u32(32)?,
            folder_count: rec.u32(36)?,
            block_size,
            total_blocks,
            free_blocks,
            next_allocation: rec.u32(52)?,
            rsrc_clump_size: rec.u32(56)?,
            data_clump_size: rec.u32(60)?,
            next_catalog_id: rec.u32(64)?,
            write_count: rec.u32(68)?,
            encodings_bitmap: rec.u64(72)?,
            finder_info,
            allocation_file: HfsPlusForkData::parse(region, 112)?,
            extents_file: HfsPlusForkData::parse(region, 192)?,
            catalog_file: HfsPlusForkData::parse(region, 272)?,
            attributes_file: HfsPlusForkData::parse(region, 352)?,
            startup_file: HfsPlusForkData::parse(region, 432)?,
        })
    }

    /// Encode to the 512-byte header region.
    pub fn to_bytes(&self) -> Result<[u8; VOLUME_HEADER_SIZE], ParseError> {
        let mut out = [0_u8; VOLUME_HEADER_SIZE];
        write_be_u16(&mut out, 0, self.signature)?;
        write_be_u16(&mut out, 2, self.version)?;
        let words = [
            (4, self.attributes),
            (8, self.last_mounted_version),
            (12, self.journal_info_block),
            (16, self.create_date),
            (20, self.modify_date),
            (24, self.backup_date),
            (28, self.checked_date),
            (32, self.file_count),
            (36, self.folder_count),
            (40, self.block_size),
            (44, self.total_blocks),
            (48, self.free_blocks),
            (52, self.next_allocation),
            (56, self.rsrc_clump_size),
            (60, self.data_clump_size),
            (64, self.next_catalog_id),
            (68, self.write_count),
        ];
        for (offset, value) in words {
            write_be_u32(&mut out, offset, value)?;
        }
        write_be_u64(&mut out, 72, self.encodings_bitmap)?;
        for (i, value) in self.finder_info.iter().enumerate() {
            write_be_u32(&mut out, 80 + i * 4, *value)?;
        }
        self.allocation_file.write_into(&mut out, 112)?;
        self.extents_file.write_into(&mut out, 192)?;
        self.catalog_file.write_into(&mut out, 272)?;
        self.attributes_file.write_into(&mut out, 352)?;
        self.startup_file.write_into(&mut out, 432)?;
        Ok(out)
    }

    #[must_use]
    pub fn is_hfsx(&self) -> bool {
        self.signature == HFSX_SIGNATURE
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        u64::from(self.total_blocks) * u64::from(self.block_size)
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        u64::from(self.free_blocks) * u64::from(self.block_size)
    }
}

// ── B-tree nodes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Leaf,
    Index,
    Header,
    Map,
}

impl NodeKind {
    pub fn from_raw(raw: i8) -> Result<Self, ParseError> {
        match raw {
            -1 => Ok(Self::Leaf),
            0 => Ok(Self::Index),
            1 => Ok(Self::Header),
            2 => Ok(Self::Map),
            _ => Err(ParseError::InvalidField {
                field: "node_kind",
                reason: "expected -1, 0, 1 or 2",
            }),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> i8 {
        match self {
            Self::Leaf => -1,
            Self::Index => 0,
            Self::Header => 1,
            Self::Map => 2,
        }
    }
}

/// 14-byte descriptor at the start of every B-tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub forward_link: u32,
    pub backward_link: u32,
    pub kind: NodeKind,
    /// 1 for leaves, increasing toward the root; 0 for header/map nodes.
    pub height: u8,
    pub num_records: u16,
}

impl NodeDescriptor {
    pub fn parse(node: &[u8]) -> Result<Self, ParseError> {
        let rec = Record::big_endian(node);
        Ok(Self {
            forward_link: rec.u32(0)?,
            backward_link: rec.u32(4)?,
            kind: NodeKind::from_raw(rec.i8(8)?)?,
            height: rec.u8(9)?,
            num_records: rec.u16(10)?,
        })
    }

    pub fn write_into(&self, node: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(node, 0, self.forward_link)?;
        write_be_u32(node, 4, self.backward_link)?;
        write_u8(node, 8, self.kind.to_raw().to_be_bytes()[0])?;
        write_u8(node, 9, self.height)?;
        write_be_u16(node, 10, self.num_records)?;
        write_be_u16(node, 12, 0)
    }
}

/// Offsets of each record plus the free-space offset (`num_records + 1`
/// entries), validated to be increasing and inside the record area.
pub fn record_offsets(node: &[u8], num_records: u16) -> Result<Vec<usize>, ParseError> {
    let count = usize::from(num_records) + 1;
    let table_len = count * 2;
    let Some(table_start) = node.len().checked_sub(table_len) else {
        return Err(ParseError::OutOfRange {
            needed: table_len,
            offset: 0,
            actual: node.len(),
        });
    };

    let mut offsets = Vec::with_capacity(count);
    let mut previous = NODE_DESCRIPTOR_SIZE;
    for i in 0..count {
        let offset = usize::from(read_be_u16(node, node.len() - 2 * (i + 1))?);
        if offset < previous || offset > table_start {
            return Err(ParseError::InvalidField {
                field: "record_offset",
                reason: "offsets must increase and stay inside the node",
            });
        }
        previous = offset;
        offsets.push(offset);
    }
    Ok(offsets)
}

/// Bytes of record `index` of a node.
pub fn node_record(node: &[u8], num_records: u16, index: usize) -> Result<&[u8], ParseError> {
    if index >= usize::from(num_records) {
        return Err(ParseError::InvalidField {
            field: "record_index",
            reason: "beyond num_records",
        });
    }
    let offsets = record_offsets(node, num_records)?;
    ensure_slice(node, offsets[index], offsets[index + 1] - offsets[index])
}

/// Assemble a node image from a descriptor and serialized records.
pub fn encode_node(
    node_size: usize,
    descriptor: &NodeDescriptor,
    records: &[Vec<u8>],
) -> Result<Vec<u8>, ParseError> {
    let mut node = vec![0_u8; node_size];
    let num_records = u16::try_from(records.len())
        .map_err(|_| ParseError::IntegerConversion { field: "num_records" })?;
    let mut desc = *descriptor;
    desc.num_records = num_records;
    desc.write_into(&mut node)?;

    let table_len = (records.len() + 1) * 2;
    let mut offset = NODE_DESCRIPTOR_SIZE;
    for (i, record) in records.iter().enumerate() {
        if offset + record.len() + table_len > node_size {
            return Err(ParseError::InvalidField {
                field: "records",
                reason: "do not fit in node",
            });
        }
        write_bytes(&mut node, offset, record)?;
        let raw = u16::try_from(offset)
            .map_err(|_| ParseError::IntegerConversion { field: "record_offset" })?;
        write_be_u16(&mut node, node_size - 2 * (i + 1), raw)?;
        offset += record.len();
    }
    let free = u16::try_from(offset)
        .map_err(|_| ParseError::IntegerConversion { field: "free_offset" })?;
    write_be_u16(&mut node, node_size - 2 * (records.len() + 1), free)?;
    Ok(node)
}

/// The header record stored in node 0 of every HFS+ B-tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BTreeHeaderRecord {
    pub tree_depth: u16,
    pub root_node: u32,
    pub leaf_records: u32,
    pub first_leaf_node: u32,
    pub last_leaf_node: u32,
    pub node_size: u16,
    pub max_key_length: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub clump_size: u32,
    pub btree_type: u8,
    pub key_compare_type: u8,
    pub attributes: u32,
}

impl BTreeHeaderRecord {
    /// Parse from the first 512 bytes of node 0.
    pub fn parse_from_node(node: &[u8]) -> Result<Self, ParseError> {
        let desc = NodeDescriptor::parse(node)?;
        if desc.kind != NodeKind::Header {
            return Err(ParseError::InvalidField {
                field: "node_kind",
                reason: "node 0 is not a header node",
            });
        }
        let rec = Record::new(node, NODE_DESCRIPTOR_SIZE, Endian::Big)?;
        let node_size = rec.u16(18)?;
        if node_size < 512 || !node_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "node_size",
                reason: "must be a power of two >= 512",
            });
        }
        Ok(Self {
            tree_depth: rec.u16(0)?,
            root_node: rec.u32(2)?,
            leaf_records: rec.u32(6)?,
            first_leaf_node: rec.u32(10)?,
            last_leaf_node: rec.u32(14)?,
            node_size,
            max_key_length: rec.u16(20)?,
            total_nodes: rec.u32(22)?,
            free_nodes: rec.u32(26)?,
            clump_size: rec.u32(32)?,
            btree_type: rec.u8(36)?,
            key_compare_type: rec.u8(37)?,
            attributes: rec.u32(38)?,
        })
    }

    /// Encode the 106-byte header record.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let mut out = vec![0_u8; HEADER_RECORD_SIZE];
        write_be_u16(&mut out, 0, self.tree_depth)?;
        write_be_u32(&mut out, 2, self.root_node)?;
        write_be_u32(&mut out, 6, self.leaf_records)?;
        write_be_u32(&mut out, 10, self.first_leaf_node)?;
        write_be_u32(&mut out, 14, self.last_leaf_node)?;
        write_be_u16(&mut out, 18, self.node_size)?;
        write_be_u16(&mut out, 20, self.max_key_length)?;
        write_be_u32(&mut out, 22, self.total_nodes)?;
        write_be_u32(&mut out, 26, self.free_nodes)?;
        write_be_u32(&mut out, 32, self.clump_size)?;
        write_u8(&mut out, 36, self.btree_type)?;
        write_u8(&mut out, 37, self.key_compare_type)?;
        write_be_u32(&mut out, 38, self.attributes)?;
        Ok(out)
    }

    #[must_use]
    pub fn has_variable_index_keys(&self) -> bool {
        self.attributes & BT_VARIABLE_INDEX_KEYS_MASK != 0
    }

    /// Name ordering for the catalog. Only HFSX volumes may select binary.
    #[must_use]
    pub fn key_compare(&self, is_hfsx: bool) -> KeyCompare {
        if is_hfsx && self.key_compare_type == KEY_COMPARE_BINARY {
            KeyCompare::Binary
        } else {
            KeyCompare::CaseFolding
        }
    }
}

/// Split a keyed record into `(key, data)`.
///
/// `fixed_key_length` is the tree's `max_key_length` for index records in
/// trees without variable-length index keys; `None` means the key's own
/// length field decides. Data begins at the next even offset.
pub fn split_keyed_record(
    record: &[u8],
    fixed_key_length: Option<u16>,
) -> Result<(&[u8], &[u8]), ParseError> {
    let key_length = match fixed_key_length {
        Some(len) => usize::from(len),
        None => usize::from(read_be_u16(record, 0)?),
    };
    let key_end = 2 + key_length;
    let key = ensure_slice(record, 0, key_end)?;
    let data_start = key_end + (key_end & 1);
    let data = ensure_slice(record, data_start, record.len().saturating_sub(data_start))?;
    Ok((key, data))
}

// ── Names and key ordering ──────────────────────────────────────────────────

/// Catalog name ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyCompare {
    /// HFS+ default: case-insensitive, ignorable code points skipped.
    CaseFolding,
    /// HFSX binary: ordinal UTF-16 code unit order.
    Binary,
}

/// Case-fold one UTF-16 unit. `None` marks a code point that ordering
/// ignores.
#[must_use]
pub fn fold_unit(unit: u16) -> Option<u16> {
    match unit {
        0 => Some(0xFFFF),
        0x200C..=0x200F | 0x202A..=0x202E | 0x206A..=0x206F | 0xFEFF => None,
        0xD800..=0xDFFF => Some(unit),
        _ => {
            let Some(c) = char::from_u32(u32::from(unit)) else {
                return Some(unit);
            };
            let mut lower = c.to_lowercase();
            match (lower.next(), lower.next()) {
                (Some(folded), None) => u16::try_from(u32::from(folded)).ok().or(Some(unit)),
                _ => Some(unit),
            }
        }
    }
}

#[must_use]
pub fn compare_names(a: &[u16], b: &[u16], mode: KeyCompare) -> Ordering {
    match mode {
        KeyCompare::Binary => a.cmp(b),
        KeyCompare::CaseFolding => {
            let mut left = a.iter().filter_map(|u| fold_unit(*u));
            let mut right = b.iter().filter_map(|u| fold_unit(*u));
            loop {
                match (left.next(), right.next()) {
                    (None, None) => return Ordering::Equal,
                    (None, Some(_)) => return Ordering::Less,
                    (Some(_), None) => return Ordering::Greater,
                    (Some(l), Some(r)) => match l.cmp(&r) {
                        Ordering::Equal => {}
                        other => return other,
                    },
                }
            }
        }
    }
}

/// `HFSUniStr255`: length-prefixed UTF-16BE name.
fn parse_unistr(bytes: &[u8], offset: usize) -> Result<Vec<u16>, ParseError> {
    let rec = Record::new(bytes, offset, Endian::Big)?;
    let len = usize::from(rec.u16(0)?);
    if len > MAX_NAME_UNITS {
        return Err(ParseError::InvalidField {
            field: "name_length",
            reason: "exceeds 255 units",
        });
    }
    let raw = rec.slice(2, len * 2)?;
    Ok(raw
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

fn encode_unistr(name: &[u16], out: &mut Vec<u8>) -> Result<(), ParseError> {
    if name.len() > MAX_NAME_UNITS {
        return Err(ParseError::InvalidField {
            field: "name_length",
            reason: "exceeds 255 units",
        });
    }
    let len = u16::try_from(name.len())
        .map_err(|_| ParseError::IntegerConversion { field: "name_length" })?;
    out.extend_from_slice(&len.to_be_bytes());
    for unit in name {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    Ok(())
}

// ── Catalog keys ────────────────────────────────────────────────────────────

/// Catalog B-tree key: parent folder id + UTF-16 node name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogKey {
    pub parent_id: CatalogNodeId,
    pub name: Vec<u16>,
}

impl CatalogKey {
    #[must_use]
    pub fn new(parent_id: CatalogNodeId, name: &str) -> Self {
        Self {
            parent_id,
            name: name.encode_utf16().collect(),
        }
    }

    /// Encoded size in bytes, including the 2-byte length field.
    #[must_use]
    pub fn key_length(&self) -> usize {
        2 + 4 + 2 + self.name.len() * 2
    }

    #[must_use]
    pub fn name_string(&self) -> String {
        String::from_utf16_lossy(&self.name)
    }

    /// Parse a key starting at `offset`.
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        let rec = Record::new(bytes, offset, Endian::Big)?;
        let key_length = rec.u16(0)?;
        if !(CATALOG_KEY_MIN_LENGTH..=CATALOG_KEY_MAX_LENGTH).contains(&key_length) {
            return Err(ParseError::InvalidField {
                field: "catalog_key_length",
                reason: "must be in 6..=516",
            });
        }
        let parent_id = CatalogNodeId(rec.u32(2)?);
        let name = parse_unistr(bytes, offset + 6)?;
        if 6 + name.len() * 2 > usize::from(key_length) {
            return Err(ParseError::InvalidField {
                field: "catalog_key_length",
                reason: "shorter than the encoded name",
            });
        }
        Ok(Self { parent_id, name })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let mut out = Vec::with_capacity(self.key_length());
        let key_length = u16::try_from(self.key_length() - 2)
            .map_err(|_| ParseError::IntegerConversion { field: "catalog_key_length" })?;
        out.extend_from_slice(&key_length.to_be_bytes());
        out.extend_from_slice(&self.parent_id.0.to_be_bytes());
        encode_unistr(&self.name, &mut out)?;
        Ok(out)
    }

    /// Order by parent id, then name.
    #[must_use]
    pub fn compare(&self, other: &Self, mode: KeyCompare) -> Ordering {
        self.parent_id
            .cmp(&other.parent_id)
            .then_with(|| compare_names(&self.name, &other.name, mode))
    }
}

// ── Catalog records ─────────────────────────────────────────────────────────

pub const RECORD_TYPE_FOLDER: i16 = 1;
pub const RECORD_TYPE_FILE: i16 = 2;
pub const RECORD_TYPE_FOLDER_THREAD: i16 = 3;
pub const RECORD_TYPE_FILE_THREAD: i16 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogDates {
    pub create: u32,
    pub content_modify: u32,
    pub attribute_modify: u32,
    pub access: u32,
    pub backup: u32,
}

impl CatalogDates {
    fn parse(rec: &Record<'_>) -> Result<Self, ParseError> {
        Ok(Self {
            create: rec.u32(12)?,
            content_modify: rec.u32(16)?,
            attribute_modify: rec.u32(20)?,
            access: rec.u32(24)?,
            backup: rec.u32(28)?,
        })
    }

    fn write_into(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(buf, 12, self.create)?;
        write_be_u32(buf, 16, self.content_modify)?;
        write_be_u32(buf, 20, self.attribute_modify)?;
        write_be_u32(buf, 24, self.access)?;
        write_be_u32(buf, 28, self.backup)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogFolder {
    pub flags: u16,
    pub valence: u32,
    pub folder_id: CatalogNodeId,
    pub dates: CatalogDates,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogFile {
    pub flags: u16,
    pub file_id: CatalogNodeId,
    pub dates: CatalogDates,
    pub data_fork: HfsPlusForkData,
    pub resource_fork: HfsPlusForkData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogThread {
    pub parent_id: CatalogNodeId,
    pub name: Vec<u16>,
}

impl CatalogThread {
    #[must_use]
    pub fn name_string(&self) -> String {
        String::from_utf16_lossy(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogRecord {
    Folder(CatalogFolder),
    File(CatalogFile),
    FolderThread(CatalogThread),
    FileThread(CatalogThread),
}

impl CatalogRecord {
    /// Parse the data portion of a catalog leaf record.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let rec = Record::big_endian(data);
        match rec.i16(0)? {
            RECORD_TYPE_FOLDER => {
                ensure_slice(data, 0, CATALOG_FOLDER_SIZE)?;
                Ok(Self::Folder(CatalogFolder {
                    flags: rec.u16(2)?,
                    valence: rec.u32(4)?,
                    folder_id: CatalogNodeId(rec.u32(8)?),
                    dates: CatalogDates::parse(&rec)?,
                }))
            }
            RECORD_TYPE_FILE => {
                ensure_slice(data, 0, CATALOG_FILE_SIZE)?;
                Ok(Self::File(CatalogFile {
                    flags: rec.u16(2)?,
                    file_id: CatalogNodeId(rec.u32(8)?),
                    dates: CatalogDates::parse(&rec)?,
                    data_fork: HfsPlusForkData::parse(data, 88)?,
                    resource_fork: HfsPlusForkData::parse(data, 168)?,
                }))
            }
            kind @ (RECORD_TYPE_FOLDER_THREAD | RECORD_TYPE_FILE_THREAD) => {
                let thread = CatalogThread {
                    parent_id: CatalogNodeId(rec.u32(4)?),
                    name: parse_unistr(data, 8)?,
                };
                if kind == RECORD_TYPE_FOLDER_THREAD {
                    Ok(Self::FolderThread(thread))
                } else {
                    Ok(Self::FileThread(thread))
                }
            }
            _ => Err(ParseError::InvalidField {
                field: "catalog_record_type",
                reason: "expected 1..=4",
            }),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        match self {
            Self::Folder(folder) => {
                let mut out = vec![0_u8; CATALOG_FOLDER_SIZE];
                out[..2].copy_from_slice(&RECORD_TYPE_FOLDER.to_be_bytes());
                write_be_u16(&mut out, 2, folder.flags)?;
                write_be_u32(&mut out, 4, folder.valence)?;
                write_be_u32(&mut out, 8, folder.folder_id.0)?;
                folder.dates.write_into(&mut out)?;
                Ok(out)
            }
            Self::File(file) => {
                let mut out = vec![0_u8; CATALOG_FILE_SIZE];
                out[..2].copy_from_slice(&RECORD_TYPE_FILE.to_be_bytes());
                write_be_u16(&mut out, 2, file.flags)?;
                write_be_u32(&mut out, 8, file.file_id.0)?;
                file.dates.write_into(&mut out)?;
                file.data_fork.write_into(&mut out, 88)?;
                file.resource_fork.write_into(&mut out, 168)?;
                Ok(out)
            }
            Self::FolderThread(thread) | Self::FileThread(thread) => {
                let kind = if matches!(self, Self::FolderThread(_)) {
                    RECORD_TYPE_FOLDER_THREAD
                } else {
                    RECORD_TYPE_FILE_THREAD
                };
                let mut out = Vec::with_capacity(10 + thread.name.len() * 2);
                out.extend_from_slice(&kind.to_be_bytes());
                out.extend_from_slice(&[0, 0]);
                out.extend_from_slice(&thread.parent_id.0.to_be_bytes());
                encode_unistr(&thread.name, &mut out)?;
                Ok(out)
            }
        }
    }
}

// ── Extents overflow keys ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ForkType {
    Data,
    Resource,
}

impl ForkType {
    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Data => 0x00,
            Self::Resource => 0xFF,
        }
    }

    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0x00 => Ok(Self::Data),
            0xFF => Ok(Self::Resource),
            _ => Err(ParseError::InvalidField {
                field: "fork_type",
                reason: "expected 0x00 or 0xFF",
            }),
        }
    }
}

/// Extents overflow B-tree key. Ordered by file id, fork, start block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtentKey {
    pub file_id: CatalogNodeId,
    pub fork_type: ForkType,
    pub start_block: u32,
}

impl Ord for ExtentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.file_id
            .cmp(&other.file_id)
            .then(self.fork_type.cmp(&other.fork_type))
            .then(self.start_block.cmp(&other.start_block))
    }
}

impl PartialOrd for ExtentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl ExtentKey {
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        let rec = Record::new(bytes, offset, Endian::Big)?;
        if rec.u16(0)? != EXTENT_KEY_LENGTH {
            return Err(ParseError::InvalidField {
                field: "extent_key_length",
                reason: "expected 10",
            });
        }
        Ok(Self {
            fork_type: ForkType::from_raw(rec.u8(2)?)?,
            file_id: CatalogNodeId(rec.u32(4)?),
            start_block: rec.u32(8)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; 12] {
        let mut out = [0_u8; 12];
        out[..2].copy_from_slice(&EXTENT_KEY_LENGTH.to_be_bytes());
        out[2] = self.fork_type.to_raw();
        out[4..8].copy_from_slice(&self.file_id.0.to_be_bytes());
        out[8..12].copy_from_slice(&self.start_block.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> HfsPlusVolumeHeader {
        let mut catalog = HfsPlusForkData {
            logical_size: 8192,
            clump_size: 4096,
            total_blocks: 2,
            ..HfsPlusForkData::default()
        };
        catalog.extents[0] = HfsPlusExtentDescriptor {
            start_block: 10,
            block_count: 2,
        };
        HfsPlusVolumeHeader {
            signature: HFSPLUS_SIGNATURE,
            version: HFSPLUS_VERSION,
            attributes: 0x100,
            last_mounted_version: 0x3130_2E30,
            journal_info_block: 0,
            create_date: 3_000_000_000,
            modify_date: 3_000_000_100,
            backup_date: 0,
            checked_date: 0,
            file_count: 3,
            folder_count: 2,
            block_size: 4096,
            total_blocks: 16384,
            free_blocks: 16122,
            next_allocation: 40,
            rsrc_clump_size: 65536,
            data_clump_size: 65536,
            next_catalog_id: 22,
            write_count: 1,
            encodings_bitmap: 1,
            finder_info: [0; 8],
            allocation_file: HfsPlusForkData::default(),
            extents_file: HfsPlusForkData::default(),
            catalog_file: catalog,
            attributes_file: HfsPlusForkData::default(),
            startup_file: HfsPlusForkData::default(),
        }
    }

    #[test]
    fn catalog_key_length_matches_reference_values() {
        let key = CatalogKey::new(CatalogNodeId(7), "test.txt");
        assert_eq!(key.key_length(), 24);

        let bytes = key.encode().expect("encode");
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[..2], &[0x00, 0x16]);
        let parsed = CatalogKey::parse(&bytes, 0).expect("parse");
        assert_eq!(parsed.parent_id, CatalogNodeId(7));
        assert_eq!(parsed.name_string(), "test.txt");
        assert_eq!(parsed.key_length(), 24);

        let empty = CatalogKey::new(CatalogNodeId(7), "");
        assert_eq!(empty.key_length(), 8);
        assert_eq!(empty.encode().expect("encode"), vec![0, 6, 0, 0, 0, 7, 0, 0]);
    }

    #[test]
    fn catalog_key_rejects_inconsistent_length() {
        // keyLength 6 but name claims 3 units.
        let bytes = [0, 6, 0, 0, 0, 2, 0, 3, 0, b'a', 0, b'b', 0, b'c'];
        assert!(matches!(
            CatalogKey::parse(&bytes, 0),
            Err(ParseError::InvalidField { .. })
        ));
        assert!(matches!(
            CatalogKey::parse(&[0, 6, 0], 0),
            Err(ParseError::OutOfRange { .. })
        ));
    }

    #[test]
    fn case_folding_order() {
        let upper: Vec<u16> = "README".encode_utf16().collect();
        let lower: Vec<u16> = "readme".encode_utf16().collect();
        assert_eq!(
            compare_names(&upper, &lower, KeyCompare::CaseFolding),
            Ordering::Equal
        );
        assert_eq!(
            compare_names(&upper, &lower, KeyCompare::Binary),
            Ordering::Less
        );

        let a: Vec<u16> = "dir1".encode_utf16().collect();
        let b: Vec<u16> = "Dir2".encode_utf16().collect();
        assert_eq!(compare_names(&a, &b, KeyCompare::CaseFolding), Ordering::Less);
        assert_eq!(compare_names(&a, &b, KeyCompare::Binary), Ordering::Greater);

        // U+0000 sorts after every other unit; the private-data folder name
        // begins with four of them.
        let private = [0_u16, 0, 0, 0, u16::from(b'H')];
        let t: Vec<u16> = "test.txt".encode_utf16().collect();
        assert_eq!(
            compare_names(&t, &private, KeyCompare::CaseFolding),
            Ordering::Less
        );

        // Ignorable joiners are skipped.
        let joined = [u16::from(b'a'), 0x200D, u16::from(b'b')];
        let plain: Vec<u16> = "ab".encode_utf16().collect();
        assert_eq!(
            compare_names(&joined, &plain, KeyCompare::CaseFolding),
            Ordering::Equal
        );
    }

    #[test]
    fn catalog_key_orders_by_parent_first() {
        let a = CatalogKey::new(CatalogNodeId(2), "zzz");
        let b = CatalogKey::new(CatalogNodeId(3), "aaa");
        assert_eq!(a.compare(&b, KeyCompare::CaseFolding), Ordering::Less);
        let root_thread = CatalogKey::new(CatalogNodeId(2), "");
        assert_eq!(
            root_thread.compare(&a, KeyCompare::CaseFolding),
            Ordering::Less
        );
    }

    #[test]
    fn volume_header_round_trip_and_offsets() {
        let header = sample_header();
        let bytes = header.to_bytes().expect("encode");
        assert_eq!(&bytes[..2], b"H+");
        assert_eq!(&bytes[40..44], &4096_u32.to_be_bytes());
        // catalog fork logical size at 272, first extent start at 272+16.
        assert_eq!(&bytes[272..280], &8192_u64.to_be_bytes());
        assert_eq!(&bytes[288..292], &10_u32.to_be_bytes());

        let mut image = vec![0_u8; 2048];
        image[VOLUME_HEADER_OFFSET..VOLUME_HEADER_OFFSET + VOLUME_HEADER_SIZE]
            .copy_from_slice(&bytes);
        let parsed = HfsPlusVolumeHeader::parse_from_image(&image).expect("parse");
        assert_eq!(parsed, header);
        assert_eq!(parsed.total_bytes(), 16384 * 4096);
        assert!(!parsed.is_hfsx());
        assert_eq!(parsed.catalog_file.inline_blocks(), 2);
    }

    #[test]
    fn volume_header_rejects_bad_fields() {
        let mut bytes = sample_header().to_bytes().expect("encode");
        bytes[0] = b'X';
        assert!(matches!(
            HfsPlusVolumeHeader::parse_region(&bytes),
            Err(ParseError::InvalidMagic { .. })
        ));

        let mut bad_block = sample_header();
        bad_block.block_size = 3000;
        let bytes = bad_block.to_bytes().expect("encode");
        assert!(matches!(
            HfsPlusVolumeHeader::parse_region(&bytes),
            Err(ParseError::InvalidField {
                field: "block_size",
                ..
            })
        ));

        assert!(matches!(
            HfsPlusVolumeHeader::parse_from_image(&[0_u8; 1100]),
            Err(ParseError::OutOfRange { .. })
        ));
    }

    #[test]
    fn node_descriptor_and_record_table() {
        let desc = NodeDescriptor {
            forward_link: 5,
            backward_link: 0,
            kind: NodeKind::Leaf,
            height: 1,
            num_records: 0,
        };
        let records = vec![vec![1_u8, 2, 3, 4], vec![9_u8; 6]];
        let node = encode_node(512, &desc, &records).expect("encode");
        assert_eq!(node[8], 0xFF);
        assert_eq!(&node[510..512], &14_u16.to_be_bytes());
        assert_eq!(&node[508..510], &18_u16.to_be_bytes());
        assert_eq!(&node[506..508], &24_u16.to_be_bytes());

        let parsed = NodeDescriptor::parse(&node).expect("descriptor");
        assert_eq!(parsed.kind, NodeKind::Leaf);
        assert_eq!(parsed.num_records, 2);
        assert_eq!(parsed.forward_link, 5);
        assert_eq!(node_record(&node, 2, 0).expect("rec0"), &[1, 2, 3, 4]);
        assert_eq!(node_record(&node, 2, 1).expect("rec1"), &[9_u8; 6]);
        assert!(node_record(&node, 2, 2).is_err());
    }

    #[test]
    fn record_offsets_reject_decreasing_table() {
        let mut node = vec![0_u8; 512];
        NodeDescriptor {
            forward_link: 0,
            backward_link: 0,
            kind: NodeKind::Leaf,
            height: 1,
            num_records: 2,
        }
        .write_into(&mut node)
        .expect("descriptor");
        node[510..512].copy_from_slice(&40_u16.to_be_bytes());
        node[508..510].copy_from_slice(&20_u16.to_be_bytes());
        node[506..508].copy_from_slice(&60_u16.to_be_bytes());
        assert!(matches!(
            record_offsets(&node, 2),
            Err(ParseError::InvalidField {
                field: "record_offset",
                ..
            })
        ));
    }

    #[test]
    fn header_record_round_trip() {
        let header = BTreeHeaderRecord {
            tree_depth: 2,
            root_node: 3,
            leaf_records: 12,
            first_leaf_node: 1,
            last_leaf_node: 2,
            node_size: 4096,
            max_key_length: 516,
            total_nodes: 8,
            free_nodes: 4,
            clump_size: 32768,
            btree_type: 0,
            key_compare_type: KEY_COMPARE_BINARY,
            attributes: BT_BIG_KEYS_MASK | BT_VARIABLE_INDEX_KEYS_MASK,
        };
        let desc = NodeDescriptor {
            forward_link: 0,
            backward_link: 0,
            kind: NodeKind::Header,
            height: 0,
            num_records: 0,
        };
        let node = encode_node(
            4096,
            &desc,
            &[header.to_bytes().expect("record"), vec![0_u8; 128]],
        )
        .expect("node");
        let parsed = BTreeHeaderRecord::parse_from_node(&node).expect("parse");
        assert_eq!(parsed, header);
        assert!(parsed.has_variable_index_keys());
        assert_eq!(parsed.key_compare(true), KeyCompare::Binary);
        assert_eq!(parsed.key_compare(false), KeyCompare::CaseFolding);
    }

    #[test]
    fn catalog_records_round_trip() {
        let mut fork = HfsPlusForkData {
            logical_size: 18,
            clump_size: 0,
            total_blocks: 1,
            ..HfsPlusForkData::default()
        };
        fork.extents[0] = HfsPlusExtentDescriptor {
            start_block: 30,
            block_count: 1,
        };
        let file = CatalogRecord::File(CatalogFile {
            flags: 2,
            file_id: CatalogNodeId(20),
            dates: CatalogDates {
                create: 1,
                content_modify: 2,
                attribute_modify: 3,
                access: 4,
                backup: 5,
            },
            data_fork: fork,
            resource_fork: HfsPlusForkData::default(),
        });
        let bytes = file.encode().expect("encode");
        assert_eq!(bytes.len(), CATALOG_FILE_SIZE);
        assert_eq!(&bytes[88..96], &18_u64.to_be_bytes());
        assert_eq!(CatalogRecord::parse(&bytes).expect("parse"), file);

        let thread = CatalogRecord::FolderThread(CatalogThread {
            parent_id: CatalogNodeId::ROOT_PARENT,
            name: "Kenny".encode_utf16().collect(),
        });
        let bytes = thread.encode().expect("encode");
        assert_eq!(&bytes[..2], &3_i16.to_be_bytes());
        assert_eq!(CatalogRecord::parse(&bytes).expect("parse"), thread);

        let truncated = &CatalogRecord::Folder(CatalogFolder {
            flags: 0,
            valence: 1,
            folder_id: CatalogNodeId(2),
            dates: CatalogDates::default(),
        })
        .encode()
        .expect("encode")[..40];
        assert!(matches!(
            CatalogRecord::parse(truncated),
            Err(ParseError::OutOfRange { .. })
        ));
        assert!(CatalogRecord::parse(&[0, 9, 0, 0]).is_err());
    }

    #[test]
    fn keyed_record_split_aligns_data() {
        let key = CatalogKey::new(CatalogNodeId(2), "a");
        let mut record = key.encode().expect("key");
        record.extend_from_slice(&[0xAB, 0xCD]);
        let (k, data) = split_keyed_record(&record, None).expect("split");
        assert_eq!(k.len(), 10);
        assert_eq!(data, &[0xAB, 0xCD]);

        // Odd fixed key length pads one byte before the data.
        let raw = [0_u8, 3, 1, 2, 3, 0, 0x11, 0x22];
        let (k, data) = split_keyed_record(&raw, Some(3)).expect("split");
        assert_eq!(k.len(), 5);
        assert_eq!(data, &[0x11, 0x22]);
    }

    #[test]
    fn extent_key_layout_and_order() {
        let key = ExtentKey {
            file_id: CatalogNodeId(21),
            fork_type: ForkType::Data,
            start_block: 8,
        };
        let bytes = key.encode();
        assert_eq!(bytes, [0, 10, 0, 0, 0, 0, 0, 21, 0, 0, 0, 8]);
        assert_eq!(ExtentKey::parse(&bytes, 0).expect("parse"), key);

        let rsrc = ExtentKey {
            fork_type: ForkType::Resource,
            ..key
        };
        let later = ExtentKey {
            start_block: 20,
            ..key
        };
        assert!(key < later);
        assert!(later < rsrc);
        assert!(ExtentKey::parse(&[0, 8, 0, 0], 0).is_err());
    }

    #[test]
    fn hfs_dates_convert_from_1904() {
        assert_eq!(hfs_time_to_unix(2_082_844_800), 0);
        assert_eq!(unix_to_hfs_time(0), 2_082_844_800);
        assert_eq!(unix_to_hfs_time(-3_000_000_000), 0);
    }

    #[test]
    fn header_serializes_to_json() {
        let header = sample_header();
        let json = serde_json::to_string(&header).expect("json");
        let back: HfsPlusVolumeHeader = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, header);
    }
}
