//! XFS reference layouts: short-form B-tree block header, free-space
//! (by-block) records and the packed `xfs_bmbt_rec` extent record.
//!
//! All fields are big-endian.

use pfs_types::{ParseError, Record, ensure_slice, read_be_u64, write_be_u16, write_be_u32};
use serde::{Deserialize, Serialize};

/// "ABTB": free space B-tree indexed by starting block.
pub const ABTB_MAGIC: u32 = 0x4142_5442;
/// "ABTC": free space B-tree indexed by block count.
pub const ABTC_MAGIC: u32 = 0x4142_5443;
pub const SHORT_BLOCK_HEADER_SIZE: usize = 16;
pub const NULL_AG_BLOCK: u32 = 0xFFFF_FFFF;
pub const ALLOC_REC_SIZE: usize = 8;
pub const ALLOC_PTR_SIZE: usize = 4;
pub const BMBT_REC_SIZE: usize = 16;

const MASK_63: u64 = (1 << 63) - 1;
const MASK_9: u64 = (1 << 9) - 1;
const MASK_21: u64 = (1 << 21) - 1;
pub const BMBT_STARTOFF_MAX: u64 = (1 << 54) - 1;
pub const BMBT_STARTBLOCK_MAX: u64 = (1 << 52) - 1;
pub const BMBT_BLOCKCOUNT_MAX: u32 = (1 << 21) - 1;

/// Header of a short-form (per-AG) B-tree block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XfsShortBlockHeader {
    pub magic: u32,
    pub level: u16,
    pub numrecs: u16,
    pub leftsib: u32,
    pub rightsib: u32,
}

impl XfsShortBlockHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let rec = Record::big_endian(block);
        Ok(Self {
            magic: rec.u32(0)?,
            level: rec.u16(4)?,
            numrecs: rec.u16(6)?,
            leftsib: rec.u32(8)?,
            rightsib: rec.u32(12)?,
        })
    }

    /// Parse and require `expected` magic.
    pub fn parse_with_magic(block: &[u8], expected: u32) -> Result<Self, ParseError> {
        let header = Self::parse(block)?;
        if header.magic != expected {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(expected),
                actual: u64::from(header.magic),
            });
        }
        Ok(header)
    }

    pub fn write_into(&self, block: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(block, 0, self.magic)?;
        write_be_u16(block, 4, self.level)?;
        write_be_u16(block, 6, self.numrecs)?;
        write_be_u32(block, 8, self.leftsib)?;
        write_be_u32(block, 12, self.rightsib)
    }

    #[must_use]
    pub fn left_sibling(&self) -> Option<u32> {
        (self.leftsib != NULL_AG_BLOCK).then_some(self.leftsib)
    }

    #[must_use]
    pub fn right_sibling(&self) -> Option<u32> {
        (self.rightsib != NULL_AG_BLOCK).then_some(self.rightsib)
    }
}

/// Records (or key/pointer pairs) that fit in one block.
#[must_use]
pub fn maxrecs(block_size: usize, entry_len: usize) -> usize {
    block_size.saturating_sub(SHORT_BLOCK_HEADER_SIZE) / entry_len.max(1)
}

/// Free-space extent: record, and key, of both allocation B-trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct XfsAllocRec {
    pub startblock: u32,
    pub blockcount: u32,
}

impl XfsAllocRec {
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        let rec = Record::big_endian(ensure_slice(bytes, offset, ALLOC_REC_SIZE)?);
        Ok(Self {
            startblock: rec.u32(0)?,
            blockcount: rec.u32(4)?,
        })
    }

    pub fn write_into(&self, bytes: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_be_u32(bytes, offset, self.startblock)?;
        write_be_u32(bytes, offset + 4, self.blockcount)
    }
}

/// Offset of leaf record `index` in a short-form block.
#[must_use]
pub fn leaf_record_offset(index: usize, rec_len: usize) -> usize {
    SHORT_BLOCK_HEADER_SIZE + index * rec_len
}

/// Offsets of interior key `index` and its pointer. Keys fill the first
/// `maxrecs` slots and pointers follow them.
#[must_use]
pub fn interior_offsets(
    block_size: usize,
    key_len: usize,
    ptr_len: usize,
    index: usize,
) -> (usize, usize) {
    let max = maxrecs(block_size, key_len + ptr_len);
    let key = SHORT_BLOCK_HEADER_SIZE + index * key_len;
    let ptr = SHORT_BLOCK_HEADER_SIZE + max * key_len + index * ptr_len;
    (key, ptr)
}

/// Unpacked `xfs_bmbt_rec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XfsBmbtRec {
    /// File offset in filesystem blocks.
    pub startoff: u64,
    pub startblock: u64,
    pub blockcount: u32,
    pub unwritten: bool,
}

/// Unpack a 16-byte bmap record.
///
/// Bit 127 is the unwritten flag, bits 126..73 the file offset, bits 72..21
/// the start block and bits 20..0 the block count.
pub fn decode_bmbt_rec(bytes: &[u8]) -> Result<XfsBmbtRec, ParseError> {
    let l0 = read_be_u64(bytes, 0)?;
    let l1 = read_be_u64(bytes, 8)?;
    let blockcount = u32::try_from(l1 & MASK_21)
        .map_err(|_| ParseError::IntegerConversion { field: "blockcount" })?;
    Ok(XfsBmbtRec {
        unwritten: l0 >> 63 == 1,
        startoff: (l0 & MASK_63) >> 9,
        startblock: ((l0 & MASK_9) << 43) | (l1 >> 21),
        blockcount,
    })
}

/// Pack a bmap record. Fields wider than their on-disk width are rejected.
pub fn encode_bmbt_rec(rec: &XfsBmbtRec) -> Result<[u8; BMBT_REC_SIZE], ParseError> {
    if rec.startoff > BMBT_STARTOFF_MAX {
        return Err(ParseError::InvalidField {
            field: "startoff",
            reason: "exceeds 54 bits",
        });
    }
    if rec.startblock > BMBT_STARTBLOCK_MAX {
        return Err(ParseError::InvalidField {
            field: "startblock",
            reason: "exceeds 52 bits",
        });
    }
    if rec.blockcount > BMBT_BLOCKCOUNT_MAX {
        return Err(ParseError::InvalidField {
            field: "blockcount",
            reason: "exceeds 21 bits",
        });
    }
    let l0 = (u64::from(rec.unwritten) << 63) | (rec.startoff << 9) | (rec.startblock >> 43);
    let l1 = ((rec.startblock & ((1 << 43) - 1)) << 21) | u64::from(rec.blockcount);
    let mut out = [0_u8; BMBT_REC_SIZE];
    out[..8].copy_from_slice(&l0.to_be_bytes());
    out[8..].copy_from_slice(&l1.to_be_bytes());
    Ok(out)
}
