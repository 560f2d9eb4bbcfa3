#![forbid(unsafe_code)]
//! Record accessor and shared value types.
//!
//! Every on-disk decoder in the workspace reads fields through the helpers
//! in this crate. Reads are bounds-checked: a field that would extend past
//! the end of the buffer yields [`ParseError::OutOfRange`], never a silently
//! zeroed value.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Unit newtypes ───────────────────────────────────────────────────────────

/// Sector index on a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorNumber(pub u64);

/// Filesystem allocation block (or cluster) number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Byte offset on a device or within a file.
///
/// This is a unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Subtract a byte count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, bytes: u64) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }
}

impl SectorNumber {
    /// Byte offset of this sector for the given sector size.
    #[must_use]
    pub fn to_byte_offset(self, sector_size: u32) -> Option<ByteOffset> {
        self.0.checked_mul(u64::from(sector_size)).map(ByteOffset)
    }

    #[must_use]
    pub fn checked_add(self, sectors: u64) -> Option<Self> {
        self.0.checked_add(sectors).map(Self)
    }
}

/// HFS+ catalog node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CatalogNodeId(pub u32);

impl CatalogNodeId {
    /// Parent of the root folder.
    pub const ROOT_PARENT: Self = Self(1);
    pub const ROOT_FOLDER: Self = Self(2);
    pub const EXTENTS_FILE: Self = Self(3);
    pub const CATALOG_FILE: Self = Self(4);
    pub const BAD_BLOCKS_FILE: Self = Self(5);
    /// First identifier handed out to user files and folders.
    pub const FIRST_USER: Self = Self(16);
}

/// 128-bit GUID stored in the mixed-endian layout used by GPT.
///
/// The first three groups are little-endian on disk, the last two are
/// stored byte-for-byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub const NIL: Self = Self([0_u8; 16]);

    /// Build a GUID from its canonical textual fields.
    #[must_use]
    pub const fn from_fields(d1: u32, d2: u16, d3: u16, d4: [u8; 8]) -> Self {
        let a = d1.to_le_bytes();
        let b = d2.to_le_bytes();
        let c = d3.to_le_bytes();
        Self([
            a[0], a[1], a[2], a[3], b[0], b[1], c[0], c[1], d4[0], d4[1], d4[2], d4[3], d4[4],
            d4[5], d4[6], d4[7],
        ])
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0 == [0_u8; 16]
    }
}

impl fmt::Display for SectorNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CatalogNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-",
            b[3], b[2], b[1], b[0], b[5], b[4], b[7], b[6], b[8], b[9]
        )?;
        for byte in &b[10..] {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("out of range: need {needed} bytes at offset {offset}, got {actual}")]
    OutOfRange {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Field readers ───────────────────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::OutOfRange {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::OutOfRange {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_i8(data: &[u8], offset: usize) -> Result<i8, ParseError> {
    Ok(i8::from_be_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    Ok(u16::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    Ok(u32::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    Ok(u16::from_be_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    Ok(u32::from_be_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_be_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_be_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_i16(data: &[u8], offset: usize) -> Result<i16, ParseError> {
    Ok(i16::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    Ok(i32::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    Ok(i64::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_be_i16(data: &[u8], offset: usize) -> Result<i16, ParseError> {
    Ok(i16::from_be_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_be_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    Ok(i32::from_be_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_be_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    Ok(i64::from_be_bytes(read_fixed(data, offset)?))
}

/// Read `units` UTF-16 code units in big-endian order.
///
/// Unpaired surrogates are replaced with U+FFFD.
pub fn read_utf16_be(data: &[u8], offset: usize, units: usize) -> Result<String, ParseError> {
    let bytes = ensure_slice(data, offset, units.saturating_mul(2))?;
    let decoded: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&decoded))
}

/// Read `units` UTF-16 code units in little-endian order.
pub fn read_utf16_le(data: &[u8], offset: usize, units: usize) -> Result<String, ParseError> {
    let bytes = ensure_slice(data, offset, units.saturating_mul(2))?;
    let decoded: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&decoded))
}

/// Read a fixed-width, NUL- or space-padded byte string.
pub fn read_ascii_fixed(data: &[u8], offset: usize, len: usize) -> Result<String, ParseError> {
    Ok(trim_nul_padded(ensure_slice(data, offset, len)?))
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

// ── Field writers ───────────────────────────────────────────────────────────

#[inline]
pub fn write_u8(data: &mut [u8], offset: usize, value: u8) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 1)?[0] = value;
    Ok(())
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_be_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[inline]
pub fn write_be_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[inline]
pub fn write_be_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, value: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, value.len())?.copy_from_slice(value);
    Ok(())
}

// ── Record view ─────────────────────────────────────────────────────────────

/// Byte order of a record's multi-byte fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endian {
    Big,
    Little,
}

/// Typed, endian-aware view over a fixed byte range.
///
/// Field offsets passed to the accessors are relative to `base`. The view
/// borrows the buffer and never copies it.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    bytes: &'a [u8],
    base: usize,
    endian: Endian,
}

impl<'a> Record<'a> {
    /// Create a view at `base`. `base` may equal `bytes.len()` (an empty view).
    pub fn new(bytes: &'a [u8], base: usize, endian: Endian) -> Result<Self, ParseError> {
        if base > bytes.len() {
            return Err(ParseError::OutOfRange {
                needed: 0,
                offset: base,
                actual: 0,
            });
        }
        Ok(Self {
            bytes,
            base,
            endian,
        })
    }

    #[must_use]
    pub fn big_endian(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            base: 0,
            endian: Endian::Big,
        }
    }

    #[must_use]
    pub fn little_endian(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            base: 0,
            endian: Endian::Little,
        }
    }

    #[must_use]
    pub fn endian(&self) -> Endian {
        self.endian
    }

    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Bytes remaining after `base`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len() - self.base
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn at(&self, offset: usize) -> Result<usize, ParseError> {
        self.base.checked_add(offset).ok_or(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        })
    }

    /// Child view whose base is `offset` bytes past this view's base.
    pub fn sub(&self, offset: usize) -> Result<Self, ParseError> {
        Self::new(self.bytes, self.at(offset)?, self.endian)
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8], ParseError> {
        ensure_slice(self.bytes, self.at(offset)?, len)
    }

    pub fn fixed<const N: usize>(&self, offset: usize) -> Result<[u8; N], ParseError> {
        read_fixed(self.bytes, self.at(offset)?)
    }

    pub fn u8(&self, offset: usize) -> Result<u8, ParseError> {
        read_u8(self.bytes, self.at(offset)?)
    }

    pub fn i8(&self, offset: usize) -> Result<i8, ParseError> {
        read_i8(self.bytes, self.at(offset)?)
    }

    pub fn u16(&self, offset: usize) -> Result<u16, ParseError> {
        let at = self.at(offset)?;
        match self.endian {
            Endian::Big => read_be_u16(self.bytes, at),
            Endian::Little => read_le_u16(self.bytes, at),
        }
    }

    pub fn u32(&self, offset: usize) -> Result<u32, ParseError> {
        let at = self.at(offset)?;
        match self.endian {
            Endian::Big => read_be_u32(self.bytes, at),
            Endian::Little => read_le_u32(self.bytes, at),
        }
    }

    pub fn u64(&self, offset: usize) -> Result<u64, ParseError> {
        let at = self.at(offset)?;
        match self.endian {
            Endian::Big => read_be_u64(self.bytes, at),
            Endian::Little => read_le_u64(self.bytes, at),
        }
    }

    pub fn i16(&self, offset: usize) -> Result<i16, ParseError> {
        let at = self.at(offset)?;
        match self.endian {
            Endian::Big => read_be_i16(self.bytes, at),
            Endian::Little => read_le_i16(self.bytes, at),
        }
    }

    pub fn i32(&self, offset: usize) -> Result<i32, ParseError> {
        let at = self.at(offset)?;
        match self.endian {
            Endian::Big => read_be_i32(self.bytes, at),
            Endian::Little => read_le_i32(self.bytes, at),
        }
    }

    pub fn i64(&self, offset: usize) -> Result<i64, ParseError> {
        let at = self.at(offset)?;
        match self.endian {
            Endian::Big => read_be_i64(self.bytes, at),
            Endian::Little => read_le_i64(self.bytes, at),
        }
    }

    /// UTF-16 string of `units` code units in the record's byte order.
    pub fn utf16(&self, offset: usize, units: usize) -> Result<String, ParseError> {
        let at = self.at(offset)?;
        match self.endian {
            Endian::Big => read_utf16_be(self.bytes, at, units),
            Endian::Little => read_utf16_le(self.bytes, at, units),
        }
    }

    /// Fixed-length, NUL-padded byte string.
    pub fn ascii(&self, offset: usize, len: usize) -> Result<String, ParseError> {
        read_ascii_fixed(self.bytes, self.at(offset)?, len)
    }
}

/// Narrow a `u64` to `usize`, reporting the field on failure.
pub fn usize_from(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Widen a `usize` to `u64`, reporting the field on failure.
pub fn u64_from(value: usize, field: &'static str) -> Result<u64, ParseError> {
    u64::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert_eq!(read_be_u16(&bytes, 0).expect("u16"), 0x3412);
        assert_eq!(read_be_u32(&bytes, 4).expect("u32"), 0xEFCD_AB90);
        assert_eq!(read_be_u64(&bytes, 0).expect("u64"), 0x3412_7856_EFCD_AB90);
        assert_eq!(read_i8(&bytes, 7).expect("i8"), -112);
        assert_eq!(read_be_i16(&[0xFF, 0xFE], 0).expect("i16"), -2);
        assert_eq!(read_le_i32(&[0xFE, 0xFF, 0xFF, 0xFF], 0).expect("i32"), -2);
    }

    #[test]
    fn read_past_end_is_out_of_range() {
        let bytes = [0_u8; 6];
        assert_eq!(
            read_le_u32(&bytes, 4),
            Err(ParseError::OutOfRange {
                needed: 4,
                offset: 4,
                actual: 2,
            })
        );
        assert_eq!(
            read_be_u64(&bytes, 10),
            Err(ParseError::OutOfRange {
                needed: 8,
                offset: 10,
                actual: 0,
            })
        );
        assert!(matches!(
            ensure_slice(&bytes, usize::MAX, 2),
            Err(ParseError::InvalidField { field: "offset", .. })
        ));
    }

    #[test]
    fn test_trim_nul_padded() {
        let raw = b"pfs\0\0\0\0";
        assert_eq!(trim_nul_padded(raw), "pfs");
        assert_eq!(trim_nul_padded(b"NO NAME    "), "NO NAME");
    }

    #[test]
    fn utf16_strings_in_both_orders() {
        let be = [0x00, b'H', 0x00, b'i', 0x00, b'!'];
        assert_eq!(read_utf16_be(&be, 0, 3).expect("be"), "Hi!");
        let le = [b'H', 0x00, b'i', 0x00];
        assert_eq!(read_utf16_le(&le, 0, 2).expect("le"), "Hi");
        assert!(read_utf16_be(&be, 2, 3).is_err());
    }

    #[test]
    fn record_reads_relative_to_base() {
        let bytes = [0xAA, 0xBB, 0x12, 0x34, 0x56, 0x78];
        let be = Record::new(&bytes, 2, Endian::Big).expect("record");
        assert_eq!(be.u16(0).expect("u16"), 0x1234);
        assert_eq!(be.u32(0).expect("u32"), 0x1234_5678);
        assert_eq!(be.len(), 4);

        let le = Record::new(&bytes, 2, Endian::Little).expect("record");
        assert_eq!(le.u16(0).expect("u16"), 0x3412);
        assert_eq!(le.sub(2).expect("sub").u16(0).expect("u16"), 0x7856);

        assert!(matches!(
            be.u32(2),
            Err(ParseError::OutOfRange { offset: 4, .. })
        ));
        assert!(Record::new(&bytes, 7, Endian::Big).is_err());
        assert!(Record::new(&bytes, 6, Endian::Big).expect("empty").is_empty());
    }

    #[test]
    fn writers_mirror_readers() {
        let mut buf = [0_u8; 16];
        write_be_u32(&mut buf, 0, 0xDEAD_BEEF).expect("be32");
        write_le_u16(&mut buf, 4, 0xAA55).expect("le16");
        write_be_u64(&mut buf, 8, 42).expect("be64");
        assert_eq!(&buf[..6], &[0xDE, 0xAD, 0xBE, 0xEF, 0x55, 0xAA]);
        assert_eq!(read_be_u64(&buf, 8).expect("read"), 42);
        assert!(write_le_u32(&mut buf, 14, 1).is_err());
    }

    #[test]
    fn guid_display_uses_mixed_endian_groups() {
        // EFI system partition: C12A7328-F81F-11D2-BA4B-00A0C93EC93B
        let esp = Guid::from_fields(
            0xC12A_7328,
            0xF81F,
            0x11D2,
            [0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9, 0x3B],
        );
        assert_eq!(esp.0[..4], [0x28, 0x73, 0x2A, 0xC1]);
        assert_eq!(esp.to_string(), "C12A7328-F81F-11D2-BA4B-00A0C93EC93B");
        assert!(Guid::NIL.is_nil());
        assert!(!esp.is_nil());
    }

    proptest! {
        #[test]
        fn reads_never_panic(data in proptest::collection::vec(any::<u8>(), 0..64), offset in 0_usize..80) {
            let _ = read_be_u64(&data, offset);
            let _ = read_le_u32(&data, offset);
            let _ = read_utf16_be(&data, offset, 5);
            let record = Record::big_endian(&data);
            let _ = record.i64(offset);
        }
    }
}
