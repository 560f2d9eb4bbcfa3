#![forbid(unsafe_code)]
//! Extent mapping: logical byte offset to physical block resolution.
//!
//! An [`ExtentMap`] is built once per file from the format's extent list
//! (HFS+ fork descriptors, a coalesced FAT chain, packed XFS records) and
//! answers one mapping per [`ExtentMap::resolve`] call. [`ExtentReader`]
//! turns those mappings into byte reads against a [`BlockDevice`].

use pfs_block::{BlockDevice, read_bytes};
use pfs_error::{PfsError, Result};
use pfs_ondisk::xfs::{XfsBmbtRec, decode_bmbt_rec, encode_bmbt_rec};
use pfs_types::ParseError;
use serde::{Deserialize, Serialize};
use tracing::trace;

pub use pfs_ondisk::xfs::BMBT_REC_SIZE as PACKED_EXTENT_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtentState {
    Normal,
    /// Allocated but never written; reads as zeroes.
    Unwritten,
}

/// A contiguous run of blocks backing a contiguous byte range of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataExtent {
    /// Byte offset within the file.
    pub logical_offset: u64,
    /// First physical block.
    pub physical_start: u64,
    pub block_count: u64,
    pub state: ExtentState,
}

impl DataExtent {
    #[must_use]
    pub fn new(logical_offset: u64, physical_start: u64, block_count: u64) -> Self {
        Self {
            logical_offset,
            physical_start,
            block_count,
            state: ExtentState::Normal,
        }
    }

    /// Length in bytes, `None` on overflow.
    #[must_use]
    pub fn byte_len(&self, block_size: u32) -> Option<u64> {
        self.block_count.checked_mul(u64::from(block_size))
    }

    /// First byte offset past the extent, `None` on overflow.
    #[must_use]
    pub fn logical_end(&self, block_size: u32) -> Option<u64> {
        self.byte_len(block_size)
            .and_then(|len| self.logical_offset.checked_add(len))
    }
}

/// Whether uncovered ranges are legal holes or corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SparsePolicy {
    Allow,
    Deny,
}

/// Result of resolving one byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mapping {
    Mapped {
        physical_block: u64,
        offset_in_block: u32,
        /// Bytes from the offset to the end of the extent.
        len: u64,
        state: ExtentState,
    },
    Hole {
        /// Bytes until the next extent, or to the end of the address space
        /// when no extent follows.
        len: u64,
    },
}

impl Mapping {
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Mapped { len, .. } | Self::Hole { len } => *len,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Validated, sorted, non-overlapping extents of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentMap {
    block_size: u32,
    extents: Vec<DataExtent>,
    policy: SparsePolicy,
}

impl ExtentMap {
    pub fn new(block_size: u32, mut extents: Vec<DataExtent>, policy: SparsePolicy) -> Result<Self> {
        if block_size == 0 {
            return Err(PfsError::Format("extent block size must be non-zero".into()));
        }
        for ext in &extents {
            if ext.block_count == 0 {
                return Err(PfsError::corruption(
                    ext.physical_start,
                    format!("empty extent at logical offset {}", ext.logical_offset),
                ));
            }
            if ext.logical_end(block_size).is_none() {
                return Err(PfsError::corruption(
                    ext.physical_start,
                    "extent end overflows the address space",
                ));
            }
        }
        extents.sort_by_key(|e| e.logical_offset);
        for pair in extents.windows(2) {
            let prev_end = pair[0].logical_end(block_size).unwrap_or(u64::MAX);
            if pair[1].logical_offset < prev_end {
                return Err(PfsError::corruption(
                    pair[1].physical_start,
                    format!(
                        "extent at {} overlaps extent ending at {prev_end}",
                        pair[1].logical_offset
                    ),
                ));
            }
        }
        Ok(Self {
            block_size,
            extents,
            policy,
        })
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn extents(&self) -> &[DataExtent] {
        &self.extents
    }

    #[must_use]
    pub fn policy(&self) -> SparsePolicy {
        self.policy
    }

    /// End of the last extent; 0 for an empty map.
    #[must_use]
    pub fn mapped_end(&self) -> u64 {
        self.extents
            .last()
            .and_then(|e| e.logical_end(self.block_size))
            .unwrap_or(0)
    }

    /// Resolve the extent containing `offset`.
    pub fn resolve(&self, offset: u64) -> Result<Mapping> {
        let bs = u64::from(self.block_size);
        let pos = self.extents.partition_point(|e| e.logical_offset <= offset);

        if pos > 0 {
            let ext = &self.extents[pos - 1];
            let end = ext.logical_end(self.block_size).unwrap_or(u64::MAX);
            if offset < end {
                let delta = offset - ext.logical_offset;
                let offset_in_block = u32::try_from(delta % bs)
                    .map_err(|_| PfsError::Format("offset within block exceeds u32".into()))?;
                let physical_block = ext
                    .physical_start
                    .checked_add(delta / bs)
                    .ok_or_else(|| {
                        PfsError::corruption(ext.physical_start, "physical block overflows")
                    })?;
                trace!(offset, physical_block, "extent: mapped");
                return Ok(Mapping::Mapped {
                    physical_block,
                    offset_in_block,
                    len: end - offset,
                    state: ext.state,
                });
            }
        }

        let next_start = self
            .extents
            .get(pos)
            .map_or(u64::MAX, |e| e.logical_offset);
        match self.policy {
            SparsePolicy::Allow => Ok(Mapping::Hole {
                len: next_start - offset,
            }),
            SparsePolicy::Deny => Err(PfsError::corruption(
                offset / bs,
                format!("offset {offset} is not covered by any extent"),
            )),
        }
    }
}

/// Coalesce a cluster chain into maximal runs of consecutive clusters.
///
/// Physical blocks are cluster numbers; logical offsets accumulate in
/// units of `cluster_size` bytes.
#[must_use]
pub fn extents_from_chain(clusters: &[u32], cluster_size: u32) -> Vec<DataExtent> {
    let mut out: Vec<DataExtent> = Vec::new();
    let mut logical = 0_u64;
    for &cluster in clusters {
        match out.last_mut() {
            Some(run) if run.physical_start + run.block_count == u64::from(cluster) => {
                run.block_count += 1;
            }
            _ => out.push(DataExtent::new(logical, u64::from(cluster), 1)),
        }
        logical += u64::from(cluster_size);
    }
    out
}

/// Decode an XFS packed extent record into a byte-addressed extent.
pub fn decode_packed_extent(bytes: &[u8], block_size: u32) -> std::result::Result<DataExtent, ParseError> {
    let rec = decode_bmbt_rec(bytes)?;
    let logical_offset = rec
        .startoff
        .checked_mul(u64::from(block_size))
        .ok_or(ParseError::IntegerConversion { field: "startoff" })?;
    Ok(DataExtent {
        logical_offset,
        physical_start: rec.startblock,
        block_count: u64::from(rec.blockcount),
        state: if rec.unwritten {
            ExtentState::Unwritten
        } else {
            ExtentState::Normal
        },
    })
}

/// Encode an extent as an XFS packed record. The logical offset must be
/// block aligned.
pub fn encode_packed_extent(
    extent: &DataExtent,
    block_size: u32,
) -> std::result::Result<[u8; PACKED_EXTENT_SIZE], ParseError> {
    let bs = u64::from(block_size);
    if bs == 0 || extent.logical_offset % bs != 0 {
        return Err(ParseError::InvalidField {
            field: "logical_offset",
            reason: "not block aligned",
        });
    }
    let blockcount = u32::try_from(extent.block_count)
        .map_err(|_| ParseError::IntegerConversion { field: "blockcount" })?;
    encode_bmbt_rec(&XfsBmbtRec {
        startoff: extent.logical_offset / bs,
        startblock: extent.physical_start,
        blockcount,
        unwritten: extent.state == ExtentState::Unwritten,
    })
}

/// Reads file bytes through an [`ExtentMap`].
///
/// Physical block `first_block` sits at byte `base_offset` of the device;
/// blocks below `first_block` are not addressable.
pub struct ExtentReader<'a> {
    device: &'a dyn BlockDevice,
    map: &'a ExtentMap,
    file_len: u64,
    base_offset: u64,
    first_block: u64,
}

impl<'a> ExtentReader<'a> {
    #[must_use]
    pub fn new(device: &'a dyn BlockDevice, map: &'a ExtentMap, file_len: u64) -> Self {
        Self {
            device,
            map,
            file_len,
            base_offset: 0,
            first_block: 0,
        }
    }

    #[must_use]
    pub fn with_origin(mut self, base_offset: u64, first_block: u64) -> Self {
        self.base_offset = base_offset;
        self.first_block = first_block;
        self
    }

    #[must_use]
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    fn block_address(&self, block: u64, offset_in_block: u32) -> Result<u64> {
        let rel = block.checked_sub(self.first_block).ok_or_else(|| {
            PfsError::corruption(block, format!("block below first data block {}", self.first_block))
        })?;
        rel.checked_mul(u64::from(self.map.block_size()))
            .and_then(|b| b.checked_add(self.base_offset))
            .and_then(|b| b.checked_add(u64::from(offset_in_block)))
            .ok_or_else(|| PfsError::corruption(block, "block address overflows"))
    }

    /// Read up to `len` bytes at `offset`. The result is shorter when the
    /// range crosses the end of the file and empty at or past it.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset >= self.file_len {
            return Ok(Vec::new());
        }
        let available = self.file_len - offset;
        let to_read = usize::try_from(available).map_or(len, |a| a.min(len));
        let mut out = vec![0_u8; to_read];
        let mut done = 0_usize;

        while done < to_read {
            let pos = offset + done as u64;
            let mapping = self.map.resolve(pos)?;
            let remaining = to_read - done;
            let chunk = usize::try_from(mapping.len()).map_or(remaining, |l| l.min(remaining));
            match mapping {
                Mapping::Mapped {
                    physical_block,
                    offset_in_block,
                    state: ExtentState::Normal,
                    ..
                } => {
                    let address = self.block_address(physical_block, offset_in_block)?;
                    let end = address.saturating_add(chunk as u64);
                    if end > self.device.len_bytes() {
                        return Err(PfsError::corruption(
                            physical_block,
                            format!("extent extends past device end {}", self.device.len_bytes()),
                        ));
                    }
                    read_bytes(self.device, address, &mut out[done..done + chunk])?;
                }
                // Zero-filled already.
                Mapping::Mapped { .. } | Mapping::Hole { .. } => {}
            }
            done += chunk;
        }
        Ok(out)
    }

    pub fn read_to_end(&self) -> Result<Vec<u8>> {
        let len = usize::try_from(self.file_len)
            .map_err(|_| PfsError::Format(format!("file of {} bytes exceeds memory", self.file_len)))?;
        self.read(0, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_block::SectorBlockDevice;
    use proptest::prelude::*;

    fn map(extents: Vec<DataExtent>, policy: SparsePolicy) -> ExtentMap {
        ExtentMap::new(512, extents, policy).expect("map")
    }

    #[test]
    fn resolve_inside_extent() {
        let m = map(
            vec![DataExtent::new(1024, 100, 4), DataExtent::new(0, 50, 2)],
            SparsePolicy::Deny,
        );
        assert_eq!(m.extents()[0].logical_offset, 0);
        assert_eq!(
            m.resolve(1536 + 10).expect("resolve"),
            Mapping::Mapped {
                physical_block: 101,
                offset_in_block: 10,
                len: 3072 - 1546,
                state: ExtentState::Normal,
            }
        );
        assert_eq!(
            m.resolve(0).expect("start"),
            Mapping::Mapped {
                physical_block: 50,
                offset_in_block: 0,
                len: 1024,
                state: ExtentState::Normal,
            }
        );
        assert_eq!(m.mapped_end(), 3072);
    }

    #[test]
    fn holes_follow_policy() {
        let extents = vec![DataExtent::new(0, 10, 1), DataExtent::new(2048, 20, 1)];
        let sparse = map(extents.clone(), SparsePolicy::Allow);
        assert_eq!(sparse.resolve(700).expect("hole"), Mapping::Hole { len: 1348 });
        assert_eq!(
            sparse.resolve(4000).expect("tail"),
            Mapping::Hole {
                len: u64::MAX - 4000
            }
        );

        let dense = map(extents, SparsePolicy::Deny);
        assert!(matches!(
            dense.resolve(700),
            Err(PfsError::Corruption { block: 1, .. })
        ));
    }

    #[test]
    fn rejects_empty_and_overlapping_extents() {
        let empty = ExtentMap::new(512, vec![DataExtent::new(0, 5, 0)], SparsePolicy::Allow);
        assert!(matches!(empty, Err(PfsError::Corruption { block: 5, .. })));

        let overlap = ExtentMap::new(
            512,
            vec![DataExtent::new(0, 5, 4), DataExtent::new(1536, 9, 1)],
            SparsePolicy::Allow,
        );
        assert!(matches!(overlap, Err(PfsError::Corruption { block: 9, .. })));

        assert!(matches!(
            ExtentMap::new(0, vec![], SparsePolicy::Allow),
            Err(PfsError::Format(_))
        ));
    }

    #[test]
    fn chain_coalesces_contiguous_clusters() {
        let extents = extents_from_chain(&[2, 3, 4, 9, 10, 5], 2048);
        assert_eq!(
            extents,
            vec![
                DataExtent::new(0, 2, 3),
                DataExtent::new(6144, 9, 2),
                DataExtent::new(10_240, 5, 1),
            ]
        );
        assert!(extents_from_chain(&[], 512).is_empty());
    }

    #[test]
    fn packed_extent_literal() {
        // startoff 1, startblock 2, blockcount 3.
        let bytes = [
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, //
            0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x03,
        ];
        let ext = decode_packed_extent(&bytes, 4096).expect("decode");
        assert_eq!(ext, DataExtent::new(4096, 2, 3));
        assert_eq!(encode_packed_extent(&ext, 4096).expect("encode"), bytes);

        let mut unwritten = bytes;
        unwritten[0] |= 0x80;
        let ext = decode_packed_extent(&unwritten, 4096).expect("decode");
        assert_eq!(ext.state, ExtentState::Unwritten);

        let unaligned = DataExtent::new(100, 2, 3);
        assert!(encode_packed_extent(&unaligned, 4096).is_err());
    }

    #[test]
    fn reader_fills_holes_and_clamps() {
        let mut image = vec![0_u8; 8192];
        image[512..1024].fill(b'a');
        image[2048..2560].fill(b'b');
        image[3072..3584].fill(b'c');
        let dev = SectorBlockDevice::from_bytes(image).expect("device");
        let m = ExtentMap::new(
            512,
            vec![
                DataExtent::new(0, 1, 1),
                // Hole at 512..1024.
                DataExtent::new(1024, 4, 1),
                DataExtent {
                    state: ExtentState::Unwritten,
                    ..DataExtent::new(1536, 6, 1)
                },
            ],
            SparsePolicy::Allow,
        )
        .expect("map");
        let reader = ExtentReader::new(&dev, &m, 1800);
        let data = reader.read_to_end().expect("read");
        assert_eq!(data.len(), 1800);
        assert!(data[..512].iter().all(|&b| b == b'a'));
        assert!(data[512..1024].iter().all(|&b| b == 0));
        assert!(data[1024..1536].iter().all(|&b| b == b'b'));
        assert!(data[1536..].iter().all(|&b| b == 0));

        assert_eq!(reader.read(500, 20).expect("span"), {
            let mut v = vec![b'a'; 12];
            v.extend([0; 8]);
            v
        });
        assert_eq!(reader.read(1790, 100).expect("tail").len(), 10);
        assert!(reader.read(1800, 10).expect("eof").is_empty());
    }

    #[test]
    fn reader_origin_offsets_blocks() {
        let mut image = vec![0_u8; 4096];
        image[1024..1536].fill(7);
        let dev = SectorBlockDevice::from_bytes(image).expect("device");
        let m = ExtentMap::new(512, vec![DataExtent::new(0, 2, 1)], SparsePolicy::Deny)
            .expect("map");
        let reader = ExtentReader::new(&dev, &m, 512).with_origin(1024, 2);
        assert_eq!(reader.read(0, 4).expect("read"), vec![7; 4]);

        let below = ExtentMap::new(512, vec![DataExtent::new(0, 1, 1)], SparsePolicy::Deny)
            .expect("map");
        let reader = ExtentReader::new(&dev, &below, 512).with_origin(1024, 2);
        assert!(matches!(
            reader.read(0, 4),
            Err(PfsError::Corruption { block: 1, .. })
        ));

        let past = ExtentMap::new(512, vec![DataExtent::new(0, 20, 1)], SparsePolicy::Deny)
            .expect("map");
        let reader = ExtentReader::new(&dev, &past, 512);
        assert!(matches!(
            reader.read(0, 4),
            Err(PfsError::Corruption { block: 20, .. })
        ));
    }

    #[test]
    fn extent_serializes() {
        let ext = DataExtent::new(0, 9, 2);
        let json = serde_json::to_string(&ext).expect("json");
        let back: DataExtent = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, ext);
    }

    /// Extents separated by random gaps, in shuffled order.
    fn arb_extents() -> impl Strategy<Value = Vec<DataExtent>> {
        prop::collection::vec((0_u64..4, 1_u64..6, 0_u64..1000), 0..12).prop_map(|parts| {
            let mut logical = 0;
            let mut out = Vec::new();
            for (gap, count, phys) in parts {
                logical += gap * 512;
                out.push(DataExtent::new(logical, phys, count));
                logical += count * 512;
            }
            out.reverse();
            out
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn resolve_is_idempotent_and_consistent(extents in arb_extents(), probe in 0_u64..40_000) {
            let m = ExtentMap::new(512, extents, SparsePolicy::Allow).expect("map");
            let first = m.resolve(probe).expect("resolve");
            prop_assert_eq!(first, m.resolve(probe).expect("again"));
            if let Mapping::Mapped { physical_block, offset_in_block, len, .. } = first {
                let end = probe + len;
                let ext = m
                    .extents()
                    .iter()
                    .find(|e| e.logical_offset <= probe && probe < e.logical_end(512).unwrap_or(0))
                    .expect("covering extent");
                prop_assert_eq!(Some(end), ext.logical_end(512));
                let delta = probe - ext.logical_offset;
                prop_assert_eq!(physical_block, ext.physical_start + delta / 512);
                prop_assert_eq!(u64::from(offset_in_block), delta % 512);
            }
        }

        #[test]
        fn walking_mappings_covers_every_extent(extents in arb_extents()) {
            let m = ExtentMap::new(512, extents, SparsePolicy::Allow).expect("map");
            let end = m.mapped_end();
            let total: u64 = m.extents().iter().map(|e| e.block_count * 512).sum();
            let mut pos = 0;
            let mut mapped = 0;
            let mut pieces = 0;
            while pos < end {
                let mapping = m.resolve(pos).expect("resolve");
                prop_assert!(!mapping.is_empty());
                if matches!(mapping, Mapping::Mapped { .. }) {
                    mapped += mapping.len();
                    pieces += 1;
                }
                pos += mapping.len();
            }
            prop_assert_eq!(pos, end);
            prop_assert_eq!(mapped, total);
            prop_assert!(pieces <= m.extents().len());
        }
    }
}
