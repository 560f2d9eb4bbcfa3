#![forbid(unsafe_code)]
//! On-disk format parsing for HFS+, FAT and XFS structures.
//!
//! Pure parsing crate: no I/O, no side effects. Parses byte slices into
//! typed Rust structures (volume headers, boot sectors, B-tree node
//! descriptors, catalog keys and records, directory entries, packed extent
//! records) and encodes them back for image construction.

pub mod fat;
pub mod hfsplus;
pub mod xfs;

pub use fat::{FatBootSector, FatDirEntry, FatGeometry, FatShortEntry, FatType};
pub use hfsplus::{
    BTreeHeaderRecord, CatalogKey, CatalogRecord, ExtentKey, HfsPlusExtentDescriptor,
    HfsPlusForkData, HfsPlusVolumeHeader, KeyCompare, NodeDescriptor, NodeKind,
};
pub use xfs::{XfsAllocRec, XfsBmbtRec, XfsShortBlockHeader, decode_bmbt_rec, encode_bmbt_rec};
