#![forbid(unsafe_code)]
//! ProbeFS public API facade.
//!
//! Re-exports `pfs-core`: the filesystem registry, the mounted-filesystem
//! trait and the device types needed to open an image. Tools and the
//! harness depend on this crate rather than on the layers beneath it.

pub use pfs_core::*;
