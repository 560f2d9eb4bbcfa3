#![forbid(unsafe_code)]
//! Block-device contract consumed by the decoding engine.
//!
//! The driver layer owns real devices; ProbeFS only needs the narrow
//! [`BlockDevice`] interface (sector reads and writes, geometry, read-only
//! flag). This crate also ships the adapters the engine and its tests use:
//! a file-backed [`FileByteDevice`], an in-memory [`MemoryByteDevice`], the
//! [`SectorBlockDevice`] that slices a byte device into sectors, and a
//! [`PartitionDevice`] window that exposes one partition as its own device.

use parking_lot::Mutex;
use pfs_error::{PfsError, Result};
use pfs_types::SectorNumber;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Conventional sector size for disks and images.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Owned sector buffer.
///
/// Invariant: length == sector size of the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Whether writes are rejected.
    fn is_read_only(&self) -> bool;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn checked_end(offset: u64, len: usize, device_len: u64, op: &str) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| PfsError::Format(format!("{op} length overflows u64")))?,
        )
        .ok_or_else(|| PfsError::Format(format!("{op} range overflows u64")))?;
    if end > device_len {
        return Err(PfsError::OutOfRange(format!(
            "{op} past device end: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using positional I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write when permitted, falling back to read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        Self::from_file(file, writable)
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Self::from_file(file, false)
    }

    fn from_file(file: File, writable: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_end(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(PfsError::ReadOnly);
        }
        checked_end(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        !self.writable
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device, used for synthesized images.
#[derive(Debug)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
    read_only: bool,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
            read_only: false,
        }
    }

    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0_u8; len])
    }

    #[must_use]
    pub fn read_only(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
            read_only: true,
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let len = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        checked_end(offset, buf.len(), len, "read")?;
        let start = usize::try_from(offset)
            .map_err(|_| PfsError::Format("offset does not fit usize".to_owned()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(PfsError::ReadOnly);
        }
        let mut bytes = self.bytes.lock();
        let len = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        checked_end(offset, buf.len(), len, "write")?;
        let start = usize::try_from(offset)
            .map_err(|_| PfsError::Format("offset does not fit usize".to_owned()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Sector-addressed device, the contract between the driver layer and the
/// decoding engine.
pub trait BlockDevice: Send + Sync {
    /// Read one sector.
    fn read_sector(&self, sector: SectorNumber) -> Result<BlockBuf>;

    /// Write one sector. `data.len()` MUST equal `sector_size()`.
    fn write_sector(&self, sector: SectorNumber, data: &[u8]) -> Result<()>;

    /// Sector size in bytes.
    fn sector_size(&self) -> u32;

    /// Total number of sectors.
    fn sector_count(&self) -> u64;

    fn is_read_only(&self) -> bool;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Device length in bytes.
    fn len_bytes(&self) -> u64 {
        self.sector_count()
            .saturating_mul(u64::from(self.sector_size()))
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for Arc<T> {
    fn read_sector(&self, sector: SectorNumber) -> Result<BlockBuf> {
        (**self).read_sector(sector)
    }

    fn write_sector(&self, sector: SectorNumber, data: &[u8]) -> Result<()> {
        (**self).write_sector(sector, data)
    }

    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }

    fn sector_count(&self) -> u64 {
        (**self).sector_count()
    }

    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }

    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }
}

/// Presents a [`ByteDevice`] as fixed-size sectors.
#[derive(Debug)]
pub struct SectorBlockDevice<D: ByteDevice> {
    inner: D,
    sector_size: u32,
    sector_count: u64,
}

impl<D: ByteDevice> SectorBlockDevice<D> {
    /// Trailing bytes that do not fill a whole sector are ignored.
    pub fn new(inner: D, sector_size: u32) -> Result<Self> {
        if sector_size < 128 || !sector_size.is_power_of_two() {
            return Err(PfsError::Format(format!(
                "invalid sector_size={sector_size} (must be a power of two >= 128)"
            )));
        }
        let sector_count = inner.len_bytes() / u64::from(sector_size);
        Ok(Self {
            inner,
            sector_size,
            sector_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn sector_offset(&self, sector: SectorNumber) -> Result<u64> {
        if sector.0 >= self.sector_count {
            return Err(PfsError::OutOfRange(format!(
                "sector {sector} beyond device end (sector_count={})",
                self.sector_count
            )));
        }
        sector
            .to_byte_offset(self.sector_size)
            .map(|offset| offset.0)
            .ok_or_else(|| PfsError::Format("sector offset overflow".to_owned()))
    }

    fn sector_len(&self) -> Result<usize> {
        usize::try_from(self.sector_size)
            .map_err(|_| PfsError::Format("sector_size does not fit usize".to_owned()))
    }
}

impl SectorBlockDevice<MemoryByteDevice> {
    /// In-memory device over `bytes` with 512-byte sectors.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::new(MemoryByteDevice::new(bytes), DEFAULT_SECTOR_SIZE)
    }
}

impl<D: ByteDevice> BlockDevice for SectorBlockDevice<D> {
    fn read_sector(&self, sector: SectorNumber) -> Result<BlockBuf> {
        let offset = self.sector_offset(sector)?;
        let mut buf = vec![0_u8; self.sector_len()?];
        self.inner.read_exact_at(offset, &mut buf)?;
        trace!(sector = sector.0, "read_sector");
        Ok(BlockBuf::new(buf))
    }

    fn write_sector(&self, sector: SectorNumber, data: &[u8]) -> Result<()> {
        if self.inner.is_read_only() {
            return Err(PfsError::ReadOnly);
        }
        let expected = self.sector_len()?;
        if data.len() != expected {
            return Err(PfsError::Format(format!(
                "write_sector data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        let offset = self.sector_offset(sector)?;
        self.inner.write_all_at(offset, data)
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// A contiguous window of sectors on a parent device.
///
/// Sector 0 of the window is `start` on the parent. Used to hand a single
/// partition to the filesystem registry as if it were a whole device.
#[derive(Clone)]
pub struct PartitionDevice {
    parent: Arc<dyn BlockDevice>,
    start: SectorNumber,
    count: u64,
}

impl std::fmt::Debug for PartitionDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionDevice")
            .field("start", &self.start)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl PartitionDevice {
    /// Fails with `InvalidPartition` if the window is empty or extends past
    /// the parent device.
    pub fn new(parent: Arc<dyn BlockDevice>, start: SectorNumber, count: u64) -> Result<Self> {
        if count == 0 {
            return Err(PfsError::InvalidPartition(format!(
                "empty partition at sector {start}"
            )));
        }
        let end = start.checked_add(count).ok_or_else(|| {
            PfsError::InvalidPartition(format!("partition range overflows at sector {start}"))
        })?;
        if end.0 > parent.sector_count() {
            return Err(PfsError::InvalidPartition(format!(
                "partition [{start}, {end}) exceeds device of {} sectors",
                parent.sector_count()
            )));
        }
        Ok(Self {
            parent,
            start,
            count,
        })
    }

    #[must_use]
    pub fn start(&self) -> SectorNumber {
        self.start
    }

    fn translate(&self, sector: SectorNumber) -> Result<SectorNumber> {
        if sector.0 >= self.count {
            return Err(PfsError::OutOfRange(format!(
                "sector {sector} beyond partition end (sector_count={})",
                self.count
            )));
        }
        Ok(SectorNumber(self.start.0 + sector.0))
    }
}

impl BlockDevice for PartitionDevice {
    fn read_sector(&self, sector: SectorNumber) -> Result<BlockBuf> {
        self.parent.read_sector(self.translate(sector)?)
    }

    fn write_sector(&self, sector: SectorNumber, data: &[u8]) -> Result<()> {
        self.parent.write_sector(self.translate(sector)?, data)
    }

    fn sector_size(&self) -> u32 {
        self.parent.sector_size()
    }

    fn sector_count(&self) -> u64 {
        self.count
    }

    fn is_read_only(&self) -> bool {
        self.parent.is_read_only()
    }

    fn sync(&self) -> Result<()> {
        self.parent.sync()
    }
}

/// Read an arbitrary byte range that may straddle sector boundaries.
pub fn read_bytes(dev: &dyn BlockDevice, offset: u64, buf: &mut [u8]) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    checked_end(offset, buf.len(), dev.len_bytes(), "read")?;

    let sector_size = u64::from(dev.sector_size());
    let mut done = 0_usize;
    while done < buf.len() {
        let pos = offset + u64::try_from(done).unwrap_or(u64::MAX);
        let sector = SectorNumber(pos / sector_size);
        let within = usize::try_from(pos % sector_size)
            .map_err(|_| PfsError::Format("sector offset does not fit usize".to_owned()))?;
        let data = dev.read_sector(sector)?;
        let available = data.as_slice().len().saturating_sub(within);
        if available == 0 {
            return Err(PfsError::Format(format!(
                "device returned short sector {sector}"
            )));
        }
        let take = available.min(buf.len() - done);
        buf[done..done + take].copy_from_slice(&data.as_slice()[within..within + take]);
        done += take;
    }
    Ok(())
}

/// Read up to `max_len` bytes from the start of the device.
///
/// Used for format probing; devices shorter than `max_len` return their
/// whole contents.
pub fn read_probe_region(dev: &dyn BlockDevice, max_len: usize) -> Result<Vec<u8>> {
    let len = usize::try_from(dev.len_bytes())
        .unwrap_or(usize::MAX)
        .min(max_len);
    let mut buf = vec![0_u8; len];
    read_bytes(dev, 0, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| u8::try_from(i % 251).unwrap()).collect()
    }

    #[test]
    fn sector_device_round_trips() {
        let dev = SectorBlockDevice::new(MemoryByteDevice::zeroed(512 * 4), 512).expect("device");
        assert_eq!(dev.sector_count(), 4);
        assert_eq!(dev.len_bytes(), 2048);

        dev.write_sector(SectorNumber(2), &[7_u8; 512]).expect("write");
        let read = dev.read_sector(SectorNumber(2)).expect("read");
        assert_eq!(read.as_slice(), &[7_u8; 512]);
        assert!(matches!(
            dev.read_sector(SectorNumber(4)),
            Err(PfsError::OutOfRange(_))
        ));
        assert!(matches!(
            dev.write_sector(SectorNumber(0), &[0_u8; 10]),
            Err(PfsError::Format(_))
        ));
    }

    #[test]
    fn rejects_bad_sector_sizes() {
        assert!(SectorBlockDevice::new(MemoryByteDevice::zeroed(4096), 0).is_err());
        assert!(SectorBlockDevice::new(MemoryByteDevice::zeroed(4096), 500).is_err());
        assert!(SectorBlockDevice::new(MemoryByteDevice::zeroed(4096), 4096).is_ok());
    }

    #[test]
    fn read_only_memory_device_refuses_writes() {
        let dev =
            SectorBlockDevice::new(MemoryByteDevice::read_only(vec![0_u8; 1024]), 512).expect("dev");
        assert!(dev.is_read_only());
        assert!(matches!(
            dev.write_sector(SectorNumber(0), &[1_u8; 512]),
            Err(PfsError::ReadOnly)
        ));
    }

    #[test]
    fn read_bytes_spans_sectors() {
        let image = patterned(512 * 3);
        let dev = SectorBlockDevice::from_bytes(image.clone()).expect("device");
        let mut buf = vec![0_u8; 600];
        read_bytes(&dev, 300, &mut buf).expect("read");
        assert_eq!(buf, image[300..900]);

        let mut past = [0_u8; 16];
        assert!(matches!(
            read_bytes(&dev, 1530, &mut past),
            Err(PfsError::OutOfRange(_))
        ));
    }

    #[test]
    fn probe_region_is_clamped_to_device_length() {
        let dev = SectorBlockDevice::from_bytes(patterned(1024)).expect("device");
        assert_eq!(read_probe_region(&dev, 16 * 1024).expect("probe").len(), 1024);
        assert_eq!(read_probe_region(&dev, 100).expect("probe").len(), 100);
    }

    #[test]
    fn partition_window_translates_and_bounds() {
        let image = patterned(512 * 8);
        let parent: Arc<dyn BlockDevice> =
            Arc::new(SectorBlockDevice::from_bytes(image.clone()).expect("device"));
        let part = PartitionDevice::new(Arc::clone(&parent), SectorNumber(2), 3).expect("window");
        assert_eq!(part.sector_count(), 3);
        assert_eq!(
            part.read_sector(SectorNumber(0)).expect("read").as_slice(),
            &image[1024..1536]
        );
        assert!(part.read_sector(SectorNumber(3)).is_err());

        assert!(matches!(
            PartitionDevice::new(Arc::clone(&parent), SectorNumber(6), 3),
            Err(PfsError::InvalidPartition(_))
        ));
        assert!(matches!(
            PartitionDevice::new(parent, SectorNumber(1), 0),
            Err(PfsError::InvalidPartition(_))
        ));
    }

    #[test]
    fn file_device_reads_image_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        let image = patterned(2048);
        file.write_all(&image).expect("write image");
        file.flush().expect("flush");

        let bytes = FileByteDevice::open_read_only(file.path()).expect("open");
        assert!(ByteDevice::is_read_only(&bytes));
        let dev = SectorBlockDevice::new(bytes, 512).expect("device");
        assert_eq!(dev.sector_count(), 4);
        assert_eq!(
            dev.read_sector(SectorNumber(1)).expect("read").as_slice(),
            &image[512..1024]
        );
        assert!(matches!(
            dev.write_sector(SectorNumber(1), &[0_u8; 512]),
            Err(PfsError::ReadOnly)
        ));

        let rw = FileByteDevice::open(file.path()).expect("open rw");
        rw.write_all_at(0, b"PFS!").expect("write");
        rw.sync().expect("sync");
        let mut head = [0_u8; 4];
        rw.read_exact_at(0, &mut head).expect("read back");
        assert_eq!(&head, b"PFS!");
    }
}
