//! Platform-specific raw block I/O
//!
//! Everything above this module talks to storage through [`BlockDevice`]:
//! positional, block-aligned reads and writes plus a durability barrier.
//!
//! - [`RawFile`]: a device or regular file, optionally opened with O_DIRECT
//! - [`MemDevice`]: an in-memory device used by tests and tooling
//! - [`AlignedBuffer`]: block-sized buffers whose memory alignment is
//!   guaranteed by construction

use flashkv_common::{BLOCK_SIZE, Error, Result};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Memory alignment of I/O buffers (satisfies O_DIRECT on 4K-sector devices)
pub const MEMORY_ALIGNMENT: usize = 4096;

/// A block-addressed storage device
pub trait BlockDevice: Send + Sync {
    /// Read exactly `buf.len()` bytes at `offset`
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `offset`
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Make every completed write durable
    fn sync(&self) -> Result<()>;

    /// Device size in bytes
    fn size(&self) -> u64;

    /// Human-readable device name for logs
    fn name(&self) -> &str;
}

/// Check that an I/O request is block aligned
fn check_alignment(name: &str, offset: u64, len: usize) -> Result<()> {
    if offset % BLOCK_SIZE as u64 != 0 {
        return Err(Error::Storage(format!(
            "{name}: offset {offset} is not aligned to {BLOCK_SIZE}"
        )));
    }
    if len % BLOCK_SIZE != 0 {
        return Err(Error::Storage(format!(
            "{name}: size {len} is not aligned to {BLOCK_SIZE}"
        )));
    }
    Ok(())
}

fn check_bounds(name: &str, offset: u64, len: usize, size: u64) -> Result<()> {
    if offset.checked_add(len as u64).is_none_or(|end| end > size) {
        return Err(Error::Storage(format!(
            "{name}: I/O at {offset}+{len} exceeds device size {size}"
        )));
    }
    Ok(())
}

/// Raw file handle with optional direct I/O
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
    read_only: bool,
}

impl RawFile {
    /// Open an existing device or file
    pub fn open(path: impl AsRef<Path>, read_only: bool, direct_io: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true);
        }
        Self::apply_direct(&mut options, direct_io);

        let file = options
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to open {path_str}: {e}")))?;

        let size = if Self::is_block_device(&path) {
            Self::get_block_device_size(&file, &path_str)?
        } else {
            file.metadata()
                .map_err(|e| {
                    Error::Storage(format!("failed to get metadata for {path_str}: {e}"))
                })?
                .len()
        };

        Ok(Self {
            file,
            path: path_str,
            size,
            read_only,
        })
    }

    /// Create a file of the given size, or open a block device at its native size
    pub fn create(path: impl AsRef<Path>, size: u64, direct_io: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let is_block_device = Self::is_block_device(&path);

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if !is_block_device {
            options.create(true).truncate(true);
        }
        Self::apply_direct(&mut options, direct_io);

        let file = options
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to create {path_str}: {e}")))?;

        let actual_size = if is_block_device {
            Self::get_block_device_size(&file, &path_str)?
        } else {
            file.set_len(size)
                .map_err(|e| Error::Storage(format!("failed to set size for {path_str}: {e}")))?;
            size
        };

        Ok(Self {
            file,
            path: path_str,
            size: actual_size,
            read_only: false,
        })
    }

    #[cfg(target_os = "linux")]
    fn apply_direct(options: &mut OpenOptions, direct_io: bool) {
        if direct_io {
            options.custom_flags(libc::O_DIRECT);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_direct(_options: &mut OpenOptions, _direct_io: bool) {}

    /// Check if path is a block device
    fn is_block_device(path: impl AsRef<Path>) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(&path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    /// Get block device size using ioctl
    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn get_block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        // BLKGETSIZE64
        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if ret == -1 {
            return Err(Error::Storage(format!(
                "failed to get block device size for {path}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(size)
    }

    /// Get block device size (non-Linux fallback)
    #[cfg(not(target_os = "linux"))]
    fn get_block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::io::{Seek, SeekFrom};
        let mut f = file;
        let size = f
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::Storage(format!("failed to get device size for {path}: {e}")))?;
        Ok(size)
    }

    /// Get the file path
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl BlockDevice for RawFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_alignment(&self.path, offset, buf.len())?;
        check_bounds(&self.path, offset, buf.len(), self.size)?;
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::Storage(format!("read failed on {} at {offset}: {e}", self.path)))
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::Storage(format!("{} is read-only", self.path)));
        }
        check_alignment(&self.path, offset, buf.len())?;
        check_bounds(&self.path, offset, buf.len(), self.size)?;
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| Error::Storage(format!("write failed on {} at {offset}: {e}", self.path)))
    }

    fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::Storage(format!("sync failed on {}: {e}", self.path)))
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn name(&self) -> &str {
        &self.path
    }
}

/// In-memory block device
///
/// Writes land directly in memory; `sync` only counts. Write failures can be
/// injected to exercise error propagation.
pub struct MemDevice {
    name: String,
    data: RwLock<Vec<u8>>,
    fail_writes: AtomicBool,
    syncs: AtomicU64,
}

impl MemDevice {
    /// Create a zero-filled device
    #[must_use]
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        let size = usize::try_from(size).unwrap_or(usize::MAX);
        Self {
            name: name.into(),
            data: RwLock::new(vec![0u8; size]),
            fail_writes: AtomicBool::new(false),
            syncs: AtomicU64::new(0),
        }
    }

    /// Make every subsequent write fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of sync barriers issued so far
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::SeqCst)
    }

    /// Overwrite raw bytes, bypassing alignment checks
    pub fn poke(&self, offset: u64, bytes: &[u8]) {
        let start = offset as usize;
        self.data.write()[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Copy raw bytes out, bypassing alignment checks
    pub fn peek(&self, offset: u64, len: usize) -> Vec<u8> {
        let start = offset as usize;
        self.data.read()[start..start + len].to_vec()
    }
}

impl BlockDevice for MemDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_alignment(&self.name, offset, buf.len())?;
        let data = self.data.read();
        check_bounds(&self.name, offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!(
                "{}: injected write failure at {offset}",
                self.name
            )));
        }
        check_alignment(&self.name, offset, buf.len())?;
        let mut data = self.data.write();
        check_bounds(&self.name, offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Block-sized I/O buffer with guaranteed memory alignment
///
/// The length is always a whole number of blocks and the first byte is
/// aligned to the requested alignment, so buffers can be handed to O_DIRECT
/// without further arithmetic by callers.
pub struct AlignedBuffer {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuffer {
    /// Create a zeroed buffer of at least `size` bytes, rounded up to whole blocks
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self::with_alignment(size, MEMORY_ALIGNMENT)
    }

    /// Create a zeroed buffer of `blocks` whole blocks
    #[must_use]
    pub fn blocks(blocks: usize) -> Self {
        Self::new(blocks * BLOCK_SIZE)
    }

    /// Create a zeroed buffer with a custom memory alignment
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two.
    #[must_use]
    pub fn with_alignment(size: usize, alignment: usize) -> Self {
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        let len = size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        let storage = vec![0u8; len + alignment];
        let start = storage.as_ptr().align_offset(alignment);
        assert!(start < alignment, "unable to align buffer");
        Self { storage, start, len }
    }

    /// Get the buffer as a slice
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    /// Get the buffer as a mutable slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.start + self.len]
    }

    /// Get the buffer size
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check if buffer is empty
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of whole blocks in the buffer
    pub const fn block_count(&self) -> usize {
        self.len / BLOCK_SIZE
    }

    /// One block of the buffer
    pub fn block(&self, index: usize) -> &[u8] {
        &self.as_slice()[index * BLOCK_SIZE..(index + 1) * BLOCK_SIZE]
    }

    /// One block of the buffer, mutably
    pub fn block_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.as_mut_slice()[index * BLOCK_SIZE..(index + 1) * BLOCK_SIZE]
    }

    /// Copy data into the buffer (pads with zeros if source is smaller)
    pub fn copy_from(&mut self, src: &[u8]) {
        let dst = self.as_mut_slice();
        let copy_len = src.len().min(dst.len());
        dst[..copy_len].copy_from_slice(&src[..copy_len]);
        dst[copy_len..].fill(0);
    }

    /// Zero the whole buffer
    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl Clone for AlignedBuffer {
    fn clone(&self) -> Self {
        let mut copy = Self::new(self.len);
        copy.copy_from(self.as_slice());
        copy
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer").field("len", &self.len).finish()
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_aligned_buffer() {
        let mut buf = AlignedBuffer::new(100);
        assert_eq!(buf.len(), BLOCK_SIZE);
        assert_eq!(buf.as_slice().as_ptr() as usize % MEMORY_ALIGNMENT, 0);

        buf.copy_from(b"hello");
        assert_eq!(&buf.as_slice()[..5], b"hello");
        assert!(buf.as_slice()[5..].iter().all(|&b| b == 0));

        let copy = buf.clone();
        assert_eq!(copy.as_slice(), buf.as_slice());
        assert_eq!(copy.as_slice().as_ptr() as usize % MEMORY_ALIGNMENT, 0);
    }

    #[test]
    fn test_raw_file_create_and_read() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path();

        {
            let file = RawFile::create(path, 8192, false).unwrap();
            let mut buf = AlignedBuffer::blocks(1);
            buf.copy_from(b"test data pattern");
            file.write_at(BLOCK_SIZE as u64, buf.as_slice()).unwrap();
            file.sync().unwrap();
        }

        {
            let file = RawFile::open(path, true, false).unwrap();
            assert_eq!(file.size(), 8192);
            let mut buf = AlignedBuffer::blocks(1);
            file.read_at(BLOCK_SIZE as u64, buf.as_mut_slice()).unwrap();
            assert!(buf.as_slice().starts_with(b"test data pattern"));
            assert!(file.write_at(0, buf.as_slice()).is_err());
        }
    }

    #[test]
    fn test_unaligned_io_rejected() {
        let dev = MemDevice::new("mem0", 4096);
        let mut buf = vec![0u8; 100];
        assert!(dev.read_at(0, &mut buf).is_err());
        let buf = vec![0u8; BLOCK_SIZE];
        assert!(dev.write_at(7, &buf).is_err());
        assert!(dev.write_at(4096, &buf).is_err());
    }

    #[test]
    fn test_mem_device_fail_writes() {
        let dev = MemDevice::new("mem0", 4096);
        let buf = vec![1u8; BLOCK_SIZE];
        dev.write_at(0, &buf).unwrap();
        dev.set_fail_writes(true);
        assert!(dev.write_at(0, &buf).is_err());
        dev.set_fail_writes(false);
        dev.sync().unwrap();
        assert_eq!(dev.sync_count(), 1);
        assert_eq!(dev.peek(0, 4), vec![1, 1, 1, 1]);
    }
}
