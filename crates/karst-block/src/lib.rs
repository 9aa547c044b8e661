#![forbid(unsafe_code)]
//! Block I/O layer for karst.
//!
//! Provides the `ByteDevice` and `BlockDevice` traits with `&Cx` capability
//! context for cooperative cancellation, aligned owned buffers, file and
//! in-memory device implementations, and the batched extent driver used by
//! the metadata paths.

use asupersync::Cx;
use karst_error::{KarstError, Result};
use karst_types::Pbn;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| KarstError::Cancelled)
}

const DEFAULT_BLOCK_ALIGNMENT: usize = 4096;

/// Owned byte buffer whose exposed window starts at a requested alignment.
///
/// The allocation is over-sized by one alignment step and the window is
/// placed on the first aligned byte inside it, which keeps the type free
/// of unsafe pointer work. Alignments round up to the next power of two;
/// zero requests one-byte alignment.
#[derive(Debug, Clone)]
pub struct AlignedVec {
    buf: Box<[u8]>,
    head: usize,
    size: usize,
}

impl AlignedVec {
    #[must_use]
    pub fn new(size: usize, alignment: usize) -> Self {
        let align = alignment.max(1).next_power_of_two();
        let buf: Box<[u8]> = vec![0_u8; size + (align - 1)].into_boxed_slice();
        // Distance from the allocation base to the next aligned address,
        // as a single masked expression (zero when already aligned).
        let head = align.wrapping_sub(buf.as_ptr() as usize) & (align - 1);
        debug_assert!(head + size <= buf.len());
        Self { buf, head, size }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.head..self.head + self.size]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let window = self.head..self.head + self.size;
        &mut self.buf[window]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl PartialEq for AlignedVec {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for AlignedVec {}

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Arc<AlignedVec>,
}

impl BlockBuf {
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: Arc::new(AlignedVec::new(len, DEFAULT_BLOCK_ALIGNMENT)),
        }
    }

    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut buf = Self::zeroed(data.len());
        buf.make_mut().copy_from_slice(data);
        buf
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn clone_ref(&self) -> Self {
        Self {
            bytes: Arc::clone(&self.bytes),
        }
    }

    pub fn make_mut(&mut self) -> &mut [u8] {
        Arc::make_mut(&mut self.bytes).as_mut_slice()
    }

    /// Whether every byte in the buffer is zero.
    ///
    /// Word-at-a-time scan; the first nonzero word exits early, which is
    /// the common case for real data.
    #[must_use]
    pub fn is_all_zero(&self) -> bool {
        let bytes = self.as_slice();
        let mut chunks = bytes.chunks_exact(8);
        for chunk in &mut chunks {
            let word = u64::from_ne_bytes(chunk.try_into().unwrap_or([0; 8]));
            if word != 0 {
                return false;
            }
        }
        chunks.remainder().iter().all(|b| *b == 0)
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self, cx: &Cx) -> Result<()>;
}

/// Positioned file I/O over `std::os::unix::fs::FileExt`.
///
/// Opens read-write when the file permits it and degrades to a read-only
/// device otherwise; writes against a read-only device report `ReadOnly`.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match Self::open_mode(path, true) {
            Ok(dev) => Ok(dev),
            Err(_) => Self::open_mode(path, false),
        }
    }

    fn open_mode(path: &Path, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;
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

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| KarstError::Format("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(KarstError::OutOfRange {
                kind: "byte offset",
                value: end,
                limit: self.len,
            });
        }
        self.file.read_exact_at(buf, offset)?;
        cx_checkpoint(cx)?;
        Ok(())
    }

    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        if !self.writable {
            return Err(KarstError::ReadOnly);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| KarstError::Format("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(KarstError::OutOfRange {
                kind: "byte offset",
                value: end,
                limit: self.len,
            });
        }
        self.file.write_all_at(buf, offset)?;
        cx_checkpoint(cx)?;
        Ok(())
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device backed by a shared buffer.
///
/// Used by tests and the e2e harness; cloning shares the backing storage.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; len])),
        }
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let start = usize::try_from(offset)
            .map_err(|_| KarstError::Format("offset does not fit usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| KarstError::Format("read range overflow".to_owned()))?;
        let bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(KarstError::OutOfRange {
                kind: "byte offset",
                value: end as u64,
                limit: bytes.len() as u64,
            });
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let start = usize::try_from(offset)
            .map_err(|_| KarstError::Format("offset does not fit usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| KarstError::Format("write range overflow".to_owned()))?;
        let mut bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(KarstError::OutOfRange {
                kind: "byte offset",
                value: end as u64,
                limit: bytes.len() as u64,
            });
        }
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by physical block number.
    fn read_block(&self, cx: &Cx, pbn: Pbn) -> Result<BlockBuf>;

    /// Write a block. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, cx: &Cx, pbn: Pbn, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self, cx: &Cx) -> Result<()>;
}

/// Adapter exposing any `ByteDevice` as a `BlockDevice`.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(KarstError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let remainder = len % u64::from(block_size);
        if remainder != 0 {
            return Err(KarstError::Format(format!(
                "device length is not block-aligned: len_bytes={len} block_size={block_size}"
            )));
        }
        let block_count = len / u64::from(block_size);
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, cx: &Cx, pbn: Pbn) -> Result<BlockBuf> {
        if pbn.0 >= self.block_count {
            return Err(KarstError::OutOfRange {
                kind: "pbn",
                value: pbn.0,
                limit: self.block_count,
            });
        }
        let offset = pbn.0 * u64::from(self.block_size);
        let mut buf = BlockBuf::zeroed(self.block_size as usize);
        self.inner.read_exact_at(cx, offset, buf.make_mut())?;
        Ok(buf)
    }

    fn write_block(&self, cx: &Cx, pbn: Pbn, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(KarstError::Format(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        if pbn.0 >= self.block_count {
            return Err(KarstError::OutOfRange {
                kind: "pbn",
                value: pbn.0,
                limit: self.block_count,
            });
        }
        let offset = pbn.0 * u64::from(self.block_size);
        self.inner.write_all_at(cx, offset, data)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        self.inner.sync(cx)
    }
}

/// Read `count` consecutive blocks starting at `start` as one batched extent.
///
/// Every sub-read is attempted; the first failure is remembered and returned
/// once all have been tried, so a single bad block does not hide the state
/// of its neighbors.
pub fn read_extent(
    cx: &Cx,
    dev: &dyn BlockDevice,
    start: Pbn,
    count: u64,
) -> Result<Vec<BlockBuf>> {
    cx_checkpoint(cx)?;
    trace!(
        target: "karst::block::extent",
        event = "read_extent",
        start = start.0,
        count
    );
    let mut bufs = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
    let mut first_error: Option<KarstError> = None;
    for index in 0..count {
        let pbn = start
            .checked_add(index)
            .ok_or_else(|| KarstError::Format("extent range overflow".to_owned()))?;
        match dev.read_block(cx, pbn) {
            Ok(buf) => bufs.push(buf),
            Err(err) => {
                bufs.push(BlockBuf::zeroed(dev.block_size() as usize));
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(bufs),
    }
}

/// Write consecutive blocks starting at `start` as one batched extent.
///
/// All sub-writes are attempted; the first non-success status is aggregated
/// and returned after the batch completes.
pub fn write_extent(cx: &Cx, dev: &dyn BlockDevice, start: Pbn, bufs: &[BlockBuf]) -> Result<()> {
    cx_checkpoint(cx)?;
    trace!(
        target: "karst::block::extent",
        event = "write_extent",
        start = start.0,
        count = bufs.len()
    );
    let mut first_error: Option<KarstError> = None;
    for (index, buf) in bufs.iter().enumerate() {
        let pbn = start
            .checked_add(index as u64)
            .ok_or_else(|| KarstError::Format("extent range overflow".to_owned()))?;
        if let Err(err) = dev.write_block(cx, pbn, buf.as_slice())
            && first_error.is_none()
        {
            first_error = Some(err);
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_block_device(blocks: u64, block_size: u32) -> ByteBlockDevice<MemoryByteDevice> {
        let dev = MemoryByteDevice::new((blocks * u64::from(block_size)) as usize);
        ByteBlockDevice::new(dev, block_size).expect("aligned device")
    }

    #[test]
    fn zeroed_buf_is_all_zero() {
        let buf = BlockBuf::zeroed(4096);
        assert!(buf.is_all_zero());
        let mut buf = buf;
        buf.make_mut()[4095] = 1;
        assert!(!buf.is_all_zero());
    }

    #[test]
    fn block_roundtrip_through_memory_device() {
        let cx = Cx::for_testing();
        let dev = memory_block_device(8, 4096);
        let mut data = BlockBuf::zeroed(4096);
        data.make_mut()[0..4].copy_from_slice(b"kars");
        dev.write_block(&cx, Pbn(3), data.as_slice()).expect("write");
        let back = dev.read_block(&cx, Pbn(3)).expect("read");
        assert_eq!(back.as_slice(), data.as_slice());
    }

    #[test]
    fn out_of_range_block_is_rejected() {
        let cx = Cx::for_testing();
        let dev = memory_block_device(4, 4096);
        let err = dev.read_block(&cx, Pbn(4)).unwrap_err();
        assert!(matches!(err, KarstError::OutOfRange { .. }));
    }

    #[test]
    fn misaligned_device_length_is_rejected() {
        let dev = MemoryByteDevice::new(4096 + 17);
        assert!(ByteBlockDevice::new(dev, 4096).is_err());
    }

    #[test]
    fn wrong_write_size_is_rejected() {
        let cx = Cx::for_testing();
        let dev = memory_block_device(4, 4096);
        let err = dev.write_block(&cx, Pbn(0), &[0_u8; 512]).unwrap_err();
        assert!(matches!(err, KarstError::Format(_)));
    }

    #[test]
    fn extent_roundtrip() {
        let cx = Cx::for_testing();
        let dev = memory_block_device(8, 512);
        let bufs: Vec<BlockBuf> = (0..4_u8)
            .map(|i| BlockBuf::from_bytes(&[i; 512]))
            .collect();
        write_extent(&cx, &dev, Pbn(2), &bufs).expect("extent write");
        let back = read_extent(&cx, &dev, Pbn(2), 4).expect("extent read");
        for (i, buf) in back.iter().enumerate() {
            assert_eq!(buf.as_slice(), &[i as u8; 512][..]);
        }
    }

    #[test]
    fn extent_aggregates_first_error_after_attempting_all() {
        let cx = Cx::for_testing();
        let dev = memory_block_device(4, 512);
        // Range runs off the end of the device: blocks 2 and 3 succeed,
        // blocks 4 and 5 fail; the first failure is what comes back.
        let err = read_extent(&cx, &dev, Pbn(2), 4).unwrap_err();
        assert!(matches!(
            err,
            KarstError::OutOfRange { value: 4, .. }
        ));
    }

    #[test]
    fn file_device_roundtrip() {
        let cx = Cx::for_testing();
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        file.as_file().set_len(8192).expect("set_len");
        let dev = FileByteDevice::open(file.path()).expect("open");
        dev.write_all_at(&cx, 4096, &[7_u8; 512]).expect("write");
        let mut back = [0_u8; 512];
        dev.read_exact_at(&cx, 4096, &mut back).expect("read");
        assert_eq!(back, [7_u8; 512]);
        dev.sync(&cx).expect("sync");
    }
}
