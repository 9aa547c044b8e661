//! The data-VIO: one logical block's worth of work.
//!
//! A data-VIO is created at bio ingress, hops between zones through the
//! pipeline phases, and returns to the pool at acknowledgment. Its buffers
//! are preallocated at pool construction; the data path allocates nothing
//! after admission.

use crate::bio::BioId;
use karst_error::KarstError;
use karst_pack::CompressionStatusWord;
use karst_types::{
    BlockSize, ChunkName, DataLocation, HashZone, JournalPoint, Lbn, LogicalZone, Pbn,
    PhysicalZone, VioId,
};

/// What this data-VIO is doing to its logical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VioOperation {
    Read,
    Write,
    Discard,
}

/// How the reference-count update step treats `new_mapped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefUpdate {
    /// No reference change (zero block or trim).
    None,
    /// Convert this VIO's provisional allocation into a real reference.
    CommitProvisional,
    /// Add a share on an existing block (dedup, or a follow-on fragment
    /// of a packed block).
    Share,
}

/// Per-request state machine carrier.
#[derive(Debug)]
pub struct DataVio {
    pub id: VioId,
    pub bio: Option<BioId>,
    pub op: VioOperation,
    pub lbn: Lbn,
    /// Byte offset of the payload within the block (partial I/O).
    pub offset: usize,
    /// Payload bytes within this block.
    pub len: usize,
    /// Where this block's piece starts in the bio payload/buffer.
    pub payload_offset: usize,
    /// Bytes left to discard, including the current block's piece.
    pub remaining_discard: usize,
    pub is_trim: bool,
    pub is_zero_block: bool,
    pub is_duplicate: bool,
    pub flush_after: bool,

    pub mapped: DataLocation,
    pub new_mapped: DataLocation,
    pub duplicate: DataLocation,
    pub chunk_name: Option<ChunkName>,

    pub logical_zone: LogicalZone,
    pub hash_zone: HashZone,
    pub allocation_zone: PhysicalZone,
    pub allocation: Option<Pbn>,
    pub allocation_attempts: u8,
    pub provisional_committed: bool,
    pub ref_update: RefUpdate,
    pub journal_point: Option<JournalPoint>,

    pub holds_logical_lock: bool,
    pub holds_hash_lock: bool,
    /// Outcome of the dedup verify comparison.
    pub verified_match: bool,

    pub compression_size: usize,
    pub compression_status: CompressionStatusWord,

    pub flush_generation: u64,
    pub result: Option<KarstError>,
    pub has_discard_permit: bool,

    /// The block image being read or written.
    pub data: Vec<u8>,
    /// Compression output / decompression input staging.
    pub scratch: Vec<u8>,
}

impl DataVio {
    #[must_use]
    pub fn new(id: VioId, block_size: BlockSize) -> Self {
        Self {
            id,
            bio: None,
            op: VioOperation::Read,
            lbn: Lbn(0),
            offset: 0,
            len: 0,
            payload_offset: 0,
            remaining_discard: 0,
            is_trim: false,
            is_zero_block: false,
            is_duplicate: false,
            flush_after: false,
            mapped: DataLocation::UNMAPPED,
            new_mapped: DataLocation::UNMAPPED,
            duplicate: DataLocation::UNMAPPED,
            chunk_name: None,
            logical_zone: LogicalZone(0),
            hash_zone: HashZone(0),
            allocation_zone: PhysicalZone(0),
            allocation: None,
            allocation_attempts: 0,
            provisional_committed: false,
            ref_update: RefUpdate::None,
            journal_point: None,
            holds_logical_lock: false,
            holds_hash_lock: false,
            verified_match: false,
            compression_size: 0,
            compression_status: CompressionStatusWord::new(),
            flush_generation: 0,
            result: None,
            has_discard_permit: false,
            data: vec![0_u8; block_size.as_usize()],
            scratch: vec![0_u8; block_size.as_usize()],
        }
    }

    /// Whether this piece covers less than a full block.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.offset != 0 || self.len != self.data.len()
    }

    /// Record the first failure; later failures are dropped.
    pub fn set_result(&mut self, err: KarstError) {
        if self.result.is_none() {
            self.result = Some(err);
        }
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.result.is_some()
    }

    /// Reset request state for pool reuse, keeping the buffers.
    pub fn reset(&mut self) {
        self.bio = None;
        self.op = VioOperation::Read;
        self.lbn = Lbn(0);
        self.offset = 0;
        self.len = 0;
        self.payload_offset = 0;
        self.remaining_discard = 0;
        self.is_trim = false;
        self.is_zero_block = false;
        self.is_duplicate = false;
        self.flush_after = false;
        self.mapped = DataLocation::UNMAPPED;
        self.new_mapped = DataLocation::UNMAPPED;
        self.duplicate = DataLocation::UNMAPPED;
        self.chunk_name = None;
        self.allocation = None;
        self.allocation_attempts = 0;
        self.provisional_committed = false;
        self.ref_update = RefUpdate::None;
        self.journal_point = None;
        self.holds_logical_lock = false;
        self.holds_hash_lock = false;
        self.verified_match = false;
        self.compression_size = 0;
        self.compression_status.reset();
        self.flush_generation = 0;
        self.result = None;
        self.has_discard_permit = false;
        self.data.fill(0);
        self.scratch.fill(0);
    }

    /// Re-arm the per-block state for the next block of a walking
    /// discard, keeping the bio attachment and permits.
    pub fn advance_discard_block(&mut self, block_size: usize) {
        self.lbn = self.lbn.next();
        self.offset = 0;
        self.len = self.remaining_discard.min(block_size);
        self.is_trim = self.len == block_size;
        self.is_zero_block = false;
        self.is_duplicate = false;
        self.mapped = DataLocation::UNMAPPED;
        self.new_mapped = DataLocation::UNMAPPED;
        self.duplicate = DataLocation::UNMAPPED;
        self.chunk_name = None;
        self.allocation = None;
        self.allocation_attempts = 0;
        self.provisional_committed = false;
        self.ref_update = RefUpdate::None;
        self.journal_point = None;
        self.verified_match = false;
        self.compression_size = 0;
        self.compression_status.reset();
        self.data.fill(0);
    }
}

/// Pipeline steps, each tagged with the zone kind that runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Acquire the logical lock for the LBN. Logical zone.
    FindBlockMapSlot,
    /// Read the existing mapping. Logical zone.
    GetMapped,
    /// Read the mapped (or candidate) physical block. Physical zone.
    ReadData,
    /// Extract and decompress a packed fragment. CPU zone.
    UncompressRead,
    /// Overlay a partial payload (or discard zeros) onto old data. CPU.
    ApplyPartialWrite,
    /// Fingerprint the block. CPU zone.
    HashData,
    /// Enter the per-fingerprint hash lock. Hash zone.
    AcquireHashLock,
    /// Agent-only: query the advice index. Hash zone.
    AgentQuery,
    /// Take a read lock on the dedup candidate. Physical zone.
    LockDuplicate,
    /// Read the candidate block for verification. Physical zone.
    VerifyRead,
    /// Compare candidate bytes against the write payload. CPU zone.
    VerifyCompare,
    /// Apply the verify outcome to the hash lock. Hash zone.
    VerifyResult,
    /// Try to compress the block. CPU zone.
    Compress,
    /// Stage the compressed fragment into a packer bin. Packer zone.
    Pack,
    /// Write a sealed compressed batch. Physical zone.
    WriteBatch,
    /// Allocate a fresh physical block. Physical zone.
    Allocate,
    /// Write uncompressed data to the allocation. Physical zone.
    WriteData,
    /// Agent-only: publish the fresh write to the hash lock. Hash zone.
    HashLockWritten,
    /// Append the intent record. Journal zone.
    JournalEntry,
    /// Apply the reference update for `new_mapped`. Physical zone.
    IncrementRef,
    /// Drop the reference on the old mapping. Physical zone.
    DecrementOld,
    /// Update the block-map leaf. Logical zone.
    UpdateBlockMap,
    /// Commit the journal tail for FUA/SYNC acknowledgment. Journal zone.
    JournalFlushForAck,
    /// Release the allocation's PBN lock (and any uncommitted
    /// provisional hold). Physical zone.
    CleanupAllocation,
    /// Leave the hash lock. Hash zone.
    ReleaseHashLock,
    /// Release a hash lock's duplicate PBN lock. Physical zone.
    ReleaseDuplicateLock,
    /// Complete or continue the bio. Bio-ack zone.
    Acknowledge,
    /// Release the logical lock and recycle the data-VIO. Logical zone.
    Cleanup,
}
