//! Engine statistics.
//!
//! All counters are monotonic for the lifetime of the engine and are
//! read as a snapshot through [`crate::Engine::stats`].

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Upstream requests admitted.
    pub bios: u64,
    pub reads: u64,
    pub writes: u64,
    pub discards: u64,
    /// Writes elided because the payload was all zeros.
    pub zero_elisions: u64,
    /// Dedup candidates confirmed by byte verification.
    pub dedup_verified: u64,
    /// Reference shares added through dedup.
    pub dedup_shares: u64,
    /// Dedup attempts that fell back to a fresh write.
    pub dedup_fallbacks: u64,
    /// Hash locks abandoned to independent writes.
    pub hash_lock_bypasses: u64,
    /// Advice index queries issued.
    pub advice_queries: u64,
    /// Packed container blocks written.
    pub compressed_blocks: u64,
    /// Fragments written inside packed blocks.
    pub compressed_fragments: u64,
    /// Uncompressed data blocks written.
    pub data_writes: u64,
    /// Data blocks read from the device.
    pub data_reads: u64,
    /// Intent records appended to the recovery journal.
    pub journal_entries: u64,
    /// Block-map leaf updates.
    pub map_updates: u64,
    /// Physical blocks whose reference count returned to zero.
    pub blocks_freed: u64,
    /// Corrupt packed fragments encountered.
    pub invalid_fragments: u64,
    /// Allocation failures after trying every physical zone.
    pub out_of_space: u64,
    /// Data-VIOs that completed with an error.
    pub vio_errors: u64,
    /// Times the engine latched read-only (0 or 1).
    pub read_only_entries: u64,
}
