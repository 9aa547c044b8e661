#![forbid(unsafe_code)]
//! Core types for the karst block engine.
//!
//! Unit-carrying wrappers (logical vs physical block numbers, zone indexes,
//! request slots) so the rest of the workspace cannot mix address spaces,
//! plus the 4-bit mapping-state encoding shared by the block map, the
//! recovery journal, and the packer.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Sector size of the upstream block-I/O boundary.
pub const SECTOR_SIZE: u32 = 512;

/// Number of fragment slots a packed compressed block can hold.
pub const MAX_COMPRESSION_SLOTS: u8 = 14;

/// The reserved zero block. Never allocated, never reference counted, and
/// never the target of a compressed mapping.
pub const ZERO_BLOCK: Pbn = Pbn(0);

/// Logical block number: an index into the address space the engine exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lbn(pub u64);

impl Lbn {
    /// The next logical block, for discard walking.
    #[must_use]
    pub fn next(self) -> Lbn {
        Lbn(self.0.saturating_add(1))
    }
}

impl fmt::Display for Lbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lbn:{}", self.0)
    }
}

/// Physical block number: an index into the backing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pbn(pub u64);

impl Pbn {
    /// Whether this is the reserved zero block.
    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn checked_add(self, blocks: u64) -> Option<Pbn> {
        self.0.checked_add(blocks).map(Pbn)
    }
}

impl fmt::Display for Pbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pbn:{}", self.0)
    }
}

/// Index of a data-VIO slot in the request pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VioId(pub u32);

impl fmt::Display for VioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vio:{}", self.0)
    }
}

/// Logical zone index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalZone(pub u8);

/// Physical zone index (one per block allocator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhysicalZone(pub u8);

/// Hash zone index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HashZone(pub u8);

/// Zone types that may hold recovery-journal lock references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneType {
    Journal,
    Logical,
    Physical,
}

/// Validated block size: a power of two in 512..=65536.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, TypeError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(TypeError::InvalidBlockSize { value });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Sectors per block at the upstream boundary.
    #[must_use]
    pub fn sectors_per_block(self) -> u32 {
        self.0 / SECTOR_SIZE
    }

    /// Convert an upstream sector number to a logical block and byte offset
    /// within that block.
    #[must_use]
    pub fn sector_to_block(self, sector: u64) -> (Lbn, usize) {
        let per = u64::from(self.sectors_per_block());
        let lbn = Lbn(sector / per);
        let offset = (sector % per) * u64::from(SECTOR_SIZE);
        (lbn, offset as usize)
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(4096)
    }
}

/// How a block-map entry maps its logical block.
///
/// Encoded in 4 bits: 0 = unmapped, 1 = an independent uncompressed physical
/// block, 2 + slot = fragment `slot` of a packed compressed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MappingState {
    Unmapped,
    Uncompressed,
    Compressed(u8),
}

impl MappingState {
    const COMPRESSED_BASE: u8 = 2;

    /// Decode a 4-bit nibble. All sixteen values are meaningful.
    #[must_use]
    pub fn from_nibble(nibble: u8) -> Self {
        match nibble & 0x0F {
            0 => MappingState::Unmapped,
            1 => MappingState::Uncompressed,
            n => MappingState::Compressed(n - Self::COMPRESSED_BASE),
        }
    }

    /// Encode to the 4-bit on-disk nibble.
    #[must_use]
    pub fn to_nibble(self) -> u8 {
        match self {
            MappingState::Unmapped => 0,
            MappingState::Uncompressed => 1,
            MappingState::Compressed(slot) => Self::COMPRESSED_BASE + (slot & 0x0F),
        }
    }

    /// The mapping state for fragment `slot` of a packed block.
    pub fn for_slot(slot: u8) -> Result<Self, TypeError> {
        if slot >= MAX_COMPRESSION_SLOTS {
            return Err(TypeError::InvalidSlot { slot });
        }
        Ok(MappingState::Compressed(slot))
    }

    #[must_use]
    pub fn is_compressed(self) -> bool {
        matches!(self, MappingState::Compressed(_))
    }

    /// The fragment slot, for compressed states.
    #[must_use]
    pub fn slot(self) -> Option<u8> {
        match self {
            MappingState::Compressed(slot) => Some(slot),
            _ => None,
        }
    }
}

/// A physical data location: where a logical block's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataLocation {
    pub pbn: Pbn,
    pub state: MappingState,
}

impl DataLocation {
    pub const UNMAPPED: DataLocation = DataLocation {
        pbn: ZERO_BLOCK,
        state: MappingState::Unmapped,
    };

    /// The zero-sentinel mapping: logical block known to be all zeros.
    pub const ZERO: DataLocation = DataLocation {
        pbn: ZERO_BLOCK,
        state: MappingState::Uncompressed,
    };

    #[must_use]
    pub fn new(pbn: Pbn, state: MappingState) -> Self {
        Self { pbn, state }
    }

    #[must_use]
    pub fn is_mapped(self) -> bool {
        self.state != MappingState::Unmapped
    }

    /// Whether this location is representable: the zero block must never
    /// carry a compressed state, and any non-zero location must be mapped.
    #[must_use]
    pub fn is_valid(self) -> bool {
        if self.pbn.is_zero() {
            !self.state.is_compressed()
        } else {
            self.is_mapped()
        }
    }

    /// Whether reads of this location return zeros without any I/O.
    #[must_use]
    pub fn reads_as_zero(self) -> bool {
        self.pbn.is_zero() && !self.state.is_compressed()
    }
}

impl fmt::Display for DataLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state {
            MappingState::Unmapped => write!(f, "unmapped"),
            MappingState::Uncompressed => write!(f, "{}", self.pbn),
            MappingState::Compressed(slot) => write!(f, "{}+{slot}", self.pbn),
        }
    }
}

/// 128-bit content fingerprint of one block of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkName(pub [u8; 16]);

impl ChunkName {
    /// Pick the hash zone responsible for this fingerprint.
    #[must_use]
    pub fn hash_zone(self, zones: u8) -> HashZone {
        HashZone(self.0[0] % zones.max(1))
    }
}

impl fmt::Display for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "…")
    }
}

/// A position in the recovery journal: which sequenced block, which entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JournalPoint {
    pub sequence: u64,
    pub entry: u16,
}

impl fmt::Display for JournalPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "journal {}:{}", self.sequence, self.entry)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid block size {value} (must be a power of two in 512..=65536)")]
    InvalidBlockSize { value: u32 },
    #[error("compression slot {slot} out of range (max {MAX_COMPRESSION_SLOTS})")]
    InvalidSlot { slot: u8 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_validation() {
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(512).is_ok());
        assert!(BlockSize::new(65536).is_ok());
        assert!(BlockSize::new(0).is_err());
        assert!(BlockSize::new(4095).is_err());
        assert!(BlockSize::new(131_072).is_err());
    }

    #[test]
    fn sector_to_block_splits_offset() {
        let bs = BlockSize::new(4096).expect("block size");
        assert_eq!(bs.sectors_per_block(), 8);
        assert_eq!(bs.sector_to_block(0), (Lbn(0), 0));
        assert_eq!(bs.sector_to_block(7), (Lbn(0), 3584));
        assert_eq!(bs.sector_to_block(8), (Lbn(1), 0));
        assert_eq!(bs.sector_to_block(17), (Lbn(2), 512));
    }

    #[test]
    fn mapping_state_nibble_roundtrip() {
        for nibble in 0..=15_u8 {
            let state = MappingState::from_nibble(nibble);
            assert_eq!(state.to_nibble(), nibble);
        }
        assert_eq!(MappingState::from_nibble(0), MappingState::Unmapped);
        assert_eq!(MappingState::from_nibble(1), MappingState::Uncompressed);
        assert_eq!(MappingState::from_nibble(2), MappingState::Compressed(0));
        assert_eq!(MappingState::from_nibble(15), MappingState::Compressed(13));
    }

    #[test]
    fn slot_bounds() {
        assert!(MappingState::for_slot(0).is_ok());
        assert!(MappingState::for_slot(13).is_ok());
        assert!(MappingState::for_slot(14).is_err());
    }

    #[test]
    fn zero_block_location_validity() {
        assert!(DataLocation::UNMAPPED.is_valid());
        assert!(DataLocation::ZERO.is_valid());
        assert!(DataLocation::ZERO.reads_as_zero());
        let bad = DataLocation::new(ZERO_BLOCK, MappingState::Compressed(3));
        assert!(!bad.is_valid());
        let unmapped_nonzero = DataLocation::new(Pbn(9), MappingState::Unmapped);
        assert!(!unmapped_nonzero.is_valid());
        let mapped = DataLocation::new(Pbn(9), MappingState::Uncompressed);
        assert!(mapped.is_valid());
        assert!(!mapped.reads_as_zero());
    }

    #[test]
    fn hash_zone_selection_is_stable() {
        let name = ChunkName([7; 16]);
        assert_eq!(name.hash_zone(4), HashZone(3));
        assert_eq!(name.hash_zone(1), HashZone(0));
        // Zero zones is clamped rather than dividing by zero.
        assert_eq!(name.hash_zone(0), HashZone(0));
    }
}
