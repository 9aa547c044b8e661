//! The upstream block-I/O boundary.
//!
//! A [`Bio`] is sector-addressed and may span many blocks and partial
//! blocks at either end. The engine splits it into per-block data-VIOs
//! (or one walking data-VIO for discards) and completes it exactly once.

use karst_error::KarstError;
use karst_types::{BlockSize, Lbn, SECTOR_SIZE};

/// Identifier of an in-flight upstream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BioId(pub u32);

/// Upstream operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioOp {
    Read,
    Write,
    Discard,
    Flush,
}

/// Upstream request flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BioFlags {
    /// Synchronous: acknowledge only once durable.
    pub sync: bool,
    /// Force unit access: flush the journal before acknowledging.
    pub fua: bool,
    /// Flush the device before servicing this request.
    pub preflush: bool,
}

/// One upstream request.
#[derive(Debug, Clone)]
pub struct Bio {
    pub op: BioOp,
    /// Starting sector (512-byte units).
    pub sector: u64,
    /// Payload for writes; sized to the request.
    pub data: Vec<u8>,
    /// Length in bytes for reads and discards.
    pub len: usize,
    pub flags: BioFlags,
}

impl Bio {
    #[must_use]
    pub fn read(sector: u64, len: usize) -> Self {
        Self {
            op: BioOp::Read,
            sector,
            data: Vec::new(),
            len,
            flags: BioFlags::default(),
        }
    }

    #[must_use]
    pub fn write(sector: u64, data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            op: BioOp::Write,
            sector,
            data,
            len,
            flags: BioFlags::default(),
        }
    }

    #[must_use]
    pub fn discard(sector: u64, len: usize) -> Self {
        Self {
            op: BioOp::Discard,
            sector,
            data: Vec::new(),
            len,
            flags: BioFlags::default(),
        }
    }

    #[must_use]
    pub fn flush() -> Self {
        Self {
            op: BioOp::Flush,
            sector: 0,
            data: Vec::new(),
            len: 0,
            flags: BioFlags {
                sync: true,
                ..BioFlags::default()
            },
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: BioFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Byte length of this request.
    #[must_use]
    pub fn len_bytes(&self) -> usize {
        self.len
    }

    /// Iterate the per-block pieces of this request: `(lbn, offset within
    /// block, length within block, offset within the bio payload)`.
    #[must_use]
    pub fn block_pieces(&self, block_size: BlockSize) -> Vec<BioPiece> {
        let mut pieces = Vec::new();
        let mut remaining = self.len;
        let mut sector = self.sector;
        let mut payload_offset = 0_usize;
        while remaining > 0 {
            let (lbn, offset) = block_size.sector_to_block(sector);
            let in_block = (block_size.as_usize() - offset).min(remaining);
            pieces.push(BioPiece {
                lbn,
                offset,
                len: in_block,
                payload_offset,
            });
            remaining -= in_block;
            payload_offset += in_block;
            sector += (in_block / SECTOR_SIZE as usize) as u64;
            if in_block % SECTOR_SIZE as usize != 0 {
                // Sub-sector tails still advance to the next block.
                sector = (lbn.0 + 1) * u64::from(block_size.sectors_per_block());
            }
        }
        pieces
    }
}

/// One block-sized piece of a bio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BioPiece {
    pub lbn: Lbn,
    pub offset: usize,
    pub len: usize,
    pub payload_offset: usize,
}

/// Tracking for an in-flight bio.
#[derive(Debug)]
pub struct BioState {
    pub op: BioOp,
    pub flags: BioFlags,
    /// Data-VIOs still working for this bio.
    pub pending: u32,
    /// Read buffer assembled by the data-VIOs.
    pub buffer: Vec<u8>,
    /// Write payload, kept for partial-block overlays.
    pub payload: Vec<u8>,
    /// First failure wins.
    pub result: Option<KarstError>,
    pub completed: bool,
}

impl BioState {
    #[must_use]
    pub fn new(op: BioOp, flags: BioFlags, buffer_len: usize) -> Self {
        Self {
            op,
            flags,
            pending: 0,
            buffer: vec![0_u8; buffer_len],
            payload: Vec::new(),
            result: None,
            completed: false,
        }
    }

    pub fn record_error(&mut self, err: KarstError) {
        if self.result.is_none() {
            self.result = Some(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bs() -> BlockSize {
        BlockSize::new(4096).expect("block size")
    }

    #[test]
    fn aligned_write_splits_into_whole_blocks() {
        let bio = Bio::write(8, vec![0_u8; 8192]);
        let pieces = bio.block_pieces(bs());
        assert_eq!(
            pieces,
            vec![
                BioPiece {
                    lbn: Lbn(1),
                    offset: 0,
                    len: 4096,
                    payload_offset: 0
                },
                BioPiece {
                    lbn: Lbn(2),
                    offset: 0,
                    len: 4096,
                    payload_offset: 4096
                },
            ]
        );
    }

    #[test]
    fn straddling_request_has_partial_ends() {
        // Start at sector 7 (3584 bytes into block 0), run 4608 bytes:
        // 512 in block 0, 4096 in block 1.
        let bio = Bio::read(7, 4608);
        let pieces = bio.block_pieces(bs());
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0], BioPiece {
            lbn: Lbn(0),
            offset: 3584,
            len: 512,
            payload_offset: 0
        });
        assert_eq!(pieces[1], BioPiece {
            lbn: Lbn(1),
            offset: 0,
            len: 4096,
            payload_offset: 512
        });
    }

    #[test]
    fn short_partial_is_single_piece() {
        let bio = Bio::write(1, vec![0_u8; 512]);
        let pieces = bio.block_pieces(bs());
        assert_eq!(
            pieces,
            vec![BioPiece {
                lbn: Lbn(0),
                offset: 512,
                len: 512,
                payload_offset: 0
            }]
        );
    }

    #[test]
    fn bio_state_keeps_first_error() {
        let mut state = BioState::new(BioOp::Write, BioFlags::default(), 0);
        state.record_error(KarstError::OutOfSpace);
        state.record_error(KarstError::ReadOnly);
        assert!(matches!(state.result, Some(KarstError::OutOfSpace)));
    }
}
