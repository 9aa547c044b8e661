#![forbid(unsafe_code)]
//! The compressor and fragment packer.
//!
//! Compression runs on the CPU zone; the packer is its own zone, staging
//! compressed fragments into up to fourteen open bins and sealing each
//! bin into one packed physical block once it cannot take the next
//! arrival or a flush is requested.

pub mod compress;
pub mod status;

pub use compress::{compress_block, decompress_fragment, incompressible};
pub use status::{CompressionState, CompressionStatusWord, VioCompressionStatus};

use karst_error::{KarstError, Result};
use karst_ondisk::compressed::{fragment_capacity, pack_fragments};
use karst_types::{MAX_COMPRESSION_SLOTS, VioId};
use tracing::{debug, trace};

/// Most bins the packer keeps open at once.
pub const MAX_BINS: usize = 14;

#[derive(Debug, Clone, Copy)]
struct Fragment {
    vio: VioId,
    offset: usize,
    size: usize,
}

#[derive(Debug)]
struct Bin {
    data: Vec<u8>,
    fragments: Vec<Fragment>,
}

impl Bin {
    fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            fragments: Vec::new(),
        }
    }

    fn free_space(&self, capacity: usize) -> usize {
        capacity - self.data.len()
    }

    fn accepts(&self, capacity: usize, size: usize) -> bool {
        self.fragments.len() < MAX_COMPRESSION_SLOTS as usize && self.free_space(capacity) >= size
    }

    fn push(&mut self, vio: VioId, bytes: &[u8]) {
        self.fragments.push(Fragment {
            vio,
            offset: self.data.len(),
            size: bytes.len(),
        });
        self.data.extend_from_slice(bytes);
    }
}

/// A closed bin: the packed block image and each participant's slot.
#[derive(Debug)]
pub struct SealedBatch {
    pub participants: Vec<(VioId, u8)>,
    pub block: Vec<u8>,
}

/// Monotonic packer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackerStats {
    pub fragments_queued: u64,
    pub bins_sealed: u64,
    pub fragments_written: u64,
    pub cancellations: u64,
}

/// The fragment packer.
#[derive(Debug)]
pub struct Packer {
    block_size: usize,
    capacity: usize,
    bins: Vec<Bin>,
    stats: PackerStats,
}

impl Packer {
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            capacity: fragment_capacity(block_size),
            bins: Vec::new(),
            stats: PackerStats::default(),
        }
    }

    /// Largest fragment the packer will accept.
    #[must_use]
    pub fn max_fragment_size(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn stats(&self) -> PackerStats {
        self.stats
    }

    /// Number of data-VIOs currently blocked in bins.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.bins.iter().map(|bin| bin.fragments.len()).sum()
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.bins.iter().any(|bin| !bin.fragments.is_empty())
    }

    /// Queue one compressed fragment.
    ///
    /// Picks the open bin with the tightest fit. When no bin can take the
    /// fragment and all fourteen are open, the fullest bin is sealed to
    /// make room and returned for the caller to write out.
    pub fn add(&mut self, vio: VioId, bytes: &[u8]) -> Result<Option<SealedBatch>> {
        if bytes.is_empty() || bytes.len() > self.capacity {
            return Err(KarstError::Protocol(format!(
                "fragment of {} bytes cannot be packed (capacity {})",
                bytes.len(),
                self.capacity
            )));
        }

        let mut sealed = None;
        if self.best_fit(bytes.len()).is_none() && self.bins.len() >= MAX_BINS {
            let fullest = self.fullest_bin();
            sealed = Some(self.seal(fullest)?);
        }

        let bin_index = match self.best_fit(bytes.len()) {
            Some(index) => index,
            None => {
                self.bins.push(Bin::new(self.capacity));
                self.bins.len() - 1
            }
        };
        self.bins[bin_index].push(vio, bytes);
        self.stats.fragments_queued += 1;
        trace!(
            target: "karst::packer",
            event = "fragment_queued",
            vio = vio.0,
            size = bytes.len(),
            bin = bin_index
        );
        Ok(sealed)
    }

    /// The open bin with the least free space still fitting `size`.
    fn best_fit(&self, size: usize) -> Option<usize> {
        self.bins
            .iter()
            .enumerate()
            .filter(|(_, bin)| bin.accepts(self.capacity, size))
            .min_by_key(|(_, bin)| bin.free_space(self.capacity))
            .map(|(index, _)| index)
    }

    fn fullest_bin(&self) -> usize {
        self.bins
            .iter()
            .enumerate()
            .max_by_key(|(_, bin)| bin.data.len())
            .map(|(index, _)| index)
            .unwrap_or(0)
    }

    fn seal(&mut self, bin_index: usize) -> Result<SealedBatch> {
        let bin = self.bins.swap_remove(bin_index);
        let fragments: Vec<&[u8]> = bin
            .fragments
            .iter()
            .map(|fragment| &bin.data[fragment.offset..fragment.offset + fragment.size])
            .collect();
        let block = pack_fragments(&fragments, self.block_size)?;
        let participants = bin
            .fragments
            .iter()
            .enumerate()
            .map(|(slot, fragment)| (fragment.vio, slot as u8))
            .collect::<Vec<_>>();
        self.stats.bins_sealed += 1;
        self.stats.fragments_written += participants.len() as u64;
        debug!(
            target: "karst::packer",
            event = "bin_sealed",
            fragments = participants.len(),
            bytes = bin.data.len()
        );
        Ok(SealedBatch {
            participants,
            block,
        })
    }

    /// Seal every non-empty bin: the flush path, and the scheduler's
    /// idle-packer bound on write latency.
    pub fn flush(&mut self) -> Result<Vec<SealedBatch>> {
        let mut batches = Vec::new();
        while let Some(index) = self.bins.iter().position(|bin| !bin.fragments.is_empty()) {
            batches.push(self.seal(index)?);
        }
        self.bins.clear();
        Ok(batches)
    }

    /// Remove a canceled data-VIO's fragment from its bin. The first
    /// canceler calls this; an emptied bin is discarded.
    pub fn remove(&mut self, vio: VioId) -> bool {
        for bin_index in 0..self.bins.len() {
            let Some(position) = self.bins[bin_index]
                .fragments
                .iter()
                .position(|fragment| fragment.vio == vio)
            else {
                continue;
            };
            let bin = &mut self.bins[bin_index];
            let removed = bin.fragments.remove(position);
            bin.data
                .drain(removed.offset..removed.offset + removed.size);
            for fragment in &mut bin.fragments[position..] {
                fragment.offset -= removed.size;
            }
            if bin.fragments.is_empty() {
                self.bins.swap_remove(bin_index);
            }
            self.stats.cancellations += 1;
            trace!(
                target: "karst::packer",
                event = "fragment_canceled",
                vio = vio.0
            );
            return true;
        }
        false
    }
}
