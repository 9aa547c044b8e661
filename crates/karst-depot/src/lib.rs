#![forbid(unsafe_code)]
//! The slab depot: zoned physical allocation and reference counting.
//!
//! The depot owns every slab, striped round-robin across physical zones;
//! each zone's [`BlockAllocator`] holds its slabs, its open-slab cursor,
//! and its PBN lock pool. All reference-count mutation happens through the
//! owning zone. The only cross-zone state is the approximate free-block
//! count.

pub mod pbn_lock;
pub mod ref_counts;
pub mod slab;

pub use pbn_lock::{PbnLock, PbnLockKind, PbnLockOutcome, PbnLockPool};
pub use ref_counts::ShareOutcome;
pub use slab::{RefOp, Slab, SlabJournal, SlabStatus};

use asupersync::Cx;
use karst_block::{BlockBuf, BlockDevice, write_extent};
use karst_error::{KarstError, Result};
use karst_ondisk::layout::{Partition, SLAB_SUMMARY_ENTRY_SIZE, SlabConfig, SlabSummaryEntry};
use karst_types::{Pbn, PhysicalZone, VioId};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace};

/// Per-zone block allocation.
#[derive(Debug)]
pub struct BlockAllocator {
    pub zone: PhysicalZone,
    slabs: Vec<Slab>,
    open_slab: Option<usize>,
    pub pbn_locks: PbnLockPool,
    /// Monotonic count of blocks handed out by this allocator.
    pub blocks_allocated: u64,
}

impl BlockAllocator {
    fn new(zone: PhysicalZone) -> Self {
        Self {
            zone,
            slabs: Vec::new(),
            open_slab: None,
            pbn_locks: PbnLockPool::new(),
            blocks_allocated: 0,
        }
    }

    #[must_use]
    pub fn slabs(&self) -> &[Slab] {
        &self.slabs
    }

    pub fn slabs_mut(&mut self) -> &mut [Slab] {
        &mut self.slabs
    }

    #[must_use]
    pub fn free_block_count(&self) -> u64 {
        self.slabs.iter().map(Slab::free_block_count).sum()
    }

    /// The slab holding `pbn`'s data area, if this zone owns it.
    #[must_use]
    pub fn slab_index_for_pbn(&self, pbn: Pbn) -> Option<usize> {
        self.slabs.iter().position(|slab| slab.contains_data_pbn(pbn))
    }

    pub fn slab_for_pbn_mut(&mut self, pbn: Pbn) -> Result<&mut Slab> {
        let index = self.slab_index_for_pbn(pbn).ok_or(KarstError::OutOfRange {
            kind: "pbn",
            value: pbn.0,
            limit: u64::MAX,
        })?;
        Ok(&mut self.slabs[index])
    }

    #[must_use]
    pub fn slab_for_pbn(&self, pbn: Pbn) -> Option<&Slab> {
        self.slab_index_for_pbn(pbn).map(|index| &self.slabs[index])
    }

    /// Allocation priority of a slab: unrecovered and full slabs sort
    /// last, emptier slabs first.
    fn slab_priority(slab: &Slab) -> u8 {
        if !slab.is_recovered() || slab.free_block_count() == 0 {
            return 0;
        }
        (64 - slab.free_block_count().leading_zeros()) as u8
    }

    /// Open the highest-priority slab for allocation.
    fn select_open_slab(&mut self) -> Option<usize> {
        for slab in &mut self.slabs {
            slab.priority = Self::slab_priority(slab);
        }
        let best = self
            .slabs
            .iter()
            .enumerate()
            .filter(|(_, slab)| slab.priority > 0)
            .max_by_key(|(_, slab)| (slab.priority, slab.free_block_count()))
            .map(|(index, _)| index)?;
        self.slabs[best].open();
        self.open_slab = Some(best);
        Some(best)
    }

    /// Allocate one physical block for `vio`.
    ///
    /// The search starts in the open slab at its cursor and rotates to the
    /// fullest-free slab on exhaustion. A successful allocation leaves the
    /// block provisionally referenced under a fresh exclusive PBN write
    /// lock held by `vio`.
    pub fn allocate_block(&mut self, vio: VioId) -> Result<Pbn> {
        self.allocate_with_kind(vio, PbnLockKind::UncompressedWrite)
    }

    /// Allocate the container block for a packed compressed batch.
    pub fn allocate_compressed_block(&mut self, vio: VioId) -> Result<Pbn> {
        self.allocate_with_kind(vio, PbnLockKind::CompressedWrite)
    }

    fn allocate_with_kind(&mut self, vio: VioId, kind: PbnLockKind) -> Result<Pbn> {
        let mut candidate = self.open_slab.or_else(|| self.select_open_slab());
        let mut rotations = 0;
        while let Some(index) = candidate {
            if self.slabs[index].is_recovered() {
                // Walk the slab cursor, skipping freed blocks a straggler
                // still holds a lock on. Bounded so lock-skipped blocks are
                // not revisited forever after the cursor wraps.
                let mut probes = self.slabs[index].ref_counts().data_blocks();
                while probes > 0
                    && let Some(sbn) = self.slabs[index].ref_counts_mut().allocate_provisional()
                {
                    probes -= 1;
                    let pbn = self.slabs[index].pbn_of(sbn);
                    if self.pbn_locks.acquire(pbn, kind, vio) != PbnLockOutcome::Acquired {
                        self.slabs[index].release_provisional(pbn)?;
                        continue;
                    }
                    let lock = self
                        .pbn_locks
                        .get_mut(pbn)
                        .ok_or_else(|| KarstError::Protocol("lock vanished".to_owned()))?;
                    lock.set_provisional_reference(true);
                    self.blocks_allocated += 1;
                    trace!(
                        target: "karst::depot::allocator",
                        event = "block_allocated",
                        zone = self.zone.0,
                        slab = self.slabs[index].slab_number,
                        pbn = pbn.0
                    );
                    return Ok(pbn);
                }
            }
            rotations += 1;
            if rotations > self.slabs.len() {
                break;
            }
            candidate = self.select_open_slab();
        }
        Err(KarstError::OutOfSpace)
    }
}

/// Monotonic depot counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DepotStats {
    pub blocks_allocated: u64,
    pub slabs: u64,
}

/// The slab depot.
#[derive(Debug)]
pub struct SlabDepot {
    config: SlabConfig,
    area: Partition,
    summary_partition: Partition,
    allocators: Vec<BlockAllocator>,
    slab_count: u64,
    /// Cross-zone approximation of free data blocks.
    free_blocks: AtomicU64,
}

impl SlabDepot {
    /// Build a depot over the slab area, striping slabs across
    /// `physical_zones` allocators.
    pub fn new(
        config: SlabConfig,
        area: Partition,
        summary_partition: Partition,
        physical_zones: u8,
    ) -> Result<Self> {
        if physical_zones == 0 {
            return Err(KarstError::Format("need at least one physical zone".to_owned()));
        }
        if area.count % config.slab_blocks != 0 {
            return Err(KarstError::Format(format!(
                "slab area of {} blocks is not a multiple of slab size {}",
                area.count, config.slab_blocks
            )));
        }
        let slab_count = area.count / config.slab_blocks;
        let mut allocators: Vec<BlockAllocator> = (0..physical_zones)
            .map(|zone| BlockAllocator::new(PhysicalZone(zone)))
            .collect();
        for number in 0..slab_count {
            let zone = (number % u64::from(physical_zones)) as usize;
            let origin = Pbn(area.start.0 + number * config.slab_blocks);
            allocators[zone].slabs.push(Slab::new(
                number as u32,
                PhysicalZone(zone as u8),
                origin,
                &config,
            ));
        }
        let free_blocks = slab_count * config.data_blocks;
        info!(
            target: "karst::depot",
            event = "depot_built",
            slabs = slab_count,
            zones = physical_zones,
            data_blocks = free_blocks
        );
        Ok(Self {
            config,
            area,
            summary_partition,
            allocators,
            slab_count,
            free_blocks: AtomicU64::new(free_blocks),
        })
    }

    #[must_use]
    pub fn slab_count(&self) -> u64 {
        self.slab_count
    }

    #[must_use]
    pub fn config(&self) -> &SlabConfig {
        &self.config
    }

    #[must_use]
    pub fn physical_zones(&self) -> u8 {
        self.allocators.len() as u8
    }

    /// Cheap cross-zone estimate of free data blocks.
    #[must_use]
    pub fn approximate_free_blocks(&self) -> u64 {
        self.free_blocks.load(Ordering::Relaxed)
    }

    pub fn note_allocated(&self) {
        self.free_blocks.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn note_freed(&self) {
        self.free_blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// The physical zone owning `pbn`'s slab.
    pub fn zone_for_pbn(&self, pbn: Pbn) -> Result<PhysicalZone> {
        let index = self.area.index_of(pbn).ok_or(KarstError::OutOfRange {
            kind: "pbn",
            value: pbn.0,
            limit: self.area.end().0,
        })?;
        let slab_number = index / self.config.slab_blocks;
        Ok(PhysicalZone(
            (slab_number % u64::from(self.physical_zones())) as u8,
        ))
    }

    #[must_use]
    pub fn allocator(&self, zone: PhysicalZone) -> &BlockAllocator {
        &self.allocators[usize::from(zone.0)]
    }

    pub fn allocator_mut(&mut self, zone: PhysicalZone) -> &mut BlockAllocator {
        &mut self.allocators[usize::from(zone.0)]
    }

    #[must_use]
    pub fn stats(&self) -> DepotStats {
        DepotStats {
            blocks_allocated: self.allocators.iter().map(|a| a.blocks_allocated).sum(),
            slabs: self.slab_count,
        }
    }

    /// Persist dirty refcount areas and the slab summary.
    pub fn flush(&mut self, cx: &Cx, dev: &dyn BlockDevice) -> Result<()> {
        let block_size = dev.block_size() as usize;
        let mut summary = vec![SlabSummaryEntry::default(); self.slab_count as usize];

        for allocator in &mut self.allocators {
            for slab in &mut allocator.slabs {
                summary[slab.slab_number as usize] = slab.summary_entry();
                if !slab.ref_counts().is_dirty() {
                    continue;
                }
                let blocks: Vec<BlockBuf> = slab
                    .ref_counts()
                    .pack(block_size)
                    .into_iter()
                    .map(|raw| BlockBuf::from_bytes(&raw))
                    .collect();
                write_extent(cx, dev, slab.ref_counts_origin(), &blocks)?;
                slab.ref_counts_mut().mark_clean();
                debug!(
                    target: "karst::depot",
                    event = "refcounts_flushed",
                    slab = slab.slab_number,
                    blocks = blocks.len()
                );
            }
        }

        // Pack the summary entries into the summary partition.
        let per_block = block_size / SLAB_SUMMARY_ENTRY_SIZE;
        let mut images: Vec<BlockBuf> = Vec::new();
        for chunk in summary.chunks(per_block) {
            let mut image = vec![0_u8; block_size];
            for (index, entry) in chunk.iter().enumerate() {
                let at = index * SLAB_SUMMARY_ENTRY_SIZE;
                image[at..at + SLAB_SUMMARY_ENTRY_SIZE].copy_from_slice(&entry.pack());
            }
            images.push(BlockBuf::from_bytes(&image));
        }
        let images = &images[..images.len().min(self.summary_partition.count as usize)];
        write_extent(cx, dev, self.summary_partition.start, images)?;
        Ok(())
    }

    /// Reload refcount state, using the summary to skip clean slabs.
    pub fn load(&mut self, cx: &Cx, dev: &dyn BlockDevice) -> Result<()> {
        let block_size = dev.block_size() as usize;
        let per_block = block_size / SLAB_SUMMARY_ENTRY_SIZE;

        let mut summary = Vec::with_capacity(self.slab_count as usize);
        'outer: for index in 0..self.summary_partition.count {
            let raw = dev.read_block(cx, self.summary_partition.pbn_at(index)?)?;
            for entry_index in 0..per_block {
                if summary.len() == self.slab_count as usize {
                    break 'outer;
                }
                let at = entry_index * SLAB_SUMMARY_ENTRY_SIZE;
                let raw_entry: [u8; SLAB_SUMMARY_ENTRY_SIZE] = raw.as_slice()
                    [at..at + SLAB_SUMMARY_ENTRY_SIZE]
                    .try_into()
                    .map_err(|_| KarstError::Format("summary entry truncated".to_owned()))?;
                summary.push(SlabSummaryEntry::unpack(raw_entry));
            }
        }

        let mut free_blocks = 0_u64;
        for allocator in &mut self.allocators {
            for slab in &mut allocator.slabs {
                let entry = summary
                    .get(slab.slab_number as usize)
                    .copied()
                    .unwrap_or_default();
                if entry.load_ref_counts {
                    let ref_blocks = slab_ref_blocks(&self.config);
                    let mut blocks = Vec::with_capacity(ref_blocks);
                    for offset in 0..ref_blocks {
                        let pbn = Pbn(slab.ref_counts_origin().0 + offset as u64);
                        blocks.push(dev.read_block(cx, pbn)?.as_slice().to_vec());
                    }
                    slab.ref_counts_mut().load(&blocks)?;
                }
                free_blocks += slab.free_block_count();
            }
        }
        self.free_blocks.store(free_blocks, Ordering::Relaxed);
        info!(
            target: "karst::depot",
            event = "depot_loaded",
            slabs = self.slab_count,
            free_blocks
        );
        Ok(())
    }
}

fn slab_ref_blocks(config: &SlabConfig) -> usize {
    config.ref_count_blocks as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_block::{ByteBlockDevice, MemoryByteDevice};

    const BLOCK_SIZE: u32 = 512;

    fn config() -> SlabConfig {
        SlabConfig {
            slab_blocks: 16,
            data_blocks: 13,
            ref_count_blocks: 1,
            slab_journal_blocks: 2,
        }
    }

    fn depot(zones: u8) -> SlabDepot {
        SlabDepot::new(
            config(),
            Partition {
                start: Pbn(32),
                count: 64,
            },
            Partition {
                start: Pbn(30),
                count: 2,
            },
            zones,
        )
        .expect("depot")
    }

    fn device() -> ByteBlockDevice<MemoryByteDevice> {
        ByteBlockDevice::new(
            MemoryByteDevice::new(256 * BLOCK_SIZE as usize),
            BLOCK_SIZE,
        )
        .expect("device")
    }

    #[test]
    fn slabs_stripe_across_zones() {
        let depot = depot(2);
        assert_eq!(depot.slab_count(), 4);
        assert_eq!(depot.allocator(PhysicalZone(0)).slabs().len(), 2);
        assert_eq!(depot.allocator(PhysicalZone(1)).slabs().len(), 2);
        // Slab 0 starts at the area origin, slab 1 one slab further.
        assert_eq!(depot.zone_for_pbn(Pbn(32)).expect("zone"), PhysicalZone(0));
        assert_eq!(depot.zone_for_pbn(Pbn(48)).expect("zone"), PhysicalZone(1));
        assert_eq!(depot.zone_for_pbn(Pbn(64)).expect("zone"), PhysicalZone(0));
        assert!(depot.zone_for_pbn(Pbn(31)).is_err());
    }

    #[test]
    fn allocate_takes_provisional_under_write_lock() {
        let mut depot = depot(1);
        let allocator = depot.allocator_mut(PhysicalZone(0));
        let pbn = allocator.allocate_block(VioId(0)).expect("allocated");
        let lock = allocator.pbn_locks.get(pbn).expect("lock held");
        assert!(lock.has_provisional_reference());
        let slab = allocator.slab_for_pbn(pbn).expect("slab");
        assert_eq!(
            slab.ref_counts().count(slab.slab_block_number(pbn).expect("sbn")),
            ref_counts::PROVISIONAL_REFERENCE
        );
    }

    #[test]
    fn allocator_rotates_to_next_slab_on_exhaustion() {
        let mut depot = depot(1);
        let allocator = depot.allocator_mut(PhysicalZone(0));
        let per_slab = config().data_blocks;
        let total = per_slab * 4;
        let mut seen = std::collections::HashSet::new();
        for i in 0..total {
            let pbn = allocator.allocate_block(VioId(i as u32)).expect("allocated");
            assert!(seen.insert(pbn), "pbn {pbn} handed out twice");
        }
        assert!(matches!(
            allocator.allocate_block(VioId(999)),
            Err(KarstError::OutOfSpace)
        ));
    }

    #[test]
    fn free_block_approximation_moves_with_notes() {
        let depot = depot(1);
        let initial = depot.approximate_free_blocks();
        depot.note_allocated();
        assert_eq!(depot.approximate_free_blocks(), initial - 1);
        depot.note_freed();
        assert_eq!(depot.approximate_free_blocks(), initial);
    }

    #[test]
    fn flush_and_load_roundtrip() {
        let cx = Cx::for_testing();
        let dev = device();
        let mut depot = depot(2);

        let pbn = {
            let allocator = depot.allocator_mut(PhysicalZone(0));
            let pbn = allocator.allocate_block(VioId(0)).expect("allocated");
            let point = karst_types::JournalPoint { sequence: 1, entry: 0 };
            allocator
                .slab_for_pbn_mut(pbn)
                .expect("slab")
                .commit_provisional(pbn, point)
                .expect("commit");
            pbn
        };
        depot.note_allocated();
        depot.flush(&cx, &dev).expect("flush");

        let mut restored = depot_with_same_shape();
        restored.load(&cx, &dev).expect("load");
        let slab = restored
            .allocator(PhysicalZone(0))
            .slab_for_pbn(pbn)
            .expect("slab");
        let sbn = slab.slab_block_number(pbn).expect("sbn");
        assert_eq!(slab.ref_counts().count(sbn), 1);
        assert_eq!(
            restored.approximate_free_blocks(),
            depot.approximate_free_blocks()
        );
    }

    fn depot_with_same_shape() -> SlabDepot {
        depot(2)
    }
}
