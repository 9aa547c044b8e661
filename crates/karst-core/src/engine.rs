//! The karst engine: the zoned data-VIO pipeline.
//!
//! The engine owns every zone's state and cranks the per-zone FIFO
//! queues in a fixed round-robin until idle. Each step handler runs
//! entirely on its owning zone: it reads the data-VIO, mutates that
//! zone's structures, and either enqueues the next step or leaves the
//! data-VIO parked on a lock or packer bin for a release path to wake.
//! When data-VIOs blocked in packer bins are the only remaining work,
//! the packer is flushed; that is the deterministic form of its flush
//! timeout.

use crate::bio::{Bio, BioFlags, BioId, BioOp, BioPiece, BioState};
use crate::config::EngineConfig;
use crate::data_vio::{RefUpdate, Step, VioOperation};
use crate::hash_lock::{HashLock, HashLockState, HashZoneState};
use crate::pool::VioPool;
use crate::stats::EngineStats;
use crate::zones::{WorkQueues, ZoneKey};
use asupersync::Cx;
use karst_block::BlockDevice;
use karst_dedup::AdviceIndex;
use karst_depot::{PbnLockKind, PbnLockOutcome, ShareOutcome, SlabDepot};
use karst_error::{KarstError, Result};
use karst_journal::RecoveryJournal;
use karst_map::BlockMap;
use karst_ondisk::compressed::fragment;
use karst_ondisk::journal::JournalEntry;
use karst_ondisk::layout::{Layout, SlabConfig, Superblock};
use karst_pack::{Packer, SealedBatch, compress_block, decompress_fragment};
use karst_types::{
    DataLocation, Lbn, MappingState, Pbn, PhysicalZone, SECTOR_SIZE, VioId, ZoneType,
};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Per-LBN serializer: one mutator at a time, FIFO waiters.
#[derive(Debug)]
struct LogicalLock {
    holder: VioId,
    waiters: VecDeque<VioId>,
}

#[derive(Debug, Default)]
struct LogicalZoneState {
    locks: HashMap<Lbn, LogicalLock>,
}

/// The engine.
pub struct Engine {
    dev: Arc<dyn BlockDevice>,
    config: EngineConfig,
    superblock: Superblock,
    pool: VioPool,
    queues: WorkQueues,
    bios: HashMap<BioId, BioState>,
    next_bio: u32,
    logical: Vec<LogicalZoneState>,
    hash: Vec<HashZoneState>,
    map: BlockMap,
    depot: SlabDepot,
    journal: RecoveryJournal,
    packer: Packer,
    pending_batches: HashMap<u8, VecDeque<SealedBatch>>,
    advice: Box<dyn AdviceIndex>,
    read_only: bool,
    next_alloc_zone: u8,
    flush_generation: u64,
    stats: EngineStats,
}

impl Engine {
    /// Format a fresh volume on `dev` and open the engine over it.
    pub fn format(
        cx: &Cx,
        dev: Arc<dyn BlockDevice>,
        config: EngineConfig,
        advice: Box<dyn AdviceIndex>,
    ) -> Result<Self> {
        config.validate()?;
        let block_size = config.block_size;
        let physical_blocks = dev.block_count();
        let layout = Layout::compute(
            block_size,
            physical_blocks,
            config.logical_blocks,
            config.logical_zones,
            config.journal_blocks,
            config.slab_blocks,
        )?;
        let superblock = Superblock {
            uuid: config.uuid,
            block_size,
            logical_blocks: config.logical_blocks,
            physical_blocks,
            logical_zones: config.logical_zones,
            physical_zones: config.physical_zones,
            hash_zones: config.hash_zones,
            slab_blocks: config.slab_blocks,
            layout,
        };
        dev.write_block(cx, Pbn(0), &superblock.pack())?;

        // Scrub the journal ring and summary so stale images never decode.
        let zero = vec![0_u8; block_size.as_usize()];
        for index in 0..layout.journal.count {
            dev.write_block(cx, layout.journal.pbn_at(index)?, &zero)?;
        }
        for index in 0..layout.slab_summary.count {
            dev.write_block(cx, layout.slab_summary.pbn_at(index)?, &zero)?;
        }
        dev.sync(cx)?;
        info!(
            target: "karst::core",
            event = "volume_formatted",
            physical_blocks,
            logical_blocks = config.logical_blocks,
            slabs = layout.slab_count
        );
        Self::assemble(dev, config, superblock, advice)
    }

    /// Open an engine over a previously formatted volume.
    pub fn open(
        cx: &Cx,
        dev: Arc<dyn BlockDevice>,
        mut config: EngineConfig,
        advice: Box<dyn AdviceIndex>,
    ) -> Result<Self> {
        let raw = dev.read_block(cx, Pbn(0))?;
        let superblock = Superblock::unpack(raw.as_slice())?;
        config.block_size = superblock.block_size;
        config.logical_blocks = superblock.logical_blocks;
        config.logical_zones = superblock.logical_zones;
        config.physical_zones = superblock.physical_zones;
        config.hash_zones = superblock.hash_zones;
        config.slab_blocks = superblock.slab_blocks;
        let mut engine = Self::assemble(dev, config, superblock, advice)?;
        engine.map.open(cx, engine.dev.as_ref())?;
        engine.depot.load(cx, engine.dev.as_ref())?;
        info!(
            target: "karst::core",
            event = "volume_opened",
            logical_blocks = engine.superblock.logical_blocks
        );
        Ok(engine)
    }

    fn assemble(
        dev: Arc<dyn BlockDevice>,
        config: EngineConfig,
        superblock: Superblock,
        advice: Box<dyn AdviceIndex>,
    ) -> Result<Self> {
        let block_size = superblock.block_size;
        let slab_config = SlabConfig::compute(superblock.slab_blocks, block_size)?;
        let map = BlockMap::new(
            superblock.layout.block_map,
            block_size.as_usize(),
            superblock.logical_zones,
            superblock.logical_blocks,
        )?;
        let depot = SlabDepot::new(
            slab_config,
            superblock.layout.slab_area,
            superblock.layout.slab_summary,
            superblock.physical_zones,
        )?;
        let journal = RecoveryJournal::new(
            superblock.layout.journal,
            block_size.as_usize(),
            usize::from(superblock.logical_zones),
            usize::from(superblock.physical_zones),
        )?;
        Ok(Self {
            pool: VioPool::new(config.pool_size, config.discard_limit, block_size),
            queues: WorkQueues::new(
                superblock.logical_zones,
                superblock.physical_zones,
                superblock.hash_zones,
            ),
            bios: HashMap::new(),
            next_bio: 0,
            logical: (0..superblock.logical_zones)
                .map(|_| LogicalZoneState::default())
                .collect(),
            hash: (0..superblock.hash_zones)
                .map(|_| HashZoneState::new())
                .collect(),
            map,
            depot,
            journal,
            packer: Packer::new(block_size.as_usize()),
            pending_batches: HashMap::new(),
            advice,
            read_only: false,
            next_alloc_zone: 0,
            flush_generation: 0,
            stats: EngineStats::default(),
            dev,
            config,
            superblock,
        })
    }

    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub fn approximate_free_blocks(&self) -> u64 {
        self.depot.approximate_free_blocks()
    }

    /// Reference count of a data PBN, for invariant checks and tooling.
    pub fn reference_count(&self, pbn: Pbn) -> Result<u8> {
        let zone = self.depot.zone_for_pbn(pbn)?;
        let slab = self
            .depot
            .allocator(zone)
            .slab_for_pbn(pbn)
            .ok_or(KarstError::OutOfRange {
                kind: "pbn",
                value: pbn.0,
                limit: u64::MAX,
            })?;
        Ok(slab.ref_counts().count(slab.slab_block_number(pbn)?))
    }

    /// The current mapping of a logical block, for tests and tooling.
    pub fn mapping_of(&mut self, cx: &Cx, lbn: Lbn) -> Result<DataLocation> {
        self.map.get_mapped(cx, self.dev.as_ref(), lbn)
    }

    fn latch_read_only(&mut self, err: &KarstError) {
        if err.latches_read_only() && !self.read_only {
            error!(
                target: "karst::core",
                event = "read_only_latched",
                error = %err
            );
            self.read_only = true;
            self.stats.read_only_entries += 1;
        }
    }

    // ── Bio boundary ───────────────────────────────────────────────────

    /// Submit an upstream request, launching its data-VIOs. Admission
    /// blocks cooperatively: the scheduler is cranked until permits free.
    pub fn submit(&mut self, cx: &Cx, bio: Bio) -> Result<BioId> {
        cx.checkpoint().map_err(|_| KarstError::Cancelled)?;
        if matches!(bio.op, BioOp::Write | BioOp::Discard) && self.read_only {
            return Err(KarstError::ReadOnly);
        }
        self.validate_range(&bio)?;

        let id = BioId(self.next_bio);
        self.next_bio = self.next_bio.wrapping_add(1);
        self.stats.bios += 1;

        if bio.flags.preflush {
            self.do_flush(cx)?;
        }

        match bio.op {
            BioOp::Flush => {
                self.run_until_idle(cx)?;
                self.do_flush(cx)?;
                let mut state = BioState::new(bio.op, bio.flags, 0);
                state.completed = true;
                self.bios.insert(id, state);
            }
            BioOp::Read => {
                self.stats.reads += 1;
                let pieces = bio.block_pieces(self.config.block_size);
                self.bios.insert(id, BioState::new(bio.op, bio.flags, bio.len));
                self.launch_pieces(cx, id, BioOp::Read, bio.flags, &pieces)?;
            }
            BioOp::Write => {
                self.stats.writes += 1;
                let pieces = bio.block_pieces(self.config.block_size);
                // The payload must be staged before any piece launches:
                // admission can crank the scheduler into the overlay step.
                let mut state = BioState::new(bio.op, bio.flags, 0);
                state.payload = bio.data;
                self.bios.insert(id, state);
                self.launch_pieces(cx, id, BioOp::Write, bio.flags, &pieces)?;
            }
            BioOp::Discard => {
                self.stats.discards += 1;
                self.bios.insert(id, BioState::new(bio.op, bio.flags, 0));
                if bio.len == 0 {
                    if let Some(state) = self.bios.get_mut(&id) {
                        state.completed = true;
                    }
                } else {
                    self.launch_discard(cx, id, &bio)?;
                }
            }
        }
        Ok(id)
    }

    fn validate_range(&self, bio: &Bio) -> Result<()> {
        if matches!(bio.op, BioOp::Flush) {
            return Ok(());
        }
        let start = bio.sector * u64::from(SECTOR_SIZE);
        let end = start
            .checked_add(bio.len as u64)
            .ok_or_else(|| KarstError::Format("bio length overflow".to_owned()))?;
        let limit = self.superblock.logical_blocks * u64::from(self.config.block_size.get());
        if end > limit {
            return Err(KarstError::OutOfRange {
                kind: "sector",
                value: end / u64::from(SECTOR_SIZE),
                limit: limit / u64::from(SECTOR_SIZE),
            });
        }
        Ok(())
    }

    fn launch_discard(&mut self, cx: &Cx, bio_id: BioId, bio: &Bio) -> Result<()> {
        // One walking data-VIO covers the whole discard.
        let pieces = bio.block_pieces(self.config.block_size);
        let Some(first) = pieces.first().copied() else {
            if let Some(state) = self.bios.get_mut(&bio_id) {
                state.completed = true;
            }
            return Ok(());
        };
        let vio_id = self.admit(cx, true)?;
        if let Some(state) = self.bios.get_mut(&bio_id) {
            state.pending += 1;
        }
        let block_size = self.config.block_size.as_usize();
        let logical_zone = self.map.zone_for_lbn(first.lbn);
        let alloc_zone = self.pick_allocation_zone();
        let generation = self.flush_generation;
        let flags = bio.flags;
        let total = bio.len;
        let vio = self.pool.vio_mut(vio_id);
        vio.bio = Some(bio_id);
        vio.op = VioOperation::Discard;
        vio.lbn = first.lbn;
        vio.offset = first.offset;
        vio.len = first.len;
        vio.payload_offset = 0;
        vio.remaining_discard = total;
        vio.is_trim = first.len == block_size;
        vio.flush_after = flags.fua || flags.sync;
        vio.logical_zone = logical_zone;
        vio.allocation_zone = alloc_zone;
        vio.flush_generation = generation;
        // Discards must never stall in the packer: the bio cannot be
        // acknowledged until the walk finishes.
        vio.compression_status.cancel();
        self.enqueue(vio_id, Step::FindBlockMapSlot);
        Ok(())
    }

    fn launch_pieces(
        &mut self,
        cx: &Cx,
        bio_id: BioId,
        op: BioOp,
        flags: BioFlags,
        pieces: &[BioPiece],
    ) -> Result<()> {
        if pieces.is_empty() {
            if let Some(state) = self.bios.get_mut(&bio_id) {
                state.completed = true;
            }
            return Ok(());
        }
        let block_size = self.config.block_size.as_usize();
        for piece in pieces {
            let vio_id = self.admit(cx, false)?;
            if let Some(state) = self.bios.get_mut(&bio_id) {
                state.pending += 1;
            }
            let logical_zone = self.map.zone_for_lbn(piece.lbn);
            let alloc_zone = self.pick_allocation_zone();
            let generation = self.flush_generation;
            {
                let vio = self.pool.vio_mut(vio_id);
                vio.bio = Some(bio_id);
                vio.lbn = piece.lbn;
                vio.offset = piece.offset;
                vio.len = piece.len;
                vio.payload_offset = piece.payload_offset;
                vio.logical_zone = logical_zone;
                vio.allocation_zone = alloc_zone;
                vio.flush_generation = generation;
            }
            match op {
                BioOp::Read => {
                    self.pool.vio_mut(vio_id).op = VioOperation::Read;
                }
                BioOp::Write => {
                    let state = self.bios.get(&bio_id).ok_or_else(|| {
                        KarstError::Protocol("write bio lost its payload".to_owned())
                    })?;
                    let vio = self.pool.vio_mut(vio_id);
                    vio.op = VioOperation::Write;
                    vio.flush_after = flags.fua || flags.sync;
                    if piece.len == block_size {
                        vio.data.copy_from_slice(
                            &state.payload
                                [piece.payload_offset..piece.payload_offset + piece.len],
                        );
                        vio.is_zero_block = is_all_zero(&vio.data);
                    }
                    // Partial payloads stay staged in the bio state until
                    // the overlay step.
                }
                BioOp::Discard | BioOp::Flush => {
                    return Err(KarstError::Protocol(
                        "discard/flush routed to piecewise launch".to_owned(),
                    ));
                }
            }
            self.enqueue(vio_id, Step::FindBlockMapSlot);
        }
        Ok(())
    }

    /// Take a data-VIO, cranking the scheduler until admission succeeds.
    fn admit(&mut self, cx: &Cx, discard: bool) -> Result<VioId> {
        loop {
            if let Some(id) = self.pool.acquire(discard) {
                return Ok(id);
            }
            if !self.queues.is_idle() {
                self.crank(cx);
                continue;
            }
            if self.packer.has_pending() {
                self.flush_packer()?;
                continue;
            }
            return Err(KarstError::Protocol(
                "request pool exhausted with no work in flight".to_owned(),
            ));
        }
    }

    fn pick_allocation_zone(&mut self) -> PhysicalZone {
        let zone = PhysicalZone(self.next_alloc_zone);
        self.next_alloc_zone = (self.next_alloc_zone + 1) % self.superblock.physical_zones;
        zone
    }

    /// Run the zoned scheduler until every queue is empty and no
    /// data-VIO is parked in the packer.
    pub fn run_until_idle(&mut self, cx: &Cx) -> Result<()> {
        loop {
            self.crank(cx);
            if self.packer.has_pending() {
                self.flush_packer()?;
                continue;
            }
            if self.queues.is_idle() {
                return Ok(());
            }
        }
    }

    fn crank(&mut self, cx: &Cx) {
        while let Some((_, item)) = self.queues.pop_next() {
            self.dispatch(cx, item.vio, item.step);
        }
    }

    /// Take the completed result for a bio. For reads, the assembled
    /// data comes back with it.
    pub fn take_result(&mut self, id: BioId) -> Result<Vec<u8>> {
        let state = self
            .bios
            .remove(&id)
            .ok_or_else(|| KarstError::Protocol(format!("unknown bio {}", id.0)))?;
        if !state.completed {
            self.bios.insert(id, state);
            return Err(KarstError::Protocol(format!("bio {} still in flight", id.0)));
        }
        match state.result {
            Some(err) => Err(err),
            None => Ok(state.buffer),
        }
    }

    // ── Convenience block API ──────────────────────────────────────────

    /// Write whole blocks starting at `lbn` and wait for completion.
    pub fn write_blocks(&mut self, cx: &Cx, lbn: Lbn, data: &[u8]) -> Result<()> {
        let sectors = u64::from(self.config.block_size.sectors_per_block());
        let bio = Bio::write(lbn.0 * sectors, data.to_vec());
        let id = self.submit(cx, bio)?;
        self.run_until_idle(cx)?;
        self.take_result(id).map(|_| ())
    }

    /// Read `count` whole blocks starting at `lbn`.
    pub fn read_blocks(&mut self, cx: &Cx, lbn: Lbn, count: u64) -> Result<Vec<u8>> {
        let sectors = u64::from(self.config.block_size.sectors_per_block());
        let len = (count * u64::from(self.config.block_size.get())) as usize;
        let bio = Bio::read(lbn.0 * sectors, len);
        let id = self.submit(cx, bio)?;
        self.run_until_idle(cx)?;
        self.take_result(id)
    }

    /// Discard `count` whole blocks starting at `lbn`.
    pub fn discard_blocks(&mut self, cx: &Cx, lbn: Lbn, count: u64) -> Result<()> {
        let sectors = u64::from(self.config.block_size.sectors_per_block());
        let len = (count * u64::from(self.config.block_size.get())) as usize;
        let bio = Bio::discard(lbn.0 * sectors, len);
        let id = self.submit(cx, bio)?;
        self.run_until_idle(cx)?;
        self.take_result(id).map(|_| ())
    }

    /// Drain in-flight work, then flush all metadata and the device.
    pub fn flush(&mut self, cx: &Cx) -> Result<()> {
        self.run_until_idle(cx)?;
        self.do_flush(cx)
    }

    fn do_flush(&mut self, cx: &Cx) -> Result<()> {
        self.flush_generation += 1;

        match self.journal.flush(cx, self.dev.as_ref()) {
            Ok(notified) => self.after_lock_release(notified),
            Err(err) => {
                self.latch_read_only(&err);
                return Err(err);
            }
        }

        let released = match self.map.flush(cx, self.dev.as_ref()) {
            Ok(released) => released,
            Err(err) => {
                self.latch_read_only(&err);
                return Err(err);
            }
        };
        for pin in released {
            let lock = self.journal.lock_index(pin.sequence);
            let notified = self.journal.lock_counter_mut().release(
                lock,
                ZoneType::Logical,
                usize::from(pin.zone.0),
            );
            self.after_lock_release(notified);
        }

        if let Err(err) = self.depot.flush(cx, self.dev.as_ref()) {
            self.latch_read_only(&err);
            return Err(err);
        }
        self.release_slab_journal_pins();

        self.journal.reap();
        self.dev.sync(cx)?;
        trace!(
            target: "karst::core",
            event = "flush_complete",
            generation = self.flush_generation
        );
        Ok(())
    }

    /// Handle a lock-counter notification edge: reap, then re-arm.
    fn after_lock_release(&mut self, notified: bool) {
        if notified {
            self.journal.reap();
            self.journal.lock_counter().acknowledge_unlock();
        }
    }

    fn release_slab_journal_pins(&mut self) {
        let mut pins: Vec<(PhysicalZone, u64, u32)> = Vec::new();
        for zone in 0..self.superblock.physical_zones {
            let allocator = self.depot.allocator_mut(PhysicalZone(zone));
            for slab in allocator.slabs_mut() {
                for (sequence, count) in slab.journal.drain_recovery_locks() {
                    pins.push((PhysicalZone(zone), sequence, count));
                }
            }
        }
        for (zone, sequence, count) in pins {
            let lock = self.journal.lock_index(sequence);
            for _ in 0..count {
                let notified = self.journal.lock_counter_mut().release(
                    lock,
                    ZoneType::Physical,
                    usize::from(zone.0),
                );
                self.after_lock_release(notified);
            }
        }
    }

    // ── Scheduler plumbing ─────────────────────────────────────────────

    fn zone_for_step(&self, id: VioId, step: Step) -> ZoneKey {
        let vio = self.pool.vio(id);
        match step {
            Step::FindBlockMapSlot | Step::GetMapped | Step::UpdateBlockMap | Step::Cleanup => {
                ZoneKey::Logical(vio.logical_zone.0)
            }
            Step::ReadData | Step::DecrementOld => self.physical_zone_key(vio.mapped.pbn),
            Step::LockDuplicate | Step::VerifyRead | Step::ReleaseDuplicateLock => {
                self.physical_zone_key(vio.duplicate.pbn)
            }
            Step::IncrementRef => self.physical_zone_key(vio.new_mapped.pbn),
            Step::Allocate | Step::WriteData | Step::WriteBatch | Step::CleanupAllocation => {
                ZoneKey::Physical(vio.allocation_zone.0)
            }
            Step::UncompressRead
            | Step::ApplyPartialWrite
            | Step::HashData
            | Step::VerifyCompare
            | Step::Compress => ZoneKey::Cpu,
            Step::AcquireHashLock
            | Step::AgentQuery
            | Step::VerifyResult
            | Step::HashLockWritten
            | Step::ReleaseHashLock => ZoneKey::Hash(vio.hash_zone.0),
            Step::JournalEntry | Step::JournalFlushForAck => ZoneKey::Journal,
            Step::Pack => ZoneKey::Packer,
            Step::Acknowledge => ZoneKey::BioAck,
        }
    }

    fn physical_zone_key(&self, pbn: Pbn) -> ZoneKey {
        match self.depot.zone_for_pbn(pbn) {
            Ok(zone) => ZoneKey::Physical(zone.0),
            // Invalid targets still need a queue to fail on.
            Err(_) => ZoneKey::Physical(0),
        }
    }

    fn enqueue(&mut self, id: VioId, step: Step) {
        let zone = self.zone_for_step(id, step);
        self.queues.enqueue(zone, id, step);
    }

    fn dispatch(&mut self, cx: &Cx, id: VioId, step: Step) {
        trace!(
            target: "karst::core::steps",
            event = "dispatch",
            vio = id.0,
            step = ?step
        );
        match step {
            Step::FindBlockMapSlot => self.step_find_block_map_slot(id),
            Step::GetMapped => self.step_get_mapped(cx, id),
            Step::ReadData => self.step_read_data(cx, id),
            Step::UncompressRead => self.step_uncompress_read(id),
            Step::ApplyPartialWrite => self.step_apply_partial_write(id),
            Step::HashData => self.step_hash_data(id),
            Step::AcquireHashLock => self.step_acquire_hash_lock(id),
            Step::AgentQuery => self.step_agent_query(cx, id),
            Step::LockDuplicate => self.step_lock_duplicate(id),
            Step::VerifyRead => self.step_verify_read(cx, id),
            Step::VerifyCompare => self.step_verify_compare(id),
            Step::VerifyResult => self.step_verify_result(id),
            Step::Compress => self.step_compress(id),
            Step::Pack => self.step_pack(id),
            Step::WriteBatch => self.step_write_batch(cx, id),
            Step::Allocate => self.step_allocate(id),
            Step::WriteData => self.step_write_data(cx, id),
            Step::HashLockWritten => self.step_hash_lock_written(cx, id),
            Step::JournalEntry => self.step_journal_entry(cx, id),
            Step::IncrementRef => self.step_increment_ref(id),
            Step::DecrementOld => self.step_decrement_old(id),
            Step::UpdateBlockMap => self.step_update_block_map(cx, id),
            Step::JournalFlushForAck => self.step_journal_flush_for_ack(cx, id),
            Step::CleanupAllocation => self.step_cleanup_allocation(id),
            Step::ReleaseHashLock => self.step_release_hash_lock(id),
            Step::ReleaseDuplicateLock => self.step_release_duplicate_lock(id),
            Step::Acknowledge => self.step_acknowledge(id),
            Step::Cleanup => self.step_cleanup(id),
        }
    }

    /// Record a failure and route the data-VIO to resource teardown. If
    /// the data-VIO is a hash-lock agent, the lock is bypassed so its
    /// waiters write independently.
    fn fail_vio(&mut self, id: VioId, err: KarstError) {
        warn!(
            target: "karst::core",
            event = "vio_failed",
            vio = id.0,
            lbn = self.pool.vio(id).lbn.0,
            error = %err
        );
        self.bypass_hash_lock(id);
        self.pool.vio_mut(id).set_result(err);
        self.stats.vio_errors += 1;
        self.enqueue_completion(id);
    }

    fn enqueue_completion(&mut self, id: VioId) {
        let next = self.next_completion_step(id, None);
        self.enqueue(id, next);
    }

    /// The ordered completion chain: allocation teardown → hash lock
    /// release (→ duplicate lock release) → journal flush → acknowledge.
    fn next_completion_step(&self, id: VioId, after: Option<Step>) -> Step {
        let vio = self.pool.vio(id);
        let stage = match after {
            None | Some(Step::UpdateBlockMap) => 0,
            Some(Step::CleanupAllocation) => 1,
            Some(Step::ReleaseHashLock) | Some(Step::ReleaseDuplicateLock) => 2,
            Some(_) => 0,
        };
        if stage < 1 && vio.allocation.is_some() {
            return Step::CleanupAllocation;
        }
        if stage < 2 && vio.holds_hash_lock {
            return Step::ReleaseHashLock;
        }
        if vio.flush_after && !vio.has_error() {
            return Step::JournalFlushForAck;
        }
        Step::Acknowledge
    }

    // ── Logical zone steps ─────────────────────────────────────────────

    fn step_find_block_map_slot(&mut self, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        let lbn = self.pool.vio(id).lbn;
        let zone = usize::from(self.pool.vio(id).logical_zone.0);
        match self.logical[zone].locks.entry(lbn) {
            Entry::Vacant(slot) => {
                slot.insert(LogicalLock {
                    holder: id,
                    waiters: VecDeque::new(),
                });
                self.pool.vio_mut(id).holds_logical_lock = true;
                self.enqueue(id, Step::GetMapped);
            }
            Entry::Occupied(mut slot) => {
                trace!(
                    target: "karst::core::logical",
                    event = "logical_lock_wait",
                    vio = id.0,
                    lbn = lbn.0,
                    holder = slot.get().holder.0
                );
                slot.get_mut().waiters.push_back(id);
            }
        }
    }

    fn step_get_mapped(&mut self, cx: &Cx, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        let lbn = self.pool.vio(id).lbn;
        let mapped = match self.map.get_mapped(cx, self.dev.as_ref(), lbn) {
            Ok(mapped) => mapped,
            Err(err) => {
                self.latch_read_only(&err);
                self.fail_vio(id, err);
                return;
            }
        };
        let (op, is_partial, is_trim, is_zero_block) = {
            let vio = self.pool.vio_mut(id);
            vio.mapped = mapped;
            (vio.op, vio.is_partial(), vio.is_trim, vio.is_zero_block)
        };
        let readable = mapped.is_mapped() && !mapped.reads_as_zero();

        match op {
            VioOperation::Read => {
                if readable {
                    self.enqueue(id, Step::ReadData);
                } else {
                    self.pool.vio_mut(id).data.fill(0);
                    self.enqueue(id, Step::Acknowledge);
                }
            }
            VioOperation::Write | VioOperation::Discard => {
                if is_partial {
                    // Read-modify-write: fetch old content first.
                    if readable {
                        self.enqueue(id, Step::ReadData);
                    } else {
                        self.pool.vio_mut(id).data.fill(0);
                        self.enqueue(id, Step::ApplyPartialWrite);
                    }
                } else if is_trim {
                    self.enqueue(id, Step::JournalEntry);
                } else if is_zero_block {
                    self.stats.zero_elisions += 1;
                    self.enqueue(id, Step::JournalEntry);
                } else {
                    self.enqueue(id, Step::HashData);
                }
            }
        }
    }

    fn step_update_block_map(&mut self, cx: &Cx, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        let (lbn, new_mapped, zone, point) = {
            let vio = self.pool.vio(id);
            (vio.lbn, vio.new_mapped, vio.logical_zone, vio.journal_point)
        };
        let Some(point) = point else {
            self.fail_vio(
                id,
                KarstError::Protocol("block map update without journal entry".to_owned()),
            );
            return;
        };
        // Pin the journal block for this zone before dirtying the leaf;
        // the pin comes back from the map flush once the leaf is durable.
        let lock = self.journal.lock_index(point.sequence);
        self.journal
            .lock_counter_mut()
            .acquire(lock, ZoneType::Logical, usize::from(zone.0));

        if let Err(err) =
            self.map
                .put_mapped(cx, self.dev.as_ref(), lbn, new_mapped, point.sequence)
        {
            let notified = self.journal.lock_counter_mut().release(
                lock,
                ZoneType::Logical,
                usize::from(zone.0),
            );
            self.after_lock_release(notified);
            self.latch_read_only(&err);
            self.fail_vio(id, err);
            return;
        }
        self.stats.map_updates += 1;
        let next = self.next_completion_step(id, Some(Step::UpdateBlockMap));
        self.enqueue(id, next);
    }

    fn step_cleanup(&mut self, id: VioId) {
        let (lbn, zone, continuing) = {
            let vio = self.pool.vio(id);
            let continuing = vio.op == VioOperation::Discard
                && !vio.has_error()
                && vio.remaining_discard > vio.len;
            (vio.lbn, usize::from(vio.logical_zone.0), continuing)
        };

        // Release the logical lock and hand it to the next waiter.
        if self.pool.vio(id).holds_logical_lock {
            let next_holder = match self.logical[zone].locks.get_mut(&lbn) {
                Some(lock) => {
                    debug_assert_eq!(lock.holder, id);
                    lock.waiters.pop_front()
                }
                None => None,
            };
            match next_holder {
                Some(waiter) => {
                    if let Some(lock) = self.logical[zone].locks.get_mut(&lbn) {
                        lock.holder = waiter;
                    }
                    self.pool.vio_mut(waiter).holds_logical_lock = true;
                    self.enqueue(waiter, Step::GetMapped);
                }
                None => {
                    self.logical[zone].locks.remove(&lbn);
                }
            }
            self.pool.vio_mut(id).holds_logical_lock = false;
        }

        if continuing {
            let block_size = self.config.block_size.as_usize();
            {
                let vio = self.pool.vio_mut(id);
                vio.remaining_discard -= vio.len;
                vio.advance_discard_block(block_size);
                // Keep the packer off-limits for the rest of the walk.
                vio.compression_status.cancel();
            }
            let new_zone = self.map.zone_for_lbn(self.pool.vio(id).lbn);
            self.pool.vio_mut(id).logical_zone = new_zone;
            self.enqueue(id, Step::FindBlockMapSlot);
            return;
        }

        self.pool.release(id);
    }

    // ── Read path ──────────────────────────────────────────────────────

    fn step_read_data(&mut self, cx: &Cx, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        let mapped = self.pool.vio(id).mapped;
        self.stats.data_reads += 1;
        match self.dev.read_block(cx, mapped.pbn) {
            Ok(buf) => {
                let vio = self.pool.vio_mut(id);
                if mapped.state.is_compressed() {
                    vio.scratch.copy_from_slice(buf.as_slice());
                    self.enqueue(id, Step::UncompressRead);
                } else {
                    vio.data.copy_from_slice(buf.as_slice());
                    self.after_old_data_read(id);
                }
            }
            Err(err) => self.fail_vio(id, err),
        }
    }

    fn step_uncompress_read(&mut self, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        let mapped = self.pool.vio(id).mapped;
        let slot = mapped.state.slot().unwrap_or(0);
        let outcome = {
            let vio = self.pool.vio_mut(id);
            let (scratch, data) = (&vio.scratch, &mut vio.data);
            fragment(scratch, slot, mapped.pbn.0)
                .and_then(|piece| decompress_fragment(piece, data, mapped.pbn.0))
        };
        match outcome {
            Ok(()) => self.after_old_data_read(id),
            Err(err) => {
                self.stats.invalid_fragments += 1;
                self.fail_vio(id, err);
            }
        }
    }

    /// The old block content is in `data`; continue per operation.
    fn after_old_data_read(&mut self, id: VioId) {
        match self.pool.vio(id).op {
            VioOperation::Read => self.enqueue(id, Step::Acknowledge),
            VioOperation::Write | VioOperation::Discard => {
                self.enqueue(id, Step::ApplyPartialWrite);
            }
        }
    }

    // ── CPU zone steps ─────────────────────────────────────────────────

    fn step_apply_partial_write(&mut self, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        let (bio_id, op, offset, len, payload_offset) = {
            let vio = self.pool.vio(id);
            (vio.bio, vio.op, vio.offset, vio.len, vio.payload_offset)
        };
        match op {
            VioOperation::Discard => {
                let vio = self.pool.vio_mut(id);
                vio.data[offset..offset + len].fill(0);
            }
            _ => {
                let Some(state) = bio_id.and_then(|bio| self.bios.get(&bio)) else {
                    self.fail_vio(
                        id,
                        KarstError::Protocol("partial write lost its bio payload".to_owned()),
                    );
                    return;
                };
                let vio = self.pool.vio_mut(id);
                vio.data[offset..offset + len]
                    .copy_from_slice(&state.payload[payload_offset..payload_offset + len]);
            }
        }
        let is_zero_block = {
            let vio = self.pool.vio_mut(id);
            vio.is_zero_block = is_all_zero(&vio.data);
            vio.is_zero_block
        };
        if is_zero_block {
            self.stats.zero_elisions += 1;
            self.enqueue(id, Step::JournalEntry);
        } else {
            self.enqueue(id, Step::HashData);
        }
    }

    fn step_hash_data(&mut self, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        let zones = self.superblock.hash_zones;
        {
            let vio = self.pool.vio_mut(id);
            let name = karst_dedup::chunk_name(&vio.data);
            vio.chunk_name = Some(name);
            vio.hash_zone = name.hash_zone(zones);
        }
        self.enqueue(id, Step::AcquireHashLock);
    }

    fn step_compress(&mut self, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        let max_fragment = self.packer.max_fragment_size();
        let packable = {
            let vio = self.pool.vio_mut(id);
            let size = {
                let (data, scratch) = (&vio.data, &mut vio.scratch);
                compress_block(data, scratch)
            };
            vio.compression_size = size;
            if size <= max_fragment && vio.compression_status.may_pack() {
                true
            } else {
                vio.compression_status.set_done();
                false
            }
        };
        if packable {
            self.enqueue(id, Step::Pack);
        } else {
            self.enqueue(id, Step::Allocate);
        }
    }

    // ── Hash zone steps ────────────────────────────────────────────────

    fn step_acquire_hash_lock(&mut self, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        let Some(name) = self.pool.vio(id).chunk_name else {
            self.fail_vio(
                id,
                KarstError::Protocol("hash lock acquire without fingerprint".to_owned()),
            );
            return;
        };

        enum Arrival {
            Agent,
            Adopt(DataLocation),
            Bypass,
            Waiting,
        }
        let zone = usize::from(self.pool.vio(id).hash_zone.0);
        let arrival = match self.hash[zone].locks.entry(name) {
            Entry::Vacant(slot) => {
                slot.insert(HashLock::new(name, id));
                Arrival::Agent
            }
            Entry::Occupied(mut slot) => {
                let lock = slot.get_mut();
                lock.reference_count += 1;
                match lock.state {
                    HashLockState::Updating => {
                        Arrival::Adopt(lock.duplicate.unwrap_or(DataLocation::UNMAPPED))
                    }
                    HashLockState::Bypassing => Arrival::Bypass,
                    _ => {
                        lock.waiters.push_back(id);
                        Arrival::Waiting
                    }
                }
            }
        };

        self.pool.vio_mut(id).holds_hash_lock = true;
        match arrival {
            Arrival::Agent => self.enqueue(id, Step::AgentQuery),
            Arrival::Adopt(duplicate) => {
                // Late arrival inherits the decided location, no verify.
                self.adopt_duplicate(id, duplicate);
                self.enqueue(id, Step::JournalEntry);
            }
            Arrival::Bypass => self.start_write(id),
            Arrival::Waiting => {}
        }
    }

    /// Point a data-VIO at a decided shareable location.
    fn adopt_duplicate(&mut self, id: VioId, duplicate: DataLocation) {
        let vio = self.pool.vio_mut(id);
        vio.duplicate = duplicate;
        vio.is_duplicate = true;
        vio.ref_update = RefUpdate::Share;
    }

    fn step_agent_query(&mut self, cx: &Cx, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        let Some(name) = self.pool.vio(id).chunk_name else {
            self.fail_vio(
                id,
                KarstError::Protocol("agent query without fingerprint".to_owned()),
            );
            return;
        };
        let zone = usize::from(self.pool.vio(id).hash_zone.0);
        if let Some(lock) = self.hash[zone].locks.get_mut(&name) {
            lock.state = HashLockState::Querying;
        }

        self.stats.advice_queries += 1;
        let advice = match self.advice.query(cx, &name) {
            Ok(advice) => advice,
            Err(KarstError::Cancelled) => {
                self.fail_vio(id, KarstError::Cancelled);
                return;
            }
            // The time-bounded adapter already folds transport errors and
            // timeouts into "no advice"; treat stragglers the same way.
            Err(_) => None,
        };
        let candidate = advice.filter(|location| self.is_plausible_advice(*location));

        let Some(lock) = self.hash[zone].locks.get_mut(&name) else {
            return;
        };
        lock.had_advice = candidate.is_some();
        match candidate {
            Some(location) => {
                lock.state = HashLockState::Locking;
                lock.duplicate = Some(location);
                self.pool.vio_mut(id).duplicate = location;
                self.enqueue(id, Step::LockDuplicate);
            }
            None => {
                lock.state = HashLockState::Writing;
                self.start_write(id);
            }
        }
    }

    fn is_plausible_advice(&self, location: DataLocation) -> bool {
        if !location.is_mapped() || location.pbn.is_zero() {
            return false;
        }
        let Ok(zone) = self.depot.zone_for_pbn(location.pbn) else {
            return false;
        };
        self.depot
            .allocator(zone)
            .slab_for_pbn(location.pbn)
            .is_some()
    }

    fn step_verify_result(&mut self, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        let (name, matched, duplicate) = {
            let vio = self.pool.vio(id);
            (vio.chunk_name, vio.verified_match, vio.duplicate)
        };
        let Some(name) = name else {
            self.fail_vio(
                id,
                KarstError::Protocol("verify result without fingerprint".to_owned()),
            );
            return;
        };

        let zone = usize::from(self.pool.vio(id).hash_zone.0);
        self.hash[zone].verifies += 1;
        let waiters = {
            let Some(lock) = self.hash[zone].locks.get_mut(&name) else {
                return;
            };
            if matched {
                lock.state = HashLockState::Updating;
                lock.verified = true;
                lock.duplicate = Some(duplicate);
                lock.duplicate_lock = Some(duplicate.pbn);
                Some(lock.take_waiters())
            } else {
                lock.state = HashLockState::Writing;
                lock.duplicate = None;
                None
            }
        };

        match waiters {
            Some(waiters) => {
                self.stats.dedup_verified += 1;
                self.adopt_duplicate(id, duplicate);
                self.enqueue(id, Step::JournalEntry);
                for waiter in waiters {
                    self.adopt_duplicate(waiter, duplicate);
                    self.enqueue(waiter, Step::JournalEntry);
                }
            }
            None => {
                // Mismatch or unsharable candidate: drop the candidate
                // lock, then write fresh.
                self.hash[zone].verify_mismatches += 1;
                self.enqueue(id, Step::ReleaseDuplicateLock);
            }
        }
    }

    fn step_hash_lock_written(&mut self, cx: &Cx, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        let (name, new_mapped) = {
            let vio = self.pool.vio(id);
            (vio.chunk_name, vio.new_mapped)
        };
        let Some(name) = name else {
            self.enqueue(id, Step::JournalEntry);
            return;
        };

        let zone = usize::from(self.pool.vio(id).hash_zone.0);
        let decision = self.hash[zone].locks.get_mut(&name).map(|lock| {
            let had_advice = lock.had_advice;
            lock.state = HashLockState::Updating;
            lock.duplicate = Some(new_mapped);
            lock.verified = true;
            (lock.take_waiters(), had_advice)
        });
        let Some((waiters, had_advice)) = decision else {
            self.enqueue(id, Step::JournalEntry);
            return;
        };

        // Teach the index where this fingerprint now lives.
        let published = if had_advice {
            self.advice.update(cx, &name, new_mapped)
        } else {
            self.advice.post(cx, &name, new_mapped)
        };
        if let Err(err) = published {
            debug!(
                target: "karst::core::dedup",
                event = "advice_publish_failed",
                error = %err
            );
        }

        // The agent journals first: its reference commit must land before
        // any waiter's share observes the provisional count.
        self.enqueue(id, Step::JournalEntry);
        for waiter in waiters {
            self.adopt_duplicate(waiter, new_mapped);
            self.enqueue(waiter, Step::JournalEntry);
        }
    }

    fn step_release_hash_lock(&mut self, id: VioId) {
        let name = self.pool.vio(id).chunk_name;
        let zone = usize::from(self.pool.vio(id).hash_zone.0);
        let mut release_duplicate = None;
        let mut destroy = false;
        if let Some(name) = name {
            if let Some(lock) = self.hash[zone].locks.get_mut(&name) {
                lock.reference_count = lock.reference_count.saturating_sub(1);
                if lock.agent == Some(id) {
                    lock.agent = None;
                }
                if lock.reference_count == 0 {
                    lock.state = HashLockState::Unlocking;
                    release_duplicate = lock.duplicate_lock.take();
                    destroy = true;
                }
            }
            if destroy {
                self.hash[zone].locks.remove(&name);
            }
        }
        self.pool.vio_mut(id).holds_hash_lock = false;

        if let Some(pbn) = release_duplicate {
            // Ride this data-VIO to the candidate's zone to drop the lock.
            self.pool.vio_mut(id).duplicate = DataLocation::new(pbn, MappingState::Uncompressed);
            self.enqueue(id, Step::ReleaseDuplicateLock);
            return;
        }
        let next = self.next_completion_step(id, Some(Step::ReleaseHashLock));
        self.enqueue(id, next);
    }

    /// Abandon dedup for a fingerprint whose agent cannot finish: waiters
    /// become independent writers. No-op unless `id` is the agent.
    fn bypass_hash_lock(&mut self, id: VioId) {
        let Some(name) = self.pool.vio(id).chunk_name else {
            return;
        };
        let zone = usize::from(self.pool.vio(id).hash_zone.0);
        let waiters = {
            let Some(lock) = self.hash[zone].locks.get_mut(&name) else {
                return;
            };
            if lock.agent != Some(id) {
                return;
            }
            lock.state = HashLockState::Bypassing;
            lock.agent = None;
            lock.take_waiters()
        };
        self.stats.hash_lock_bypasses += 1;
        for waiter in waiters {
            self.start_write(waiter);
        }
    }

    // ── Dedup verify steps ─────────────────────────────────────────────

    fn step_lock_duplicate(&mut self, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        let duplicate = self.pool.vio(id).duplicate;
        let Ok(zone) = self.depot.zone_for_pbn(duplicate.pbn) else {
            // Advice went stale under us; fall back to a fresh write.
            self.demote_to_write(id);
            return;
        };
        let outcome =
            self.depot
                .allocator_mut(zone)
                .pbn_locks
                .acquire(duplicate.pbn, PbnLockKind::Read, id);
        match outcome {
            PbnLockOutcome::Acquired => {
                self.note_verifying(id);
                self.enqueue(id, Step::VerifyRead);
            }
            PbnLockOutcome::Queued => {
                trace!(
                    target: "karst::core::dedup",
                    event = "duplicate_lock_wait",
                    vio = id.0,
                    pbn = duplicate.pbn.0
                );
            }
        }
    }

    /// The candidate lock is held; the agent's hash lock is verifying.
    /// The state flip rides along with the lock grant.
    fn note_verifying(&mut self, id: VioId) {
        if let Some(name) = self.pool.vio(id).chunk_name {
            let zone = usize::from(self.pool.vio(id).hash_zone.0);
            if let Some(lock) = self.hash[zone].locks.get_mut(&name) {
                lock.state = HashLockState::Verifying;
            }
        }
    }

    fn step_verify_read(&mut self, cx: &Cx, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        let duplicate = self.pool.vio(id).duplicate;

        // Saturated or free candidates can never be shared; skip the read
        // and fall straight through to the fresh-write path.
        let sharable = self
            .depot
            .zone_for_pbn(duplicate.pbn)
            .ok()
            .and_then(|zone| {
                let slab = self.depot.allocator(zone).slab_for_pbn(duplicate.pbn)?;
                let sbn = slab.slab_block_number(duplicate.pbn).ok()?;
                Some(slab.ref_counts().count(sbn))
            })
            .is_some_and(|count| {
                count != karst_depot::ref_counts::EMPTY_REFERENCE
                    && count != karst_depot::ref_counts::PROVISIONAL_REFERENCE
                    && count != karst_depot::ref_counts::SATURATED_REFERENCE
            });
        if !sharable {
            self.pool.vio_mut(id).verified_match = false;
            self.enqueue(id, Step::VerifyResult);
            return;
        }

        match self.dev.read_block(cx, duplicate.pbn) {
            Ok(buf) => {
                let outcome = if duplicate.state.is_compressed() {
                    let slot = duplicate.state.slot().unwrap_or(0);
                    let vio = self.pool.vio_mut(id);
                    fragment(buf.as_slice(), slot, duplicate.pbn.0).and_then(|piece| {
                        decompress_fragment(piece, &mut vio.scratch, duplicate.pbn.0)
                    })
                } else {
                    self.pool
                        .vio_mut(id)
                        .scratch
                        .copy_from_slice(buf.as_slice());
                    Ok(())
                };
                match outcome {
                    Ok(()) => self.enqueue(id, Step::VerifyCompare),
                    Err(_) => {
                        // A malformed candidate is a mismatch, not an
                        // error: the write path falls back.
                        self.stats.invalid_fragments += 1;
                        self.pool.vio_mut(id).verified_match = false;
                        self.enqueue(id, Step::VerifyResult);
                    }
                }
            }
            Err(_) => {
                self.pool.vio_mut(id).verified_match = false;
                self.enqueue(id, Step::VerifyResult);
            }
        }
    }

    fn step_verify_compare(&mut self, id: VioId) {
        {
            let vio = self.pool.vio_mut(id);
            vio.verified_match = vio.scratch == vio.data;
        }
        self.enqueue(id, Step::VerifyResult);
    }

    fn step_release_duplicate_lock(&mut self, id: VioId) {
        let duplicate = self.pool.vio(id).duplicate;
        if let Ok(zone) = self.depot.zone_for_pbn(duplicate.pbn) {
            let granted = self
                .depot
                .allocator_mut(zone)
                .pbn_locks
                .release(duplicate.pbn);
            for waiter in granted {
                // Waiters on a candidate PBN are dedup agents resuming
                // their verification.
                self.note_verifying(waiter);
                self.enqueue(waiter, Step::VerifyRead);
            }
        }

        let vio = self.pool.vio(id);
        if !vio.has_error()
            && vio.holds_hash_lock
            && !vio.is_duplicate
            && vio.journal_point.is_none()
        {
            // Mismatch path: the agent continues with a fresh write.
            self.start_write(id);
        } else {
            let next = self.next_completion_step(id, Some(Step::ReleaseDuplicateLock));
            self.enqueue(id, next);
        }
    }

    /// Stale advice mid-verify: forget the candidate and write fresh.
    fn demote_to_write(&mut self, id: VioId) {
        if let Some(name) = self.pool.vio(id).chunk_name {
            let zone = usize::from(self.pool.vio(id).hash_zone.0);
            if let Some(lock) = self.hash[zone].locks.get_mut(&name) {
                lock.state = HashLockState::Writing;
                lock.duplicate = None;
            }
        }
        self.start_write(id);
    }

    // ── Write path ─────────────────────────────────────────────────────

    /// Enter the fresh-write path: compression when eligible, otherwise
    /// straight to allocation.
    fn start_write(&mut self, id: VioId) {
        let compress = self.config.compression
            && self.pool.vio(id).compression_status.may_compress();
        if compress {
            self.enqueue(id, Step::Compress);
        } else {
            self.enqueue(id, Step::Allocate);
        }
    }

    fn step_allocate(&mut self, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        let zone = self.pool.vio(id).allocation_zone;
        match self.depot.allocator_mut(zone).allocate_block(id) {
            Ok(pbn) => {
                {
                    let vio = self.pool.vio_mut(id);
                    vio.allocation = Some(pbn);
                    vio.ref_update = RefUpdate::CommitProvisional;
                }
                self.enqueue(id, Step::WriteData);
            }
            Err(KarstError::OutOfSpace) => {
                let zones = self.superblock.physical_zones;
                let attempts = {
                    let vio = self.pool.vio_mut(id);
                    vio.allocation_attempts += 1;
                    vio.allocation_attempts
                };
                if attempts >= zones {
                    self.stats.out_of_space += 1;
                    self.fail_vio(id, KarstError::OutOfSpace);
                    return;
                }
                self.pool.vio_mut(id).allocation_zone = PhysicalZone((zone.0 + 1) % zones);
                self.enqueue(id, Step::Allocate);
            }
            Err(err) => self.fail_vio(id, err),
        }
    }

    fn step_write_data(&mut self, cx: &Cx, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        let Some(pbn) = self.pool.vio(id).allocation else {
            self.fail_vio(
                id,
                KarstError::Protocol("data write without allocation".to_owned()),
            );
            return;
        };
        let outcome = {
            let vio = self.pool.vio(id);
            self.dev.write_block(cx, pbn, &vio.data)
        };
        if let Err(err) = outcome {
            self.fail_vio(id, err);
            return;
        }
        self.stats.data_writes += 1;
        {
            let vio = self.pool.vio_mut(id);
            vio.new_mapped = DataLocation::new(pbn, MappingState::Uncompressed);
            vio.compression_status.set_done();
        }
        if self.vio_is_hash_agent(id) {
            self.enqueue(id, Step::HashLockWritten);
        } else {
            self.enqueue(id, Step::JournalEntry);
        }
    }

    fn vio_is_hash_agent(&self, id: VioId) -> bool {
        let vio = self.pool.vio(id);
        let Some(name) = vio.chunk_name else {
            return false;
        };
        self.hash[usize::from(vio.hash_zone.0)]
            .locks
            .get(&name)
            .is_some_and(|lock| lock.agent == Some(id))
    }

    // ── Packer path ────────────────────────────────────────────────────

    fn step_pack(&mut self, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        if !self.pool.vio(id).compression_status.may_write_compressed() {
            // Canceled between the compressor and the packer.
            self.pool.vio_mut(id).compression_status.set_done();
            self.enqueue(id, Step::Allocate);
            return;
        }
        let size = self.pool.vio(id).compression_size;
        let sealed = {
            let vio = self.pool.vio(id);
            self.packer.add(id, &vio.scratch[..size])
        };
        match sealed {
            Ok(Some(batch)) => self.stage_batch(batch),
            Ok(None) => {}
            Err(err) => {
                self.pool.vio_mut(id).compression_status.set_done();
                self.fail_vio(id, err);
            }
        }
    }

    /// Route a sealed batch to a physical zone for allocation and write.
    fn stage_batch(&mut self, batch: SealedBatch) {
        let Some(&(agent, _)) = batch.participants.first() else {
            return;
        };
        let zone = self.pick_allocation_zone();
        self.pool.vio_mut(agent).allocation_zone = zone;
        self.pending_batches
            .entry(zone.0)
            .or_default()
            .push_back(batch);
        self.queues
            .enqueue(ZoneKey::Physical(zone.0), agent, Step::WriteBatch);
    }

    /// Seal every open bin; called when the packer is the only thing
    /// holding work.
    fn flush_packer(&mut self) -> Result<()> {
        let batches = self.packer.flush()?;
        for batch in batches {
            self.stage_batch(batch);
        }
        Ok(())
    }

    fn step_write_batch(&mut self, cx: &Cx, id: VioId) {
        let zone = self.pool.vio(id).allocation_zone;
        let Some(batch) = self
            .pending_batches
            .get_mut(&zone.0)
            .and_then(VecDeque::pop_front)
        else {
            return;
        };

        // Allocate the container block under a compressed-write lock.
        let pbn = match self.depot.allocator_mut(zone).allocate_compressed_block(id) {
            Ok(pbn) => pbn,
            Err(err) => {
                self.stats.out_of_space += 1;
                let recoverable = err.is_dedup_recoverable();
                for (vio_id, _) in batch.participants {
                    self.pool.vio_mut(vio_id).compression_status.set_done();
                    if recoverable {
                        // Fall back to independent uncompressed writes.
                        self.enqueue(vio_id, Step::Allocate);
                    } else {
                        self.fail_vio(
                            vio_id,
                            KarstError::Protocol(format!(
                                "compressed batch allocation failed: {err}"
                            )),
                        );
                    }
                }
                return;
            }
        };

        if let Err(err) = self.dev.write_block(cx, pbn, &batch.block) {
            self.release_batch_allocation(zone, pbn);
            let message = err.to_string();
            for (vio_id, _) in batch.participants {
                self.pool.vio_mut(vio_id).compression_status.set_done();
                self.fail_vio(vio_id, KarstError::Io(std::io::Error::other(message.clone())));
            }
            return;
        }
        self.stats.compressed_blocks += 1;

        for (index, (vio_id, slot)) in batch.participants.iter().enumerate() {
            {
                let location = DataLocation::new(pbn, MappingState::Compressed(*slot));
                let vio = self.pool.vio_mut(*vio_id);
                vio.new_mapped = location;
                vio.allocation_zone = zone;
                vio.compression_status.set_done();
                if index == 0 {
                    vio.allocation = Some(pbn);
                    vio.ref_update = RefUpdate::CommitProvisional;
                } else {
                    vio.ref_update = RefUpdate::Share;
                }
            }
            self.stats.compressed_fragments += 1;
            if self.vio_is_hash_agent(*vio_id) {
                self.enqueue(*vio_id, Step::HashLockWritten);
            } else {
                self.enqueue(*vio_id, Step::JournalEntry);
            }
        }
    }

    fn release_batch_allocation(&mut self, zone: PhysicalZone, pbn: Pbn) {
        let allocator = self.depot.allocator_mut(zone);
        if let Ok(slab) = allocator.slab_for_pbn_mut(pbn) {
            let _ = slab.release_provisional(pbn);
        }
        let _ = allocator.pbn_locks.release(pbn);
    }

    // ── Journal and reference steps ────────────────────────────────────

    fn step_journal_entry(&mut self, cx: &Cx, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        // Decide the final mapping for this block.
        {
            let vio = self.pool.vio_mut(id);
            if vio.is_trim {
                vio.new_mapped = DataLocation::UNMAPPED;
                vio.ref_update = RefUpdate::None;
            } else if vio.is_zero_block {
                vio.new_mapped = DataLocation::ZERO;
                vio.ref_update = RefUpdate::None;
            } else if vio.is_duplicate {
                vio.new_mapped = vio.duplicate;
                vio.ref_update = RefUpdate::Share;
            }
        }
        let (lbn, mapped, new_mapped) = {
            let vio = self.pool.vio(id);
            (vio.lbn, vio.mapped, vio.new_mapped)
        };
        if mapped == new_mapped {
            // Rewriting the identical mapping (repeated trim, repeated
            // zero write, dedup onto the current block): nothing changes.
            self.pool.vio_mut(id).ref_update = RefUpdate::None;
            let next = self.next_completion_step(id, Some(Step::UpdateBlockMap));
            self.enqueue(id, next);
            return;
        }

        let entry = JournalEntry {
            lbn,
            old: mapped,
            new: new_mapped,
        };
        let point = match self.journal.append(cx, self.dev.as_ref(), entry) {
            Ok(point) => point,
            Err(err) => {
                self.latch_read_only(&err);
                self.fail_vio(id, err);
                return;
            }
        };
        self.stats.journal_entries += 1;
        self.pool.vio_mut(id).journal_point = Some(point);

        let has_increment = self.pool.vio(id).ref_update != RefUpdate::None;
        let has_decrement = mapped.is_mapped() && !mapped.pbn.is_zero();
        if has_increment {
            self.enqueue(id, Step::IncrementRef);
        } else if has_decrement {
            self.enqueue(id, Step::DecrementOld);
        } else {
            self.enqueue(id, Step::UpdateBlockMap);
        }
    }

    fn step_increment_ref(&mut self, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        let (new_mapped, ref_update, point, mapped, is_duplicate) = {
            let vio = self.pool.vio(id);
            (
                vio.new_mapped,
                vio.ref_update,
                vio.journal_point,
                vio.mapped,
                vio.is_duplicate,
            )
        };
        let Some(point) = point else {
            self.fail_vio(
                id,
                KarstError::Protocol("reference update without journal entry".to_owned()),
            );
            return;
        };
        let zone = match self.depot.zone_for_pbn(new_mapped.pbn) {
            Ok(zone) => zone,
            Err(err) => {
                self.fail_vio(id, err);
                return;
            }
        };

        let outcome = {
            let allocator = self.depot.allocator_mut(zone);
            match allocator.slab_for_pbn_mut(new_mapped.pbn) {
                Ok(slab) => match ref_update {
                    RefUpdate::CommitProvisional => slab
                        .commit_provisional(new_mapped.pbn, point)
                        .map(|()| Some(ShareOutcome::Shared(1))),
                    RefUpdate::Share => slab.share_reference(new_mapped.pbn, point),
                    RefUpdate::None => Ok(None),
                },
                Err(err) => Err(err),
            }
        };

        match outcome {
            Ok(Some(ShareOutcome::Shared(_))) | Ok(None) => {
                if ref_update == RefUpdate::CommitProvisional {
                    self.pool.vio_mut(id).provisional_committed = true;
                    self.depot.note_allocated();
                } else if is_duplicate {
                    self.stats.dedup_shares += 1;
                }
                self.pin_journal_for_physical(point.sequence, zone);
            }
            Ok(Some(ShareOutcome::Saturated)) | Ok(Some(ShareOutcome::Free)) => {
                // The candidate stopped being sharable between verify and
                // here; write fresh instead. The stray intent record is
                // superseded by the entry the fresh write will add.
                self.stats.dedup_fallbacks += 1;
                {
                    let vio = self.pool.vio_mut(id);
                    vio.is_duplicate = false;
                    vio.journal_point = None;
                    vio.ref_update = RefUpdate::None;
                    vio.compression_status.cancel();
                }
                self.enqueue(id, Step::Allocate);
                return;
            }
            Err(err) => {
                self.latch_read_only(&err);
                self.fail_vio(id, err);
                return;
            }
        }

        if mapped.is_mapped() && !mapped.pbn.is_zero() {
            self.enqueue(id, Step::DecrementOld);
        } else {
            self.enqueue(id, Step::UpdateBlockMap);
        }
    }

    fn pin_journal_for_physical(&mut self, sequence: u64, zone: PhysicalZone) {
        let lock = self.journal.lock_index(sequence);
        self.journal
            .lock_counter_mut()
            .acquire(lock, ZoneType::Physical, usize::from(zone.0));
    }

    fn step_decrement_old(&mut self, id: VioId) {
        if self.pool.vio(id).has_error() {
            self.enqueue_completion(id);
            return;
        }
        let (mapped, point) = {
            let vio = self.pool.vio(id);
            (vio.mapped, vio.journal_point)
        };
        let Some(point) = point else {
            self.fail_vio(
                id,
                KarstError::Protocol("old-mapping decrement without journal entry".to_owned()),
            );
            return;
        };
        let zone = match self.depot.zone_for_pbn(mapped.pbn) {
            Ok(zone) => zone,
            Err(err) => {
                self.fail_vio(id, err);
                return;
            }
        };
        let outcome = {
            let allocator = self.depot.allocator_mut(zone);
            match allocator.slab_for_pbn_mut(mapped.pbn) {
                Ok(slab) => slab.decrement_reference(mapped.pbn, point),
                Err(err) => Err(err),
            }
        };
        match outcome {
            Ok(new_count) => {
                if new_count == Some(0) {
                    self.depot.note_freed();
                    self.stats.blocks_freed += 1;
                }
                // A sticky-saturated decrement journaled nothing, so there
                // is no slab-journal pin to mirror.
                if new_count != Some(karst_depot::ref_counts::SATURATED_REFERENCE) {
                    self.pin_journal_for_physical(point.sequence, zone);
                }
                self.enqueue(id, Step::UpdateBlockMap);
            }
            Err(err) => {
                self.latch_read_only(&err);
                self.fail_vio(id, err);
            }
        }
    }

    fn step_journal_flush_for_ack(&mut self, cx: &Cx, id: VioId) {
        match self.journal.flush(cx, self.dev.as_ref()) {
            Ok(notified) => {
                self.after_lock_release(notified);
                self.enqueue(id, Step::Acknowledge);
            }
            Err(err) => {
                self.latch_read_only(&err);
                self.fail_vio(id, err);
            }
        }
    }

    // ── Completion ─────────────────────────────────────────────────────

    /// Release the allocation's PBN lock, undoing the provisional hold if
    /// it never committed.
    fn step_cleanup_allocation(&mut self, id: VioId) {
        let (allocation, zone, committed) = {
            let vio = self.pool.vio(id);
            (vio.allocation, vio.allocation_zone, vio.provisional_committed)
        };
        if let Some(pbn) = allocation {
            let allocator = self.depot.allocator_mut(zone);
            if !committed
                && let Ok(slab) = allocator.slab_for_pbn_mut(pbn)
            {
                let _ = slab.release_provisional(pbn);
            }
            let granted = allocator.pbn_locks.release(pbn);
            for waiter in granted {
                // Only dedup agents ever queue on a data PBN.
                self.note_verifying(waiter);
                self.enqueue(waiter, Step::VerifyRead);
            }
            self.pool.vio_mut(id).allocation = None;
        }
        let next = self.next_completion_step(id, Some(Step::CleanupAllocation));
        self.enqueue(id, next);
    }

    fn step_acknowledge(&mut self, id: VioId) {
        let (bio_id, op, continuing) = {
            let vio = self.pool.vio(id);
            let continuing = vio.op == VioOperation::Discard
                && !vio.has_error()
                && vio.remaining_discard > vio.len;
            (vio.bio, vio.op, continuing)
        };

        if continuing {
            // More blocks to walk; the bio stays open.
            self.enqueue(id, Step::Cleanup);
            return;
        }

        if let Some(bio_id) = bio_id {
            // Reads deliver their bytes into the bio buffer.
            if op == VioOperation::Read && !self.pool.vio(id).has_error() {
                let (payload_offset, offset, len) = {
                    let vio = self.pool.vio(id);
                    (vio.payload_offset, vio.offset, vio.len)
                };
                if let Some(state) = self.bios.get_mut(&bio_id) {
                    let vio = self.pool.vio(id);
                    state.buffer[payload_offset..payload_offset + len]
                        .copy_from_slice(&vio.data[offset..offset + len]);
                }
            }
            let err = self.pool.vio_mut(id).result.take();
            if let Some(state) = self.bios.get_mut(&bio_id) {
                if let Some(err) = err {
                    state.record_error(err);
                }
                state.pending = state.pending.saturating_sub(1);
                if state.pending == 0 {
                    state.completed = true;
                    trace!(
                        target: "karst::core::bio",
                        event = "bio_completed",
                        bio = bio_id.0
                    );
                }
            }
        }
        self.enqueue(id, Step::Cleanup);
    }
}

fn is_all_zero(data: &[u8]) -> bool {
    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        if u64::from_ne_bytes(chunk.try_into().unwrap_or([0; 8])) != 0 {
            return false;
        }
    }
    chunks.remainder().iter().all(|b| *b == 0)
}
