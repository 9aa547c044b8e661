#![forbid(unsafe_code)]
//! End-to-end scenarios against an in-memory backing device.

use asupersync::Cx;
use karst_block::{BlockBuf, BlockDevice, ByteBlockDevice, MemoryByteDevice};
use karst_core::{Bio, BioFlags, Engine, EngineConfig};
use karst_dedup::{AdviceIndex, MemoryAdviceIndex, TimeBounded};
use karst_error::KarstError;
use karst_types::{Lbn, MappingState, Pbn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const BLOCK_SIZE: usize = 4096;
const DEVICE_BLOCKS: usize = 1024;

fn test_config() -> EngineConfig {
    EngineConfig {
        logical_blocks: 1024,
        logical_zones: 2,
        physical_zones: 2,
        hash_zones: 2,
        slab_blocks: 64,
        journal_blocks: 8,
        pool_size: 16,
        discard_limit: 4,
        ..EngineConfig::default()
    }
}

fn backing_device() -> Arc<dyn BlockDevice> {
    let inner = MemoryByteDevice::new(DEVICE_BLOCKS * BLOCK_SIZE);
    Arc::new(ByteBlockDevice::new(inner, BLOCK_SIZE as u32).expect("device"))
}

fn engine_on(dev: Arc<dyn BlockDevice>) -> (Cx, Engine) {
    let cx = Cx::for_testing();
    let engine = Engine::format(
        &cx,
        dev,
        test_config(),
        Box::new(MemoryAdviceIndex::new()),
    )
    .expect("format");
    (cx, engine)
}

fn engine() -> (Cx, Engine) {
    engine_on(backing_device())
}

/// A block that LZ cannot shrink.
fn incompressible_block(seed: u64) -> Vec<u8> {
    let mut data = vec![0_u8; BLOCK_SIZE];
    let mut state = seed | 1;
    for byte in &mut data {
        state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        *byte = (state >> 56) as u8;
    }
    data
}

#[test]
fn s1_write_then_read_roundtrip() {
    let (cx, mut engine) = engine();
    let data = incompressible_block(1);
    let free_before = engine.approximate_free_blocks();

    engine.write_blocks(&cx, Lbn(0), &data).expect("write");
    let back = engine.read_blocks(&cx, Lbn(0), 1).expect("read");
    assert_eq!(back, data);

    let mapping = engine.mapping_of(&cx, Lbn(0)).expect("mapping");
    assert_eq!(mapping.state, MappingState::Uncompressed);
    assert_eq!(engine.reference_count(mapping.pbn).expect("refcount"), 1);
    assert_eq!(engine.approximate_free_blocks(), free_before - 1);
}

#[test]
fn s2_identical_blocks_share_one_physical_block() {
    let (cx, mut engine) = engine();
    let data = incompressible_block(2);
    let free_before = engine.approximate_free_blocks();

    engine.write_blocks(&cx, Lbn(0), &data).expect("write 0");
    engine.write_blocks(&cx, Lbn(1), &data).expect("write 1");

    assert_eq!(engine.read_blocks(&cx, Lbn(0), 1).expect("read 0"), data);
    assert_eq!(engine.read_blocks(&cx, Lbn(1), 1).expect("read 1"), data);

    let first = engine.mapping_of(&cx, Lbn(0)).expect("mapping 0");
    let second = engine.mapping_of(&cx, Lbn(1)).expect("mapping 1");
    assert_eq!(first.pbn, second.pbn, "both LBNs share one physical block");
    assert_eq!(engine.reference_count(first.pbn).expect("refcount"), 2);
    assert_eq!(engine.approximate_free_blocks(), free_before - 1);
    assert_eq!(engine.stats().dedup_shares, 1);
}

#[test]
fn s3_zero_block_writes_allocate_nothing() {
    let (cx, mut engine) = engine();
    let free_before = engine.approximate_free_blocks();

    engine
        .write_blocks(&cx, Lbn(0), &vec![0_u8; BLOCK_SIZE])
        .expect("write zeros");

    let back = engine.read_blocks(&cx, Lbn(0), 1).expect("read");
    assert_eq!(back, vec![0_u8; BLOCK_SIZE]);
    let mapping = engine.mapping_of(&cx, Lbn(0)).expect("mapping");
    assert!(
        mapping.reads_as_zero(),
        "zero writes map to the zero sentinel, got {mapping}"
    );
    assert_eq!(engine.approximate_free_blocks(), free_before);
    assert_eq!(engine.stats().zero_elisions, 1);
}

#[test]
fn s4_overwrite_releases_previous_block() {
    let (cx, mut engine) = engine();
    let first = incompressible_block(41);
    let second = incompressible_block(42);

    engine.write_blocks(&cx, Lbn(0), &first).expect("first write");
    let first_pbn = engine.mapping_of(&cx, Lbn(0)).expect("mapping").pbn;

    engine.write_blocks(&cx, Lbn(0), &second).expect("second write");
    assert_eq!(engine.read_blocks(&cx, Lbn(0), 1).expect("read"), second);

    assert_eq!(
        engine.reference_count(first_pbn).expect("refcount"),
        0,
        "overwritten block returns to the free pool"
    );
    assert_eq!(engine.stats().blocks_freed, 1);
}

#[test]
fn s5_compressible_blocks_pack_into_one_block() {
    let (cx, mut engine) = engine();
    let blocks: Vec<Vec<u8>> = [b'A', b'B', b'C']
        .iter()
        .map(|byte| vec![*byte; BLOCK_SIZE])
        .collect();

    // Launch all three before running so they meet in the packer.
    let sectors = (BLOCK_SIZE / 512) as u64;
    let ids: Vec<_> = blocks
        .iter()
        .enumerate()
        .map(|(index, data)| {
            engine
                .submit(&cx, Bio::write(index as u64 * sectors, data.clone()))
                .expect("submit")
        })
        .collect();
    engine.run_until_idle(&cx).expect("run");
    for id in ids {
        engine.take_result(id).expect("write result");
    }

    let mappings: Vec<_> = (0..3)
        .map(|lbn| engine.mapping_of(&cx, Lbn(lbn)).expect("mapping"))
        .collect();
    let container = mappings[0].pbn;
    let mut slots = Vec::new();
    for mapping in &mappings {
        assert_eq!(mapping.pbn, container, "all three share one packed block");
        match mapping.state {
            MappingState::Compressed(slot) => slots.push(slot),
            state => panic!("expected a compressed mapping, got {state:?}"),
        }
    }
    slots.sort_unstable();
    slots.dedup();
    assert_eq!(slots.len(), 3, "each fragment has a distinct slot");

    for (lbn, data) in blocks.iter().enumerate() {
        let back = engine.read_blocks(&cx, Lbn(lbn as u64), 1).expect("read");
        assert_eq!(&back, data);
    }
    assert_eq!(engine.reference_count(container).expect("refcount"), 3);
    assert_eq!(engine.stats().compressed_blocks, 1);
    assert_eq!(engine.stats().compressed_fragments, 3);
}

#[test]
fn s6_discard_range_reads_back_zeros() {
    let (cx, mut engine) = engine();
    let mut pbns = Vec::new();
    for lbn in 0..5_u64 {
        engine
            .write_blocks(&cx, Lbn(lbn), &incompressible_block(100 + lbn))
            .expect("write");
        pbns.push(engine.mapping_of(&cx, Lbn(lbn)).expect("mapping").pbn);
    }

    engine.discard_blocks(&cx, Lbn(0), 5).expect("discard");

    for lbn in 0..5_u64 {
        let back = engine.read_blocks(&cx, Lbn(lbn), 1).expect("read");
        assert_eq!(back, vec![0_u8; BLOCK_SIZE], "lbn {lbn} reads zeros");
        let mapping = engine.mapping_of(&cx, Lbn(lbn)).expect("mapping");
        assert!(!mapping.is_mapped(), "lbn {lbn} is unmapped after discard");
    }
    for pbn in pbns {
        assert_eq!(engine.reference_count(pbn).expect("refcount"), 0);
    }
}

#[test]
fn trim_of_unmapped_blocks_is_a_noop() {
    let (cx, mut engine) = engine();
    engine.discard_blocks(&cx, Lbn(10), 3).expect("discard");
    assert_eq!(
        engine.read_blocks(&cx, Lbn(10), 3).expect("read"),
        vec![0_u8; 3 * BLOCK_SIZE]
    );
    assert_eq!(engine.stats().journal_entries, 0);
}

#[test]
fn partial_write_preserves_surrounding_bytes() {
    let (cx, mut engine) = engine();
    let base = incompressible_block(7);
    engine.write_blocks(&cx, Lbn(0), &base).expect("base write");

    // Overlay 1024 bytes at byte offset 512 (sector 1).
    let overlay = vec![0xEE_u8; 1024];
    let id = engine
        .submit(&cx, Bio::write(1, overlay.clone()))
        .expect("submit");
    engine.run_until_idle(&cx).expect("run");
    engine.take_result(id).expect("partial write");

    let back = engine.read_blocks(&cx, Lbn(0), 1).expect("read");
    assert_eq!(&back[..512], &base[..512], "prefix preserved");
    assert_eq!(&back[512..1536], &overlay[..], "overlay applied");
    assert_eq!(&back[1536..], &base[1536..], "suffix preserved");
}

#[test]
fn partial_discard_zeroes_only_its_range() {
    let (cx, mut engine) = engine();
    let first = incompressible_block(8);
    let second = incompressible_block(9);
    engine.write_blocks(&cx, Lbn(0), &first).expect("write 0");
    engine.write_blocks(&cx, Lbn(1), &second).expect("write 1");

    // Discard bytes 2048..6144: the tail of block 0, the head of block 1.
    let id = engine
        .submit(&cx, Bio::discard(4, 4096))
        .expect("submit");
    engine.run_until_idle(&cx).expect("run");
    engine.take_result(id).expect("discard");

    let back0 = engine.read_blocks(&cx, Lbn(0), 1).expect("read 0");
    assert_eq!(&back0[..2048], &first[..2048]);
    assert_eq!(&back0[2048..], &[0_u8; 2048][..]);

    let back1 = engine.read_blocks(&cx, Lbn(1), 1).expect("read 1");
    assert_eq!(&back1[..2048], &[0_u8; 2048][..]);
    assert_eq!(&back1[2048..], &second[2048..]);
}

#[test]
fn straddling_bio_roundtrip() {
    let (cx, mut engine) = engine();
    // One full block with a partial piece on each side, starting
    // mid-block at sector 7.
    let len = BLOCK_SIZE + 1024;
    let mut source = incompressible_block(10);
    source.extend_from_slice(&incompressible_block(20));
    let payload: Vec<u8> = source[..len].to_vec();
    let id = engine
        .submit(&cx, Bio::write(7, payload.clone()))
        .expect("submit");
    engine.run_until_idle(&cx).expect("run");
    engine.take_result(id).expect("write");

    let id = engine.submit(&cx, Bio::read(7, len)).expect("submit");
    engine.run_until_idle(&cx).expect("run");
    let back = engine.take_result(id).expect("read");
    assert_eq!(back, payload);
}

#[test]
fn concurrent_identical_writes_dedupe_through_the_hash_lock() {
    let (cx, mut engine) = engine();
    let data = incompressible_block(11);
    let sectors = (BLOCK_SIZE / 512) as u64;

    let first = engine
        .submit(&cx, Bio::write(0, data.clone()))
        .expect("submit 0");
    let second = engine
        .submit(&cx, Bio::write(sectors, data.clone()))
        .expect("submit 1");
    engine.run_until_idle(&cx).expect("run");
    engine.take_result(first).expect("write 0");
    engine.take_result(second).expect("write 1");

    let a = engine.mapping_of(&cx, Lbn(0)).expect("mapping 0");
    let b = engine.mapping_of(&cx, Lbn(1)).expect("mapping 1");
    assert_eq!(a.pbn, b.pbn);
    assert_eq!(engine.reference_count(a.pbn).expect("refcount"), 2);
    assert_eq!(engine.read_blocks(&cx, Lbn(0), 1).expect("read"), data);
    assert_eq!(engine.read_blocks(&cx, Lbn(1), 1).expect("read"), data);
}

#[test]
fn saturated_refcount_is_sticky_and_stops_dedup() {
    let (cx, mut engine) = engine();
    let data = incompressible_block(12);

    engine.write_blocks(&cx, Lbn(0), &data).expect("first write");
    let first_pbn = engine.mapping_of(&cx, Lbn(0)).expect("mapping").pbn;

    // 1 + 252 shares brings the count to 253; the next share latches 255.
    for lbn in 1..=253_u64 {
        engine.write_blocks(&cx, Lbn(lbn), &data).expect("share write");
    }
    assert_eq!(engine.reference_count(first_pbn).expect("refcount"), 255);

    // Saturated: later identical writes must allocate fresh blocks...
    engine.write_blocks(&cx, Lbn(254), &data).expect("post-saturation");
    let fresh = engine.mapping_of(&cx, Lbn(254)).expect("mapping");
    assert_ne!(fresh.pbn, first_pbn);
    assert_eq!(engine.read_blocks(&cx, Lbn(254), 1).expect("read"), data);

    // ...and the saturated count never moves, even on overwrite.
    engine
        .write_blocks(&cx, Lbn(0), &incompressible_block(13))
        .expect("overwrite");
    assert_eq!(engine.reference_count(first_pbn).expect("refcount"), 255);
}

#[test]
fn advice_timeout_falls_back_to_fresh_writes() {
    let cx = Cx::for_testing();
    let dev = backing_device();
    let advice: Box<dyn AdviceIndex> = Box::new(TimeBounded::new(
        MemoryAdviceIndex::new(),
        Duration::ZERO,
    ));
    let mut engine = Engine::format(&cx, dev, test_config(), advice).expect("format");

    let data = incompressible_block(14);
    engine.write_blocks(&cx, Lbn(0), &data).expect("write 0");
    engine.write_blocks(&cx, Lbn(1), &data).expect("write 1");

    let a = engine.mapping_of(&cx, Lbn(0)).expect("mapping 0");
    let b = engine.mapping_of(&cx, Lbn(1)).expect("mapping 1");
    assert_ne!(a.pbn, b.pbn, "no advice means no dedup");
    assert_eq!(engine.stats().dedup_shares, 0);
    assert_eq!(engine.read_blocks(&cx, Lbn(1), 1).expect("read"), data);
}

/// Backing device whose writes can be switched to fail.
#[derive(Debug)]
struct FailSwitchDevice {
    inner: ByteBlockDevice<MemoryByteDevice>,
    fail_writes: AtomicBool,
}

impl BlockDevice for FailSwitchDevice {
    fn read_block(&self, cx: &Cx, pbn: Pbn) -> Result<BlockBuf, KarstError> {
        self.inner.read_block(cx, pbn)
    }

    fn write_block(&self, cx: &Cx, pbn: Pbn, data: &[u8]) -> Result<(), KarstError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(KarstError::Io(std::io::Error::other("injected fault")));
        }
        self.inner.write_block(cx, pbn, data)
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self, cx: &Cx) -> Result<(), KarstError> {
        self.inner.sync(cx)
    }
}

#[test]
fn metadata_write_failure_latches_read_only() {
    let cx = Cx::for_testing();
    let dev = Arc::new(FailSwitchDevice {
        inner: ByteBlockDevice::new(
            MemoryByteDevice::new(DEVICE_BLOCKS * BLOCK_SIZE),
            BLOCK_SIZE as u32,
        )
        .expect("device"),
        fail_writes: AtomicBool::new(false),
    });
    let mut engine = Engine::format(
        &cx,
        Arc::clone(&dev) as Arc<dyn BlockDevice>,
        test_config(),
        Box::new(MemoryAdviceIndex::new()),
    )
    .expect("format");

    engine
        .write_blocks(&cx, Lbn(0), &incompressible_block(15))
        .expect("write");

    dev.fail_writes.store(true, Ordering::Release);
    let err = engine.flush(&cx).unwrap_err();
    assert!(matches!(err, KarstError::Io(_)));
    assert!(engine.is_read_only());

    // Writes fail fast; reads still work.
    let err = engine
        .write_blocks(&cx, Lbn(1), &incompressible_block(16))
        .unwrap_err();
    assert!(matches!(err, KarstError::ReadOnly));
    dev.fail_writes.store(false, Ordering::Release);
    assert_eq!(
        engine.read_blocks(&cx, Lbn(0), 1).expect("read"),
        incompressible_block(15)
    );
}

#[test]
fn flush_and_reopen_preserves_data_and_refcounts() {
    let cx = Cx::for_testing();
    let dev = backing_device();
    let data = incompressible_block(17);
    let shared_pbn;
    {
        let mut engine = Engine::format(
            &cx,
            Arc::clone(&dev),
            test_config(),
            Box::new(MemoryAdviceIndex::new()),
        )
        .expect("format");
        engine.write_blocks(&cx, Lbn(3), &data).expect("write");
        engine.write_blocks(&cx, Lbn(4), &data).expect("dedup write");
        shared_pbn = engine.mapping_of(&cx, Lbn(3)).expect("mapping").pbn;
        engine.flush(&cx).expect("flush");
    }

    let mut engine = Engine::open(
        &cx,
        dev,
        EngineConfig::default(),
        Box::new(MemoryAdviceIndex::new()),
    )
    .expect("open");
    assert_eq!(engine.read_blocks(&cx, Lbn(3), 1).expect("read"), data);
    assert_eq!(engine.read_blocks(&cx, Lbn(4), 1).expect("read"), data);
    assert_eq!(engine.reference_count(shared_pbn).expect("refcount"), 2);
}

#[test]
fn small_pool_admission_completes_large_bio() {
    let cx = Cx::for_testing();
    let dev = backing_device();
    let mut config = test_config();
    config.pool_size = 4;
    config.discard_limit = 2;
    let mut engine =
        Engine::format(&cx, dev, config, Box::new(MemoryAdviceIndex::new())).expect("format");

    // 16 blocks of distinct data through a 4-entry pool.
    let payload: Vec<u8> = (0..16_u64)
        .flat_map(|i| incompressible_block(200 + i))
        .collect();
    let id = engine
        .submit(&cx, Bio::write(0, payload.clone()))
        .expect("submit");
    engine.run_until_idle(&cx).expect("run");
    engine.take_result(id).expect("write");

    let id = engine
        .submit(&cx, Bio::read(0, payload.len()))
        .expect("submit");
    engine.run_until_idle(&cx).expect("run");
    assert_eq!(engine.take_result(id).expect("read"), payload);
}

#[test]
fn sync_write_flag_is_honored() {
    let (cx, mut engine) = engine();
    let data = incompressible_block(18);
    let bio = Bio::write(0, data.clone()).with_flags(BioFlags {
        sync: true,
        fua: true,
        preflush: false,
    });
    let id = engine.submit(&cx, bio).expect("submit");
    engine.run_until_idle(&cx).expect("run");
    engine.take_result(id).expect("write");
    assert_eq!(engine.read_blocks(&cx, Lbn(0), 1).expect("read"), data);
}

#[test]
fn out_of_range_bio_is_rejected() {
    let (cx, mut engine) = engine();
    let sectors_per_block = (BLOCK_SIZE / 512) as u64;
    let err = engine
        .submit(
            &cx,
            Bio::write(1024 * sectors_per_block, vec![1_u8; BLOCK_SIZE]),
        )
        .unwrap_err();
    assert!(matches!(err, KarstError::OutOfRange { .. }));
}
