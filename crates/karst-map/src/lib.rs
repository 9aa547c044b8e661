#![forbid(unsafe_code)]
//! The block map: LBN → (PBN, mapping state) indirection.
//!
//! A three-level tree per logical zone over a dedicated map partition:
//! one root page per zone at a fixed slot, interior pages of child
//! references, leaf pages of data locations. Leaf pages are striped
//! across logical zones by leaf index, so each zone mutates only its own
//! pages. Updates are journaled: the caller pins the recovery-journal
//! block before dirtying a leaf, the map remembers the pin, and `flush`
//! hands the drained pins back once the pages are durable.
//!
//! Tree pages are allocated from a bump cursor over the partition; the
//! cursor is the map's only cross-zone step and runs serialized on the
//! engine scheduler. The page cache is unbounded; cache eviction policy
//! belongs to the block-map I/O collaborator, not the data path.

use asupersync::Cx;
use karst_block::BlockDevice;
use karst_error::{KarstError, Result};
use karst_ondisk::layout::Partition;
use karst_ondisk::page::{MapPage, entries_per_page};
use karst_types::{DataLocation, Lbn, LogicalZone, MappingState, Pbn};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

/// A pin released by a flush: the journal sequence a logical zone was
/// holding for a now-durable page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasedPin {
    pub zone: LogicalZone,
    pub sequence: u64,
}

#[derive(Debug, Default)]
struct ZoneState {
    /// Loaded pages by partition index.
    cache: HashMap<u64, MapPage>,
    /// Dirty pages by partition index, with the journal sequences pinned
    /// on their behalf.
    dirty: BTreeMap<u64, Vec<u64>>,
}

/// The block map.
#[derive(Debug)]
pub struct BlockMap {
    partition: Partition,
    block_size: usize,
    entries_per_page: u64,
    logical_zones: u8,
    logical_blocks: u64,
    zones: Vec<ZoneState>,
    /// Bump cursor for fresh tree pages (roots occupy the first slots).
    next_free_page: u64,
}

/// Where an LBN lives in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TreeSlot {
    zone: u8,
    root_slot: u64,
    interior_slot: u64,
    leaf_slot: u64,
}

impl BlockMap {
    pub fn new(
        partition: Partition,
        block_size: usize,
        logical_zones: u8,
        logical_blocks: u64,
    ) -> Result<Self> {
        let epp = entries_per_page(block_size) as u64;
        let zones = logical_zones.max(1);
        let capacity = u64::from(zones)
            .saturating_mul(epp)
            .saturating_mul(epp)
            .saturating_mul(epp);
        if logical_blocks > capacity {
            return Err(KarstError::Format(format!(
                "logical space of {logical_blocks} blocks exceeds tree capacity {capacity}"
            )));
        }
        if partition.count < u64::from(zones) {
            return Err(KarstError::Format(
                "map partition smaller than its root pages".to_owned(),
            ));
        }
        Ok(Self {
            partition,
            block_size,
            entries_per_page: epp,
            logical_zones: zones,
            logical_blocks,
            zones: (0..zones).map(|_| ZoneState::default()).collect(),
            next_free_page: u64::from(zones),
        })
    }

    #[must_use]
    pub fn logical_blocks(&self) -> u64 {
        self.logical_blocks
    }

    /// The logical zone owning `lbn`'s leaf page.
    #[must_use]
    pub fn zone_for_lbn(&self, lbn: Lbn) -> LogicalZone {
        let leaf_index = lbn.0 / self.entries_per_page;
        LogicalZone((leaf_index % u64::from(self.logical_zones)) as u8)
    }

    fn slot_for(&self, lbn: Lbn) -> Result<TreeSlot> {
        if lbn.0 >= self.logical_blocks {
            return Err(KarstError::OutOfRange {
                kind: "lbn",
                value: lbn.0,
                limit: self.logical_blocks,
            });
        }
        let epp = self.entries_per_page;
        let leaf_index = lbn.0 / epp;
        let zone = (leaf_index % u64::from(self.logical_zones)) as u8;
        let zone_leaf_ordinal = leaf_index / u64::from(self.logical_zones);
        Ok(TreeSlot {
            zone,
            root_slot: zone_leaf_ordinal / epp,
            interior_slot: zone_leaf_ordinal % epp,
            leaf_slot: lbn.0 % epp,
        })
    }

    fn root_index(&self, zone: u8) -> u64 {
        u64::from(zone)
    }

    /// Load a page into its zone's cache if absent, returning its index.
    fn ensure_loaded(
        &mut self,
        cx: &Cx,
        dev: &dyn BlockDevice,
        zone: u8,
        page_index: u64,
    ) -> Result<()> {
        if self.zones[usize::from(zone)].cache.contains_key(&page_index) {
            return Ok(());
        }
        let pbn = self.partition.pbn_at(page_index)?;
        let raw = dev.read_block(cx, pbn)?;
        let page = MapPage::unpack(raw.as_slice(), page_index)?;
        trace!(
            target: "karst::map",
            event = "page_loaded",
            zone,
            page_index
        );
        self.zones[usize::from(zone)].cache.insert(page_index, page);
        Ok(())
    }

    fn page_entry(&self, zone: u8, page_index: u64, slot: u64) -> DataLocation {
        self.zones[usize::from(zone)]
            .cache
            .get(&page_index)
            .map_or(DataLocation::UNMAPPED, |page| {
                page.entries[slot as usize]
            })
    }

    /// Look up the data location for `lbn`.
    pub fn get_mapped(&mut self, cx: &Cx, dev: &dyn BlockDevice, lbn: Lbn) -> Result<DataLocation> {
        let slot = self.slot_for(lbn)?;
        let root_index = self.root_index(slot.zone);
        self.ensure_loaded(cx, dev, slot.zone, root_index)?;

        let interior_ref = self.page_entry(slot.zone, root_index, slot.root_slot);
        if !interior_ref.is_mapped() {
            return Ok(DataLocation::UNMAPPED);
        }
        let interior_index = self.child_index(interior_ref)?;
        self.ensure_loaded(cx, dev, slot.zone, interior_index)?;

        let leaf_ref = self.page_entry(slot.zone, interior_index, slot.interior_slot);
        if !leaf_ref.is_mapped() {
            return Ok(DataLocation::UNMAPPED);
        }
        let leaf_index = self.child_index(leaf_ref)?;
        self.ensure_loaded(cx, dev, slot.zone, leaf_index)?;

        let location = self.page_entry(slot.zone, leaf_index, slot.leaf_slot);
        if !location.is_valid() {
            return Err(KarstError::Unrecoverable(format!(
                "block map entry for {lbn} is invalid: {location}"
            )));
        }
        Ok(location)
    }

    fn child_index(&self, child: DataLocation) -> Result<u64> {
        self.partition
            .index_of(child.pbn)
            .ok_or_else(|| KarstError::Unrecoverable(format!(
                "tree page reference {} outside map partition",
                child.pbn
            )))
    }

    /// Allocate a fresh tree page in `zone`'s cache.
    fn allocate_page(&mut self, zone: u8) -> Result<u64> {
        if self.next_free_page >= self.partition.count {
            return Err(KarstError::OutOfSpace);
        }
        let page_index = self.next_free_page;
        self.next_free_page += 1;
        let page = MapPage::empty(page_index, self.block_size);
        let state = &mut self.zones[usize::from(zone)];
        state.cache.insert(page_index, page);
        state.dirty.entry(page_index).or_default();
        debug!(
            target: "karst::map",
            event = "tree_page_allocated",
            zone,
            page_index
        );
        Ok(page_index)
    }

    fn set_entry(&mut self, zone: u8, page_index: u64, slot: u64, value: DataLocation) {
        let state = &mut self.zones[usize::from(zone)];
        if let Some(page) = state.cache.get_mut(&page_index) {
            page.entries[slot as usize] = value;
            state.dirty.entry(page_index).or_default();
        }
    }

    /// Record a new mapping for `lbn`, growing the tree as needed.
    ///
    /// `sequence` is the recovery-journal block holding the intent record;
    /// the caller has already pinned it for this logical zone, and the
    /// flush that persists the leaf returns the pin for release.
    pub fn put_mapped(
        &mut self,
        cx: &Cx,
        dev: &dyn BlockDevice,
        lbn: Lbn,
        location: DataLocation,
        sequence: u64,
    ) -> Result<()> {
        if !location.is_valid() {
            return Err(KarstError::Protocol(format!(
                "refusing to map {lbn} to invalid location {location}"
            )));
        }
        let slot = self.slot_for(lbn)?;
        let root_index = self.root_index(slot.zone);
        self.ensure_loaded(cx, dev, slot.zone, root_index)?;

        let interior_ref = self.page_entry(slot.zone, root_index, slot.root_slot);
        let interior_index = if interior_ref.is_mapped() {
            self.child_index(interior_ref)?
        } else {
            let page_index = self.allocate_page(slot.zone)?;
            let child = DataLocation::new(
                self.partition.pbn_at(page_index)?,
                MappingState::Uncompressed,
            );
            self.set_entry(slot.zone, root_index, slot.root_slot, child);
            page_index
        };
        self.ensure_loaded(cx, dev, slot.zone, interior_index)?;

        let leaf_ref = self.page_entry(slot.zone, interior_index, slot.interior_slot);
        let leaf_index = if leaf_ref.is_mapped() {
            self.child_index(leaf_ref)?
        } else {
            let page_index = self.allocate_page(slot.zone)?;
            let child = DataLocation::new(
                self.partition.pbn_at(page_index)?,
                MappingState::Uncompressed,
            );
            self.set_entry(slot.zone, interior_index, slot.interior_slot, child);
            page_index
        };
        self.ensure_loaded(cx, dev, slot.zone, leaf_index)?;

        self.set_entry(slot.zone, leaf_index, slot.leaf_slot, location);
        self.zones[usize::from(slot.zone)]
            .dirty
            .entry(leaf_index)
            .or_default()
            .push(sequence);
        trace!(
            target: "karst::map",
            event = "mapping_updated",
            lbn = lbn.0,
            location = %location,
            sequence
        );
        Ok(())
    }

    /// Whether any zone has unwritten pages.
    #[must_use]
    pub fn has_dirty_pages(&self) -> bool {
        self.zones.iter().any(|zone| !zone.dirty.is_empty())
    }

    /// Write every dirty page and drain the journal pins they held.
    pub fn flush(&mut self, cx: &Cx, dev: &dyn BlockDevice) -> Result<Vec<ReleasedPin>> {
        let mut released = Vec::new();
        for (zone_id, zone) in self.zones.iter_mut().enumerate() {
            let dirty = std::mem::take(&mut zone.dirty);
            for (page_index, pins) in dirty {
                let page = zone
                    .cache
                    .get(&page_index)
                    .ok_or_else(|| KarstError::Protocol("dirty page not cached".to_owned()))?;
                let image = page.pack(self.block_size)?;
                let pbn = self.partition.pbn_at(page_index)?;
                dev.write_block(cx, pbn, &image)?;
                for sequence in pins {
                    released.push(ReleasedPin {
                        zone: LogicalZone(zone_id as u8),
                        sequence,
                    });
                }
            }
        }
        if !released.is_empty() {
            debug!(
                target: "karst::map",
                event = "map_flushed",
                released = released.len()
            );
        }
        Ok(released)
    }

    /// Recompute the bump cursor after open by walking root and interior
    /// pages for the highest referenced page slot.
    pub fn open(&mut self, cx: &Cx, dev: &dyn BlockDevice) -> Result<()> {
        let mut highest = u64::from(self.logical_zones) - 1;
        for zone in 0..self.logical_zones {
            let root_index = self.root_index(zone);
            self.ensure_loaded(cx, dev, zone, root_index)?;
            let interior_refs: Vec<DataLocation> = {
                let page = &self.zones[usize::from(zone)].cache[&root_index];
                page.entries.iter().copied().filter(|e| e.is_mapped()).collect()
            };
            for interior_ref in interior_refs {
                let interior_index = self.child_index(interior_ref)?;
                highest = highest.max(interior_index);
                self.ensure_loaded(cx, dev, zone, interior_index)?;
                let page = &self.zones[usize::from(zone)].cache[&interior_index];
                for leaf_ref in page.entries.iter().filter(|e| e.is_mapped()) {
                    highest = highest.max(self.child_index(*leaf_ref)?);
                }
            }
        }
        self.next_free_page = highest + 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_block::{ByteBlockDevice, MemoryByteDevice};

    const BLOCK_SIZE: usize = 512;

    fn device(blocks: u64) -> ByteBlockDevice<MemoryByteDevice> {
        ByteBlockDevice::new(
            MemoryByteDevice::new(blocks as usize * BLOCK_SIZE),
            BLOCK_SIZE as u32,
        )
        .expect("device")
    }

    fn map(zones: u8) -> BlockMap {
        BlockMap::new(
            Partition {
                start: Pbn(8),
                count: 64,
            },
            BLOCK_SIZE,
            zones,
            10_000,
        )
        .expect("map")
    }

    fn loc(pbn: u64) -> DataLocation {
        DataLocation::new(Pbn(pbn), MappingState::Uncompressed)
    }

    #[test]
    fn unwritten_lbn_reads_unmapped() {
        let cx = Cx::for_testing();
        let dev = device(128);
        let mut map = map(2);
        assert_eq!(
            map.get_mapped(&cx, &dev, Lbn(17)).expect("lookup"),
            DataLocation::UNMAPPED
        );
    }

    #[test]
    fn lbn_out_of_range_is_rejected() {
        let cx = Cx::for_testing();
        let dev = device(128);
        let mut map = map(2);
        assert!(matches!(
            map.get_mapped(&cx, &dev, Lbn(10_000)),
            Err(KarstError::OutOfRange { .. })
        ));
    }

    #[test]
    fn mapping_roundtrip_in_memory() {
        let cx = Cx::for_testing();
        let dev = device(128);
        let mut map = map(2);
        map.put_mapped(&cx, &dev, Lbn(1234), loc(777), 1).expect("put");
        assert_eq!(map.get_mapped(&cx, &dev, Lbn(1234)).expect("get"), loc(777));
        // Neighbors stay unmapped.
        assert_eq!(
            map.get_mapped(&cx, &dev, Lbn(1235)).expect("get"),
            DataLocation::UNMAPPED
        );
    }

    #[test]
    fn flush_persists_and_returns_pins() {
        let cx = Cx::for_testing();
        let dev = device(128);
        let mut map = map(2);
        map.put_mapped(&cx, &dev, Lbn(5), loc(700), 3).expect("put");
        map.put_mapped(&cx, &dev, Lbn(6), loc(701), 4).expect("put");
        assert!(map.has_dirty_pages());

        let released = map.flush(&cx, &dev).expect("flush");
        assert!(!map.has_dirty_pages());
        let sequences: Vec<u64> = released.iter().map(|pin| pin.sequence).collect();
        assert!(sequences.contains(&3));
        assert!(sequences.contains(&4));
        // LBNs 5 and 6 share a leaf in zone 0.
        assert!(released.iter().all(|pin| pin.zone == LogicalZone(0)));

        // A fresh map instance reads the flushed state back.
        let mut reopened = map_with_same_shape();
        reopened.open(&cx, &dev).expect("open");
        assert_eq!(reopened.get_mapped(&cx, &dev, Lbn(5)).expect("get"), loc(700));
        assert_eq!(reopened.get_mapped(&cx, &dev, Lbn(6)).expect("get"), loc(701));
    }

    fn map_with_same_shape() -> BlockMap {
        map(2)
    }

    #[test]
    fn reopen_does_not_reuse_tree_pages() {
        let cx = Cx::for_testing();
        let dev = device(128);
        let mut map = map(1);
        map.put_mapped(&cx, &dev, Lbn(0), loc(700), 1).expect("put");
        map.flush(&cx, &dev).expect("flush");

        let mut reopened = BlockMap::new(
            Partition {
                start: Pbn(8),
                count: 64,
            },
            BLOCK_SIZE,
            1,
            10_000,
        )
        .expect("map");
        reopened.open(&cx, &dev).expect("open");
        // New pages must land after the two pages the first map used.
        reopened
            .put_mapped(&cx, &dev, Lbn(9_000), loc(900), 2)
            .expect("put");
        reopened.flush(&cx, &dev).expect("flush");
        assert_eq!(reopened.get_mapped(&cx, &dev, Lbn(0)).expect("get"), loc(700));
        assert_eq!(
            reopened.get_mapped(&cx, &dev, Lbn(9_000)).expect("get"),
            loc(900)
        );
    }

    #[test]
    fn zones_stripe_by_leaf_index() {
        let map = map(2);
        // Leaf 0 -> zone 0, leaf 1 -> zone 1 (entries_per_page = 99 at 512B).
        assert_eq!(map.zone_for_lbn(Lbn(0)), LogicalZone(0));
        assert_eq!(map.zone_for_lbn(Lbn(98)), LogicalZone(0));
        assert_eq!(map.zone_for_lbn(Lbn(99)), LogicalZone(1));
        assert_eq!(map.zone_for_lbn(Lbn(198)), LogicalZone(0));
    }

    #[test]
    fn invalid_location_is_refused() {
        let cx = Cx::for_testing();
        let dev = device(128);
        let mut map = map(1);
        let bad = DataLocation::new(Pbn(0), MappingState::Compressed(1));
        assert!(matches!(
            map.put_mapped(&cx, &dev, Lbn(0), bad, 1),
            Err(KarstError::Protocol(_))
        ));
    }

    #[test]
    fn map_partition_exhaustion_is_out_of_space() {
        let cx = Cx::for_testing();
        let dev = device(16);
        // Partition of 3 pages with 1 zone: root + interior + leaf fits,
        // but a second leaf in a distant region cannot be allocated.
        let mut map = BlockMap::new(
            Partition {
                start: Pbn(8),
                count: 3,
            },
            BLOCK_SIZE,
            1,
            99 * 99 * 99,
        )
        .expect("map");
        map.put_mapped(&cx, &dev, Lbn(0), loc(700), 1).expect("put");
        let distant = Lbn(99 * 99 * 98);
        assert!(matches!(
            map.put_mapped(&cx, &dev, distant, loc(701), 2),
            Err(KarstError::OutOfSpace)
        ));
    }
}
