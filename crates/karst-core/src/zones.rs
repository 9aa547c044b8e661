//! The zoned scheduler.
//!
//! Every zone is a cooperative single-threaded context realized as one
//! FIFO queue of `(data-VIO, step)` work items. A work item never
//! suspends mid-step; waiting is always expressed by *not* enqueueing a
//! next step until some release path does. The engine cranks the queues
//! in a fixed round-robin order until everything is idle.

use crate::data_vio::Step;
use karst_types::VioId;
use std::collections::VecDeque;

/// Zone addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZoneKey {
    Journal,
    Logical(u8),
    Physical(u8),
    Hash(u8),
    Cpu,
    Packer,
    BioAck,
}

/// One queued work item.
#[derive(Debug, Clone, Copy)]
pub struct WorkItem {
    pub vio: VioId,
    pub step: Step,
}

/// The per-zone FIFO queues.
#[derive(Debug)]
pub struct WorkQueues {
    journal: VecDeque<WorkItem>,
    logical: Vec<VecDeque<WorkItem>>,
    physical: Vec<VecDeque<WorkItem>>,
    hash: Vec<VecDeque<WorkItem>>,
    cpu: VecDeque<WorkItem>,
    packer: VecDeque<WorkItem>,
    bio_ack: VecDeque<WorkItem>,
}

impl WorkQueues {
    #[must_use]
    pub fn new(logical_zones: u8, physical_zones: u8, hash_zones: u8) -> Self {
        Self {
            journal: VecDeque::new(),
            logical: (0..logical_zones).map(|_| VecDeque::new()).collect(),
            physical: (0..physical_zones).map(|_| VecDeque::new()).collect(),
            hash: (0..hash_zones).map(|_| VecDeque::new()).collect(),
            cpu: VecDeque::new(),
            packer: VecDeque::new(),
            bio_ack: VecDeque::new(),
        }
    }

    fn queue_mut(&mut self, zone: ZoneKey) -> &mut VecDeque<WorkItem> {
        match zone {
            ZoneKey::Journal => &mut self.journal,
            ZoneKey::Logical(index) => &mut self.logical[usize::from(index)],
            ZoneKey::Physical(index) => &mut self.physical[usize::from(index)],
            ZoneKey::Hash(index) => &mut self.hash[usize::from(index)],
            ZoneKey::Cpu => &mut self.cpu,
            ZoneKey::Packer => &mut self.packer,
            ZoneKey::BioAck => &mut self.bio_ack,
        }
    }

    /// Enqueue a step on its zone.
    pub fn enqueue(&mut self, zone: ZoneKey, vio: VioId, step: Step) {
        self.queue_mut(zone).push_back(WorkItem { vio, step });
    }

    /// Pop the next item in round-robin zone order.
    pub fn pop_next(&mut self) -> Option<(ZoneKey, WorkItem)> {
        if let Some(item) = self.journal.pop_front() {
            return Some((ZoneKey::Journal, item));
        }
        for index in 0..self.logical.len() {
            if let Some(item) = self.logical[index].pop_front() {
                return Some((ZoneKey::Logical(index as u8), item));
            }
        }
        for index in 0..self.physical.len() {
            if let Some(item) = self.physical[index].pop_front() {
                return Some((ZoneKey::Physical(index as u8), item));
            }
        }
        for index in 0..self.hash.len() {
            if let Some(item) = self.hash[index].pop_front() {
                return Some((ZoneKey::Hash(index as u8), item));
            }
        }
        if let Some(item) = self.cpu.pop_front() {
            return Some((ZoneKey::Cpu, item));
        }
        if let Some(item) = self.packer.pop_front() {
            return Some((ZoneKey::Packer, item));
        }
        if let Some(item) = self.bio_ack.pop_front() {
            return Some((ZoneKey::BioAck, item));
        }
        None
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.journal.is_empty()
            && self.logical.iter().all(VecDeque::is_empty)
            && self.physical.iter().all(VecDeque::is_empty)
            && self.hash.iter().all(VecDeque::is_empty)
            && self.cpu.is_empty()
            && self.packer.is_empty()
            && self.bio_ack.is_empty()
    }
}
