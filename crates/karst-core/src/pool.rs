//! The data-VIO pool and admission limiters.
//!
//! A fixed set of data-VIOs is allocated up front; the free list is LIFO
//! so recently-used request state stays cache-warm. Admission is governed
//! by two limiters: a general one bounding in-flight requests and a
//! smaller discard limiter bounding metadata churn from trims. Running
//! out of permits blocks ingress cooperatively (the engine cranks its
//! scheduler until a permit frees).

use crate::data_vio::DataVio;
use karst_types::{BlockSize, VioId};
use tracing::trace;

/// A simple counting limiter.
#[derive(Debug)]
pub struct Limiter {
    capacity: u32,
    busy: u32,
    /// High-water mark, for diagnostics.
    pub max_busy: u32,
}

impl Limiter {
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            busy: 0,
            max_busy: 0,
        }
    }

    #[must_use]
    pub fn available(&self) -> bool {
        self.busy < self.capacity
    }

    pub fn take(&mut self) -> bool {
        if !self.available() {
            return false;
        }
        self.busy += 1;
        self.max_busy = self.max_busy.max(self.busy);
        true
    }

    pub fn release(&mut self) {
        debug_assert!(self.busy > 0, "limiter release without take");
        self.busy = self.busy.saturating_sub(1);
    }

    #[must_use]
    pub fn busy(&self) -> u32 {
        self.busy
    }
}

/// The pre-allocated data-VIO pool.
#[derive(Debug)]
pub struct VioPool {
    vios: Vec<DataVio>,
    /// LIFO free list.
    free: Vec<VioId>,
    pub general: Limiter,
    pub discard: Limiter,
}

impl VioPool {
    #[must_use]
    pub fn new(size: u32, discard_limit: u32, block_size: BlockSize) -> Self {
        let vios = (0..size)
            .map(|index| DataVio::new(VioId(index), block_size))
            .collect();
        let free = (0..size).rev().map(VioId).collect();
        Self {
            vios,
            free,
            general: Limiter::new(size),
            discard: Limiter::new(discard_limit.min(size)),
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.vios.len()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.vios.len() - self.free.len()
    }

    /// Take a data-VIO if both the pool and the general limiter allow.
    /// Discard-like requests also need a discard permit.
    pub fn acquire(&mut self, discard: bool) -> Option<VioId> {
        if self.free.is_empty() || !self.general.available() {
            return None;
        }
        if discard && !self.discard.available() {
            return None;
        }
        let id = self.free.pop()?;
        self.general.take();
        if discard {
            self.discard.take();
            self.vios[id.0 as usize].has_discard_permit = true;
        }
        trace!(
            target: "karst::core::pool",
            event = "vio_acquired",
            vio = id.0,
            in_flight = self.in_flight()
        );
        Some(id)
    }

    /// Return a data-VIO and its permits.
    pub fn release(&mut self, id: VioId) {
        let vio = &mut self.vios[id.0 as usize];
        if vio.has_discard_permit {
            self.discard.release();
        }
        vio.reset();
        self.general.release();
        self.free.push(id);
        trace!(
            target: "karst::core::pool",
            event = "vio_released",
            vio = id.0,
            in_flight = self.in_flight()
        );
    }

    /// Give back the discard permit early when a request stops being
    /// discard-like (a partial discard that became a plain write).
    pub fn release_discard_permit(&mut self, id: VioId) {
        let vio = &mut self.vios[id.0 as usize];
        if vio.has_discard_permit {
            vio.has_discard_permit = false;
            self.discard.release();
        }
    }

    #[must_use]
    pub fn vio(&self, id: VioId) -> &DataVio {
        &self.vios[id.0 as usize]
    }

    pub fn vio_mut(&mut self, id: VioId) -> &mut DataVio {
        &mut self.vios[id.0 as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(size: u32, discards: u32) -> VioPool {
        VioPool::new(size, discards, BlockSize::new(4096).expect("block size"))
    }

    #[test]
    fn pool_is_lifo() {
        let mut pool = pool(3, 1);
        let a = pool.acquire(false).expect("a");
        assert_eq!(a, VioId(0));
        pool.release(a);
        let b = pool.acquire(false).expect("b");
        assert_eq!(b, VioId(0), "most recently freed comes back first");
    }

    #[test]
    fn general_limit_bounds_in_flight() {
        let mut pool = pool(2, 2);
        assert!(pool.acquire(false).is_some());
        assert!(pool.acquire(false).is_some());
        assert!(pool.acquire(false).is_none());
        assert_eq!(pool.in_flight(), 2);
    }

    #[test]
    fn discard_limit_is_separate() {
        let mut pool = pool(4, 1);
        let d = pool.acquire(true).expect("first discard");
        assert!(pool.acquire(true).is_none(), "discard permit exhausted");
        assert!(pool.acquire(false).is_some(), "general writes still admitted");
        pool.release(d);
        assert!(pool.acquire(true).is_some());
    }

    #[test]
    fn early_discard_permit_release() {
        let mut pool = pool(4, 1);
        let d = pool.acquire(true).expect("discard");
        pool.release_discard_permit(d);
        assert!(pool.acquire(true).is_some(), "permit freed early");
        // Releasing the vio afterwards must not double-free the permit.
        pool.release(d);
        assert_eq!(pool.discard.busy(), 1);
    }
}
