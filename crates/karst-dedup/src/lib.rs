#![forbid(unsafe_code)]
//! Content fingerprinting and the dedup-advice index boundary.
//!
//! The engine never owns the advice index; it posts, queries, and updates
//! hints through the narrow [`AdviceIndex`] trait. Advice is best-effort:
//! a hint names a candidate PBN that *may* hold a block with the given
//! fingerprint, and the data path always verifies bytes before sharing.

use asupersync::Cx;
use karst_error::{KarstError, Result};
use karst_types::{ChunkName, DataLocation};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Derive the 128-bit content fingerprint of one block of data.
#[must_use]
pub fn chunk_name(data: &[u8]) -> ChunkName {
    let digest = blake3::hash(data);
    let mut name = [0_u8; 16];
    name.copy_from_slice(&digest.as_bytes()[..16]);
    ChunkName(name)
}

/// The dedup-advice index boundary: post new mappings, query candidates,
/// update stale hints. All three are fire-and-forget from the engine's
/// perspective; failures must never fail a write.
pub trait AdviceIndex: Send + Sync {
    /// Record that `name` now lives at `advice`.
    fn post(&self, cx: &Cx, name: &ChunkName, advice: DataLocation) -> Result<()>;

    /// Look up a candidate location for `name`.
    fn query(&self, cx: &Cx, name: &ChunkName) -> Result<Option<DataLocation>>;

    /// Replace the advice for `name` (the previous hint proved stale).
    fn update(&self, cx: &Cx, name: &ChunkName, advice: DataLocation) -> Result<()>;
}

/// Counters for advice outcomes. Timeouts and transport errors both read
/// as "no advice" on the data path but stay distinguishable here.
#[derive(Debug, Default)]
pub struct AdviceStats {
    pub queries: AtomicU64,
    pub hits: AtomicU64,
    pub timeouts: AtomicU64,
    pub transport_errors: AtomicU64,
}

impl AdviceStats {
    #[must_use]
    pub fn snapshot(&self) -> AdviceStatsSnapshot {
        AdviceStatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdviceStatsSnapshot {
    pub queries: u64,
    pub hits: u64,
    pub timeouts: u64,
    pub transport_errors: u64,
}

/// Wraps any index with a soft deadline and the "no advice beats an error"
/// policy: a query that overruns `deadline` or fails in transport returns
/// `None` and the engine proceeds with a fresh write.
pub struct TimeBounded<I> {
    inner: I,
    deadline: Duration,
    stats: Arc<AdviceStats>,
}

impl<I: AdviceIndex> TimeBounded<I> {
    pub fn new(inner: I, deadline: Duration) -> Self {
        Self {
            inner,
            deadline,
            stats: Arc::new(AdviceStats::default()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> Arc<AdviceStats> {
        Arc::clone(&self.stats)
    }
}

impl<I: AdviceIndex> AdviceIndex for TimeBounded<I> {
    fn post(&self, cx: &Cx, name: &ChunkName, advice: DataLocation) -> Result<()> {
        // Fire and forget: a failed post only costs future dedup.
        if let Err(err) = self.inner.post(cx, name, advice) {
            debug!(
                target: "karst::dedup",
                event = "post_failed",
                name = %name,
                error = %err
            );
            self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn query(&self, cx: &Cx, name: &ChunkName) -> Result<Option<DataLocation>> {
        self.stats.queries.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let outcome = self.inner.query(cx, name);
        let elapsed = started.elapsed();

        if elapsed > self.deadline {
            trace!(
                target: "karst::dedup",
                event = "query_timeout",
                name = %name,
                elapsed_ms = elapsed.as_millis() as u64
            );
            self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        match outcome {
            Ok(Some(advice)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(advice))
            }
            Ok(None) => Ok(None),
            Err(KarstError::Cancelled) => Err(KarstError::Cancelled),
            Err(err) => {
                debug!(
                    target: "karst::dedup",
                    event = "query_failed",
                    name = %name,
                    error = %err
                );
                self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    fn update(&self, cx: &Cx, name: &ChunkName, advice: DataLocation) -> Result<()> {
        if let Err(err) = self.inner.update(cx, name, advice) {
            debug!(
                target: "karst::dedup",
                event = "update_failed",
                name = %name,
                error = %err
            );
            self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// In-memory advice index for tests and the e2e harness.
#[derive(Debug, Default)]
pub struct MemoryAdviceIndex {
    entries: Mutex<HashMap<ChunkName, DataLocation>>,
}

impl MemoryAdviceIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl AdviceIndex for MemoryAdviceIndex {
    fn post(&self, cx: &Cx, name: &ChunkName, advice: DataLocation) -> Result<()> {
        cx.checkpoint().map_err(|_| KarstError::Cancelled)?;
        self.entries.lock().entry(*name).or_insert(advice);
        Ok(())
    }

    fn query(&self, cx: &Cx, name: &ChunkName) -> Result<Option<DataLocation>> {
        cx.checkpoint().map_err(|_| KarstError::Cancelled)?;
        Ok(self.entries.lock().get(name).copied())
    }

    fn update(&self, cx: &Cx, name: &ChunkName, advice: DataLocation) -> Result<()> {
        cx.checkpoint().map_err(|_| KarstError::Cancelled)?;
        self.entries.lock().insert(*name, advice);
        Ok(())
    }
}

/// An index that always fails in transport, for fallback-path tests.
#[derive(Debug, Default)]
pub struct UnreachableIndex;

impl AdviceIndex for UnreachableIndex {
    fn post(&self, _cx: &Cx, _name: &ChunkName, _advice: DataLocation) -> Result<()> {
        Err(KarstError::Protocol("advice transport down".to_owned()))
    }

    fn query(&self, _cx: &Cx, _name: &ChunkName) -> Result<Option<DataLocation>> {
        Err(KarstError::Protocol("advice transport down".to_owned()))
    }

    fn update(&self, _cx: &Cx, _name: &ChunkName, _advice: DataLocation) -> Result<()> {
        Err(KarstError::Protocol("advice transport down".to_owned()))
    }
}
