//! Scope ids and their per-id block counters.
//!
//! One [`ScopeIdRegistry`] is shared by every compile call of a runtime.
//! Entries expire after the configured TTL unless they are kept alive, and
//! the map is bounded: once it grows past its capacity the oldest expirable
//! entries are evicted in chunks.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use smol_str::SmolStr;

use crate::error::FrameError;

const DEFAULT_CAPACITY: usize = 65_536;
const EVICTION_CHUNK: usize = 1024;
const SWEEP_INTERVAL: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct Counters {
    return_index: u16,
    block_inc: u16,
    touched: Instant,
    keepalive: bool,
}

impl Counters {
    fn new(keepalive: bool) -> Self {
        Self {
            return_index: 0,
            block_inc: 0,
            touched: Instant::now(),
            keepalive,
        }
    }
}

#[derive(Debug)]
pub struct ScopeIdRegistry {
    ttl: Duration,
    capacity: usize,
    scopes: DashMap<u32, Counters>,
    remote_incs: DashMap<(u32, SmolStr), (u16, Instant)>,
    ops: AtomicUsize,
}

impl Default for ScopeIdRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

/// Returns the current value and advances it, wrapping to 0 after `u16::MAX`.
#[inline(always)]
fn post_increment(counter: &mut u16) -> u16 {
    let current = *counter;
    *counter = counter.wrapping_add(1);
    current
}

impl ScopeIdRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            scopes: DashMap::new(),
            remote_incs: DashMap::new(),
            ops: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn contains(&self, sid: u32) -> bool {
        self.scopes.contains_key(&sid)
    }

    /// Draws a random id that is not currently in use and registers it with
    /// fresh counters. `keepalive` entries never expire.
    pub fn generate(&self, keepalive: bool) -> Result<u32, FrameError> {
        self.maintain();
        loop {
            let mut raw = [0u8; 4];
            getrandom::getrandom(&mut raw).map_err(|e| FrameError::RandomSource(e.to_string()))?;
            let sid = u32::from_le_bytes(raw);
            // 0 is reserved for DATA messages
            if sid == 0 {
                continue;
            }
            if let Entry::Vacant(entry) = self.scopes.entry(sid) {
                entry.insert(Counters::new(keepalive));
                tracing::trace!(sid, "generated scope id");
                return Ok(sid);
            }
        }
    }

    /// Next return index of `sid`, registering the id if it is unknown.
    pub fn next_return_index(&self, sid: u32) -> u16 {
        self.maintain();
        let mut entry = self.scopes.entry(sid).or_insert_with(|| Counters::new(false));
        entry.touched = Instant::now();
        post_increment(&mut entry.return_index)
    }

    /// Next block increment of `sid`.
    pub fn next_block_inc(&self, sid: u32) -> u16 {
        self.maintain();
        let mut entry = self.scopes.entry(sid).or_insert_with(|| Counters::new(false));
        entry.touched = Instant::now();
        post_increment(&mut entry.block_inc)
    }

    /// Block increment for responses: tracked per remote endpoint, so two
    /// peers answering under the same id count independently.
    pub fn next_remote_block_inc(&self, sid: u32, remote: &str) -> u16 {
        self.maintain();
        let mut entry = self
            .remote_incs
            .entry((sid, SmolStr::new(remote)))
            .or_insert_with(|| (0, Instant::now()));
        entry.1 = Instant::now();
        post_increment(&mut entry.0)
    }

    /// Marks `sid` as used so it does not expire.
    pub fn keep_alive(&self, sid: u32) {
        if let Some(mut entry) = self.scopes.get_mut(&sid) {
            entry.keepalive = true;
            entry.touched = Instant::now();
        }
    }

    /// Drops the counters of `sid` (end of scope).
    pub fn release(&self, sid: u32) {
        self.scopes.remove(&sid);
        tracing::trace!(sid, "released scope id");
    }

    pub fn reset_remote(&self, sid: u32, remote: &str) {
        self.remote_incs.remove(&(sid, SmolStr::new(remote)));
    }

    /// Removes expired entries. Runs on its own every few thousand
    /// operations; exposed for callers that want a deterministic sweep.
    pub fn sweep(&self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.scopes
            .retain(|_, c| c.keepalive || now.duration_since(c.touched) < ttl);
        self.remote_incs
            .retain(|_, (_, touched)| now.duration_since(*touched) < ttl);
    }

    fn maintain(&self) {
        let ops = self.ops.fetch_add(1, Ordering::Relaxed);
        if ops % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.sweep();
        }
        if self.scopes.len() >= self.capacity {
            self.evict();
        }
    }

    /// Evicts the oldest expirable entries.
    fn evict(&self) {
        let mut candidates: Vec<(u32, Instant)> = self
            .scopes
            .iter()
            .filter(|e| !e.keepalive)
            .map(|e| (*e.key(), e.touched))
            .collect();
        candidates.sort_unstable_by_key(|(_, touched)| *touched);
        let evicted = candidates.len().min(EVICTION_CHUNK);
        for (sid, _) in candidates.into_iter().take(evicted) {
            self.scopes.remove(&sid);
        }
        tracing::debug!(evicted, "evicted scope ids");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rustc_hash::FxHashSet;
    use std::sync::Arc;

    #[test]
    fn test_counters_start_at_zero_and_increment() {
        let registry = ScopeIdRegistry::default();
        let sid = registry.generate(false).unwrap();
        assert_eq!(registry.next_return_index(sid), 0);
        assert_eq!(registry.next_return_index(sid), 1);
        assert_eq!(registry.next_block_inc(sid), 0);
        assert_eq!(registry.next_block_inc(sid), 1);
    }

    #[test]
    fn test_counters_wrap() {
        let mut counter = u16::MAX;
        assert_eq!(post_increment(&mut counter), u16::MAX);
        assert_eq!(counter, 0);
    }

    #[test]
    fn test_remote_incs_are_independent() {
        let registry = ScopeIdRegistry::default();
        let sid = 42;
        assert_eq!(registry.next_remote_block_inc(sid, "@alice"), 0);
        assert_eq!(registry.next_remote_block_inc(sid, "@alice"), 1);
        assert_eq!(registry.next_remote_block_inc(sid, "@bob"), 0);
        registry.reset_remote(sid, "@alice");
        assert_eq!(registry.next_remote_block_inc(sid, "@alice"), 0);
    }

    #[test]
    fn test_release_forgets_counters() {
        let registry = ScopeIdRegistry::default();
        let sid = registry.generate(false).unwrap();
        registry.next_block_inc(sid);
        registry.release(sid);
        assert!(!registry.contains(sid));
        assert_eq!(registry.next_block_inc(sid), 0);
    }

    #[test]
    fn test_sweep_expires_unless_kept_alive() {
        let registry = ScopeIdRegistry::new(Duration::ZERO);
        let expiring = registry.generate(false).unwrap();
        let kept = registry.generate(true).unwrap();
        registry.sweep();
        assert!(!registry.contains(expiring));
        assert!(registry.contains(kept));
    }

    #[test]
    fn test_eviction_keeps_registry_bounded() {
        let registry = ScopeIdRegistry::with_capacity(Duration::from_secs(60), 8);
        for _ in 0..32 {
            registry.generate(false).unwrap();
        }
        assert!(registry.len() <= 8);
    }

    #[test]
    fn test_concurrent_generation_is_unique() {
        let registry = Arc::new(ScopeIdRegistry::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..1250)
                        .map(|_| registry.generate(true).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = FxHashSet::default();
        for handle in handles {
            for sid in handle.join().unwrap() {
                assert!(seen.insert(sid), "duplicate scope id {sid}");
            }
        }
        assert_eq!(seen.len(), 10_000);
        assert_eq!(registry.len(), 10_000);
    }

    proptest! {
        #[test]
        fn test_block_inc_sequence(n in 1usize..300) {
            let registry = ScopeIdRegistry::default();
            let sid = registry.generate(false).unwrap();
            let incs: Vec<u16> = (0..n).map(|_| registry.next_block_inc(sid)).collect();
            prop_assert_eq!(incs, (0..n as u16).collect::<Vec<_>>());
        }
    }
}
