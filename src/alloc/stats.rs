//! All counters use `Relaxed` ordering.  Individual counter values are
//! eventually consistent; cross-counter snapshots may be transiently
//! inconsistent.  This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw
/// value may transiently dip below zero.  Readers should always use
/// `load()`/`get()`, which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

// Address space reserved by allocator instances
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Physical memory committed by allocator instances
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}

// Spans currently adopted by a frontend (hot, cool or floating)
crate::sync::static_atomic! {
    pub static SPANS_LIVE: Counter = Counter::new();
}

// Span pool traffic
crate::sync::static_atomic! {
    pub static SPAN_POOL_GETS: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static SPAN_POOL_PUTS: Counter = Counter::new();
}

// Block pool traffic (remote frees and steals)
crate::sync::static_atomic! {
    pub static BLOCK_POOL_FREES: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static BLOCK_POOL_ALLOCS: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static SPAN_STEALS: Counter = Counter::new();
}

// Frontend refills (fresh or reactivated spans becoming hot)
crate::sync::static_atomic! {
    pub static REFILLS: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Point-in-time snapshot of the diagnostic counters.
pub struct AllocatorStats {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub spans_live: usize,
    pub span_pool_gets: usize,
    pub span_pool_puts: usize,
    pub block_pool_frees: usize,
    pub block_pool_allocs: usize,
    pub span_steals: usize,
    pub refills: usize,
}

impl AllocatorStats {
    pub fn snapshot() -> Self {
        Self {
            total_reserved: TOTAL_RESERVED.load(Ordering::Relaxed),
            total_committed: TOTAL_COMMITTED.load(Ordering::Relaxed),
            spans_live: SPANS_LIVE.load(Ordering::Relaxed),
            span_pool_gets: SPAN_POOL_GETS.load(Ordering::Relaxed),
            span_pool_puts: SPAN_POOL_PUTS.load(Ordering::Relaxed),
            block_pool_frees: BLOCK_POOL_FREES.load(Ordering::Relaxed),
            block_pool_allocs: BLOCK_POOL_ALLOCS.load(Ordering::Relaxed),
            span_steals: SPAN_STEALS.load(Ordering::Relaxed),
            refills: REFILLS.load(Ordering::Relaxed),
        }
    }
}
