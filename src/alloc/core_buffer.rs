//! Core-id probing and the per-core frontend container.
//!
//! A fixed-size table (owned by the allocator instance) maps
//! `core_id → CoreBuffer`; slots are created lazily under a single
//! creation lock and read lock-free afterwards.  Each thread caches its
//! binding in TLS (see `api.rs`); the binding is treated as stable for
//! the duration of any single allocate or free call.

use super::frontend::CoreAllocator;
use crate::sync::atomic::AtomicU64;

/// Upper bound on dispatchable cores; ids are folded into this range.
pub(crate) const MAX_CORES: usize = 64;

const _: () = assert!(MAX_CORES.is_power_of_two());

/// One frontend plus the bookkeeping the dispatch layer needs.
pub(crate) struct CoreBuffer {
    pub(crate) allocator: CoreAllocator,
    /// Threads currently bound to this core.  The last one out floats the
    /// frontend's spans.
    pub(crate) num_threads: AtomicU64,
}

impl CoreBuffer {
    pub(crate) fn new(core_id: u64) -> Self {
        Self {
            allocator: CoreAllocator::new(core_id),
            num_threads: AtomicU64::new(0),
        }
    }
}

/// Index of the CPU the calling thread runs on, folded into `MAX_CORES`.
#[cfg(all(target_os = "linux", not(any(loom, miri))))]
pub(crate) fn cpu_id() -> usize {
    // Safety: FFI call to sched_getcpu; the only failure mode is a
    // negative return on kernels without getcpu, handled below.
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        return fallback_id();
    }
    cpu as usize & (MAX_CORES - 1)
}

#[cfg(not(all(target_os = "linux", not(any(loom, miri)))))]
pub(crate) fn cpu_id() -> usize {
    fallback_id()
}

/// Platforms without a cheap CPU-id probe spread threads by a per-thread
/// counter instead; dispatch stays correct, only locality suffers.
fn fallback_id() -> usize {
    use crate::sync::atomic::{AtomicUsize, Ordering};
    std::thread_local! {
        static SLOT: usize = {
            static CTR: AtomicUsize = AtomicUsize::new(0);
            CTR.fetch_add(1, Ordering::Relaxed)
        };
    }
    SLOT.with(|&s| s) & (MAX_CORES - 1)
}

/// Number of online CPUs, cached.  Drives the residency-class comparison
/// that biases block stealing toward nearby cores.
pub(crate) fn num_cpus() -> u64 {
    use crate::sync::OnceLock;
    static CACHED: OnceLock<u64> = OnceLock::new();
    *CACHED.get_or_init(|| {
        #[cfg(not(any(loom, miri)))]
        {
            // Safety: FFI call to sysconf.
            let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
            if n > 0 { n as u64 } else { 1 }
        }
        #[cfg(any(loom, miri))]
        {
            8
        }
    })
}
