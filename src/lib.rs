#[cfg(not(target_pointer_width = "64"))]
compile_error!("spanalloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod alloc;

// allocator instances
pub use alloc::api::{GlobalSpanAllocator, SpanAllocator, SpanAllocatorConfig};

// size-class table, for shim layers that need the small-object cutoff
pub use alloc::size_class::{MAX_SMALL_SIZE, NUM_CLASSES};

// errors
pub use alloc::vm::VmError;

// diagnostics
pub use alloc::stats::AllocatorStats;
