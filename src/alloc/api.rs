//! Public allocator surface: `SpanAllocator` instances plus the process-wide
//! `GlobalSpanAllocator` with its TLS core binding.
//!
//! This is the API a malloc shim consumes: `allocate` returns null only
//! for size 0, `free` needs no layout (the span header is recovered by
//! address masking), and teardown is best-effort — spans reachable only
//! through the block pool stay cached, never lost.

use std::ptr::{NonNull, null_mut};

use super::arena::Arena;
use super::block_pool::BlockPool;
use super::core_buffer::{CoreBuffer, MAX_CORES, cpu_id};
use super::frontend::{Backends, ListNode};
use super::span_pool::SpanPool;
use super::typed_alloc::TypedAllocator;
use super::vm::VmError;
use crate::sync::atomic::{AtomicPtr, Ordering};
use crate::sync::{Mutex, OnceLock};

/// Configuration for `SpanAllocator`.  All fields have sensible defaults.
/// Set at construction via [`SpanAllocator::with_config`].
#[derive(Clone, Debug)]
pub struct SpanAllocatorConfig {
    /// A cool span whose utilization (percent of blocks handed out) drops
    /// below this is demoted or returned.  Default: 80.
    pub reuse_threshold: u32,

    /// On a free into a floated span, the span is promoted back to hot if
    /// the current hot span's utilization exceeds this.  Default: 80.
    pub local_reuse_threshold: u32,

    /// Remember floated spans on a slow list for cheap reactivation.
    /// Default: true.
    pub reuse_slow_spans: bool,

    /// Return a retired span's pages to the OS from the freeing thread.
    /// When false, pages linger for in-place reuse until [`trim`]
    /// (the cooperative collector) surrenders them.
    /// Default: true.
    ///
    /// [`trim`]: SpanAllocator::trim
    pub eager_decommit: bool,

    /// Shards per size class in the span and block pools.  Must be a
    /// power of two.  Default: 8.
    pub shard_count: usize,

    /// Address space reserved for spans.  Default: 4 GB.
    pub span_region_size: usize,

    /// Address space reserved for allocator metadata.  Default: 16 MB.
    pub meta_region_size: usize,
}

impl Default for SpanAllocatorConfig {
    fn default() -> Self {
        Self {
            reuse_threshold: 80,
            local_reuse_threshold: 80,
            reuse_slow_spans: true,
            eager_decommit: true,
            shard_count: 8,
            span_region_size: 4 * 1024 * 1024 * 1024,
            meta_region_size: 16 * 1024 * 1024,
        }
    }
}

pub struct SpanAllocator {
    arena: Arena,
    span_pool: SpanPool,
    block_pool: BlockPool,
    node_alloc: TypedAllocator<ListNode>,
    buffer_alloc: TypedAllocator<CoreBuffer>,
    cores: Box<[AtomicPtr<CoreBuffer>]>,
    core_lock: Mutex<()>,
    config: SpanAllocatorConfig,
}

// Safety: core buffers are write-once published pointers into arena
// metadata; everything else synchronizes internally.
unsafe impl Send for SpanAllocator {}
// Safety: see above.
unsafe impl Sync for SpanAllocator {}

impl SpanAllocator {
    /// Create an allocator with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the address-space reservation fails or the
    /// configuration is invalid.
    pub fn new() -> Result<Self, VmError> {
        Self::with_config(SpanAllocatorConfig::default())
    }

    /// Create an allocator with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the address-space reservation fails or the
    /// configuration is invalid (e.g. a non-power-of-two shard count).
    pub fn with_config(config: SpanAllocatorConfig) -> Result<Self, VmError> {
        if !config.shard_count.is_power_of_two() {
            return Err(VmError::InitializationFailed(format!(
                "shard_count {} is not a power of two",
                config.shard_count
            )));
        }
        if config.reuse_threshold > 100 || config.local_reuse_threshold > 100 {
            return Err(VmError::InitializationFailed(format!(
                "utilization thresholds must be percentages: {} / {}",
                config.reuse_threshold, config.local_reuse_threshold
            )));
        }

        let arena = Arena::new(config.span_region_size, config.meta_region_size)?;
        let span_pool = SpanPool::new(
            config.shard_count,
            config.eager_decommit,
            arena.span_capacity(),
        );
        let block_pool = BlockPool::new(config.shard_count);

        let mut cores = Vec::with_capacity(MAX_CORES);
        cores.resize_with(MAX_CORES, || AtomicPtr::new(null_mut()));

        Ok(Self {
            arena,
            span_pool,
            block_pool,
            node_alloc: TypedAllocator::new(4096),
            buffer_alloc: TypedAllocator::new(16384),
            cores: cores.into_boxed_slice(),
            core_lock: Mutex::new(()),
            config,
        })
    }

    pub(crate) fn backends(&self) -> Backends<'_> {
        Backends {
            arena: &self.arena,
            span_pool: &self.span_pool,
            block_pool: &self.block_pool,
            node_alloc: &self.node_alloc,
            reuse_threshold: self.config.reuse_threshold,
            local_reuse_threshold: self.config.local_reuse_threshold,
            reuse_slow_spans: self.config.reuse_slow_spans,
        }
    }

    /// The frontend for `core`, creating it on first use.  Slots are
    /// write-once: creation happens under the lock, later lookups are a
    /// single acquire load.
    pub(crate) fn core_buffer(&self, core: usize) -> &CoreBuffer {
        let slot = &self.cores[core & (MAX_CORES - 1)];
        let p = slot.load(Ordering::Acquire);
        if !p.is_null() {
            // Safety: published buffers live as long as the arena.
            return unsafe { &*p };
        }

        let _g = self
            .core_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let p = slot.load(Ordering::Acquire);
        if !p.is_null() {
            // Safety: published buffers live as long as the arena.
            return unsafe { &*p };
        }

        let buf = self.buffer_alloc.allocate(&self.arena);
        // Safety: fresh metadata memory, exclusively ours under the lock.
        unsafe {
            buf.as_ptr()
                .write(CoreBuffer::new((core & (MAX_CORES - 1)) as u64));
        }
        slot.store(buf.as_ptr(), Ordering::Release);
        // Safety: just initialized; lives as long as the arena.
        unsafe { &*buf.as_ptr() }
    }

    /// Allocate at least `size` bytes, aligned to the block size of the
    /// matching class.  Returns `None` iff `size == 0`.
    ///
    /// # Panics
    ///
    /// Sizes above [`MAX_SMALL_SIZE`](super::size_class::MAX_SMALL_SIZE)
    /// belong to the shim's large-object path and abort; arena exhaustion
    /// is fatal.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let buffer = self.core_buffer(cpu_id());
        buffer.allocator.allocate(&self.backends(), size)
    }

    /// Allocate `size` bytes at an address aligned to `align`
    /// (memalign-style).  The returned pointer may sit mid-block; `free`
    /// canonicalizes it back to the block base.
    ///
    /// # Panics
    ///
    /// `align` must be a power of two, and `size + align` must stay within
    /// the small-object limit.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        if size == 0 {
            return None;
        }
        // Every class is 16-byte aligned already.
        if align <= 16 {
            return self.allocate(size);
        }
        // Over-allocate so an aligned address fits inside one block.
        let padded = size
            .checked_add(align)
            .expect("aligned allocation size overflow");
        let p = self.allocate(padded)?;
        let aligned = (p.as_ptr() as usize).next_multiple_of(align);
        // Safety: aligned + size stays within the allocated block.
        Some(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
    }

    /// Free a pointer previously returned by [`allocate`] or
    /// [`allocate_aligned`] on this instance.
    ///
    /// # Safety
    /// - `ptr` must come from this allocator and not have been freed.
    ///
    /// [`allocate`]: Self::allocate
    /// [`allocate_aligned`]: Self::allocate_aligned
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        debug_assert!(
            self.arena.contains(ptr),
            "free of pointer {ptr:p} outside this allocator's arena",
        );
        let buffer = self.core_buffer(cpu_id());
        buffer.allocator.free(&self.backends(), ptr);
    }

    /// Release unused memory to the OS: the cooperative collector pass
    /// over the span pool.
    pub fn trim(&self) {
        self.span_pool.trim(&self.arena);
    }
}

// ---------------------------------------------------------------------------
// Global instance + TLS core binding
// ---------------------------------------------------------------------------

static GLOBAL_INSTANCE: OnceLock<SpanAllocator> = OnceLock::new();

// The binding cell is only ever touched by its own thread; a plain std
// Cell is deliberate (nothing here for loom to schedule).
struct CoreBinding {
    buffer: std::cell::Cell<*const CoreBuffer>,
}

impl CoreBinding {
    fn new() -> Self {
        Self {
            buffer: std::cell::Cell::new(std::ptr::null()),
        }
    }

    /// Bind the calling thread to its core's frontend, counting it in.
    fn bind(&self, alloc: &'static SpanAllocator) -> &'static CoreBuffer {
        let p = self.buffer.get();
        if !p.is_null() {
            // Safety: published buffers live as long as the allocator.
            return unsafe { &*p };
        }
        let buffer = alloc.core_buffer(cpu_id());
        buffer.num_threads.fetch_add(1, Ordering::Relaxed);
        self.buffer.set(buffer as *const CoreBuffer);
        buffer
    }

    /// Count the thread out; the last thread off a core floats the
    /// frontend's spans so they stay stealable.
    fn release(&self) {
        let p = self.buffer.take();
        if p.is_null() {
            return;
        }
        let Some(alloc) = GLOBAL_INSTANCE.get() else {
            return;
        };
        // Safety: published buffers live as long as the allocator.
        let buffer = unsafe { &*p };
        let old = buffer.num_threads.fetch_sub(1, Ordering::AcqRel);
        if old == 1 {
            buffer.allocator.clear_spans(&alloc.backends());
        }
    }
}

impl Drop for CoreBinding {
    fn drop(&mut self) {
        self.release();
    }
}

std::thread_local! {
    static CORE_BINDING: CoreBinding = CoreBinding::new();
}

/// Process-wide allocator.  Initialize once, then allocate/free from any
/// thread; each thread is bound to its core's frontend on first use and
/// counted out again when it exits.
pub struct GlobalSpanAllocator;

impl GlobalSpanAllocator {
    /// Initialize the global allocator.
    ///
    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` if already initialized, or
    /// any reservation error from construction.
    pub fn init() -> Result<(), VmError> {
        GlobalSpanAllocator::init_with(SpanAllocatorConfig::default())
    }

    /// Initialize the global allocator with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` if already initialized, or
    /// any reservation error from construction.
    pub fn init_with(config: SpanAllocatorConfig) -> Result<(), VmError> {
        GLOBAL_INSTANCE
            .set(SpanAllocator::with_config(config)?)
            .map_err(|_| VmError::InitializationFailed("already initialized".to_string()))
    }

    /// Returns the initialized global allocator.
    ///
    /// # Panics
    ///
    /// Panics if [`init`](Self::init) has not been called.
    pub fn get() -> &'static SpanAllocator {
        GLOBAL_INSTANCE
            .get()
            .expect("GlobalSpanAllocator not initialized")
    }

    /// Bind the calling thread to its core frontend.  The thread-start
    /// interception layer calls this before delegating to the user
    /// routine; plain users may skip it — binding also happens lazily.
    pub fn bind_current_thread() {
        let alloc = Self::get();
        CORE_BINDING.with(|binding| {
            binding.bind(alloc);
        });
    }

    /// Allocate at least `size` bytes.  `None` iff `size == 0`.
    pub fn allocate(size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let alloc = Self::get();
        CORE_BINDING.with(|binding| {
            let buffer = binding.bind(alloc);
            buffer.allocator.allocate(&alloc.backends(), size)
        })
    }

    /// Memalign-style allocation; see [`SpanAllocator::allocate_aligned`].
    pub fn allocate_aligned(size: usize, align: usize) -> Option<NonNull<u8>> {
        Self::get().allocate_aligned(size, align)
    }

    /// Free a pointer previously returned by this allocator.
    ///
    /// # Safety
    /// - `ptr` must come from [`allocate`](Self::allocate) or
    ///   [`allocate_aligned`](Self::allocate_aligned) and not have been
    ///   freed already.
    pub unsafe fn free(ptr: NonNull<u8>) {
        let alloc = Self::get();
        CORE_BINDING.with(|binding| {
            let buffer = binding.bind(alloc);
            buffer.allocator.free(&alloc.backends(), ptr);
        });
    }

    /// Release unused memory to the OS.
    pub fn trim() {
        if let Some(alloc) = GLOBAL_INSTANCE.get() {
            alloc.trim();
        }
    }

    /// Best-effort shutdown: unbind the calling thread (floating its
    /// frontend's spans if it was the last one) and run the collector.
    /// Spans reachable only through the block pool stay cached; no memory
    /// is lost, it is simply retained for the process lifetime.
    pub fn teardown() {
        CORE_BINDING.with(|binding| binding.release());
        Self::trim();
    }
}
