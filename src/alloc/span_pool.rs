//! Retired-span backend.
//!
//! A sharded array of lock-free stacks holding fully-free, unowned spans,
//! indexed by `(size_class, core_hint)`.  `get` probes the caller's shard,
//! rotates through the rest, and falls back to carving a fresh virtual
//! span from the arena.  `put` surrenders a span for reuse.
//!
//! The page-return hint is a build-time choice carried in the config: with
//! eager decommit the freeing thread surrenders the block region's pages
//! inline; otherwise spans park on a pending stack and the next `trim`
//! call plays collector.  Correctness does not depend on which.  Either
//! way the header page stays committed, so a pooled span keeps its class
//! stamp and freelist bookkeeping.

use std::ptr::NonNull;

#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

use super::arena::Arena;
use super::size_class::{NUM_CLASSES, span_size};
use super::span::{SpanHeader, owner_tag};
use super::stats;
use super::tagged_stack::TaggedStack;
use super::vm::{PlatformVmOps, VmOps};
use crate::sync::atomic::Ordering;
#[cfg(debug_assertions)]
use crate::sync::Mutex;

pub(crate) struct SpanPool {
    /// `NUM_CLASSES * shard_count` stacks, row-major by class.
    shards: Box<[TaggedStack]>,
    shard_count: usize,
    eager_decommit: bool,
    /// Debug-only double-put guard, indexed by arena span slot.
    #[cfg(debug_assertions)]
    pooled: Mutex<FixedBitSet>,
}

impl SpanPool {
    pub(crate) fn new(shard_count: usize, eager_decommit: bool, span_capacity: usize) -> Self {
        debug_assert!(shard_count.is_power_of_two());
        let mut shards = Vec::with_capacity(NUM_CLASSES * shard_count);
        shards.resize_with(NUM_CLASSES * shard_count, TaggedStack::new);
        Self {
            shards: shards.into_boxed_slice(),
            shard_count,
            eager_decommit,
            #[cfg(debug_assertions)]
            pooled: Mutex::new(FixedBitSet::with_capacity(span_capacity)),
        }
    }

    #[inline]
    fn stack(&self, class: usize, shard: usize) -> &TaggedStack {
        &self.shards[class * self.shard_count + (shard & (self.shard_count - 1))]
    }

    /// Fetch a span of class `class`, preferring the caller's shard.
    ///
    /// Returns the header and a `reusable` flag: when true, the span was
    /// recycled with its block region still committed, so the freelist may
    /// be refreshed in place (block addresses unchanged).  When false the
    /// caller must rebuild the freelist from the block range.
    ///
    /// # Panics
    ///
    /// Fresh-span commit failure and arena exhaustion are fatal.
    pub(crate) fn get(
        &self,
        arena: &Arena,
        class: usize,
        owner: u64,
    ) -> (NonNull<SpanHeader>, bool) {
        debug_assert!(class > 0 && class < NUM_CLASSES);

        let start = owner as usize;
        for i in 0..self.shard_count {
            let Some(entry) = self.stack(class, start + i).pop() else {
                continue;
            };
            let header = entry.cast::<SpanHeader>();
            // Safety: a popped span is exclusively ours.
            let hdr = unsafe { &mut *header.as_ptr() };
            debug_assert_eq!(hdr.size_class(), class);

            #[cfg(debug_assertions)]
            {
                let base = NonNull::new(hdr.base()).unwrap();
                if arena.contains(base) {
                    self.pooled
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .set(arena.span_index(base), false);
                }
            }

            let reusable = hdr.is_committed();
            if !reusable {
                Self::recommit_block_region(hdr);
            }

            stats::SPAN_POOL_GETS.add(1);
            stats::SPANS_LIVE.add(1);
            return (header, reusable);
        }

        // All shards empty: carve a fresh virtual span.
        let slot = arena.span_slot();
        // Safety: FFI call to commit memory; the slot is exclusively ours.
        if let Err(e) = unsafe { PlatformVmOps::commit(slot, span_size(class)) } {
            panic!("span commit failed for class {class}: {e}");
        }
        stats::TOTAL_COMMITTED.add(span_size(class));
        // Safety: slot is span-aligned, committed, exclusively ours.
        let header = unsafe { SpanHeader::stamp(slot, class) };

        stats::SPAN_POOL_GETS.add(1);
        stats::SPANS_LIVE.add(1);
        (header, false)
    }

    /// Surrender a fully-free span for reuse.
    ///
    /// # Safety
    /// - The caller must hold the span exclusively (active tag owned or
    ///   freshly claimed) with every block on its freelist.
    pub(crate) unsafe fn put(
        &self,
        arena: &Arena,
        span: NonNull<SpanHeader>,
        class: usize,
        owner_hint: u64,
    ) {
        // Safety: exclusivity per contract.
        let hdr = unsafe { &mut *span.as_ptr() };
        debug_assert_eq!(hdr.size_class(), class);
        debug_assert!(hdr.flist.full(), "span pool put of a non-free span");

        hdr.prev = std::ptr::null_mut();
        hdr.next = std::ptr::null_mut();
        // Publish freelist state before the span becomes globally visible.
        hdr.owner_tag
            .store(owner_tag::pack(owner_hint, false), Ordering::Release);

        #[cfg(debug_assertions)]
        {
            let base = NonNull::new(hdr.base()).unwrap();
            if arena.contains(base) {
                let mut pooled = self
                    .pooled
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let idx = arena.span_index(base);
                assert!(!pooled.contains(idx), "double put of span {base:p}");
                pooled.insert(idx);
            }
        }

        stats::SPAN_POOL_PUTS.add(1);
        stats::sub_saturating(&stats::SPANS_LIVE, 1);

        if self.eager_decommit {
            Self::decommit_block_region(hdr);
        }
        // With deferred decommit the pages stay resident so a near-term get
        // can refresh the freelist in place; trim plays collector later.
        // Safety: span handed over to the stack.
        unsafe { self.stack(class, owner_hint as usize).push(span.cast()) };
    }

    /// The cooperative collector pass: surrender the pages of every pooled
    /// span that still holds its block region.
    pub(crate) fn trim(&self, _arena: &Arena) {
        for stack in &self.shards {
            let mut drained = Vec::new();
            while let Some(entry) = stack.pop() {
                let header = entry.cast::<SpanHeader>();
                // Safety: popped spans are exclusively the drainer's.
                let hdr = unsafe { &mut *header.as_ptr() };
                Self::decommit_block_region(hdr);
                drained.push(header);
            }
            for header in drained {
                // Safety: span handed back to the shard stack.
                unsafe { stack.push(header.cast()) };
            }
        }
    }

    /// Return the block region's pages to the OS, keeping the header page.
    fn decommit_block_region(hdr: &mut SpanHeader) {
        if !hdr.is_committed() {
            return;
        }
        let page = PlatformVmOps::page_size();
        let span = span_size(hdr.size_class());
        if span <= page {
            return;
        }
        // Safety: the block region starts one page into the span.
        let at = unsafe { NonNull::new_unchecked(hdr.base().add(page)) };
        // Safety: FFI call to decommit memory.
        if unsafe { PlatformVmOps::decommit(at, span - page) }.is_ok() {
            hdr.set_committed(false);
            stats::sub_saturating(&stats::TOTAL_COMMITTED, span - page);
        }
    }

    fn recommit_block_region(hdr: &mut SpanHeader) {
        let page = PlatformVmOps::page_size();
        let span = span_size(hdr.size_class());
        if span > page {
            // Safety: recommit of the region decommitted above.
            let at = unsafe { NonNull::new_unchecked(hdr.base().add(page)) };
            // Safety: FFI call to commit memory.
            if let Err(e) = unsafe { PlatformVmOps::commit(at, span - page) } {
                panic!("span recommit failed: {e}");
            }
            stats::TOTAL_COMMITTED.add(span - page);
        }
        hdr.set_committed(true);
    }
}
