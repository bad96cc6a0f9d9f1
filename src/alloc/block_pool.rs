//! Remote-free backend.
//!
//! One lock-free stack per `(size_class, shard)` holds individual blocks
//! freed by threads that do not own the block's span.  A span's shard is
//! fixed when a frontend adopts it, so remote frees cluster near the
//! owner.  `allocate` prefers the caller's shard and rotates through the
//! rest.
//!
//! Popping a block can also surrender its whole span: if the span is
//! floating and the popped block turns out to be its last outstanding
//! block, the pool claims the span and returns it so the caller can
//! promote it to hot.  The claim parks the tag under a reserved owner id;
//! the stored owner id is a routing hint, never an authority.  A failed
//! or unprofitable claim is released again; false negatives merely forgo
//! a fast-path promotion.

use std::ptr::NonNull;

use super::size_class::NUM_CLASSES;
use super::span::{SpanHeader, owner_tag};
use super::stats;
use super::tagged_stack::TaggedStack;
use crate::sync::atomic::Ordering;

pub(crate) struct BlockPool {
    /// `NUM_CLASSES * shard_count` stacks, row-major by class.
    shards: Box<[TaggedStack]>,
    shard_count: usize,
}

impl BlockPool {
    pub(crate) fn new(shard_count: usize) -> Self {
        debug_assert!(shard_count.is_power_of_two());
        let mut shards = Vec::with_capacity(NUM_CLASSES * shard_count);
        shards.resize_with(NUM_CLASSES * shard_count, TaggedStack::new);
        Self {
            shards: shards.into_boxed_slice(),
            shard_count,
        }
    }

    #[inline]
    pub(crate) fn shard_count(&self) -> usize {
        self.shard_count
    }

    #[inline]
    fn stack(&self, class: usize, shard: usize) -> &TaggedStack {
        &self.shards[class * self.shard_count + (shard & (self.shard_count - 1))]
    }

    /// Enqueue a block freed by a non-owner.  `shard` is the span's
    /// `remote_shard` handle.
    pub(crate) fn free(&self, block: NonNull<u8>, class: usize, shard: usize) {
        debug_assert!(class > 0 && class < NUM_CLASSES);
        stats::BLOCK_POOL_FREES.add(1);
        // Safety: a freed block is dead memory; its first word is the link.
        unsafe { self.stack(class, shard).push(block) };
    }

    /// Dequeue one block of `class`, preferring the shard of `owner`.
    ///
    /// Returns the block and, when the pop surrendered a whole span, its
    /// header for promotion.  A returned span is exclusively claimed: its
    /// active bit is set and every block except the returned one sits on
    /// its freelist.
    pub(crate) fn allocate(
        &self,
        class: usize,
        owner: u64,
    ) -> Option<(NonNull<u8>, Option<NonNull<SpanHeader>>)> {
        debug_assert!(class > 0 && class < NUM_CLASSES);
        let start = owner as usize;
        for i in 0..self.shard_count {
            let Some(block) = self.stack(class, start + i).pop() else {
                continue;
            };
            stats::BLOCK_POOL_ALLOCS.add(1);
            // Safety: the block belongs to a live span of this allocator.
            let span = unsafe { Self::try_claim_span(block, class) };
            return Some((block, span));
        }
        None
    }

    /// Attempt to claim the popped block's span for the caller.
    ///
    /// On a successful claim CAS the claimant holds the span exclusively
    /// and may inspect its freelist: the hint fires iff the popped block
    /// is the last outstanding block (freelist at capacity − 1), i.e.
    /// handing over the span hands over all of it.  Otherwise the claim is
    /// released and the span floats on under its previous tag.
    ///
    /// # Safety
    /// - `block` must belong to a live span of class `class`.
    unsafe fn try_claim_span(block: NonNull<u8>, class: usize) -> Option<NonNull<SpanHeader>> {
        // Safety: block is interior to its span per contract.
        let header = unsafe { SpanHeader::from_object(block) };
        // Only the atomic tag may be touched while the span is contended.
        // Safety: headers outlive their blocks.
        let tag = unsafe { &(*header.as_ptr()).owner_tag };

        let raw = tag.load(Ordering::Acquire);
        if owner_tag::is_active(raw) {
            return None;
        }

        // Claim under the reserved owner id: were the old owner's id kept
        // in an active tag, the old owner could mistake the span for its
        // own and push to the freelist mid-claim.
        let claim = owner_tag::pack(owner_tag::CLAIMED_OWNER, true);
        if tag
            .compare_exchange(raw, claim, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Lost the race; the block itself is still ours.
            return None;
        }

        // Exclusive from here: the freelist is safe to read.
        // Safety: the successful claim pins the span.
        let (len, cap, span_class) = unsafe {
            let hdr = &*header.as_ptr();
            (hdr.flist.len(), hdr.flist.capacity(), hdr.size_class())
        };
        debug_assert_eq!(span_class, class);
        if len + 1 == cap {
            stats::SPAN_STEALS.add(1);
            Some(header)
        } else {
            // Other blocks are outstanding or queued; let the span float.
            tag.store(raw, Ordering::Release);
            None
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::super::arena::Arena;
    use super::super::size_class::{VIRTUAL_SPAN_SIZE, block_size, size_to_class};
    use super::super::span_pool::SpanPool;
    use super::*;

    fn setup(class: usize, owner: u64) -> (Arena, SpanPool, NonNull<SpanHeader>) {
        let arena = Arena::new(VIRTUAL_SPAN_SIZE * 8, 1 << 20).unwrap();
        let pool = SpanPool::new(2, true, arena.span_capacity());
        let (span, _) = pool.get(&arena, class, owner);
        // Safety: Test code.
        unsafe {
            (*span.as_ptr()).rebuild_flist();
            (*span.as_ptr())
                .owner_tag
                .store(owner_tag::pack(owner, true), Ordering::Release);
        }
        (arena, pool, span)
    }

    #[test]
    fn test_free_then_allocate_round_trip() {
        let _guard = crate::alloc::TEST_MUTEX.read().unwrap();
        let class = size_to_class(64);
        let (_arena, _pool, span) = setup(class, 1);
        let blocks = BlockPool::new(4);

        // Pull two blocks out of the span, free them remotely.
        // Safety: Test code.
        let (a, b) = unsafe {
            let hdr = &mut *span.as_ptr();
            (hdr.flist.pop().unwrap(), hdr.flist.pop().unwrap())
        };
        blocks.free(a, class, 1);
        blocks.free(b, class, 1);

        // Owner's shard served first, LIFO.
        let (first, hint) = blocks.allocate(class, 1).unwrap();
        assert_eq!(first, b);
        assert!(hint.is_none(), "span is active; no steal");
        let (second, hint) = blocks.allocate(class, 1).unwrap();
        assert_eq!(second, a);
        assert!(hint.is_none());
        assert!(blocks.allocate(class, 1).is_none());
    }

    #[test]
    fn test_allocate_rotates_to_other_shards() {
        let _guard = crate::alloc::TEST_MUTEX.read().unwrap();
        let class = size_to_class(32);
        let (_arena, _pool, span) = setup(class, 1);
        let blocks = BlockPool::new(4);

        // Safety: Test code.
        let p = unsafe { (*span.as_ptr()).flist.pop().unwrap() };
        // Freed into shard 3; an allocator preferring shard 0 must find it.
        blocks.free(p, class, 3);
        let (got, _) = blocks.allocate(class, 0).unwrap();
        assert_eq!(got, p);
    }

    #[test]
    fn test_last_block_pop_hands_over_span() {
        let _guard = crate::alloc::TEST_MUTEX.read().unwrap();
        let class = size_to_class(64);
        let (_arena, _pool, span) = setup(class, 1);
        let blocks = BlockPool::new(4);

        // One outstanding block; the owner floats the span, then the block
        // is freed remotely.
        // Safety: Test code.
        let p = unsafe { (*span.as_ptr()).flist.pop().unwrap() };
        // Safety: Test code.
        unsafe {
            (*span.as_ptr())
                .owner_tag
                .store(owner_tag::pack(1, false), Ordering::Release);
        }
        blocks.free(p, class, 1);

        let (got, hint) = blocks.allocate(class, 2).unwrap();
        assert_eq!(got, p);
        let stolen = hint.expect("last block must surrender the span");
        assert_eq!(stolen, span);

        // Claimed: active under the reserved owner until a frontend adopts.
        // Safety: Test code.
        let raw = unsafe { (*span.as_ptr()).owner_tag.load(Ordering::Relaxed) };
        assert!(owner_tag::is_active(raw));
        assert_eq!(owner_tag::owner(raw), owner_tag::CLAIMED_OWNER);
    }

    #[test]
    fn test_outstanding_blocks_forgo_the_hint() {
        let _guard = crate::alloc::TEST_MUTEX.read().unwrap();
        let class = size_to_class(64);
        let (_arena, _pool, span) = setup(class, 1);
        let blocks = BlockPool::new(4);

        // Two outstanding blocks, only one freed remotely: popping it must
        // not hand over the span, and the claim must be released.
        // Safety: Test code.
        let (p, _held) = unsafe {
            let hdr = &mut *span.as_ptr();
            (hdr.flist.pop().unwrap(), hdr.flist.pop().unwrap())
        };
        // Safety: Test code.
        unsafe {
            (*span.as_ptr())
                .owner_tag
                .store(owner_tag::pack(1, false), Ordering::Release);
        }
        blocks.free(p, class, 1);

        let (got, hint) = blocks.allocate(class, 2).unwrap();
        assert_eq!(got, p);
        assert!(hint.is_none());
        // Safety: Test code.
        let raw = unsafe { (*span.as_ptr()).owner_tag.load(Ordering::Relaxed) };
        assert!(!owner_tag::is_active(raw), "failed hint must release the claim");
        assert_eq!(owner_tag::owner(raw), 1);
    }

    #[test]
    fn test_block_links_do_not_corrupt_payload_boundaries() {
        let _guard = crate::alloc::TEST_MUTEX.read().unwrap();
        let class = size_to_class(64);
        let (_arena, _pool, span) = setup(class, 1);
        let blocks = BlockPool::new(2);
        let bs = block_size(class);

        // Fill a neighbouring block with a pattern, queue its neighbour,
        // and verify the pattern survives.
        // Safety: Test code.
        unsafe {
            let hdr = &mut *span.as_ptr();
            let keep = hdr.flist.pop().unwrap();
            let queue = hdr.flist.pop().unwrap();
            assert_eq!(keep.as_ptr() as usize - queue.as_ptr() as usize, bs);

            keep.as_ptr().write_bytes(0x77, bs);
            blocks.free(queue, class, 1);
            let (back, _) = blocks.allocate(class, 1).unwrap();
            assert_eq!(back, queue);

            for i in 0..bs {
                assert_eq!(keep.as_ptr().add(i).read(), 0x77);
            }
        }
    }
}
