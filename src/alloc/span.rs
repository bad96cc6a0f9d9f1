//! Span headers and the owner tag.
//!
//! A span is a contiguous region laid out as
//! `[SpanHeader | block₀ | block₁ | …]`, placed at a
//! `VIRTUAL_SPAN_SIZE`-aligned address so any interior pointer resolves to
//! its header with one mask.  The size class is fixed for the span's
//! lifetime as a span.
//!
//! The owner tag is the sole synchronization token between the owning
//! frontend and contenders: a single word packing
//! `owner_id << 1 | active`.  While the active bit is set, only the owner
//! touches the freelist; remote freers go through the block pool.  When
//! clear, the span is floating — the owner may reclaim it with a CAS
//! (provided the owner bits still match), and the block pool may claim it
//! for a stealing frontend.

use std::ptr::{NonNull, null_mut};

use super::freelist::Freelist;
use super::size_class::{
    self, SPAN_HEADER_RESERVED, VIRTUAL_SPAN_SIZE, block_size, blocks_per_span, first_block_offset,
};
use crate::sync::atomic::AtomicU64;

/// Owner-tag packing: 63 bits of owner id, 1 active bit.
pub(crate) mod owner_tag {
    /// Reserved owner id for spans transiently claimed by the block pool.
    /// No frontend carries this id, so a tag of `(CLAIMED_OWNER, active)`
    /// never matches any frontend's `me_active` — the active bit implies
    /// exclusivity only for the party that actually holds it.
    pub(crate) const CLAIMED_OWNER: u64 = u64::MAX >> 1;

    #[inline]
    pub(crate) fn pack(owner: u64, active: bool) -> u64 {
        (owner << 1) | active as u64
    }

    #[inline]
    pub(crate) fn owner(raw: u64) -> u64 {
        raw >> 1
    }

    #[inline]
    pub(crate) fn is_active(raw: u64) -> bool {
        raw & 1 == 1
    }
}

/// Span metadata.  Sits at offset 0 of each span; the block grid starts at
/// `first_block_offset(size_class)`.
#[repr(C, align(128))]
pub(crate) struct SpanHeader {
    /// Tagged-stack link word.  Must stay at offset 0: the span pool
    /// threads retired spans through it without touching the freelist.
    pub(crate) pool_link: usize,
    /// Local freelist.  Owner-only while the active bit is set.
    pub(crate) flist: Freelist,
    /// Cool-list links.  Owner-only.
    pub(crate) prev: *mut SpanHeader,
    pub(crate) next: *mut SpanHeader,
    /// `(span_base + first_block_offset) % block_size` — maps memalign'd
    /// interior pointers back to their block base.
    aligned_block_offset: u32,
    /// Block-pool shard for `(size_class, owner)`, fixed at adoption.
    pub(crate) remote_shard: u32,
    size_class: u8,
    /// Whether the block region is backed by physical pages.  Mutated only
    /// while the span is exclusively held (fresh, adopted, or pooled).
    committed: bool,
    /// `{ owner_id : 63, active : 1 }` — see [`owner_tag`].
    pub(crate) owner_tag: AtomicU64,
}

// Loom's tracked atomics inflate the header; the layout contract only
// matters for real builds, which never run under the model checker.
#[cfg(not(loom))]
const _: () = assert!(std::mem::size_of::<SpanHeader>() <= SPAN_HEADER_RESERVED);
const _: () = assert!(std::mem::offset_of!(SpanHeader, pool_link) == 0);

impl SpanHeader {
    /// Write a fresh header for a newly committed span.
    ///
    /// The span arrives unowned and inactive; adoption stamps the owner.
    ///
    /// # Safety
    /// - `base` must be `VIRTUAL_SPAN_SIZE`-aligned with at least
    ///   `span_size(class)` committed bytes, exclusively held by the caller.
    pub(crate) unsafe fn stamp(base: NonNull<u8>, class: usize) -> NonNull<SpanHeader> {
        debug_assert!((base.as_ptr() as usize).is_multiple_of(VIRTUAL_SPAN_SIZE));
        debug_assert!(class > 0 && class < size_class::NUM_CLASSES);

        let offset = (base.as_ptr() as usize + first_block_offset(class)) % block_size(class);
        let header = base.cast::<SpanHeader>();
        // Safety: base is exclusively held and large enough per contract.
        unsafe {
            header.as_ptr().write(SpanHeader {
                pool_link: 0,
                flist: Freelist::new(),
                prev: null_mut(),
                next: null_mut(),
                aligned_block_offset: offset as u32,
                remote_shard: 0,
                size_class: class as u8,
                committed: true,
                owner_tag: AtomicU64::new(owner_tag::pack(0, false)),
            });
        }
        header
    }

    /// Resolve the header for any pointer into a span.
    ///
    /// # Safety
    /// - `p` must point into a live span of this allocator.
    #[inline]
    pub(crate) unsafe fn from_object(p: NonNull<u8>) -> NonNull<SpanHeader> {
        let addr = p.as_ptr() as usize & !(VIRTUAL_SPAN_SIZE - 1);
        debug_assert!(addr != 0);
        // Safety: masking a pointer into a span yields its base.
        unsafe { NonNull::new_unchecked(addr as *mut SpanHeader) }
    }

    #[inline]
    pub(crate) fn size_class(&self) -> usize {
        self.size_class as usize
    }

    #[inline]
    pub(crate) fn is_committed(&self) -> bool {
        self.committed
    }

    #[inline]
    pub(crate) fn set_committed(&mut self, committed: bool) {
        self.committed = committed;
    }

    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        (self as *const SpanHeader as usize) as *mut u8
    }

    /// Address of the first block.
    #[inline]
    pub(crate) fn first_block(&self) -> NonNull<u8> {
        // Safety: the block grid starts inside the span, never at null.
        unsafe { NonNull::new_unchecked(self.base().add(first_block_offset(self.size_class()))) }
    }

    /// Map a possibly interior (memalign'd) pointer back to its block base.
    #[inline]
    pub(crate) fn canonicalize(&self, p: NonNull<u8>) -> NonNull<u8> {
        let bs = block_size(self.size_class());
        let addr = p.as_ptr() as usize;
        let off = (addr - self.aligned_block_offset as usize) % bs;
        // Safety: subtracting the intra-block offset stays inside the span.
        unsafe { NonNull::new_unchecked((addr - off) as *mut u8) }
    }

    /// Percent of blocks currently handed out.
    #[inline]
    pub(crate) fn utilization(&self) -> u32 {
        self.flist.utilization()
    }

    /// Rethread the freelist over the whole block range.
    ///
    /// # Safety
    /// - Caller must hold the span exclusively with the block region
    ///   committed and no block outstanding.
    pub(crate) unsafe fn rebuild_flist(&mut self) {
        let class = self.size_class();
        // Safety: per contract, the block range is committed and ours.
        unsafe {
            self.flist
                .init_range(self.first_block(), block_size(class), blocks_per_span(class));
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::super::size_class::span_size;
    use super::super::vm::{PlatformVmOps, VmOps};
    use super::*;
    use crate::sync::atomic::Ordering;

    /// A committed, VIRTUAL_SPAN_SIZE-aligned span slot for tests.
    struct TestSlot {
        raw: NonNull<u8>,
        raw_size: usize,
        base: NonNull<u8>,
    }

    impl TestSlot {
        fn new(class: usize) -> Self {
            let raw_size = VIRTUAL_SPAN_SIZE * 2;
            // Safety: Test code.
            let raw = unsafe { PlatformVmOps::reserve(raw_size).unwrap() };
            let aligned =
                (raw.as_ptr() as usize).next_multiple_of(VIRTUAL_SPAN_SIZE) as *mut u8;
            let base = NonNull::new(aligned).unwrap();
            // Safety: Test code.
            unsafe { PlatformVmOps::commit(base, span_size(class)).unwrap() };
            Self {
                raw,
                raw_size,
                base,
            }
        }
    }

    impl Drop for TestSlot {
        fn drop(&mut self) {
            // Safety: Test code.
            unsafe { drop(PlatformVmOps::release(self.raw, self.raw_size)) };
        }
    }

    #[test]
    fn test_owner_tag_packing() {
        let raw = owner_tag::pack(7, true);
        assert_eq!(owner_tag::owner(raw), 7);
        assert!(owner_tag::is_active(raw));

        let floated = owner_tag::pack(7, false);
        assert_eq!(floated, raw & !1);
        assert_eq!(owner_tag::owner(floated), 7);
        assert!(!owner_tag::is_active(floated));

        assert_ne!(
            owner_tag::pack(owner_tag::CLAIMED_OWNER, true),
            owner_tag::pack(7, true),
        );
    }

    #[test]
    fn test_stamp_and_from_object() {
        let class = super::super::size_class::size_to_class(64);
        let slot = TestSlot::new(class);
        // Safety: Test code.
        let header = unsafe { SpanHeader::stamp(slot.base, class) };
        // Safety: Test code.
        let hdr = unsafe { &mut *header.as_ptr() };

        assert_eq!(hdr.size_class(), class);
        assert!(hdr.is_committed());
        assert!(!owner_tag::is_active(hdr.owner_tag.load(Ordering::Relaxed)));

        // Safety: Test code.
        unsafe { hdr.rebuild_flist() };
        assert!(hdr.flist.full());
        assert_eq!(hdr.flist.capacity() as usize, blocks_per_span(class));
        assert_eq!(hdr.utilization(), 0);

        // Every block of the span must resolve back to this header.
        let bs = block_size(class);
        for k in [0usize, 1, blocks_per_span(class) - 1] {
            // Safety: Test code.
            let block = unsafe {
                NonNull::new(hdr.first_block().as_ptr().add(k * bs)).unwrap()
            };
            // Safety: Test code.
            assert_eq!(unsafe { SpanHeader::from_object(block) }, header);
        }
    }

    #[test]
    fn test_canonicalize_interior_pointers() {
        let class = super::super::size_class::size_to_class(48);
        let slot = TestSlot::new(class);
        // Safety: Test code.
        let header = unsafe { SpanHeader::stamp(slot.base, class) };
        // Safety: Test code.
        let hdr = unsafe { &*header.as_ptr() };

        let bs = block_size(class);
        for k in [0usize, 3, blocks_per_span(class) - 1] {
            // Safety: Test code.
            let base = unsafe { NonNull::new(hdr.first_block().as_ptr().add(k * bs)).unwrap() };
            for delta in [0usize, 1, bs / 2, bs - 1] {
                // Safety: Test code.
                let interior = unsafe { NonNull::new(base.as_ptr().add(delta)).unwrap() };
                assert_eq!(hdr.canonicalize(interior), base, "k={k} delta={delta}");
            }
        }
    }
}
