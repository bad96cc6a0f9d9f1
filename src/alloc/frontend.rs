//! Per-core frontend allocator: the span lifecycle state machine.
//!
//! Each frontend owns, per size class, at most one hot span (the fast
//! allocation path pops its freelist), a doubly-linked list of cool spans
//! (owned, active, highly utilized), and a list of slow spans (owned but
//! floated, remembered for reactivation).  Spans circulate
//! hot → cool → slow/floating → reclaimed or retired; the owner tag is the
//! only synchronization point with other frontends.
//!
//! All threads of a core share one frontend, so every per-class operation
//! runs under that class's own mutex.  The hot paths touching shared state
//! (block pool, span pool, owner tags) stay lock-free.

use std::ptr::{NonNull, null_mut};

use super::arena::Arena;
use super::block_pool::BlockPool;
use super::core_buffer::num_cpus;
use super::size_class::{NUM_CLASSES, size_to_class};
use super::span::{SpanHeader, owner_tag};
use super::span_pool::SpanPool;
use super::stats;
use super::typed_alloc::TypedAllocator;
use crate::sync::Mutex;
use crate::sync::atomic::Ordering;

/// Everything a frontend needs from the backends, threaded through calls
/// so frontends stay free of back-references.
pub(crate) struct Backends<'a> {
    pub(crate) arena: &'a Arena,
    pub(crate) span_pool: &'a SpanPool,
    pub(crate) block_pool: &'a BlockPool,
    pub(crate) node_alloc: &'a TypedAllocator<ListNode>,
    pub(crate) reuse_threshold: u32,
    pub(crate) local_reuse_threshold: u32,
    pub(crate) reuse_slow_spans: bool,
}

/// Link node for the slow-span list.  Allocated from the typed internal
/// allocator; spans are referenced, never owned, by these nodes.
pub(crate) struct ListNode {
    next: *mut ListNode,
    prev: *mut ListNode,
    span: *mut SpanHeader,
}

struct ClassState {
    hot: *mut SpanHeader,
    cool: *mut SpanHeader,
    slow: *mut ListNode,
}

// Safety: ClassState is only reached through its class mutex.
unsafe impl Send for ClassState {}

pub(crate) struct CoreAllocator {
    id: u64,
    me_active: u64,
    me_inactive: u64,
    classes: [Mutex<ClassState>; NUM_CLASSES],
}

// Safety: raw pointers inside are guarded by the per-class mutexes; cross-
// frontend traffic goes through atomics.
unsafe impl Send for CoreAllocator {}
// Safety: see above.
unsafe impl Sync for CoreAllocator {}

impl CoreAllocator {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            me_active: owner_tag::pack(id, true),
            me_inactive: owner_tag::pack(id, false),
            classes: std::array::from_fn(|_| {
                Mutex::new(ClassState {
                    hot: null_mut(),
                    cool: null_mut(),
                    slow: null_mut(),
                })
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Serve an allocation request.  `None` iff the size maps to class 0.
    pub(crate) fn allocate(&self, cx: &Backends<'_>, size: usize) -> Option<NonNull<u8>> {
        let sc = size_to_class(size);
        if sc == 0 {
            return None;
        }
        let mut st = self.classes[sc]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Some(self.allocate_in_class(cx, &mut st, sc))
    }

    fn allocate_in_class(&self, cx: &Backends<'_>, st: &mut ClassState, sc: usize) -> NonNull<u8> {
        loop {
            if !st.hot.is_null() {
                // Safety: the hot span is ours under the class lock.
                if let Some(p) = unsafe { (*st.hot).flist.pop() } {
                    return p;
                }
            }
            if let Some(p) = self.allocate_no_span(cx, st, sc) {
                return p;
            }
            // Refilled; retry the hot-path pop.
        }
    }

    /// The hot span is missing or exhausted: steal a block, or refill.
    fn allocate_no_span(
        &self,
        cx: &Backends<'_>,
        st: &mut ClassState,
        sc: usize,
    ) -> Option<NonNull<u8>> {
        if let Some((p, hint)) = cx.block_pool.allocate(sc, self.id) {
            if let Some(span) = hint {
                // The pool claimed the span for us; adopt it under our own
                // tag while we provably hold it exclusively.  The span may
                // be one of our own floats coming home, so drop any stale
                // slow-list node for it.
                // Safety: the claim confers exclusivity.
                unsafe {
                    let hdr = span.as_ptr();
                    self.remove_slow(cx, st, hdr);
                    (*hdr).remote_shard =
                        (self.id as usize & (cx.block_pool.shard_count() - 1)) as u32;
                    (*hdr).owner_tag.store(self.me_active, Ordering::Release);
                    self.set_active_span(st, hdr);
                }
            } else {
                // Safety: the block belongs to a live span.
                let hdr = unsafe { SpanHeader::from_object(p) };
                // Safety: only the atomic tag is read.
                let raw = unsafe { (*hdr.as_ptr()).owner_tag.load(Ordering::Relaxed) };
                let cpus = num_cpus();
                if owner_tag::owner(raw) % cpus != self.id % cpus {
                    // The block came from another residency class; pull a
                    // span of our own so we stop leaning on theirs.
                    self.refill(cx, st, sc);
                }
            }
            return Some(p);
        }

        self.refill(cx, st, sc);
        None
    }

    /// Install a usable hot span: reactivate a slow span if possible,
    /// else fetch one from the span pool.
    fn refill(&self, cx: &Backends<'_>, st: &mut ClassState, sc: usize) {
        stats::REFILLS.add(1);

        if cx.reuse_slow_spans {
            // Walk and drop slow entries until one can be reclaimed.  Spans
            // that slipped away (stolen or re-owned) stay reachable through
            // the block pool; their node is simply discarded.
            while !st.slow.is_null() {
                let node = st.slow;
                // Safety: slow nodes are ours under the class lock.
                unsafe {
                    st.slow = (*node).next;
                    if !st.slow.is_null() {
                        (*st.slow).prev = null_mut();
                    }
                }
                // Safety: node detached above.
                let span = unsafe { (*node).span };
                // Safety: node is dead after detach.
                unsafe { cx.node_alloc.delete(NonNull::new_unchecked(node)) };

                debug_assert!(!span.is_null());
                // Safety: only the atomic tag is touched until the CAS wins.
                let claimed = unsafe {
                    let tag = &(*span).owner_tag;
                    owner_tag::owner(tag.load(Ordering::Relaxed)) == self.id
                        && (*span).size_class() == sc
                        && tag
                            .compare_exchange(
                                self.me_inactive,
                                self.me_active,
                                Ordering::AcqRel,
                                Ordering::Relaxed,
                            )
                            .is_ok()
                };
                if claimed {
                    self.set_active_span(st, span);
                    return;
                }
            }
        }

        let (span, reusable) = cx.span_pool.get(cx.arena, sc, self.id);
        // Safety: a span from the pool is exclusively ours until published.
        unsafe {
            let hdr = span.as_ptr();
            (*hdr).remote_shard = (self.id as usize & (cx.block_pool.shard_count() - 1)) as u32;
            if !reusable {
                (*hdr).rebuild_flist();
            }
            (*hdr).owner_tag.store(self.me_active, Ordering::Release);
            self.set_active_span(st, hdr);
        }
    }

    /// Make `span` the hot span, demoting the current hot span to the cool
    /// list.  Never touches freelist contents.
    fn set_active_span(&self, st: &mut ClassState, span: *mut SpanHeader) {
        if !st.hot.is_null() {
            Self::add_cool(st, st.hot);
        }
        st.hot = span;
    }

    fn add_cool(st: &mut ClassState, span: *mut SpanHeader) {
        // Safety: the span is ours under the class lock.
        unsafe {
            (*span).prev = null_mut();
            (*span).next = st.cool;
            if !st.cool.is_null() {
                (*st.cool).prev = span;
            }
        }
        st.cool = span;
    }

    fn remove_cool(st: &mut ClassState, span: *mut SpanHeader) {
        // Safety: the span is ours under the class lock.
        unsafe {
            if !(*span).prev.is_null() {
                (*(*span).prev).next = (*span).next;
            }
            if !(*span).next.is_null() {
                (*(*span).next).prev = (*span).prev;
            }
            if st.cool == span {
                st.cool = (*span).next;
            }
            (*span).prev = null_mut();
            (*span).next = null_mut();
        }
    }

    fn add_slow(&self, cx: &Backends<'_>, st: &mut ClassState, span: *mut SpanHeader) {
        if !cx.reuse_slow_spans {
            return;
        }
        let node = cx.node_alloc.allocate(cx.arena).as_ptr();
        // Safety: fresh node; list is ours under the class lock.
        unsafe {
            (*node).span = span;
            (*node).prev = null_mut();
            (*node).next = st.slow;
            if !st.slow.is_null() {
                (*st.slow).prev = node;
            }
        }
        st.slow = node;
    }

    /// Drop the slow-list entry for `span`, if one exists.  Absence is
    /// legal: floats from `clear_spans` leave no node behind.
    fn remove_slow(&self, cx: &Backends<'_>, st: &mut ClassState, span: *mut SpanHeader) {
        if !cx.reuse_slow_spans {
            return;
        }
        let mut node = st.slow;
        while !node.is_null() {
            // Safety: slow nodes are ours under the class lock.
            unsafe {
                if (*node).span == span {
                    if (*node).prev.is_null() {
                        st.slow = (*node).next;
                    } else {
                        (*(*node).prev).next = (*node).next;
                    }
                    if !(*node).next.is_null() {
                        (*(*node).next).prev = (*node).prev;
                    }
                    cx.node_alloc.delete(NonNull::new_unchecked(node));
                    return;
                }
                node = (*node).next;
            }
        }
    }

    /// Free a block.  The span header is resolved by the caller (address
    /// masking) so the class lock can be taken before any state is read.
    pub(crate) fn free(&self, cx: &Backends<'_>, p: NonNull<u8>) {
        // Safety: p was produced by this allocator.
        let header = unsafe { SpanHeader::from_object(p) };
        // Safety: the class byte is immutable for the span's lifetime.
        let sc = unsafe { (*header.as_ptr()).size_class() };
        let mut st = self.classes[sc]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.free_in_class(cx, &mut st, sc, p, header.as_ptr());
    }

    fn free_in_class(
        &self,
        cx: &Backends<'_>,
        st: &mut ClassState,
        sc: usize,
        p: NonNull<u8>,
        hdr: *mut SpanHeader,
    ) {
        // Canonicalize memalign'd interior pointers to the block base.
        // Safety: aligned_block_offset is immutable span metadata.
        let p = unsafe { (*hdr).canonicalize(p) };

        // Safety: only the atomic tag is read before ownership is settled.
        let raw = unsafe { (*hdr).owner_tag.load(Ordering::Acquire) };

        if raw == self.me_active {
            // Local free into a span we actively own (hot or cool).
            // Safety: active + our owner bits == exclusive freelist access.
            unsafe {
                (*hdr).flist.push(p);
                if hdr != st.hot && (*hdr).utilization() < cx.reuse_threshold {
                    Self::remove_cool(st, hdr);
                    if (*hdr).flist.full() {
                        self.release_span(cx, hdr, sc);
                    } else {
                        self.add_slow(cx, st, hdr);
                        // Floating: stealable through the block pool from
                        // here on.  The release store publishes the push.
                        (*hdr).owner_tag.store(self.me_inactive, Ordering::Release);
                    }
                }
            }
            return;
        }

        if raw == self.me_inactive {
            // We floated this span earlier; try to take it back.
            // Safety: only the atomic tag is touched until the CAS wins.
            let reclaimed = unsafe {
                (*hdr)
                    .owner_tag
                    .compare_exchange(
                        self.me_inactive,
                        self.me_active,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            };
            if reclaimed {
                // Safety: the CAS restored exclusive ownership.
                unsafe {
                    (*hdr).flist.push(p);

                    if !st.hot.is_null()
                        && (*st.hot).utilization() > cx.local_reuse_threshold
                    {
                        // The hot span is nearly exhausted: promote the
                        // reclaimed span instead of letting it float again.
                        self.remove_slow(cx, st, hdr);
                        self.set_active_span(st, hdr);
                        return;
                    }

                    if (*hdr).flist.full() {
                        self.remove_slow(cx, st, hdr);
                        self.release_span(cx, hdr, sc);
                        return;
                    }

                    // Float again; the release store publishes the push.
                    (*hdr).owner_tag.store(self.me_inactive, Ordering::Release);
                }
                return;
            }
            // Stolen between snapshot and CAS: fall through to remote.
        }

        // Remote free: the span belongs to someone else (or to nobody,
        // claimed away mid-flight).  Queue the block for its owner.
        // Safety: remote_shard is immutable while the span is not ours.
        let shard = unsafe { (*hdr).remote_shard } as usize;
        cx.block_pool.free(p, sc, shard);
    }

    /// Hand a fully-free span back to the span pool.
    ///
    /// # Safety
    /// - Caller must hold the span exclusively with a full freelist and
    ///   have unlinked it from all frontend lists.
    unsafe fn release_span(&self, cx: &Backends<'_>, hdr: *mut SpanHeader, sc: usize) {
        // Safety: exclusivity per contract.
        unsafe {
            cx.span_pool
                .put(cx.arena, NonNull::new_unchecked(hdr), sc, self.id);
        }
    }

    /// Give up every span: release the full ones, float the rest
    /// (stealable via the block pool).  Remotely-freed blocks stay
    /// reachable, so shutdown loses no memory.  The frontend itself stays
    /// alive and can be re-bound later.
    pub(crate) fn clear_spans(&self, cx: &Backends<'_>) {
        for sc in 1..NUM_CLASSES {
            let mut st = self.classes[sc]
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            let hot = st.hot;
            st.hot = null_mut();
            if !hot.is_null() {
                // Safety: the hot span is ours under the class lock.
                unsafe {
                    if (*hot).flist.full() {
                        self.release_span(cx, hot, sc);
                    } else {
                        (*hot).owner_tag.store(self.me_inactive, Ordering::Release);
                    }
                }
            }

            let mut cur = st.cool;
            st.cool = null_mut();
            while !cur.is_null() {
                // Safety: cool spans are ours under the class lock.
                unsafe {
                    let span = cur;
                    cur = (*span).next;
                    (*span).prev = null_mut();
                    (*span).next = null_mut();
                    // The release store publishes the link clears and any
                    // freelist state before the span becomes stealable.
                    (*span).owner_tag.store(self.me_inactive, Ordering::Release);
                }
            }

            let mut node = st.slow;
            st.slow = null_mut();
            while !node.is_null() {
                // Safety: slow nodes are ours under the class lock.
                unsafe {
                    let dead = node;
                    node = (*dead).next;
                    cx.node_alloc.delete(NonNull::new_unchecked(dead));
                }
            }
        }
    }

    /// Test-only visibility into the per-class state.
    #[cfg(test)]
    pub(crate) fn with_class_state<R>(
        &self,
        sc: usize,
        f: impl FnOnce(&ClassStateView) -> R,
    ) -> R {
        let st = self.classes[sc]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut cool_len = 0;
        let mut cur = st.cool;
        while !cur.is_null() {
            cool_len += 1;
            // Safety: cool spans are ours under the class lock.
            cur = unsafe { (*cur).next };
        }
        let mut slow_len = 0;
        let mut node = st.slow;
        while !node.is_null() {
            slow_len += 1;
            // Safety: slow nodes are ours under the class lock.
            node = unsafe { (*node).next };
        }
        f(&ClassStateView {
            hot: st.hot,
            cool_len,
            slow_len,
        })
    }
}

#[cfg(test)]
pub(crate) struct ClassStateView {
    pub(crate) hot: *mut SpanHeader,
    pub(crate) cool_len: usize,
    pub(crate) slow_len: usize,
}
