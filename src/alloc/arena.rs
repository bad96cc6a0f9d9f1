//! Span-aligned virtual arena.
//!
//! One reservation, carved once at construction:
//! `[pad | span region | metadata region]`.  The span region hands out
//! `VIRTUAL_SPAN_SIZE`-aligned slots by atomic bump — address space only;
//! the span pool commits the real span prefix of each slot.  The metadata
//! region feeds the typed internal allocators in committed page-multiple
//! increments.  Nothing is ever handed back: retired spans live in the
//! span pool, and the whole reservation is released on drop.

use std::ptr::NonNull;

use super::size_class::{VIRTUAL_SPAN_SIZE, round_up};
use super::stats;
use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::Mutex;
use crate::sync::atomic::{AtomicUsize, Ordering};

struct MetaBump {
    next: usize,
    committed: usize,
}

pub(crate) struct Arena {
    original: NonNull<u8>,
    total_reserved: usize,
    /// VIRTUAL_SPAN_SIZE-aligned start of the span region.
    base: NonNull<u8>,
    span_region: usize,
    next_span: AtomicUsize,
    meta_base: NonNull<u8>,
    meta_region: usize,
    meta: Mutex<MetaBump>,
}

// Safety: Arena owns the reservation; interior mutability is atomics and a
// mutex.
unsafe impl Send for Arena {}
// Safety: see above.
unsafe impl Sync for Arena {}

impl Arena {
    pub(crate) fn new(span_region: usize, meta_region: usize) -> Result<Self, VmError> {
        let span_region = round_up(span_region.max(VIRTUAL_SPAN_SIZE), VIRTUAL_SPAN_SIZE);
        let meta_region = round_up(meta_region.max(PlatformVmOps::page_size()), VIRTUAL_SPAN_SIZE);
        let total_reserved = span_region
            .checked_add(meta_region)
            .and_then(|v| v.checked_add(VIRTUAL_SPAN_SIZE))
            .ok_or_else(|| {
                VmError::InitializationFailed("arena reservation size overflow".to_string())
            })?;

        // Safety: FFI call to reserve memory.
        let original = unsafe { PlatformVmOps::reserve(total_reserved)? };

        let aligned = (original.as_ptr() as usize).next_multiple_of(VIRTUAL_SPAN_SIZE);
        // Safety: alignment padding stays within the over-reservation.
        let base = unsafe { NonNull::new_unchecked(aligned as *mut u8) };
        // Safety: span_region bytes past base are within the reservation.
        let meta_base = unsafe { NonNull::new_unchecked(base.as_ptr().add(span_region)) };

        stats::TOTAL_RESERVED.add(total_reserved);

        Ok(Self {
            original,
            total_reserved,
            base,
            span_region,
            next_span: AtomicUsize::new(0),
            meta_base,
            meta_region,
            meta: Mutex::new(MetaBump {
                next: 0,
                committed: 0,
            }),
        })
    }

    /// Hand out the next span-aligned slot.  Address space only — the
    /// caller commits what it needs.
    ///
    /// # Panics
    ///
    /// Arena exhaustion is fatal by contract.
    pub(crate) fn span_slot(&self) -> NonNull<u8> {
        let offset = self.next_span.fetch_add(VIRTUAL_SPAN_SIZE, Ordering::Relaxed);
        assert!(
            offset + VIRTUAL_SPAN_SIZE <= self.span_region,
            "span arena exhausted ({} spans handed out)",
            offset / VIRTUAL_SPAN_SIZE,
        );
        // Safety: offset is within the span region.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Bump-allocate committed metadata memory.  `bytes` must be a page
    /// multiple (typed allocators refill in page increments).
    ///
    /// # Panics
    ///
    /// Metadata exhaustion and commit failure are fatal by contract.
    pub(crate) fn meta_allocate(&self, bytes: usize) -> NonNull<u8> {
        let page = PlatformVmOps::page_size();
        debug_assert!(bytes.is_multiple_of(page), "metadata increment {bytes} not page-sized");

        let mut bump = self
            .meta
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let offset = bump.next;
        let end = offset
            .checked_add(bytes)
            .filter(|&e| e <= self.meta_region)
            .unwrap_or_else(|| panic!("arena metadata region exhausted at {offset} bytes"));
        bump.next = end;

        if end > bump.committed {
            let grow = round_up(end - bump.committed, page);
            // Safety: the commit range is inside the metadata region.
            let at = unsafe {
                NonNull::new_unchecked(self.meta_base.as_ptr().add(bump.committed))
            };
            // Safety: FFI call to commit memory.
            if let Err(e) = unsafe { PlatformVmOps::commit(at, grow) } {
                panic!("arena metadata commit failed: {e}");
            }
            bump.committed += grow;
            stats::TOTAL_COMMITTED.add(grow);
        }

        // Safety: offset is within the metadata region.
        unsafe { NonNull::new_unchecked(self.meta_base.as_ptr().add(offset)) }
    }

    /// Whether `ptr` lies inside the span region.
    pub(crate) fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.span_region
    }

    /// Slot index of a span base, for debug bookkeeping.
    pub(crate) fn span_index(&self, span_base: NonNull<u8>) -> usize {
        debug_assert!(self.contains(span_base));
        (span_base.as_ptr() as usize - self.base.as_ptr() as usize) / VIRTUAL_SPAN_SIZE
    }

    /// Total slots the span region can hand out.
    pub(crate) fn span_capacity(&self) -> usize {
        self.span_region / VIRTUAL_SPAN_SIZE
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let committed = self
            .meta
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .committed;
        // Safety: dropping the arena; the reservation is ours to release.
        unsafe {
            drop(PlatformVmOps::release(self.original, self.total_reserved));
        }
        stats::sub_saturating(&stats::TOTAL_RESERVED, self.total_reserved);
        stats::sub_saturating(&stats::TOTAL_COMMITTED, committed);
    }
}
