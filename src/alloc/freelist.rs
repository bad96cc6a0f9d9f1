//! Unsynchronized intrusive freelist threading the free blocks of one span.
//!
//! Only the span's owning frontend touches this structure while the span is
//! active; publication to other threads happens exclusively through the
//! owner tag (release store / acquire CAS).  The first machine word of a
//! free block holds the next link.

use std::ptr::{NonNull, null_mut};

#[repr(C)]
pub(crate) struct FreeBlock {
    next: *mut FreeBlock,
}

pub(crate) struct Freelist {
    head: *mut FreeBlock,
    len: u32,
    cap: u32,
    #[cfg(debug_assertions)]
    lower: usize,
    #[cfg(debug_assertions)]
    upper: usize,
}

impl Freelist {
    /// An empty list with zero capacity; real state arrives via
    /// [`init_range`](Self::init_range).
    pub(crate) const fn new() -> Self {
        Self {
            head: null_mut(),
            len: 0,
            cap: 0,
            #[cfg(debug_assertions)]
            lower: 0,
            #[cfg(debug_assertions)]
            upper: 0,
        }
    }

    /// Thread `count` blocks starting at `base`, `stride` bytes apart, into
    /// a LIFO chain.  Afterwards the list is full: `len == cap == count`.
    ///
    /// # Safety
    /// - `[base, base + stride * count)` must be committed memory owned by
    ///   the caller and not referenced by anything else.
    pub(crate) unsafe fn init_range(&mut self, base: NonNull<u8>, stride: usize, count: usize) {
        debug_assert!(stride >= std::mem::size_of::<*mut FreeBlock>());
        let count32 = u32::try_from(count).expect("span block count exceeds u32");
        self.len = count32;
        self.cap = count32;
        self.head = null_mut();
        #[cfg(debug_assertions)]
        {
            self.lower = base.as_ptr() as usize;
            self.upper = base.as_ptr() as usize + stride * count;
        }
        let mut cursor = base.as_ptr();
        for _ in 0..count {
            // Inlined push: write the old head into the block's first word.
            let block = cursor.cast::<FreeBlock>();
            // Safety: cursor stays within the caller's range.
            unsafe {
                (*block).next = self.head;
                self.head = block;
                cursor = cursor.add(stride);
            }
        }
    }

    /// Prepend a block.
    ///
    /// # Safety
    /// - `p` must be a block of this span, not currently on the list.
    #[inline]
    pub(crate) unsafe fn push(&mut self, p: NonNull<u8>) {
        #[cfg(debug_assertions)]
        {
            let addr = p.as_ptr() as usize;
            debug_assert!(
                addr >= self.lower && addr < self.upper,
                "freelist push of {p:p} outside span block range [{:x}, {:x})",
                self.lower,
                self.upper
            );
            debug_assert!(
                self.len < self.cap,
                "freelist overflow pushing {p:p} (double free?)"
            );
        }
        let block = p.as_ptr().cast::<FreeBlock>();
        // Safety: p points at a free block; its first word is ours.
        unsafe {
            (*block).next = self.head;
        }
        self.head = block;
        self.len += 1;
    }

    /// Pop the most recently freed block.
    #[inline]
    pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
        let block = self.head;
        if block.is_null() {
            return None;
        }
        #[cfg(debug_assertions)]
        {
            let addr = block as usize;
            debug_assert!(
                addr >= self.lower && addr < self.upper,
                "freelist head {block:p} outside span block range [{:x}, {:x})",
                self.lower,
                self.upper
            );
        }
        // Safety: head is a valid free block while on the list.
        unsafe {
            self.head = (*block).next;
        }
        self.len -= 1;
        NonNull::new(block.cast::<u8>())
    }

    #[inline]
    pub(crate) fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.cap
    }

    #[inline]
    pub(crate) fn empty(&self) -> bool {
        self.head.is_null()
    }

    /// Every block of the span is free.
    #[inline]
    pub(crate) fn full(&self) -> bool {
        self.len == self.cap
    }

    /// Percent of blocks currently handed out.
    #[inline]
    pub(crate) fn utilization(&self) -> u32 {
        100 - (self.len * 100 / self.cap)
    }
}
