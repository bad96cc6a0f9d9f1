//! Spinlocked free-list allocator for the allocator's own metadata
//! (slow-list link nodes, core frontends).  Bulk-refills from the arena's
//! metadata region in page-sized increments.  Configuration misuse is
//! fatal at construction.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr::{NonNull, null_mut};

use super::arena::Arena;
use super::size_class::round_up;
use super::vm::{PlatformVmOps, VmOps};
use crate::sync::atomic::{AtomicBool, Ordering};
use crate::sync::hint;

pub(crate) struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub(crate) const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    #[inline]
    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

struct FreeNode {
    next: *mut FreeNode,
}

pub(crate) struct TypedAllocator<T> {
    lock: SpinLock,
    head: UnsafeCell<*mut FreeNode>,
    /// Refill increment; a page multiple.
    increment: usize,
    /// Object stride: size padded to alignment, at least one word.
    stride: usize,
    _marker: PhantomData<*mut T>,
}

// Safety: the spinlock guards the freelist head; handed-out pointers are
// the caller's responsibility.
unsafe impl<T> Send for TypedAllocator<T> {}
// Safety: see above.
unsafe impl<T> Sync for TypedAllocator<T> {}

impl<T> TypedAllocator<T> {
    /// # Panics
    ///
    /// Misconfiguration is fatal: the alignment of `T` must divide the
    /// page size and a padded `T` must fit the increment.
    pub(crate) fn new(increment: usize) -> Self {
        let page = PlatformVmOps::page_size();
        let align = std::mem::align_of::<T>();
        assert!(
            page.is_multiple_of(align),
            "TypedAllocator: alignment {align} must be a divisor of the page size {page}",
        );

        let stride = round_up(
            std::mem::size_of::<T>().max(std::mem::size_of::<FreeNode>()),
            align.max(std::mem::align_of::<FreeNode>()),
        );
        let increment = round_up(increment.max(page), page);
        assert!(
            stride <= increment,
            "TypedAllocator: type of stride {stride} is too large for increment {increment}",
        );

        Self {
            lock: SpinLock::new(),
            head: UnsafeCell::new(null_mut()),
            increment,
            stride,
            _marker: PhantomData,
        }
    }

    /// Pop a free object, refilling from the arena when dry.  The returned
    /// memory is uninitialized.
    pub(crate) fn allocate(&self, arena: &Arena) -> NonNull<T> {
        self.lock.lock();
        // Safety: the spinlock serializes head access.
        let head = unsafe { &mut *self.head.get() };

        let result = if head.is_null() {
            self.refill(arena, head)
        } else {
            let node = *head;
            // Safety: nodes on the list are valid free objects.
            unsafe { *head = (*node).next };
            node.cast::<u8>()
        };
        self.lock.unlock();

        // Safety: refill and the freelist never produce null.
        unsafe { NonNull::new_unchecked(result.cast::<T>()) }
    }

    /// Return an object to the freelist.
    ///
    /// # Safety
    /// - `ptr` must come from `allocate` on this instance and must not be
    ///   referenced afterwards.
    pub(crate) unsafe fn delete(&self, ptr: NonNull<T>) {
        self.lock.lock();
        // Safety: the spinlock serializes head access; the object is dead.
        unsafe {
            let head = &mut *self.head.get();
            let node = ptr.as_ptr().cast::<FreeNode>();
            (*node).next = *head;
            *head = node;
        }
        self.lock.unlock();
    }

    /// Carve a fresh increment: the first object is returned, the rest are
    /// threaded onto the freelist.  Caller holds the lock.
    fn refill(&self, arena: &Arena, head: &mut *mut FreeNode) -> *mut u8 {
        let base = arena.meta_allocate(self.increment);
        let count = self.increment / self.stride;
        let mut cursor = base.as_ptr();
        // Safety: the increment is fresh committed memory.
        unsafe {
            cursor = cursor.add(self.stride);
            for _ in 1..count {
                let node = cursor.cast::<FreeNode>();
                (*node).next = *head;
                *head = node;
                cursor = cursor.add(self.stride);
            }
        }
        base.as_ptr()
    }
}
