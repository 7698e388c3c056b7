//! The kernel heap instance and its public entry points.
//!
//! Everything goes through one [`spin::Mutex`] around the [`Heap`], both the
//! `kmalloc` family and Rust's `alloc` crate via [`GlobalAlloc`].

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use spin::{Mutex, MutexGuard};
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, Size4KiB};

use crate::{error, info};

use super::{
    block::WORD_SIZE,
    heap::{Heap, HeapError, HeapStats},
    paging::{KernelFrames, KernelPageTable, PageMapper},
};

/// The kernel heap, backed by the global frame allocator and page table.
#[cfg_attr(not(test), global_allocator)]
pub static KERNEL_HEAP: LockedHeap<KernelFrames, KernelPageTable> =
    LockedHeap::new(Heap::new(KernelFrames, KernelPageTable));

/// A [`Heap`] behind a spinlock.
pub struct LockedHeap<F, M> {
    inner: Mutex<Heap<F, M>>,
}

impl<F, M> LockedHeap<F, M> {
    pub const fn new(heap: Heap<F, M>) -> Self {
        Self {
            inner: Mutex::new(heap),
        }
    }

    /// Takes the heap lock.
    pub fn lock(&self) -> MutexGuard<'_, Heap<F, M>> {
        self.inner.lock()
    }

    /// Takes the heap lock if nobody holds it.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Heap<F, M>>> {
        self.inner.try_lock()
    }

    /// Whether some caller is inside the heap right now.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats()
    }
}

unsafe impl<F, M> GlobalAlloc for LockedHeap<F, M>
where
    F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB> + Send,
    M: PageMapper + Send,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = self.inner.lock();
        let ptr = if layout.align() <= WORD_SIZE {
            heap.allocate(layout.size())
        } else {
            heap.aligned_allocate(layout.size(), layout.align())
        };
        ptr.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() {
            unsafe { ptr.write_bytes(0, layout.size()) };
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Err(err) = self.inner.lock().free(ptr) {
            error!(
                "dealloc of {:#x} ({} bytes) rejected: {}",
                ptr as usize,
                layout.size(),
                err
            );
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= WORD_SIZE {
            return self
                .inner
                .lock()
                .reallocate(ptr, new_size)
                .map_or(ptr::null_mut(), NonNull::as_ptr);
        }

        // The heap only keeps word alignment when moving a block, so over-aligned
        // layouts always move to a fresh aligned block.
        let mut heap = self.inner.lock();
        let Some(new) = heap.aligned_allocate(new_size, layout.align()) else {
            return ptr::null_mut();
        };
        unsafe { ptr::copy_nonoverlapping(ptr, new.as_ptr(), layout.size().min(new_size)) };
        if let Err(err) = heap.free(ptr) {
            error!("realloc of {:#x} could not release the old block: {}", ptr as usize, err);
        }
        new.as_ptr()
    }
}

/// Initializes the kernel heap at `start` with `initial_size` bytes mapped.
pub fn heap_init(start: usize, initial_size: usize) -> Result<(), HeapError> {
    KERNEL_HEAP.lock().initialize(start, initial_size)?;
    info!("kernel heap ready at {:#x}: {}", start, KERNEL_HEAP.stats());
    Ok(())
}

/// Allocates `size` bytes from the kernel heap.
pub fn kmalloc(size: usize) -> Option<NonNull<u8>> {
    KERNEL_HEAP.lock().allocate(size)
}

/// Allocates `size` zeroed bytes from the kernel heap.
pub fn kzalloc(size: usize) -> Option<NonNull<u8>> {
    KERNEL_HEAP.lock().zeroed_allocate(size)
}

/// Allocates `size` bytes aligned to `align` (a power of two) from the kernel heap.
pub fn kmalloc_aligned(size: usize, align: usize) -> Option<NonNull<u8>> {
    KERNEL_HEAP.lock().aligned_allocate(size, align)
}

/// Returns an allocation to the kernel heap.
pub fn kfree(ptr: *mut u8) -> Result<(), HeapError> {
    KERNEL_HEAP.lock().free(ptr)
}

/// Resizes a kernel heap allocation, moving it if needed.
pub fn krealloc(ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
    KERNEL_HEAP.lock().reallocate(ptr, new_size)
}

pub fn heap_stats() -> HeapStats {
    KERNEL_HEAP.stats()
}
