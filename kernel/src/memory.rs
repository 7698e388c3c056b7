//! Memory management.
//!
//! This module provides:
//! - The kernel heap (`kmalloc` and friends, and Rust's global allocator)
//! - Frame allocation from the bootloader memory map
//! - Page table management

pub mod alloc;
pub mod block;
mod freelist;
pub mod heap;
pub mod paging;


pub use self::alloc::{
    KERNEL_HEAP, LockedHeap, heap_init, heap_stats, kfree, kmalloc, kmalloc_aligned, krealloc,
    kzalloc,
};
pub use heap::{Heap, HeapError, HeapStats};
pub use paging::{
    BootInfoFrameAllocator, FRAME_ALLOCATOR, KernelFrames, KernelPageTable, MapError, PAGE_TABLE,
    PageMapper, init, init_frame_allocator,
};

/// Size of a 4 KiB page, the only page size the heap maps.
pub const PAGE_SIZE: usize = 4096;

/// Virtual base of the kernel heap.
pub const HEAP_START: usize = 0x_4444_0000_0000;
/// Bytes mapped by `heap_init` at boot.
pub const HEAP_INITIAL_SIZE: usize = 128 * 1024; // 128 KiB
/// Ceiling the kernel heap may grow to.
pub const HEAP_MAX_SIZE: usize = 16 * 1024 * 1024; // 16 MiB

/// Rounds `value` up to the next multiple of `align`, which must be a power of two.
///
/// Returns `None` on overflow.
#[inline]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    let mask = align - 1;
    match value.checked_add(mask) {
        Some(v) => Some(v & !mask),
        None => None,
    }
}

/// Rounds `value` down to a multiple of `align`, which must be a power of two.
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}
