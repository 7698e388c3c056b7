/*
Copyright © 2024–2025 Mako and JayAndJef

This file is part of locOS.

locOS is free software: you can redistribute it and/or modify it under the terms of the GNU General
Public License as published by the Free Software Foundation, either version 3 of the License, or (at
your option) any later version.

locOS is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the
implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public
License for more details.

You should have received a copy of the GNU General Public License along with locOS. If not, see
<https://www.gnu.org/licenses/>.
*/

//! Kernel heap manager.
//!
//! The heap is a contiguous virtual region `[start, end)` carved into variable sized
//! blocks, each prefixed by a [`BlockHeader`]. Free blocks are threaded onto an
//! address-ordered [`FreeList`]; allocation is first-fit with splitting, and freeing
//! coalesces with both neighbours straight away.
//!
//! The region starts out with the pages mapped by [`Heap::initialize`] and grows page by
//! page, up to `max_size`, whenever no free block is large enough. Growth is the only
//! time the heap talks to its frame provider and page mapper.
//!
//! A [`Heap`] does no locking of its own; the kernel keeps its single instance behind
//! the mutex in [`super::alloc::LockedHeap`].

use core::{fmt, ptr::NonNull};

use x86_64::{
    VirtAddr,
    structures::paging::{FrameAllocator, FrameDeallocator, Page, PageTableFlags, Size4KiB},
};

use crate::{debug, error, trace, warn};

use super::{
    HEAP_MAX_SIZE, PAGE_SIZE, align_up,
    block::{BlockHeader, BlockStatus, HEADER_SIZE, MIN_BLOCK_SIZE, WORD_SIZE},
    freelist::FreeList,
    paging::PageMapper,
};

/// Heap errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// Start address is zero, not page aligned or not canonical
    InvalidAddress,
    /// `initialize` was already called on this heap
    AlreadyInitialized,
    /// Growth hit the ceiling, ran out of frames or failed to map
    OutOfMemory,
    /// A block failed magic, status or bounds validation
    CorruptionDetected,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HeapError::InvalidAddress => "invalid heap start address",
            HeapError::AlreadyInitialized => "heap already initialized",
            HeapError::OutOfMemory => "heap out of memory",
            HeapError::CorruptionDetected => "heap corruption detected",
        })
    }
}

impl core::error::Error for HeapError {}

/// Snapshot of the heap counters. All sizes include header overhead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub block_count: usize,
    pub free_blocks: usize,
    pub alloc_count: usize,
    pub free_count: usize,
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={}KB used={}B free={}B blocks={} (free {}) allocs={} frees={}",
            self.total >> 10,
            self.used,
            self.free,
            self.block_count,
            self.free_blocks,
            self.alloc_count,
            self.free_count
        )
    }
}

/// A growable first-fit heap over `[start, end)`.
///
/// `F` supplies physical frames and `M` maps them when the heap grows.
pub struct Heap<F, M> {
    start: usize,
    end: usize,
    max_size: usize,
    free_list: FreeList,
    total_size: usize,
    used_size: usize,
    free_size: usize,
    block_count: usize,
    alloc_count: usize,
    free_count: usize,
    initialized: bool,
    frames: F,
    mapper: M,
}

// The raw block pointers only ever point into the heap region, which the heap owns.
unsafe impl<F: Send, M: Send> Send for Heap<F, M> {}

impl<F, M> Heap<F, M> {
    /// Creates an uninitialized heap with the default 16 MiB ceiling.
    pub const fn new(frames: F, mapper: M) -> Self {
        Self::with_max_size(frames, mapper, HEAP_MAX_SIZE)
    }

    /// Creates an uninitialized heap that will never grow past `max_size` bytes.
    pub const fn with_max_size(frames: F, mapper: M, max_size: usize) -> Self {
        Self {
            start: 0,
            end: 0,
            max_size,
            free_list: FreeList::new(),
            total_size: 0,
            used_size: 0,
            free_size: 0,
            block_count: 0,
            alloc_count: 0,
            free_count: 0,
            initialized: false,
            frames,
            mapper,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Start of the heap region.
    pub fn start(&self) -> usize {
        self.start
    }

    /// End (exclusive) of the currently mapped heap region.
    pub fn end(&self) -> usize {
        self.end
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            total: self.total_size,
            used: self.used_size,
            free: self.free_size,
            block_count: self.block_count,
            free_blocks: self.free_list.len(),
            alloc_count: self.alloc_count,
            free_count: self.free_count,
        }
    }

    /// `(address, size)` of every free block, in address order.
    pub fn free_blocks(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free_list.iter().map(|block| {
            let block = unsafe { block.as_ref() };
            (block.addr(), block.size())
        })
    }

    /// Whether `ptr` points into the mapped heap region.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        self.initialized && addr >= self.start && addr < self.end
    }

    /// Walks every block and the free list and checks the heap invariants.
    pub fn check_integrity(&self) -> Result<(), HeapError> {
        if !self.initialized {
            return Ok(());
        }

        let mut used = 0;
        let mut free = 0;
        let mut blocks = 0;
        let mut free_blocks = 0;
        let mut addr = self.start;
        while addr < self.end {
            let header = unsafe { &*(addr as *const BlockHeader) };
            let Some(end) = header
                .checked_end()
                .filter(|&end| header.is_valid() && end <= self.end)
            else {
                error!("bad block header at {:#x}", addr);
                return Err(HeapError::CorruptionDetected);
            };
            match header.status() {
                Some(BlockStatus::Used) => used += header.size(),
                _ => {
                    free += header.size();
                    free_blocks += 1;
                }
            }
            blocks += 1;
            addr = end;
        }

        if used != self.used_size
            || free != self.free_size
            || blocks != self.block_count
            || used + free != self.total_size
            || self.end - self.start != self.total_size
        {
            error!(
                "heap accounting mismatch: walked used={} free={} blocks={}, recorded {}",
                used,
                free,
                blocks,
                self.stats()
            );
            return Err(HeapError::CorruptionDetected);
        }

        let mut previous_end = None;
        for block in self.free_list.iter() {
            let block = unsafe { block.as_ref() };
            if block.status() != Some(BlockStatus::Free) {
                error!("non-free block {:#x} on the free list", block.addr());
                return Err(HeapError::CorruptionDetected);
            }
            if let Some(previous_end) = previous_end {
                if block.addr() <= previous_end {
                    error!("free list out of order or adjacent at {:#x}", block.addr());
                    return Err(HeapError::CorruptionDetected);
                }
            }
            previous_end = Some(block.end());
        }

        if free_blocks != self.free_list.len() {
            error!(
                "free list holds {} blocks, heap walk found {}",
                self.free_list.len(),
                free_blocks
            );
            return Err(HeapError::CorruptionDetected);
        }

        Ok(())
    }

    /// Looks up the used block owning `ptr`, rejecting anything that is not a live
    /// allocation of this heap.
    fn used_block(&self, ptr: NonNull<u8>) -> Result<NonNull<BlockHeader>, HeapError> {
        let addr = ptr.as_ptr() as usize;
        let in_bounds = self.initialized
            && addr % WORD_SIZE == 0
            && addr >= self.start + HEADER_SIZE
            && addr < self.end;
        if !in_bounds {
            error!("pointer {:#x} is not a heap allocation", addr);
            return Err(HeapError::CorruptionDetected);
        }

        let block = BlockHeader::from_payload(ptr);
        let header = unsafe { block.as_ref() };
        if !header.is_used() {
            error!(
                "invalid free of {:#x}: header magic/status check failed (double free?)",
                addr
            );
            return Err(HeapError::CorruptionDetected);
        }

        // The size must stay inside the heap, fit the used total and land on the
        // next header or the heap end.
        let sane_end = header.checked_end().is_some_and(|end| {
            end == self.end
                || (end.checked_add(HEADER_SIZE).is_some_and(|limit| limit <= self.end)
                    && unsafe { &*(end as *const BlockHeader) }.is_valid())
        });
        if !sane_end || header.size() > self.used_size {
            error!("invalid free of {:#x}: block size {:#x} is corrupt", addr, header.size());
            return Err(HeapError::CorruptionDetected);
        }

        Ok(block)
    }

    /// Bytes a block needs to hold `size` payload bytes.
    fn block_size_for(size: usize) -> Option<usize> {
        size.checked_add(HEADER_SIZE)
            .and_then(|size| align_up(size, WORD_SIZE))
    }

    /// Puts a free, unlinked block on the free list and fixes up the block count.
    fn release(&mut self, block: NonNull<BlockHeader>) {
        let (_, merged) = unsafe { self.free_list.insert(block) };
        self.block_count -= merged;
    }

    /// Marks an unlinked free block as used, splitting off whatever is left past
    /// `needed` if that remainder can stand as a block of its own.
    fn claim(&mut self, mut block: NonNull<BlockHeader>, needed: usize) -> NonNull<u8> {
        let header = unsafe { block.as_mut() };
        let size = header.size();
        debug_assert!(size >= needed);
        header.set_status(BlockStatus::Used);

        let taken = if size - needed >= MIN_BLOCK_SIZE {
            header.set_size(needed);
            let rest = unsafe { BlockHeader::write(header.addr() + needed, size - needed, BlockStatus::Free) };
            self.block_count += 1;
            self.release(rest);
            needed
        } else {
            size
        };

        self.used_size += taken;
        self.free_size -= taken;
        self.alloc_count += 1;
        unsafe { block.as_ref() }.payload()
    }

    /// Finds the first free block that can host an `align`-aligned payload in a
    /// block of `needed` bytes. Returns the block and the offset of the aligned header
    /// inside it; a non-zero offset is always large enough to stay a free block.
    fn find_aligned(&self, needed: usize, align: usize) -> Option<(NonNull<BlockHeader>, usize)> {
        self.free_list.iter().find_map(|block| {
            let header = unsafe { block.as_ref() };
            let addr = header.addr();

            let mut payload = align_up(addr + HEADER_SIZE, align)?;
            let lead = payload - HEADER_SIZE - addr;
            if lead != 0 && lead < MIN_BLOCK_SIZE {
                payload = align_up(addr + HEADER_SIZE + MIN_BLOCK_SIZE, align)?;
            }

            let offset = payload - HEADER_SIZE - addr;
            let fits = offset.checked_add(needed)? <= header.size();
            fits.then_some((block, offset))
        })
    }
}

impl<F, M> Heap<F, M>
where
    F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    M: PageMapper,
{
    /// Sets up the heap at `start` and maps the first `size` bytes, rounded up to whole
    /// pages.
    pub fn initialize(&mut self, start: usize, size: usize) -> Result<(), HeapError> {
        if self.initialized {
            warn!("heap at {:#x} already initialized", self.start);
            return Err(HeapError::AlreadyInitialized);
        }

        let limit = start.checked_add(self.max_size).ok_or(HeapError::InvalidAddress)?;
        if start == 0
            || start % PAGE_SIZE != 0
            || VirtAddr::try_new(start as u64).is_err()
            || VirtAddr::try_new((limit - 1) as u64).is_err()
        {
            return Err(HeapError::InvalidAddress);
        }

        let size = align_up(size.max(1), PAGE_SIZE).ok_or(HeapError::OutOfMemory)?;

        self.start = start;
        self.end = start;
        self.free_list = FreeList::new();
        self.total_size = 0;
        self.used_size = 0;
        self.free_size = 0;
        self.block_count = 0;
        self.alloc_count = 0;
        self.free_count = 0;

        if let Err(err) = self.grow(size) {
            self.start = 0;
            self.end = 0;
            return Err(err);
        }

        self.initialized = true;
        debug!(
            "heap initialized at {:#x}, {} KiB mapped, ceiling {} KiB",
            start,
            size >> 10,
            self.max_size >> 10
        );
        Ok(())
    }

    /// Maps enough fresh pages past the current end to cover `needed` bytes and adds
    /// them to the free list.
    ///
    /// If any frame or mapping fails, the pages mapped so far are unmapped and their
    /// frames returned before the error is reported.
    fn grow(&mut self, needed: usize) -> Result<(), HeapError> {
        let pages = needed.div_ceil(PAGE_SIZE).max(1);
        let expand = pages.checked_mul(PAGE_SIZE).ok_or(HeapError::OutOfMemory)?;

        let limit = self.start + self.max_size;
        let old_end = self.end;
        if old_end.checked_add(expand).is_none_or(|new_end| new_end > limit) {
            warn!(
                "heap growth by {} KiB denied: {} of {} KiB in use",
                expand >> 10,
                (old_end - self.start) >> 10,
                self.max_size >> 10
            );
            return Err(HeapError::OutOfMemory);
        }

        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        for index in 0..pages {
            let page = heap_page(old_end, index);

            let Some(frame) = self.frames.allocate_frame() else {
                warn!("heap growth: out of physical frames after {} pages", index);
                self.rollback(old_end, index);
                return Err(HeapError::OutOfMemory);
            };

            if let Err(err) = self.mapper.map_page(page, frame, flags) {
                warn!(
                    "heap growth: mapping {:#x} failed: {:?}",
                    page.start_address().as_u64(),
                    err
                );
                unsafe { self.frames.deallocate_frame(frame) };
                self.rollback(old_end, index);
                return Err(HeapError::OutOfMemory);
            }
        }

        let block = unsafe { BlockHeader::write(old_end, expand, BlockStatus::Free) };
        self.end = old_end + expand;
        self.total_size += expand;
        self.free_size += expand;
        self.block_count += 1;
        self.release(block);

        debug!(
            "heap grew by {} pages to {:#x} ({} KiB)",
            pages,
            self.end,
            self.total_size >> 10
        );
        Ok(())
    }

    /// Undoes the first `mapped` pages of a failed growth starting at `base`.
    fn rollback(&mut self, base: usize, mapped: usize) {
        for index in (0..mapped).rev() {
            match self.mapper.unmap_page(heap_page(base, index)) {
                Ok(frame) => unsafe { self.frames.deallocate_frame(frame) },
                Err(err) => {
                    error!(
                        "heap rollback: cannot unmap {:#x}: {:?}",
                        base + index * PAGE_SIZE,
                        err
                    );
                }
            }
        }
    }

    /// Allocates `size` bytes, growing the heap once if no free block fits.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 || !self.initialized {
            return None;
        }
        let needed = Self::block_size_for(size)?;

        let block = match self.free_list.first_fit(needed) {
            Some(block) => block,
            None => {
                self.grow(needed).ok()?;
                self.free_list.first_fit(needed)?
            }
        };

        unsafe { self.free_list.remove(block) };
        let ptr = self.claim(block, needed);
        trace!("alloc {:#x} size={} block={}", ptr.as_ptr() as usize, size, needed);
        Some(ptr)
    }

    /// Allocates `size` zeroed bytes.
    pub fn zeroed_allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.allocate(size)?;
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Some(ptr)
    }

    /// Allocates `size` bytes whose address is a multiple of `align`.
    ///
    /// `align` must be a power of two. The result is released with [`Heap::free`].
    pub fn aligned_allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if !align.is_power_of_two() {
            return None;
        }
        if align <= WORD_SIZE {
            return self.allocate(size);
        }
        if size == 0 || !self.initialized {
            return None;
        }
        let needed = Self::block_size_for(size)?;

        let (block, offset) = match self.find_aligned(needed, align) {
            Some(found) => found,
            None => {
                let worst_case = needed.checked_add(align)?.checked_add(MIN_BLOCK_SIZE)?;
                self.grow(worst_case).ok()?;
                self.find_aligned(needed, align)?
            }
        };

        unsafe { self.free_list.remove(block) };
        let block = if offset == 0 {
            block
        } else {
            let mut lead = block;
            let lead_header = unsafe { lead.as_mut() };
            let size = lead_header.size();
            let aligned = unsafe { BlockHeader::write(lead_header.addr() + offset, size - offset, BlockStatus::Free) };
            lead_header.set_size(offset);
            self.block_count += 1;
            self.release(lead);
            aligned
        };

        let ptr = self.claim(block, needed);
        debug_assert_eq!(ptr.as_ptr() as usize % align, 0);
        trace!(
            "alloc {:#x} size={} align={} block={}",
            ptr.as_ptr() as usize,
            size,
            align,
            needed
        );
        Some(ptr)
    }

    /// Returns the allocation at `ptr` to the heap. Null is ignored.
    ///
    /// Pointers that do not name a live allocation (foreign pointers, double frees,
    /// smashed headers) are rejected with [`HeapError::CorruptionDetected`] and leave the
    /// heap untouched.
    pub fn free(&mut self, ptr: *mut u8) -> Result<(), HeapError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };

        let mut block = self.used_block(ptr)?;
        let header = unsafe { block.as_mut() };
        let size = header.size();
        header.set_status(BlockStatus::Free);

        self.used_size -= size;
        self.free_size += size;
        self.free_count += 1;
        self.release(block);

        trace!("free {:#x} block={}", ptr.as_ptr() as usize, size);
        Ok(())
    }

    /// Resizes the allocation at `ptr` to `new_size` bytes.
    ///
    /// Grows by moving to a new block; a request that still fits the current block
    /// returns `ptr` as is. On failure the old allocation is left intact.
    pub fn reallocate(&mut self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        let Some(old) = NonNull::new(ptr) else {
            return self.allocate(new_size);
        };

        if new_size == 0 {
            if let Err(err) = self.free(ptr) {
                error!("realloc to zero could not release {:#x}: {}", ptr as usize, err);
            }
            return None;
        }

        let capacity = unsafe { self.used_block(old).ok()?.as_ref() }.capacity();
        if new_size <= capacity {
            return Some(old);
        }

        let new = self.allocate(new_size)?;
        unsafe {
            core::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), capacity.min(new_size));
        }
        if let Err(err) = self.free(ptr) {
            error!("realloc could not release {:#x}: {}", ptr as usize, err);
        }
        Some(new)
    }
}

/// The `index`th page past `base`.
fn heap_page(base: usize, index: usize) -> Page<Size4KiB> {
    Page::containing_address(VirtAddr::new((base + index * PAGE_SIZE) as u64))
}
