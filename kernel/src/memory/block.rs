//! Heap block headers.
//!
//! Every heap block, free or used, starts with a [`BlockHeader`]. The header's `size`
//! covers the header itself, so a block spans `[addr, addr + size)` and the payload
//! handed to callers starts right after the header.

use core::{mem::size_of, ptr::NonNull};

/// Sentinel stored in every live header.
pub const BLOCK_MAGIC: u32 = 0x4B48_4550;

/// Size of one block header in bytes.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Alignment of every block address and block size.
pub const WORD_SIZE: usize = size_of::<usize>();

/// Smallest payload worth keeping as a standalone free block.
pub const MIN_PAYLOAD: usize = 16;

/// Smallest block the heap will split off or leave behind.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + MIN_PAYLOAD;

/// Allocation state of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockStatus {
    Free = 0x4652_4545,
    Used = 0x5553_4544,
}

impl BlockStatus {
    const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0x4652_4545 => Some(BlockStatus::Free),
            0x5553_4544 => Some(BlockStatus::Used),
            _ => None,
        }
    }
}

/// Per-block metadata stored directly in heap memory.
///
/// `status` is kept as a raw tag rather than a [`BlockStatus`] so that a header read
/// from a bogus address never produces an invalid enum value.
#[repr(C)]
#[derive(Debug)]
pub struct BlockHeader {
    magic: u32,
    status: u32,
    size: usize,
    /// Free-list links, only meaningful while the block is free.
    pub(super) prev: Option<NonNull<BlockHeader>>,
    pub(super) next: Option<NonNull<BlockHeader>>,
}

impl BlockHeader {
    /// Writes a fresh, unlinked header at `addr`.
    ///
    /// # Safety
    /// `addr` must be word-aligned and `[addr, addr + size)` must be writable memory
    /// owned by the heap.
    pub unsafe fn write(addr: usize, size: usize, status: BlockStatus) -> NonNull<BlockHeader> {
        debug_assert!(addr % WORD_SIZE == 0, "misaligned block at {addr:#x}");
        debug_assert!(size >= HEADER_SIZE, "block at {addr:#x} smaller than its header");

        let ptr = addr as *mut BlockHeader;
        unsafe {
            ptr.write(BlockHeader {
                magic: BLOCK_MAGIC,
                status: status as u32,
                size,
                prev: None,
                next: None,
            });
            NonNull::new_unchecked(ptr)
        }
    }

    /// Returns the header that owns the payload at `payload`.
    #[inline]
    pub fn from_payload(payload: NonNull<u8>) -> NonNull<BlockHeader> {
        let header = payload.as_ptr().wrapping_sub(HEADER_SIZE).cast::<BlockHeader>();
        unsafe { NonNull::new_unchecked(header) }
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self as *const BlockHeader as usize
    }

    /// Full block size, header included.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn set_size(&mut self, size: usize) {
        debug_assert!(size >= HEADER_SIZE);
        self.size = size;
    }

    /// First address past the block.
    #[inline]
    pub fn end(&self) -> usize {
        self.addr() + self.size
    }

    /// [`BlockHeader::end`] for headers whose size has not been validated yet.
    #[inline]
    pub fn checked_end(&self) -> Option<usize> {
        self.addr().checked_add(self.size)
    }

    /// Bytes available to the caller.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size - HEADER_SIZE
    }

    #[inline]
    pub fn payload(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((self.addr() + HEADER_SIZE) as *mut u8) }
    }

    #[inline]
    pub fn status(&self) -> Option<BlockStatus> {
        BlockStatus::from_raw(self.status)
    }

    #[inline]
    pub fn set_status(&mut self, status: BlockStatus) {
        self.status = status as u32;
    }

    /// Whether the header carries the magic, a known status and a sane size.
    pub fn is_valid(&self) -> bool {
        self.magic == BLOCK_MAGIC
            && self.status().is_some()
            && self.size >= HEADER_SIZE
            && self.size % WORD_SIZE == 0
    }

    /// Whether the block is a live allocation.
    pub fn is_used(&self) -> bool {
        self.is_valid() && self.status() == Some(BlockStatus::Used)
    }

    /// Wipes the magic of a header that was merged into a neighbour.
    pub fn retire(&mut self) {
        self.magic = 0;
        self.status = 0;
        self.prev = None;
        self.next = None;
    }

    #[cfg(test)]
    pub(super) fn smash_magic(&mut self) {
        self.magic = !BLOCK_MAGIC;
    }

    #[cfg(test)]
    pub(super) fn smash_size(&mut self, size: usize) {
        self.size = size;
    }
}
