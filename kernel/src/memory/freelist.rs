use core::ptr::NonNull;

use super::block::{BlockHeader, BlockStatus};

/// Doubly linked list of free heap blocks, kept sorted by address.
///
/// The links live inside the block headers, so the list never allocates. Inserting a
/// block merges it with address-adjacent neighbours, which means two list entries are
/// never touching in memory.
#[derive(Clone, Copy, Debug)]
pub struct FreeList {
    head: Option<NonNull<BlockHeader>>,
    len: usize,
}

unsafe impl Send for FreeList {}

impl FreeList {
    /// Creates a new empty free list.
    pub const fn new() -> Self {
        FreeList { head: None, len: 0 }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// Iterates over the free blocks in ascending address order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            current: self.head,
            _list: self,
        }
    }

    /// Returns the lowest-addressed block of at least `size` bytes.
    pub fn first_fit(&self, size: usize) -> Option<NonNull<BlockHeader>> {
        self.iter()
            .find(|block| unsafe { block.as_ref() }.size() >= size)
    }

    /// Links `block` in at its address-sorted position and coalesces it with its
    /// neighbours.
    ///
    /// Returns the block that now covers `block`'s memory (the predecessor if the
    /// two merged) and how many merges took place.
    ///
    /// # Safety
    /// `block` must point to a valid, free, unlinked header inside the heap, and must
    /// not overlap any block already on the list.
    pub unsafe fn insert(
        &mut self,
        mut block: NonNull<BlockHeader>,
    ) -> (NonNull<BlockHeader>, usize) {
        let addr = block.as_ptr() as usize;
        debug_assert_eq!(unsafe { block.as_ref() }.status(), Some(BlockStatus::Free));

        let mut prev: Option<NonNull<BlockHeader>> = None;
        let mut next = self.head;
        while let Some(node) = next {
            if node.as_ptr() as usize > addr {
                break;
            }
            debug_assert_ne!(node.as_ptr() as usize, addr, "block {addr:#x} already free");
            prev = next;
            next = unsafe { node.as_ref().next };
        }

        unsafe {
            let links = block.as_mut();
            links.prev = prev;
            links.next = next;

            match prev {
                Some(mut prev) => prev.as_mut().next = Some(block),
                None => self.head = Some(block),
            }
            if let Some(mut next) = next {
                next.as_mut().prev = Some(block);
            }
        }
        self.len += 1;

        let mut merged = 0;

        if let Some(mut next) = next {
            unsafe {
                if block.as_ref().end() == next.as_ptr() as usize {
                    let absorbed = next.as_ref().size();
                    self.unlink(next);
                    next.as_mut().retire();
                    let size = block.as_ref().size();
                    block.as_mut().set_size(size + absorbed);
                    merged += 1;
                }
            }
        }

        if let Some(mut prev) = prev {
            unsafe {
                if prev.as_ref().end() == addr {
                    let absorbed = block.as_ref().size();
                    self.unlink(block);
                    block.as_mut().retire();
                    let size = prev.as_ref().size();
                    prev.as_mut().set_size(size + absorbed);
                    merged += 1;
                    return (prev, merged);
                }
            }
        }

        (block, merged)
    }

    /// Unlinks `block` from the list and clears its links.
    /// This is O(1) since the links live in the header.
    ///
    /// # Safety
    /// `block` must currently be on this list.
    pub unsafe fn remove(&mut self, block: NonNull<BlockHeader>) {
        unsafe { self.unlink(block) }
    }

    unsafe fn unlink(&mut self, mut block: NonNull<BlockHeader>) {
        let node = unsafe { block.as_mut() };

        if let Some(mut prev) = node.prev {
            unsafe { prev.as_mut() }.next = node.next;
        } else {
            debug_assert_eq!(self.head, Some(block));
            self.head = node.next;
        }

        if let Some(mut next) = node.next {
            unsafe { next.as_mut() }.prev = node.prev;
        }

        node.prev = None;
        node.next = None;
        self.len -= 1;
    }
}

/// Address-ordered iterator over a [`FreeList`].
pub struct Iter<'a> {
    current: Option<NonNull<BlockHeader>>,
    _list: &'a FreeList,
}

impl Iterator for Iter<'_> {
    type Item = NonNull<BlockHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;
        self.current = unsafe { node.as_ref().next };
        Some(node)
    }
}
