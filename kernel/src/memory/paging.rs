use core::ptr::NonNull;

use crate::{debug, info};
use limine::memory_map::{Entry, EntryType};
use spin::Mutex;
use x86_64::{
    PhysAddr, VirtAddr,
    structures::paging::{
        FrameAllocator, FrameDeallocator, Mapper, OffsetPageTable, Page, PageTable,
        PageTableFlags, PhysFrame, Size4KiB,
        mapper::{MapToError, UnmapError},
    },
};

use super::PAGE_SIZE;

pub static FRAME_ALLOCATOR: Mutex<Option<BootInfoFrameAllocator>> = Mutex::new(None);
pub static PAGE_TABLE: Mutex<Option<OffsetPageTable>> = Mutex::new(None);

/// Errors reported by a [`PageMapper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The page table or frame allocator has not been set up yet
    NotInitialized,
    /// No frame left for an intermediate page table
    FrameAllocationFailed,
    /// The page already has a mapping
    AlreadyMapped,
    /// The page has no mapping to remove
    NotMapped,
    /// A huge page covers the requested page
    HugePage,
}

impl From<MapToError<Size4KiB>> for MapError {
    fn from(err: MapToError<Size4KiB>) -> Self {
        match err {
            MapToError::FrameAllocationFailed => MapError::FrameAllocationFailed,
            MapToError::ParentEntryHugePage => MapError::HugePage,
            MapToError::PageAlreadyMapped(_) => MapError::AlreadyMapped,
        }
    }
}

impl From<UnmapError> for MapError {
    fn from(err: UnmapError) -> Self {
        match err {
            UnmapError::ParentEntryHugePage => MapError::HugePage,
            UnmapError::PageNotMapped | UnmapError::InvalidFrameAddress(_) => MapError::NotMapped,
        }
    }
}

/// Installs and removes single 4 KiB mappings in the current address space.
pub trait PageMapper {
    /// Maps `page` to `frame` with `flags`.
    fn map_page(
        &mut self,
        page: Page<Size4KiB>,
        frame: PhysFrame<Size4KiB>,
        flags: PageTableFlags,
    ) -> Result<(), MapError>;

    /// Removes the mapping of `page` and returns the frame it pointed to.
    fn unmap_page(&mut self, page: Page<Size4KiB>) -> Result<PhysFrame<Size4KiB>, MapError>;
}

/// A linked list of free frames, threaded through the frames themselves via the HHDM.
#[derive(Clone, Copy, Debug)]
struct FrameStack {
    head: Option<NonNull<FrameNode>>,
    len: usize,
}

unsafe impl Send for FrameStack {}

impl FrameStack {
    const fn new() -> Self {
        FrameStack { head: None, len: 0 }
    }

    const fn push(&mut self, ptr: NonNull<()>) {
        let node = ptr.cast::<FrameNode>();
        unsafe {
            node.write(FrameNode { next: self.head });
        }
        self.head = Some(node);
        self.len += 1;
    }

    const fn pop(&mut self) -> Option<NonNull<()>> {
        match self.head {
            Some(node) => {
                self.head = unsafe { node.as_ref().next };
                self.len -= 1;
                Some(node.cast())
            }
            None => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct FrameNode {
    next: Option<NonNull<FrameNode>>,
}

/// A frame allocator that hands out the usable frames of the bootloader memory map.
pub struct BootInfoFrameAllocator {
    free: FrameStack,
    offset: u64,
    handed_out: usize,
}

impl BootInfoFrameAllocator {
    /// Collects every usable frame of `memory_map`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the memory map is valid and that `offset` is the
    /// HHDM offset under which all physical memory is mapped.
    pub unsafe fn init(memory_map: &'static [&Entry], offset: u64) -> Self {
        let usable_frames = memory_map
            .iter()
            .filter(|region| region.entry_type == EntryType::USABLE)
            .map(|region| region.base..(region.base + region.length))
            .flat_map(|range| range.step_by(PAGE_SIZE))
            .map(|phys| unsafe { NonNull::new_unchecked((phys + offset) as *mut ()) });

        let mut allocator = Self {
            free: FrameStack::new(),
            offset,
            handed_out: 0,
        };

        for frame in usable_frames {
            allocator.free.push(frame);
        }

        debug!("frame allocator holds {} frames", allocator.free.len);

        allocator
    }

    /// Frames still available.
    pub fn free_frames(&self) -> usize {
        self.free.len
    }

    /// Frames currently handed out.
    pub fn used_frames(&self) -> usize {
        self.handed_out
    }
}

unsafe impl FrameAllocator<Size4KiB> for BootInfoFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let ptr = self.free.pop()?;
        self.handed_out += 1;
        let phys = PhysAddr::new(ptr.as_ptr() as u64 - self.offset);
        Some(PhysFrame::containing_address(phys))
    }
}

impl FrameDeallocator<Size4KiB> for BootInfoFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        let virt = frame.start_address().as_u64() + self.offset;
        if let Some(ptr) = NonNull::new(virt as *mut ()) {
            self.free.push(ptr);
            self.handed_out = self.handed_out.saturating_sub(1);
        }
    }
}

/// Frame provider backed by the global [`FRAME_ALLOCATOR`].
///
/// Every call takes the allocator lock for its own duration only.
#[derive(Clone, Copy, Debug, Default)]
pub struct KernelFrames;

unsafe impl FrameAllocator<Size4KiB> for KernelFrames {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        FRAME_ALLOCATOR.lock().as_mut()?.allocate_frame()
    }
}

impl FrameDeallocator<Size4KiB> for KernelFrames {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        if let Some(allocator) = FRAME_ALLOCATOR.lock().as_mut() {
            unsafe { allocator.deallocate_frame(frame) };
        }
    }
}

/// Page mapper backed by the global [`PAGE_TABLE`].
///
/// Intermediate tables come from [`FRAME_ALLOCATOR`], which is always locked after
/// the page table.
#[derive(Clone, Copy, Debug, Default)]
pub struct KernelPageTable;

impl PageMapper for KernelPageTable {
    fn map_page(
        &mut self,
        page: Page<Size4KiB>,
        frame: PhysFrame<Size4KiB>,
        flags: PageTableFlags,
    ) -> Result<(), MapError> {
        let mut page_table = PAGE_TABLE.lock();
        let mut frame_allocator = FRAME_ALLOCATOR.lock();
        let (Some(page_table), Some(frame_allocator)) =
            (page_table.as_mut(), frame_allocator.as_mut())
        else {
            return Err(MapError::NotInitialized);
        };

        unsafe {
            page_table
                .map_to(page, frame, flags, frame_allocator)?
                .flush();
        }
        Ok(())
    }

    fn unmap_page(&mut self, page: Page<Size4KiB>) -> Result<PhysFrame<Size4KiB>, MapError> {
        let mut page_table = PAGE_TABLE.lock();
        let page_table = page_table.as_mut().ok_or(MapError::NotInitialized)?;

        let (frame, flush) = page_table.unmap(page)?;
        flush.flush();
        Ok(frame)
    }
}

/// Initializes the global frame allocator using the provided memory map.
///
/// # Safety
/// The caller must ensure that the memory map is valid and not used elsewhere.
/// This function must only be called once, before any frame allocations occur.
pub unsafe fn init_frame_allocator(memory_map: &'static [&'static Entry], offset: u64) {
    let mut frame_allocator = FRAME_ALLOCATOR.lock();
    if frame_allocator.is_some() {
        panic!("Frame allocator already initialized");
    }
    frame_allocator.replace(unsafe { BootInfoFrameAllocator::init(memory_map, offset) });

    info!("frame allocator initialized");
}

/// Initializes the global OffsetPageTable with the given memory offset.
///
/// # Safety
/// The caller must ensure that the memory offset is valid and that all physical
/// memory is mapped at it.
pub unsafe fn init(memory_offset: VirtAddr) {
    let mut page_table = PAGE_TABLE.lock();
    if page_table.is_some() {
        panic!("Page table already initialized");
    }
    let level_4_table = unsafe { active_level_4_table(memory_offset) };
    page_table.replace(unsafe { OffsetPageTable::new(level_4_table, memory_offset) });
    info!("page tables initialized");
}

/// Returns the active level 4 table through the physical memory offset.
///
/// # Safety
/// There must be a valid level 4 table in CR3 and physical memory must be mapped at
/// `memory_offset`. Only call once, to avoid aliasing `&mut` references.
unsafe fn active_level_4_table(memory_offset: VirtAddr) -> &'static mut PageTable {
    let (level_4_table_frame, _) = x86_64::registers::control::Cr3::read();
    let phys = level_4_table_frame.start_address();
    let virt = (phys.as_u64() + memory_offset.as_u64()) as *mut PageTable;
    unsafe { &mut *virt }
}
