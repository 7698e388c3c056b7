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

#![no_std]
#![no_main]

extern crate alloc;

use core::panic::PanicInfo;

use alloc::{boxed::Box, vec::Vec};
use kernel::{
    error, hcf, info,
    memory::{
        self, FRAME_ALLOCATOR, HEAP_INITIAL_SIZE, HEAP_START, KERNEL_HEAP, PAGE_SIZE, heap_init,
        heap_stats, kfree, kmalloc,
    },
    serial_println,
};
use limine::{
    BaseRevision,
    request::{HhdmRequest, MemoryMapRequest, RequestsEndMarker, RequestsStartMarker},
};
use x86_64::VirtAddr;

#[unsafe(no_mangle)]
unsafe extern "C" fn kernel_main() -> ! {
    assert!(BASE_REVISION.is_supported());

    let memory_regions = MEMORY_MAP_REQUEST
        .get_response()
        .expect("memory map request failed")
        .entries();

    let physical_memory_offset = HHDM_REQUEST
        .get_response()
        .expect("Hhdm request failed")
        .offset();

    unsafe {
        memory::init_frame_allocator(memory_regions, physical_memory_offset);
        memory::init(VirtAddr::new(physical_memory_offset));
    }

    heap_init(HEAP_START, HEAP_INITIAL_SIZE).expect("heap initialization failed");

    heap_smoke_check();
    info!("boot complete, {}", heap_stats());

    hcf();
}

/// Pushes a few allocations through both the global allocator and `kmalloc`.
fn heap_smoke_check() {
    let boxed = Box::new(42u64);
    let mut numbers: Vec<u64> = Vec::new();
    for i in 0..4096 {
        numbers.push(i);
    }
    assert_eq!(*boxed, 42);
    assert_eq!(numbers.iter().sum::<u64>(), 4095 * 4096 / 2);
    drop(numbers);
    drop(boxed);

    let raw = kmalloc(256).expect("kmalloc failed");
    kfree(raw.as_ptr()).expect("kfree rejected a fresh allocation");

    if let Err(err) = KERNEL_HEAP.lock().check_integrity() {
        error!("heap integrity check failed after smoke check: {}", err);
    }

    // Every mapped heap page holds a frame; page tables account for the rest.
    let heap_pages = heap_stats().total / PAGE_SIZE;
    if let Some(frames) = FRAME_ALLOCATOR.lock().as_ref() {
        assert!(
            frames.used_frames() >= heap_pages,
            "{} heap pages mapped but only {} frames handed out",
            heap_pages,
            frames.used_frames()
        );
        info!(
            "frames: {} in use, {} free",
            frames.used_frames(),
            frames.free_frames()
        );
    }
}

#[used]
#[unsafe(link_section = ".requests")]
pub static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[unsafe(link_section = ".requests")]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".requests_start_marker")]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();
#[used]
#[unsafe(link_section = ".requests_end_marker")]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("{}", info);

    // The panic may have come from inside the heap; never wait on its lock here.
    if let Some(heap) = KERNEL_HEAP.try_lock() {
        serial_println!("heap: {}", heap.stats());
        match heap.check_integrity() {
            Ok(()) => {
                serial_println!("heap: integrity ok");
            }
            Err(err) => {
                serial_println!("heap: {}", err);
            }
        }
    }

    hcf();
}
