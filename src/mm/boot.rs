//! Memory bring-up
//!
//! Runs once on the boot core, before any other core or thread exists:
//! 1. A bump allocator over the pre-mapped early region carves the frame
//!    bitmap and share counts
//! 2. Reserved frames (low memory, the early region itself) are marked used
//! 3. The global context and the kernel directory are created
//! 4. The heap is pointed at the context and switches to its general phase

use log::{info, warn};
use spin::Once;

use super::address::{pages_for, PhysAddr, PAGE_SIZE};
use super::context::KernelMemoryContext;
use super::frame::{bitmap_words, FrameAllocator, FrameBitmap};
use super::heap::{BumpAllocator, DeferredGrowth, KernelHeap};
use super::phys::DirectMapper;
use super::space::AddressSpace;
use crate::arch::NativeArch;
use crate::config::MemoryConfig;
use crate::error::MemoryError;

/// The memory context of the running kernel.
pub type NativeContext = KernelMemoryContext<NativeArch, DirectMapper>;

static CONTEXT: Once<NativeContext> = Once::new();

/// What the loader hands over.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    pub config: MemoryConfig,
    /// Virtual start of a writable region usable before paging is ours.
    pub early_start: usize,
    pub early_size: usize,
    /// Where the loader's direct map puts physical address 0.
    pub phys_offset: usize,
}

/// The global context, once [`init`] has run.
pub fn context() -> Option<&'static NativeContext> {
    CONTEXT.get()
}

/// Bring up memory management. A second call returns the existing context.
///
/// # Safety
/// - `[early_start, early_start + early_size)` must be writable memory that
///   nothing else uses, for the rest of the kernel's life
/// - Every managed frame must be reachable through the direct map at
///   `phys_offset`
/// - Must not race with another call
pub unsafe fn init(
    info: BootInfo,
    heap: &'static KernelHeap<DeferredGrowth>,
) -> Result<&'static NativeContext, MemoryError> {
    if let Some(existing) = CONTEXT.get() {
        warn!("memory already initialized");
        return Ok(existing);
    }
    let config = info.config;
    let total = config.total_frames;

    // SAFETY: forwarded to the caller.
    let mut bump = unsafe { BumpAllocator::new(info.early_start, info.early_size) };
    let words = bump
        .alloc_words(bitmap_words(total))
        .ok_or(MemoryError::HeapExhausted)?;
    let shares = bump.alloc_bytes(total).ok_or(MemoryError::HeapExhausted)?;

    let mut frames = FrameAllocator::new(FrameBitmap::new(words, total), shares);
    let bitmap = frames.bitmap_mut();
    bitmap.reserve_range(PhysAddr::new(0).frame(), config.reserved_frames.min(total));
    // The early region is RAM too; keep the allocator off it
    if let Some(phys) = info.early_start.checked_sub(info.phys_offset) {
        let first = PhysAddr::new(phys).frame().as_usize();
        let count = pages_for(info.early_size + phys % PAGE_SIZE);
        if first < total {
            bitmap.reserve_range(PhysAddr::new(phys).frame(), count.min(total - first));
        }
    }

    let (rest, rest_size) = bump.remaining();
    // SAFETY: the remainder of the early region is handed on untouched.
    unsafe { heap.init_early(rest, rest_size) };

    // SAFETY: forwarded to the caller.
    let phys = unsafe { DirectMapper::new(info.phys_offset) };
    let mm = CONTEXT.call_once(|| KernelMemoryContext::new(config, frames, phys));
    AddressSpace::new_for_kernel(mm)?;

    heap.growth().bind(mm);
    heap.init_general(&config.heap)?;
    info!(
        "memory up: {} KiB used of {} KiB",
        mm.used_memory_kib(),
        mm.total_memory_kib()
    );
    Ok(mm)
}
