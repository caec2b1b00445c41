//! Host fixtures shared by the memory management tests.
//!
//! Physical RAM is a leaked, page-aligned host buffer; frame `n` lives at
//! `base + n * PAGE_SIZE`. Everything here leaks on purpose so fixtures can
//! hand out `'static` references like the kernel's boot path does.

use alloc::boxed::Box;
use alloc::vec;

use super::address::{pages_for, FrameIndex, PAGE_SIZE};
use super::context::KernelMemoryContext;
use super::frame::{bitmap_words, FrameAllocator, FrameBitmap, LockedFrameAllocator};
use super::phys::DirectMapper;
use super::space::AddressSpace;
use crate::arch::x86_64::X86_64;
use crate::config::MemoryConfig;

pub(crate) type TestContext = KernelMemoryContext<X86_64, DirectMapper>;

#[repr(C, align(4096))]
#[derive(Clone, Copy)]
struct RawFrame([u8; PAGE_SIZE]);

fn leak_pages(count: usize) -> usize {
    let pages = vec![RawFrame([0; PAGE_SIZE]); count.max(1)].into_boxed_slice();
    Box::leak(pages).as_mut_ptr() as usize
}

/// `frames` frames of fake physical memory.
pub(crate) fn ram(frames: usize) -> DirectMapper {
    // SAFETY: the buffer is leaked, so every frame below `frames` stays valid.
    unsafe { DirectMapper::new(leak_pages(frames)) }
}

fn allocator(frames: usize) -> FrameAllocator {
    let words = Box::leak(vec![0u64; bitmap_words(frames)].into_boxed_slice());
    let shares = Box::leak(vec![0u8; frames].into_boxed_slice());
    let mut allocator = FrameAllocator::new(FrameBitmap::new(words, frames), shares);
    allocator.bitmap_mut().mark_used(FrameIndex::new(0));
    allocator
}

/// Frame allocator over `frames` frames with frame 0 reserved.
pub(crate) fn frame_allocator(frames: usize) -> LockedFrameAllocator {
    spin::Mutex::new(allocator(frames))
}

/// Context built from `config`, with no kernel directory yet.
pub(crate) fn bare_context_with(config: MemoryConfig) -> &'static TestContext {
    let frames = config.total_frames;
    Box::leak(Box::new(KernelMemoryContext::new(
        config,
        allocator(frames),
        ram(frames),
    )))
}

pub(crate) fn bare_context(frames: usize) -> &'static TestContext {
    bare_context_with(MemoryConfig::new(frames))
}

/// Context built from `config` with its kernel directory installed.
pub(crate) fn context_with(config: MemoryConfig) -> &'static TestContext {
    let mm = bare_context_with(config);
    AddressSpace::new_for_kernel(mm).expect("kernel directory");
    mm
}

pub(crate) fn context(frames: usize) -> &'static TestContext {
    context_with(MemoryConfig::new(frames))
}

/// Page-aligned host memory of at least `bytes` bytes, for heap arenas.
pub(crate) fn host_arena(bytes: usize) -> usize {
    leak_pages(pages_for(bytes))
}
