//! Kernel Heap Allocator
//!
//! Two phases:
//! - **Early**: a bump allocator over a region that is usable before paging
//!   is under the kernel's control. It never frees.
//! - **General**: a `linked_list_allocator` heap over the reserved heap
//!   window. The arena starts at `HeapConfig::initial_size` and grows on
//!   demand by asking a [`HeapGrowth`] backend to map fresh frames at its
//!   end, up to `HeapConfig::max_size`.
//!
//! Early allocations stay valid after the switch; freeing one is a no-op.
//!
//! # Lock Order
//! The heap lock is taken before the frame allocator and the kernel
//! directory lock (growth maps pages while holding it). Page table code never
//! allocates from the heap, so the order is never reversed.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use linked_list_allocator::Heap;
use log::{info, trace, warn};
use spin::{Mutex, Once};

use super::address::{page_align_up, VirtAddr, PAGE_SIZE};
use crate::config::HeapConfig;
use crate::error::MemoryError;

/// Something that can back the heap window with memory.
pub trait HeapGrowth: Sync {
    /// Map `pages` fresh writable pages starting at `at`.
    ///
    /// Either every page is mapped or none is.
    fn grow(&self, at: VirtAddr, pages: usize) -> Result<(), MemoryError>;
}

impl<T: HeapGrowth + ?Sized> HeapGrowth for &T {
    fn grow(&self, at: VirtAddr, pages: usize) -> Result<(), MemoryError> {
        (**self).grow(at, pages)
    }
}

/// A growth backend bound after construction.
///
/// Lets a `static` heap exist before the memory context it grows through.
pub struct DeferredGrowth {
    target: Once<&'static dyn HeapGrowth>,
}

impl DeferredGrowth {
    pub const fn new() -> Self {
        Self { target: Once::new() }
    }

    /// Attach the real backend. Later calls are ignored.
    pub fn bind(&self, target: &'static dyn HeapGrowth) {
        self.target.call_once(|| target);
    }

    pub fn is_bound(&self) -> bool {
        self.target.is_completed()
    }
}

impl Default for DeferredGrowth {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapGrowth for DeferredGrowth {
    fn grow(&self, at: VirtAddr, pages: usize) -> Result<(), MemoryError> {
        match self.target.get() {
            Some(target) => target.grow(at, pages),
            None => Err(MemoryError::HeapExhausted),
        }
    }
}

/// Placement allocator for early boot.
#[derive(Debug)]
pub struct BumpAllocator {
    start: usize,
    next: usize,
    end: usize,
}

impl BumpAllocator {
    pub const fn empty() -> Self {
        Self {
            start: 0,
            next: 0,
            end: 0,
        }
    }

    /// # Safety
    /// `[start, start + size)` must be writable memory owned by the
    /// allocator for the rest of the kernel's life.
    pub const unsafe fn new(start: usize, size: usize) -> Self {
        Self {
            start,
            next: start,
            end: start + size,
        }
    }

    pub fn alloc(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let align = layout.align();
        let base = self.next.checked_add(align - 1)? & !(align - 1);
        let end = base.checked_add(layout.size())?;
        if end > self.end {
            return None;
        }
        self.next = end;
        NonNull::new(base as *mut u8)
    }

    fn alloc_zeroed_slice<T: Copy>(&mut self, len: usize) -> Option<&'static mut [T]> {
        let layout = Layout::array::<T>(len).ok()?;
        let ptr = self.alloc(layout)?;
        // SAFETY: the region is ours forever (constructor contract), freshly
        // carved, aligned for T, and all-zero is a valid integer.
        unsafe {
            ptr::write_bytes(ptr.as_ptr(), 0, layout.size());
            Some(core::slice::from_raw_parts_mut(ptr.as_ptr().cast::<T>(), len))
        }
    }

    /// Carve `len` zeroed words that live forever.
    pub fn alloc_words(&mut self, len: usize) -> Option<&'static mut [u64]> {
        self.alloc_zeroed_slice(len)
    }

    /// Carve `len` zeroed bytes that live forever.
    pub fn alloc_bytes(&mut self, len: usize) -> Option<&'static mut [u8]> {
        self.alloc_zeroed_slice(len)
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.next - self.start
    }

    /// The part of the region not yet handed out.
    #[inline]
    pub fn remaining(&self) -> (usize, usize) {
        (self.next, self.end - self.next)
    }
}

struct GeneralArena {
    heap: Heap,
    start: usize,
    /// End of the mapped part of the window.
    brk: usize,
    limit: usize,
    grow_step: usize,
}

impl GeneralArena {
    fn grow<G: HeapGrowth>(&mut self, growth: &G, layout: Layout) -> Result<(), MemoryError> {
        let needed = page_align_up(layout.size() + layout.align());
        let room = self.limit - self.brk;
        if needed > room {
            warn!("heap exhausted: need {} bytes, {} left", needed, room);
            return Err(MemoryError::HeapExhausted);
        }
        let bytes = needed.max(self.grow_step).min(room);

        growth.grow(VirtAddr::new(self.brk), bytes / PAGE_SIZE)?;
        // SAFETY: the pages right after the heap top were just mapped.
        unsafe { self.heap.extend(bytes) };
        self.brk += bytes;
        trace!("heap grew by {} KiB to {:#x}", bytes / 1024, self.brk);
        Ok(())
    }
}

struct HeapState {
    early: BumpAllocator,
    general: Option<GeneralArena>,
}

/// Heap occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub early_used: usize,
    /// Bytes of the heap window currently mapped.
    pub arena_size: usize,
    pub arena_used: usize,
    pub arena_free: usize,
}

/// The kernel heap.
pub struct KernelHeap<G> {
    state: Mutex<HeapState>,
    growth: G,
}

/// Room reserved before each [`KernelHeap::alloc`] block for its size and
/// alignment.
const HEADER_SPACE: usize = 16;

impl<G: HeapGrowth> KernelHeap<G> {
    pub const fn new(growth: G) -> Self {
        Self {
            state: Mutex::new(HeapState {
                early: BumpAllocator::empty(),
                general: None,
            }),
            growth,
        }
    }

    pub fn growth(&self) -> &G {
        &self.growth
    }

    /// Serve allocations from `[start, start + size)` until the general
    /// phase begins.
    ///
    /// # Safety
    /// Same contract as [`BumpAllocator::new`].
    pub unsafe fn init_early(&self, start: usize, size: usize) {
        // SAFETY: forwarded to the caller.
        self.state.lock().early = unsafe { BumpAllocator::new(start, size) };
    }

    /// Map the initial arena and switch to the general allocator.
    pub fn init_general(&self, config: &HeapConfig) -> Result<(), MemoryError> {
        let mut state = self.state.lock();
        if state.general.is_some() {
            warn!("heap general phase already initialized");
            return Ok(());
        }
        if !VirtAddr::new(config.start).is_aligned() {
            return Err(MemoryError::Misaligned);
        }
        let initial = page_align_up(config.initial_size.max(PAGE_SIZE));
        if initial > config.max_size {
            return Err(MemoryError::HeapExhausted);
        }

        self.growth
            .grow(VirtAddr::new(config.start), initial / PAGE_SIZE)?;
        let mut heap = Heap::empty();
        // SAFETY: the initial arena was just mapped and belongs to the heap.
        unsafe { heap.init(config.start as *mut u8, initial) };

        state.general = Some(GeneralArena {
            heap,
            start: config.start,
            brk: config.start + initial,
            limit: config.start + config.max_size,
            grow_step: page_align_up(config.grow_step.max(PAGE_SIZE)),
        });
        info!(
            "heap: general phase at {:#x} ({} KiB, {} KiB early)",
            config.start,
            initial / 1024,
            state.early.used() / 1024
        );
        Ok(())
    }

    /// Allocate memory for `layout`, growing the arena if needed.
    pub fn allocate_layout(&self, layout: Layout) -> Result<NonNull<u8>, MemoryError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(arena) = state.general.as_mut() else {
            return state.early.alloc(layout).ok_or(MemoryError::HeapExhausted);
        };
        loop {
            if let Ok(ptr) = arena.heap.allocate_first_fit(layout) {
                return Ok(ptr);
            }
            arena.grow(&self.growth, layout)?;
        }
    }

    /// Return a block from [`allocate_layout`](Self::allocate_layout).
    ///
    /// # Safety
    /// `ptr` must come from this heap with the same `layout` and must not be
    /// used afterwards.
    pub unsafe fn deallocate_layout(&self, ptr: NonNull<u8>, layout: Layout) {
        let mut state = self.state.lock();
        if state.early.contains(ptr.as_ptr() as usize) {
            return;
        }
        match state.general.as_mut() {
            // SAFETY: forwarded to the caller.
            Some(arena) => unsafe { arena.heap.deallocate(ptr, layout) },
            None => debug_assert!(false, "free of foreign pointer {:p}", ptr),
        }
    }

    fn block_layout(size: usize, align: usize) -> Result<(Layout, usize), MemoryError> {
        let pad = align.max(HEADER_SPACE);
        let total = size.checked_add(pad).ok_or(MemoryError::HeapExhausted)?;
        let layout = Layout::from_size_align(total, pad).map_err(|_| MemoryError::Misaligned)?;
        Ok((layout, pad))
    }

    /// Allocate `size` bytes aligned to `align` (a power of two).
    ///
    /// The block records its own size, so [`free`](Self::free) and
    /// [`realloc`](Self::realloc) need only the pointer.
    pub fn alloc(&self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError> {
        if !align.is_power_of_two() {
            return Err(MemoryError::Misaligned);
        }
        let (layout, pad) = Self::block_layout(size, align)?;
        let base = self.allocate_layout(layout)?;
        // SAFETY: the block is `pad + size` bytes and `pad >= HEADER_SPACE`,
        // so the header sits inside it and is usize-aligned.
        unsafe {
            let user = base.as_ptr().add(pad);
            let header = user.sub(HEADER_SPACE).cast::<usize>();
            header.write(size);
            header.add(1).write(align);
            Ok(NonNull::new_unchecked(user))
        }
    }

    /// Size and alignment recorded in front of `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a live pointer from [`alloc`](Self::alloc).
    unsafe fn header(ptr: NonNull<u8>) -> (usize, usize) {
        // SAFETY: alloc wrote both words right before the user pointer.
        unsafe {
            let header = ptr.as_ptr().sub(HEADER_SPACE).cast::<usize>();
            (header.read(), header.add(1).read())
        }
    }

    /// Free a block from [`alloc`](Self::alloc).
    ///
    /// # Safety
    /// `ptr` must be a live pointer from [`alloc`](Self::alloc) on this heap.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        // SAFETY: forwarded to the caller.
        let (size, align) = unsafe { Self::header(ptr) };
        if let Ok((layout, pad)) = Self::block_layout(size, align) {
            // SAFETY: base and layout are exactly what alloc used.
            unsafe {
                let base = NonNull::new_unchecked(ptr.as_ptr().sub(pad));
                self.deallocate_layout(base, layout);
            }
        }
    }

    /// Resize a block from [`alloc`](Self::alloc), keeping its contents up
    /// to the smaller size. On failure the old block is untouched.
    ///
    /// # Safety
    /// `ptr` must be a live pointer from [`alloc`](Self::alloc) on this heap.
    /// On success it must not be used again.
    pub unsafe fn realloc(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, MemoryError> {
        // SAFETY: forwarded to the caller.
        let (size, align) = unsafe { Self::header(ptr) };
        let fresh = self.alloc(new_size, align)?;
        // SAFETY: both blocks are live, distinct and at least this long.
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), size.min(new_size));
            self.free(ptr);
        }
        Ok(fresh)
    }

    pub fn stats(&self) -> HeapStats {
        let state = self.state.lock();
        let early_used = state.early.used();
        match state.general.as_ref() {
            Some(arena) => HeapStats {
                early_used,
                arena_size: arena.brk - arena.start,
                arena_used: arena.heap.used(),
                arena_free: arena.heap.free(),
            },
            None => HeapStats {
                early_used,
                arena_size: 0,
                arena_used: 0,
                arena_free: 0,
            },
        }
    }
}

unsafe impl<G: HeapGrowth> GlobalAlloc for KernelHeap<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate_layout(layout)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // SAFETY: GlobalAlloc's contract matches deallocate_layout's.
            unsafe { self.deallocate_layout(ptr, layout) };
        }
    }
}
