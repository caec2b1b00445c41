//! Physical Memory Access
//!
//! The only place in the kernel where a [`FrameIndex`] turns into a pointer.
//! Page table walks, frame zeroing, fork copies and user copy routines all
//! come through here, so every raw dereference of physical memory is in
//! this file.
//!
//! # Security Properties
//! - Callers never see a raw pointer, only typed views of one frame
//! - Views are bounded to a single 4 KiB frame

use core::ptr::{self, NonNull};

use super::address::{FrameIndex, PAGE_SIZE};
use super::paging::PageTable;

/// Translates a physical frame to an address the kernel can access.
pub trait FrameMapper: Send + Sync + 'static {
    /// Pointer to the first byte of `frame` in the kernel's view of memory.
    ///
    /// The returned pointer must be valid for `PAGE_SIZE` bytes, 4 KiB
    /// aligned, and stable for the lifetime of the mapper.
    fn frame_ptr(&self, frame: FrameIndex) -> NonNull<u8>;
}

/// A linear mapping of all physical memory at a fixed virtual offset.
///
/// This is how the kernel sees RAM once its higher-half direct map is up.
#[derive(Debug, Clone, Copy)]
pub struct DirectMapper {
    offset: usize,
}

impl DirectMapper {
    /// # Safety
    /// Every frame the kernel will ever hand to this mapper must be mapped
    /// readable and writable at `offset + frame * PAGE_SIZE`.
    pub const unsafe fn new(offset: usize) -> Self {
        Self { offset }
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }
}

impl FrameMapper for DirectMapper {
    #[inline]
    fn frame_ptr(&self, frame: FrameIndex) -> NonNull<u8> {
        let addr = self.offset + frame.start_address().as_usize();
        // SAFETY: the constructor contract makes every mapped frame non-null.
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }
}

/// Borrow a page-table node stored in `frame`.
///
/// # Safety
/// `frame` must hold a page table owned by the caller's locked address space
/// (or a table being built that nothing else can reach), and no other
/// reference to the same table may be live for `'a`.
#[inline]
pub(crate) unsafe fn table_mut<'a, M: FrameMapper + ?Sized>(
    mapper: &M,
    frame: FrameIndex,
) -> &'a mut PageTable {
    // SAFETY: PageTable is repr(C, align(4096)) and exactly one frame long;
    // exclusivity is the caller's contract.
    unsafe { &mut *mapper.frame_ptr(frame).as_ptr().cast::<PageTable>() }
}

/// Shared view of a page-table node.
///
/// # Safety
/// Same as [`table_mut`], except other shared views may coexist.
#[inline]
pub(crate) unsafe fn table_ref<'a, M: FrameMapper + ?Sized>(
    mapper: &M,
    frame: FrameIndex,
) -> &'a PageTable {
    // SAFETY: see table_mut.
    unsafe { &*mapper.frame_ptr(frame).as_ptr().cast::<PageTable>() }
}

/// Fill a frame with zeros.
///
/// # Safety
/// The caller must own `frame` exclusively.
#[inline]
pub(crate) unsafe fn zero_frame<M: FrameMapper + ?Sized>(mapper: &M, frame: FrameIndex) {
    // SAFETY: the mapper guarantees PAGE_SIZE valid bytes.
    unsafe { ptr::write_bytes(mapper.frame_ptr(frame).as_ptr(), 0, PAGE_SIZE) };
}

/// Copy one whole frame to another.
///
/// # Safety
/// `dst` must be owned exclusively by the caller and differ from `src`.
#[inline]
pub(crate) unsafe fn copy_frame<M: FrameMapper + ?Sized>(
    mapper: &M,
    src: FrameIndex,
    dst: FrameIndex,
) {
    debug_assert_ne!(src, dst);
    // SAFETY: both frames are PAGE_SIZE long and distinct frames never overlap.
    unsafe {
        ptr::copy_nonoverlapping(
            mapper.frame_ptr(src).as_ptr(),
            mapper.frame_ptr(dst).as_ptr(),
            PAGE_SIZE,
        )
    };
}

/// Copy bytes out of a frame starting at `offset`.
///
/// # Safety
/// `frame` must be mapped in a live address space the caller has locked.
///
/// # Panics
/// Panics if the range crosses the end of the frame.
#[inline]
pub(crate) unsafe fn read_frame<M: FrameMapper + ?Sized>(
    mapper: &M,
    frame: FrameIndex,
    offset: usize,
    buf: &mut [u8],
) {
    assert!(offset + buf.len() <= PAGE_SIZE, "read crosses frame boundary");
    // SAFETY: bounds checked above; buf is a distinct kernel buffer.
    unsafe {
        ptr::copy_nonoverlapping(
            mapper.frame_ptr(frame).as_ptr().add(offset),
            buf.as_mut_ptr(),
            buf.len(),
        )
    };
}

/// Copy bytes into a frame starting at `offset`.
///
/// # Safety
/// The caller must hold the only writable mapping of `frame`.
///
/// # Panics
/// Panics if the range crosses the end of the frame.
#[inline]
pub(crate) unsafe fn write_frame<M: FrameMapper + ?Sized>(
    mapper: &M,
    frame: FrameIndex,
    offset: usize,
    data: &[u8],
) {
    assert!(offset + data.len() <= PAGE_SIZE, "write crosses frame boundary");
    // SAFETY: bounds checked above; data is a distinct kernel buffer.
    unsafe {
        ptr::copy_nonoverlapping(
            data.as_ptr(),
            mapper.frame_ptr(frame).as_ptr().add(offset),
            data.len(),
        )
    };
}
