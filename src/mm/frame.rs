//! Physical Frame Allocator
//!
//! Tracks every physical frame with one bit in a packed `u64` word array.
//!
//! # Design
//! - Each bit in the bitmap represents one 4KB frame
//! - Bit = 0: frame is free
//! - Bit = 1: frame is allocated (or reserved, or does not exist)
//! - A per-frame share count sits next to the bitmap for copy-on-write
//!
//! # Security Properties
//! - Double-free is detected and causes a panic
//! - Frame 0 is never handed out
//! - Exhaustion is a typed error, never a crash
//! - The allocator is protected by a spinlock

use core::mem;

use log::trace;
use spin::Mutex;

use super::address::FrameIndex;
use crate::error::MemoryError;

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Number of bitmap words needed to track `total_frames` frames.
pub const fn bitmap_words(total_frames: usize) -> usize {
    (total_frames + BITS_PER_WORD - 1) / BITS_PER_WORD
}

/// Bitmap of physical frame availability.
pub struct FrameBitmap {
    words: &'static mut [u64],
    total_frames: usize,
    free_count: usize,
    /// Lowest word that may still contain a clear bit.
    search_hint: usize,
}

impl FrameBitmap {
    /// Build a bitmap over `storage` with every frame free.
    ///
    /// # Panics
    /// Panics if `storage` holds fewer than [`bitmap_words`] words.
    pub fn new(storage: &'static mut [u64], total_frames: usize) -> Self {
        let needed = bitmap_words(total_frames);
        assert!(
            storage.len() >= needed,
            "frame bitmap needs {} words, got {}",
            needed,
            storage.len()
        );

        let words = &mut storage[..needed];
        words.fill(0);

        // Bits past the last real frame read as allocated forever
        let tail = total_frames % BITS_PER_WORD;
        if tail != 0 {
            words[needed - 1] = !0u64 << tail;
        }

        Self {
            words,
            total_frames,
            free_count: total_frames,
            search_hint: 0,
        }
    }

    #[inline]
    fn locate(&self, frame: FrameIndex) -> (usize, u64) {
        let index = frame.as_usize();
        assert!(
            index < self.total_frames,
            "frame {} outside managed range ({} frames)",
            frame,
            self.total_frames
        );
        (index / BITS_PER_WORD, 1 << (index % BITS_PER_WORD))
    }

    /// Mark a frame as in use. Marking an already used frame does nothing.
    pub fn mark_used(&mut self, frame: FrameIndex) {
        let (word, bit) = self.locate(frame);
        if self.words[word] & bit == 0 {
            self.words[word] |= bit;
            self.free_count -= 1;
        }
    }

    /// Mark a frame as free.
    ///
    /// # Panics
    /// Panics if the frame is already free. The bitmap can no longer be
    /// trusted at that point.
    pub fn mark_free(&mut self, frame: FrameIndex) {
        let (word, bit) = self.locate(frame);
        if self.words[word] & bit == 0 {
            panic!("Double free detected for frame: {}", frame);
        }
        self.words[word] &= !bit;
        self.free_count += 1;
        if word < self.search_hint {
            self.search_hint = word;
        }
    }

    /// Check whether a frame is in use. Frames outside the managed range
    /// always read as used.
    #[inline]
    pub fn test(&self, frame: FrameIndex) -> bool {
        let index = frame.as_usize();
        if index >= self.total_frames {
            return true;
        }
        self.words[index / BITS_PER_WORD] & (1 << (index % BITS_PER_WORD)) != 0
    }

    /// Find the lowest free frame without claiming it.
    pub fn first_free(&self) -> Option<FrameIndex> {
        self.words
            .iter()
            .enumerate()
            .skip(self.search_hint)
            .find(|(_, word)| **word != u64::MAX)
            .map(|(index, word)| {
                FrameIndex::new(index * BITS_PER_WORD + (!*word).trailing_zeros() as usize)
            })
    }

    /// Claim the lowest free frame.
    pub fn allocate(&mut self) -> Result<FrameIndex, MemoryError> {
        let frame = self.first_free().ok_or(MemoryError::OutOfFrames)?;
        self.search_hint = frame.as_usize() / BITS_PER_WORD;
        self.mark_used(frame);
        Ok(frame)
    }

    /// Claim `out.len()` frames, not necessarily contiguous.
    ///
    /// On failure every frame claimed by this call is released again.
    pub fn allocate_n(&mut self, out: &mut [FrameIndex]) -> Result<(), MemoryError> {
        for filled in 0..out.len() {
            match self.allocate() {
                Ok(frame) => out[filled] = frame,
                Err(err) => {
                    for frame in &out[..filled] {
                        self.mark_free(*frame);
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Claim a physically contiguous run of `count` frames.
    pub fn allocate_contiguous(&mut self, count: usize) -> Result<FrameIndex, MemoryError> {
        let count = count.max(1);
        let mut run_start = 0;
        let mut run_len = 0;

        for index in self.search_hint * BITS_PER_WORD..self.total_frames {
            if self.test(FrameIndex::new(index)) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = index;
            }
            run_len += 1;
            if run_len == count {
                for frame in run_start..run_start + count {
                    self.mark_used(FrameIndex::new(frame));
                }
                return Ok(FrameIndex::new(run_start));
            }
        }

        Err(MemoryError::OutOfFrames)
    }

    /// Mark `count` frames starting at `start` as used, clamped to the
    /// managed range. Used for firmware and kernel image regions.
    pub fn reserve_range(&mut self, start: FrameIndex, count: usize) {
        let end = start.as_usize().saturating_add(count).min(self.total_frames);
        for index in start.as_usize()..end {
            self.mark_used(FrameIndex::new(index));
        }
    }

    /// Get the number of free frames.
    #[inline]
    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    #[inline]
    pub fn used_frames(&self) -> usize {
        self.total_frames - self.free_count
    }

    #[inline]
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }
}

/// The frame bitmap plus per-frame share counts.
///
/// A share count of 0 or 1 means the frame has a single owner. Copy-on-write
/// fork raises it to 2 on the first share and by one for each further share.
pub struct FrameAllocator {
    bitmap: FrameBitmap,
    shares: &'static mut [u8],
}

/// The frame allocator as shared between cores.
pub type LockedFrameAllocator = Mutex<FrameAllocator>;

impl FrameAllocator {
    /// # Panics
    /// Panics if `shares` has fewer entries than the bitmap has frames.
    pub fn new(bitmap: FrameBitmap, shares: &'static mut [u8]) -> Self {
        assert!(
            shares.len() >= bitmap.total_frames(),
            "share table too small for {} frames",
            bitmap.total_frames()
        );
        shares.fill(0);
        Self { bitmap, shares }
    }

    #[inline]
    pub fn bitmap(&self) -> &FrameBitmap {
        &self.bitmap
    }

    #[inline]
    pub fn bitmap_mut(&mut self) -> &mut FrameBitmap {
        &mut self.bitmap
    }

    /// Allocate a single exclusively owned frame.
    pub fn allocate(&mut self) -> Result<FrameIndex, MemoryError> {
        let frame = self.bitmap.allocate()?;
        self.shares[frame.as_usize()] = 0;
        trace!("frame {} allocated", frame);
        Ok(frame)
    }

    /// Return an exclusively owned frame.
    ///
    /// # Panics
    /// Panics on a double free or if other owners still share the frame.
    pub fn free(&mut self, frame: FrameIndex) {
        let shares = self.shares[frame.as_usize()];
        assert!(shares <= 1, "freeing frame {} with {} sharers", frame, shares);
        self.shares[frame.as_usize()] = 0;
        self.bitmap.mark_free(frame);
        trace!("frame {} freed", frame);
    }

    /// Record one more owner of `frame`.
    ///
    /// Returns `false` when the count is saturated; the caller must fall back
    /// to copying the frame.
    pub fn share(&mut self, frame: FrameIndex) -> bool {
        debug_assert!(self.bitmap.test(frame), "sharing free frame {}", frame);
        let count = &mut self.shares[frame.as_usize()];
        match *count {
            0 | 1 => *count = 2,
            u8::MAX => return false,
            n => *count = n + 1,
        }
        true
    }

    /// Drop one owner of `frame`, freeing it when the last owner goes.
    ///
    /// Returns `true` if the frame went back to the bitmap.
    pub fn release(&mut self, frame: FrameIndex) -> bool {
        let count = self.shares[frame.as_usize()];
        if count <= 1 {
            self.free(frame);
            true
        } else {
            self.shares[frame.as_usize()] = count - 1;
            false
        }
    }

    /// Check whether `frame` is managed here and currently handed out.
    /// Unlike [`FrameBitmap::test`], frames past the end read as not
    /// allocated.
    #[inline]
    pub fn is_allocated(&self, frame: FrameIndex) -> bool {
        frame.as_usize() < self.bitmap.total_frames() && self.bitmap.test(frame)
    }

    /// Check whether `frame` has a single owner left.
    #[inline]
    pub fn is_exclusive(&self, frame: FrameIndex) -> bool {
        self.shares[frame.as_usize()] <= 1
    }

    #[inline]
    pub fn share_count(&self, frame: FrameIndex) -> u8 {
        self.shares[frame.as_usize()]
    }
}

/// A RAII guard for a physical frame that frees it on drop.
///
/// Never drop a guard while holding the allocator lock.
#[derive(Debug)]
pub struct FrameGuard<'a> {
    frame: FrameIndex,
    allocator: &'a LockedFrameAllocator,
}

impl<'a> FrameGuard<'a> {
    /// Allocate a new frame from `allocator`.
    pub fn allocate(allocator: &'a LockedFrameAllocator) -> Result<Self, MemoryError> {
        let frame = allocator.lock().allocate()?;
        Ok(Self { frame, allocator })
    }

    #[inline]
    pub fn frame(&self) -> FrameIndex {
        self.frame
    }

    /// Consume the guard without freeing the frame.
    ///
    /// Use this when transferring ownership to a page table.
    #[inline]
    pub fn into_frame(self) -> FrameIndex {
        let frame = self.frame;
        mem::forget(self);
        frame
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.allocator.lock().free(self.frame);
    }
}

impl core::fmt::Debug for FrameAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "FrameAllocator(used={}, total={})",
            self.bitmap.used_frames(),
            self.bitmap.total_frames()
        )
    }
}
