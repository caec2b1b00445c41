//! Page Table Types
//!
//! Architecture-neutral view of the 4-level page table tree.
//!
//! # Page Table Structure (4KB granule)
//! - Level 0 (root): 512 entries, each covers 512GB
//! - Level 1: 512 entries, each covers 1GB
//! - Level 2: 512 entries, each covers 2MB
//! - Level 3: 512 entries, each covers 4KB
//!
//! Raw entries are opaque machine words. Only the [`PageTableArch`]
//! implementation knows their bit layout; everything else works with
//! [`PteFlags`] and [`Descriptor`].
//!
//! [`PageTableArch`]: crate::arch::PageTableArch

use core::ops::{Index, IndexMut};

use bitflags::bitflags;

use super::address::{FrameIndex, ENTRIES_PER_TABLE, PAGE_SHIFT};
use crate::arch::PageTableArch;

bitflags! {
    /// Permission and caching attributes of a leaf mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u32 {
        /// The mapping is valid.
        const PRESENT = 1 << 0;
        /// Writes are allowed.
        const WRITABLE = 1 << 1;
        /// Accessible from user mode.
        const USER = 1 << 2;
        /// Instruction fetches fault.
        const NO_EXECUTE = 1 << 3;
        /// Caching disabled.
        const NO_CACHE = 1 << 4;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 5;
        /// Survives address space switches (kernel mappings).
        const GLOBAL = 1 << 6;
        /// Shared read-only after fork; the first write copies the frame.
        const COW = 1 << 7;
        /// Not general RAM: the frame bitmap never tracks it.
        const DEVICE = 1 << 8;
        /// Frame lifetime is managed by whoever created the mapping.
        const SHARED = 1 << 9;
    }
}

impl PteFlags {
    /// Kernel code: readable, executable by kernel only.
    pub const KERNEL_CODE: Self = Self::PRESENT.union(Self::GLOBAL);

    /// Kernel data: readable/writable, not executable.
    pub const KERNEL_DATA: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::NO_EXECUTE)
        .union(Self::GLOBAL);

    /// Device memory (MMIO): uncached, not executable, never freed.
    pub const KERNEL_DEVICE: Self = Self::KERNEL_DATA
        .union(Self::NO_CACHE)
        .union(Self::WRITE_THROUGH)
        .union(Self::DEVICE);

    /// User code: readable, executable by user.
    pub const USER_CODE: Self = Self::PRESENT.union(Self::USER);

    /// User data: readable/writable by user, not executable.
    pub const USER_DATA: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::USER)
        .union(Self::NO_EXECUTE);

    /// Whether unmapping this entry should hand its frame back to the bitmap.
    #[inline]
    pub const fn owns_frame(self) -> bool {
        !self.intersects(Self::DEVICE.union(Self::SHARED))
    }
}

/// Decoded meaning of a raw entry at a given level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    /// Nothing mapped here.
    Absent,
    /// Points to the next-level table.
    Table(FrameIndex),
    /// Maps memory. `size` is 4 KiB at level 3, or a block size above it.
    Leaf {
        frame: FrameIndex,
        flags: PteFlags,
        size: usize,
    },
}

/// Bytes covered by a single entry at `level`.
#[inline]
pub const fn level_span(level: usize) -> usize {
    1 << (PAGE_SHIFT + 9 * (3 - level))
}

/// A single page table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// Create an empty entry.
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Decode this entry as it appears at `level`.
    #[inline]
    pub fn decode<A: PageTableArch>(self, level: usize) -> Descriptor {
        A::decode(self.0, level)
    }

    #[inline]
    pub fn set(&mut self, raw: u64) {
        self.0 = raw;
    }

    /// Clear the entry (make invalid).
    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PTE({:#018x})", self.0)
    }
}

/// A page table (one level of the 4-level hierarchy).
///
/// Each page table is 4KB and contains 512 entries.
/// The table must be 4KB aligned in physical memory.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    /// Iterate over all non-empty entries with their indices.
    pub fn iter_used(&self) -> impl Iterator<Item = (usize, &PageTableEntry)> {
        self.entries.iter().enumerate().filter(|(_, e)| !e.is_empty())
    }

    /// Check whether the given index range holds only empty entries.
    pub fn is_empty_in(&self, range: core::ops::Range<usize>) -> bool {
        self.entries[range].iter().all(|e| e.is_empty())
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_and_shared_mappings_do_not_own_frames() {
        assert!(PteFlags::USER_DATA.owns_frame());
        assert!(!PteFlags::KERNEL_DEVICE.owns_frame());
        assert!(!(PteFlags::USER_DATA | PteFlags::SHARED).owns_frame());
    }

    #[test]
    fn level_spans() {
        assert_eq!(level_span(3), 4096);
        assert_eq!(level_span(2), 2 << 20);
        assert_eq!(level_span(1), 1 << 30);
        assert_eq!(core::mem::size_of::<PageTable>(), 4096);
    }
}
