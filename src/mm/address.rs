//! Physical, Virtual and Frame Address Types
//!
//! Type-safe wrappers that keep physical addresses, virtual addresses and
//! frame handles apart at compile time.
//!
//! # Security Properties
//! - Physical addresses and frame indices cannot be dereferenced directly
//! - Virtual addresses are always stored in canonical (sign-extended) form
//! - A frame is named by an opaque [`FrameIndex`], never by a raw pointer

use core::fmt;

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
/// Page size mask
pub const PAGE_MASK: usize = PAGE_SIZE - 1;
/// Bits to shift for page number
pub const PAGE_SHIFT: usize = 12;

/// Number of entries per page table (512 for 4KB granule)
pub const ENTRIES_PER_TABLE: usize = 512;

/// Depth of the page table tree. Level 0 is the root, level 3 holds 4 KiB leaves.
pub const PAGE_LEVELS: usize = 4;

/// First root-table slot belonging to the shared kernel half.
pub const KERNEL_ROOT_FIRST: usize = ENTRIES_PER_TABLE / 2;

/// Start of the kernel half of every address space.
pub const KERNEL_VIRT_BASE: usize = 0xFFFF_8000_0000_0000;

/// One past the highest user-space address.
pub const USER_VIRT_TOP: usize = 0x0000_8000_0000_0000;

/// Round `value` up to the next page boundary.
#[inline]
pub const fn page_align_up(value: usize) -> usize {
    (value + PAGE_MASK) & !PAGE_MASK
}

/// Number of pages needed to cover `bytes`.
#[inline]
pub const fn pages_for(bytes: usize) -> usize {
    page_align_up(bytes) >> PAGE_SHIFT
}

/// A physical memory address.
///
/// Physical addresses cannot be dereferenced; they must go through the
/// frame mapper first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    /// Create a new physical address.
    ///
    /// # Panics
    /// Panics in debug mode if the address uses more than 52 bits.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        debug_assert!(addr <= 0x000F_FFFF_FFFF_FFFF);
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Offset within the containing frame.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// The frame containing this address.
    #[inline]
    pub const fn frame(self) -> FrameIndex {
        FrameIndex(self.0 >> PAGE_SHIFT)
    }

    /// Add an offset to this address.
    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#018x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Opaque handle for one 4 KiB physical frame (physical address / page size).
///
/// This is the only way the page table code names physical memory. Turning
/// a frame into something dereferenceable is the job of
/// [`FrameMapper`](super::phys::FrameMapper).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameIndex(usize);

impl FrameIndex {
    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Physical address of the first byte of the frame.
    #[inline]
    pub const fn start_address(self) -> PhysAddr {
        PhysAddr(self.0 << PAGE_SHIFT)
    }

    /// The frame `count` frames after this one.
    #[inline]
    pub const fn offset(self, count: usize) -> Self {
        Self(self.0 + count)
    }
}

impl fmt::Debug for FrameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.0)
    }
}

impl fmt::Display for FrameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A virtual memory address.
///
/// Stored in canonical form: bits [63:48] are copies of bit 47 on both
/// x86-64 and AArch64 with 48-bit virtual addressing.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Create a new virtual address, sign-extending from bit 47.
    ///
    /// Meant for addresses the kernel computes itself. Values that come
    /// from user space go through [`try_new`](Self::try_new), otherwise a
    /// low-half value with bit 47 set would silently land in the kernel half.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(Self::make_canonical(addr))
    }

    /// Create a virtual address only if `addr` is already canonical.
    #[inline]
    pub const fn try_new(addr: usize) -> Option<Self> {
        if Self::is_canonical(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Check whether `addr` is already canonical.
    #[inline]
    pub const fn is_canonical(addr: usize) -> bool {
        Self::make_canonical(addr) == addr
    }

    #[inline]
    const fn make_canonical(addr: usize) -> usize {
        if (addr >> 47) & 1 == 1 {
            addr | 0xFFFF_0000_0000_0000
        } else {
            addr & 0x0000_FFFF_FFFF_FFFF
        }
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self::new(self.0 & !PAGE_MASK)
    }

    /// Index into the table at `level` (0 = root, 3 = leaf table).
    #[inline]
    pub const fn table_index(self, level: usize) -> usize {
        (self.0 >> (PAGE_SHIFT + 9 * (PAGE_LEVELS - 1 - level))) & (ENTRIES_PER_TABLE - 1)
    }

    /// Get the page table indices for this address, root first.
    #[inline]
    pub const fn page_table_indices(self) -> [usize; PAGE_LEVELS] {
        [
            self.table_index(0),
            self.table_index(1),
            self.table_index(2),
            self.table_index(3),
        ]
    }

    /// Get the page offset (lowest 12 bits).
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Add an offset to this address.
    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self::new(self.0.wrapping_add(offset))
    }

    /// Check if this is a kernel address (higher half).
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= KERNEL_VIRT_BASE
    }

    /// Check if this is a user address (lower half).
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < USER_VIRT_TOP
    }

    /// Rebuild an address from table indices, sign-extending as needed.
    pub const fn from_indices(indices: [usize; PAGE_LEVELS]) -> Self {
        let raw = (indices[0] << 39) | (indices[1] << 30) | (indices[2] << 21) | (indices[3] << 12);
        Self::new(raw)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#018x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_address() {
        let user = VirtAddr::new(0x0000_0001_0000_0000);
        assert!(user.is_user());
        assert!(!user.is_kernel());

        // Bit 47 set: sign-extended into the kernel half
        let kernel = VirtAddr::new(0x0000_FF00_0000_0000);
        assert_eq!(kernel.as_usize(), 0xFFFF_FF00_0000_0000);
        assert!(kernel.is_kernel());
        assert!(!VirtAddr::is_canonical(0x0000_FF00_0000_0000));
    }

    #[test]
    fn checked_construction_rejects_non_canonical() {
        assert_eq!(VirtAddr::try_new(0x0000_8000_0000_0000), None);
        assert_eq!(VirtAddr::try_new(0x0000_FF00_0000_0000), None);
        assert_eq!(
            VirtAddr::try_new(0x0000_7FFF_FFFF_F000),
            Some(VirtAddr::new(0x0000_7FFF_FFFF_F000))
        );
        assert_eq!(
            VirtAddr::try_new(0xFFFF_8000_0000_0000).map(VirtAddr::is_kernel),
            Some(true)
        );
    }

    #[test]
    fn test_indices_round_trip() {
        let addr = VirtAddr::new(0xFFFF_FF1F_C000_3000);
        let indices = addr.page_table_indices();
        assert_eq!(indices[0], 510);
        assert!(indices[0] >= KERNEL_ROOT_FIRST);
        assert_eq!(VirtAddr::from_indices(indices), addr);

        let low = VirtAddr::new(0x40_0000);
        assert_eq!(low.page_table_indices(), [0, 0, 2, 0]);
    }

    #[test]
    fn test_frame_index() {
        let addr = PhysAddr::new(0x5123);
        assert_eq!(addr.frame(), FrameIndex::new(5));
        assert_eq!(addr.page_offset(), 0x123);
        assert_eq!(FrameIndex::new(5).start_address().as_usize(), 0x5000);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }
}
