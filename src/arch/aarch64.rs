//! ARM64 VMSA (4KB granule, 48-bit VA)
//!
//! Descriptor layout follows the ARMv8-A architecture reference manual.
//! Software-defined bits [58:55] carry the kernel's own flags.
//!
//! # MAIR layout assumed by the attribute index
//! - 0: Normal, write-back cacheable
//! - 1: Device-nGnRE
//! - 2: Normal, non-cacheable
//! - 3: Normal, write-through

use super::PageTableArch;
use crate::mm::address::{FrameIndex, VirtAddr, PAGE_SHIFT};
use crate::mm::paging::{level_span, Descriptor, PteFlags};

mod bits {
    /// Descriptor is valid.
    pub const VALID: u64 = 1 << 0;
    /// Table descriptor at levels 0-2, page descriptor at level 3.
    pub const TABLE_OR_PAGE: u64 = 1 << 1;

    /// Attribute Index [4:2] - selects MAIR entry.
    pub const ATTR_SHIFT: u64 = 2;
    pub const ATTR_MASK: u64 = 0b111 << ATTR_SHIFT;
    pub const ATTR_NORMAL: u64 = 0;
    pub const ATTR_DEVICE: u64 = 1;
    pub const ATTR_NC: u64 = 2;
    pub const ATTR_WT: u64 = 3;

    /// AP[1]: EL0 access.
    pub const AP_EL0: u64 = 1 << 6;
    /// AP[2]: read-only.
    pub const AP_RO: u64 = 1 << 7;
    /// Inner shareable.
    pub const SH_INNER: u64 = 0b11 << 8;
    /// Access Flag - set up front so the first access does not fault.
    pub const AF: u64 = 1 << 10;
    /// Not Global - use ASID for TLB matching.
    pub const NG: u64 = 1 << 11;
    /// Privileged Execute Never.
    pub const PXN: u64 = 1 << 53;
    /// User Execute Never.
    pub const UXN: u64 = 1 << 54;

    pub const SW_COW: u64 = 1 << 55;
    pub const SW_DEVICE: u64 = 1 << 56;
    pub const SW_SHARED: u64 = 1 << 57;

    /// Output address bits [47:12].
    pub const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;
}

/// AArch64 with the 4KB translation granule.
#[derive(Debug, Clone, Copy)]
pub struct Aarch64;

impl PageTableArch for Aarch64 {
    const NAME: &'static str = "aarch64";

    fn encode_leaf(frame: FrameIndex, flags: PteFlags) -> u64 {
        let mut raw = (frame.start_address().as_usize() as u64 & bits::ADDR_MASK)
            | bits::VALID
            | bits::TABLE_OR_PAGE
            | bits::AF;

        let attr = if flags.contains(PteFlags::DEVICE | PteFlags::NO_CACHE) {
            bits::ATTR_DEVICE
        } else if flags.contains(PteFlags::NO_CACHE) {
            bits::ATTR_NC
        } else if flags.contains(PteFlags::WRITE_THROUGH) {
            bits::ATTR_WT
        } else {
            bits::ATTR_NORMAL
        };
        raw |= attr << bits::ATTR_SHIFT;
        if attr != bits::ATTR_DEVICE {
            raw |= bits::SH_INNER;
        }

        if !flags.contains(PteFlags::WRITABLE) {
            raw |= bits::AP_RO;
        }
        if flags.contains(PteFlags::USER) {
            // The kernel never executes user pages
            raw |= bits::AP_EL0 | bits::PXN;
            if flags.contains(PteFlags::NO_EXECUTE) {
                raw |= bits::UXN;
            }
        } else {
            raw |= bits::UXN;
            if flags.contains(PteFlags::NO_EXECUTE) {
                raw |= bits::PXN;
            }
        }
        if !flags.contains(PteFlags::GLOBAL) {
            raw |= bits::NG;
        }

        if flags.contains(PteFlags::COW) {
            raw |= bits::SW_COW;
        }
        if flags.contains(PteFlags::DEVICE) {
            raw |= bits::SW_DEVICE;
        }
        if flags.contains(PteFlags::SHARED) {
            raw |= bits::SW_SHARED;
        }
        raw
    }

    fn encode_table(frame: FrameIndex, _user: bool) -> u64 {
        // Table descriptors leave APTable/XNTable clear; leaves decide access
        (frame.start_address().as_usize() as u64 & bits::ADDR_MASK)
            | bits::VALID
            | bits::TABLE_OR_PAGE
    }

    fn decode(raw: u64, level: usize) -> Descriptor {
        if raw & bits::VALID == 0 {
            return Descriptor::Absent;
        }

        let is_table_or_page = raw & bits::TABLE_OR_PAGE != 0;
        match level {
            0..=2 if is_table_or_page => {
                return Descriptor::Table(frame_of(raw & bits::ADDR_MASK));
            }
            // Blocks exist only at levels 1 and 2; level 3 requires a page descriptor
            0 => return Descriptor::Absent,
            3 if !is_table_or_page => return Descriptor::Absent,
            _ => {}
        }

        let size = level_span(level);
        let mut flags = PteFlags::PRESENT;
        if raw & bits::AP_RO == 0 {
            flags |= PteFlags::WRITABLE;
        }
        let user = raw & bits::AP_EL0 != 0;
        if user {
            flags |= PteFlags::USER;
        }
        let xn = if user { bits::UXN } else { bits::PXN };
        if raw & xn != 0 {
            flags |= PteFlags::NO_EXECUTE;
        }
        match (raw & bits::ATTR_MASK) >> bits::ATTR_SHIFT {
            bits::ATTR_DEVICE => flags |= PteFlags::NO_CACHE | PteFlags::WRITE_THROUGH,
            bits::ATTR_NC => flags |= PteFlags::NO_CACHE,
            bits::ATTR_WT => flags |= PteFlags::WRITE_THROUGH,
            _ => {}
        }
        if raw & bits::NG == 0 {
            flags |= PteFlags::GLOBAL;
        }
        if raw & bits::SW_COW != 0 {
            flags |= PteFlags::COW;
        }
        if raw & bits::SW_DEVICE != 0 {
            flags |= PteFlags::DEVICE;
        }
        if raw & bits::SW_SHARED != 0 {
            flags |= PteFlags::SHARED;
        }

        Descriptor::Leaf {
            frame: frame_of(raw & bits::ADDR_MASK & !(size as u64 - 1)),
            flags,
            size,
        }
    }

    unsafe fn load_root(root: FrameIndex) {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        // SAFETY: the caller guarantees the tree maps the running kernel.
        unsafe {
            core::arch::asm!(
                "msr ttbr0_el1, {root}",
                "isb",
                root = in(reg) root.start_address().as_usize(),
                options(nostack, preserves_flags),
            );
        }
        #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
        let _ = root;
    }

    fn flush_page(addr: VirtAddr) {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        // SAFETY: TLB maintenance only drops cached translations.
        unsafe {
            core::arch::asm!(
                "dsb ishst",
                "tlbi vaae1is, {page}",
                "dsb ish",
                "isb",
                page = in(reg) addr.as_usize() >> PAGE_SHIFT,
                options(nostack, preserves_flags),
            );
        }
        #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
        let _ = addr;
    }

    fn flush_all() {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        // SAFETY: TLB maintenance only drops cached translations.
        unsafe {
            core::arch::asm!(
                "dsb ishst",
                "tlbi vmalle1is",
                "dsb ish",
                "isb",
                options(nostack, preserves_flags),
            );
        }
    }
}

#[inline]
fn frame_of(addr: u64) -> FrameIndex {
    FrameIndex::new((addr >> PAGE_SHIFT) as usize)
}
