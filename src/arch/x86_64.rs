//! x86-64 4-level paging
//!
//! Entry layout per the Intel SDM, with bits 9-11 (ignored by hardware)
//! carrying the kernel's software flags.

use super::PageTableArch;
use crate::mm::address::{FrameIndex, VirtAddr, PAGE_SHIFT};
use crate::mm::paging::{level_span, Descriptor, PteFlags};

mod bits {
    pub const PRESENT: u64 = 1 << 0;
    pub const WRITABLE: u64 = 1 << 1;
    pub const USER: u64 = 1 << 2;
    pub const WRITE_THROUGH: u64 = 1 << 3;
    pub const NO_CACHE: u64 = 1 << 4;
    /// Large page at levels 1 and 2.
    pub const HUGE: u64 = 1 << 7;
    pub const GLOBAL: u64 = 1 << 8;
    pub const SW_COW: u64 = 1 << 9;
    pub const SW_DEVICE: u64 = 1 << 10;
    pub const SW_SHARED: u64 = 1 << 11;
    pub const NO_EXECUTE: u64 = 1 << 63;

    /// Physical address bits [51:12].
    pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
}

/// Flag pairs shared by encode and decode.
const FLAG_BITS: [(PteFlags, u64); 9] = [
    (PteFlags::PRESENT, bits::PRESENT),
    (PteFlags::WRITABLE, bits::WRITABLE),
    (PteFlags::USER, bits::USER),
    (PteFlags::WRITE_THROUGH, bits::WRITE_THROUGH),
    (PteFlags::NO_CACHE, bits::NO_CACHE),
    (PteFlags::GLOBAL, bits::GLOBAL),
    (PteFlags::COW, bits::SW_COW),
    (PteFlags::DEVICE, bits::SW_DEVICE),
    (PteFlags::SHARED, bits::SW_SHARED),
];

/// x86-64 with 4-level (48-bit) paging.
#[derive(Debug, Clone, Copy)]
pub struct X86_64;

impl PageTableArch for X86_64 {
    const NAME: &'static str = "x86_64";

    fn encode_leaf(frame: FrameIndex, flags: PteFlags) -> u64 {
        let mut raw = frame.start_address().as_usize() as u64 & bits::ADDR_MASK;
        for (flag, bit) in FLAG_BITS {
            if flags.contains(flag) {
                raw |= bit;
            }
        }
        if flags.contains(PteFlags::NO_EXECUTE) {
            raw |= bits::NO_EXECUTE;
        }
        raw
    }

    fn encode_table(frame: FrameIndex, user: bool) -> u64 {
        let raw = (frame.start_address().as_usize() as u64 & bits::ADDR_MASK)
            | bits::PRESENT
            | bits::WRITABLE;
        if user {
            raw | bits::USER
        } else {
            raw
        }
    }

    fn decode(raw: u64, level: usize) -> Descriptor {
        if raw & bits::PRESENT == 0 {
            return Descriptor::Absent;
        }

        let block = (level == 1 || level == 2) && raw & bits::HUGE != 0;
        if level < 3 && !block {
            return Descriptor::Table(frame_of(raw & bits::ADDR_MASK));
        }

        let size = level_span(level);
        let mut flags = PteFlags::empty();
        for (flag, bit) in FLAG_BITS {
            if raw & bit != 0 {
                flags |= flag;
            }
        }
        if raw & bits::NO_EXECUTE != 0 {
            flags |= PteFlags::NO_EXECUTE;
        }

        Descriptor::Leaf {
            // Bit 12 is PAT in large-page entries
            frame: frame_of(raw & bits::ADDR_MASK & !(size as u64 - 1)),
            flags,
            size,
        }
    }

    unsafe fn load_root(root: FrameIndex) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: the caller guarantees the tree maps the running kernel.
        unsafe {
            core::arch::asm!(
                "mov cr3, {root}",
                root = in(reg) root.start_address().as_usize(),
                options(nostack, preserves_flags),
            );
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        let _ = root;
    }

    fn flush_page(addr: VirtAddr) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: invlpg only drops a cached translation.
        unsafe {
            core::arch::asm!(
                "invlpg [{addr}]",
                addr = in(reg) addr.as_usize(),
                options(nostack, preserves_flags),
            );
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        let _ = addr;
    }

    fn flush_all() {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: reloading CR3 with its current value only flushes the TLB.
        unsafe {
            core::arch::asm!(
                "mov {tmp}, cr3",
                "mov cr3, {tmp}",
                tmp = out(reg) _,
                options(nostack, preserves_flags),
            );
        }
    }
}

#[inline]
fn frame_of(addr: u64) -> FrameIndex {
    FrameIndex::new((addr >> PAGE_SHIFT) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_round_trip() {
        let frame = FrameIndex::new(0x1234);
        for flags in [
            PteFlags::USER_DATA,
            PteFlags::USER_CODE | PteFlags::COW,
            PteFlags::KERNEL_DEVICE,
            PteFlags::KERNEL_DATA,
        ] {
            let raw = X86_64::encode_leaf(frame, flags);
            assert_eq!(
                X86_64::decode(raw, 3),
                Descriptor::Leaf { frame, flags, size: 4096 }
            );
        }
    }

    #[test]
    fn user_tables_carry_the_user_bit() {
        let frame = FrameIndex::new(9);
        assert_eq!(X86_64::encode_table(frame, true) & 0xFFF, 0x07);
        assert_eq!(X86_64::encode_table(frame, false) & 0xFFF, 0x03);
        assert_eq!(X86_64::decode(X86_64::encode_table(frame, true), 0), Descriptor::Table(frame));
    }

    #[test]
    fn huge_pages_decode_as_blocks() {
        // 2 MiB page at physical 0x4000_0000 with the PAT bit set
        let raw = 0x4000_0000 | (1 << 12) | bits::HUGE | bits::PRESENT | bits::WRITABLE;
        match X86_64::decode(raw, 2) {
            Descriptor::Leaf { frame, size, .. } => {
                assert_eq!(frame.start_address().as_usize(), 0x4000_0000);
                assert_eq!(size, 2 << 20);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(X86_64::decode(0, 2), Descriptor::Absent);
    }
}
