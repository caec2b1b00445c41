//! Architecture Support
//!
//! Each supported architecture provides one [`PageTableArch`]
//! implementation: the bit layout of its page table entries plus the
//! handful of privileged instructions the memory core needs. The rest of
//! the kernel is written against this trait only.
//!
//! Hardware hooks are compiled for bare-metal targets (`target_os = "none"`)
//! and are no-ops elsewhere, so host tests exercise the same paths.

pub mod aarch64;
pub mod x86_64;

use crate::mm::address::{FrameIndex, VirtAddr};
use crate::mm::paging::{Descriptor, PteFlags};

/// Page table entry codec and translation hooks for one architecture.
pub trait PageTableArch: Send + Sync + 'static {
    /// Human-readable architecture name for boot logs.
    const NAME: &'static str;

    /// Encode a leaf (4 KiB page) entry.
    fn encode_leaf(frame: FrameIndex, flags: PteFlags) -> u64;

    /// Encode an entry pointing at a next-level table.
    ///
    /// `user` is set for tables covering user-space addresses.
    fn encode_table(frame: FrameIndex, user: bool) -> u64;

    /// Decode a raw entry found at `level` (0 = root).
    fn decode(raw: u64, level: usize) -> Descriptor;

    /// Install `root` as the active translation root of this core.
    ///
    /// # Safety
    /// `root` must be a complete page table tree that maps the currently
    /// executing kernel code and stack.
    unsafe fn load_root(root: FrameIndex);

    /// Drop any cached translation for `addr` on this core.
    fn flush_page(addr: VirtAddr);

    /// Drop every non-global cached translation on this core.
    fn flush_all();
}

/// The architecture this kernel image is built for.
#[cfg(target_arch = "aarch64")]
pub type NativeArch = aarch64::Aarch64;

/// The architecture this kernel image is built for.
#[cfg(not(target_arch = "aarch64"))]
pub type NativeArch = x86_64::X86_64;
