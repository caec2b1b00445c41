//! Cross-core TLB invalidation
//!
//! The architecture hooks in [`PageTableArch`](crate::arch::PageTableArch)
//! only reach the local core. Once more than one core can run a tree, an
//! entry that is cleared, downgraded or repointed must also be dropped from
//! every other core's TLB before the frame behind it is reused. The memory
//! context hands a [`TlbShootdown`] to every page table manager it creates;
//! the manager calls it after the local flush and before any frame goes
//! back to the allocator.

use super::address::{FrameIndex, VirtAddr};

/// Remote invalidation, provided by the platform's IPI layer.
///
/// `root` names the tree whose entry changed. An implementation may limit
/// the broadcast to cores that have `root` active, except for kernel-half
/// addresses: those are shared by every tree and must reach all cores.
/// Both calls return only once every targeted core has flushed.
pub trait TlbShootdown: Sync {
    /// Invalidate the translation of one page on other cores.
    fn shootdown_page(&self, root: FrameIndex, addr: VirtAddr);

    /// Invalidate every non-global translation of `root` on other cores.
    fn shootdown_all(&self, root: FrameIndex);
}

/// The single-core case: the local flush is already enough.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalOnly;

impl TlbShootdown for LocalOnly {
    #[inline]
    fn shootdown_page(&self, _root: FrameIndex, _addr: VirtAddr) {}

    #[inline]
    fn shootdown_all(&self, _root: FrameIndex) {}
}
