//! Address Spaces
//!
//! An [`AddressSpace`] is a counted reference to a [`Directory`]: one page
//! table root plus the lock that serializes every mutation of its tree.
//! Threads of one process hold references to the same directory; a fork
//! gets a directory of its own.
//!
//! # Lifecycle
//! - [`AddressSpace::new_for_kernel`] builds the kernel directory once. The
//!   memory context keeps a reference forever, so it is never destroyed.
//! - [`AddressSpace::new_user`] and [`AddressSpace::fork_copy`] start at one
//!   reference.
//! - [`AddressSpace::drop_ref`] (or plain `drop`) is the only way a tree is
//!   torn down: the last reference frees it.
//!
//! # Shared Memory
//! A user directory also records the [`SharedRegion`]s attached to it. The
//! attachments hold the regions alive and are dropped after the tree is
//! freed, so a region's frames outlive every entry that points at them.
//!
//! # Security Properties
//! - User spaces cannot map into the kernel half; kernel-half mappings
//!   go through the kernel directory so every tree sees them
//! - Kernel-half addresses never carry the USER flag

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use log::{debug, info, warn};
use spin::Mutex;

use super::address::{FrameIndex, PhysAddr, VirtAddr, PAGE_SIZE};
use super::context::KernelMemoryContext;
use super::mapper::Root;
use super::paging::PteFlags;
use super::phys::FrameMapper;
use super::shm::{self, Attachment, SharedRegion};
use crate::arch::PageTableArch;
use crate::error::MemoryError;

/// Which half of the address space a directory may mutate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    /// The kernel directory: kernel half plus anything mapped before the
    /// first process exists.
    Kernel,
    /// A process directory: user half only.
    User,
}

/// A page table root and the lock guarding its tree.
pub struct Directory<A: PageTableArch, M: FrameMapper> {
    mm: &'static KernelMemoryContext<A, M>,
    kind: SpaceKind,
    root_frame: FrameIndex,
    /// Taken before `root` when both are needed.
    shared: Mutex<Vec<Attachment<A, M>>>,
    root: Mutex<Root>,
}

impl<A: PageTableArch, M: FrameMapper> Drop for Directory<A, M> {
    fn drop(&mut self) {
        if self.kind == SpaceKind::Kernel {
            return;
        }
        let root = self.root.get_mut();
        self.mm.pages().free_tree(root);
        debug!("address space {} destroyed", self.root_frame);
    }
}

/// A counted reference to a [`Directory`].
pub struct AddressSpace<A: PageTableArch, M: FrameMapper> {
    dir: Arc<Directory<A, M>>,
}

impl<A: PageTableArch, M: FrameMapper> AddressSpace<A, M> {
    fn wrap(mm: &'static KernelMemoryContext<A, M>, kind: SpaceKind, root: Root) -> Self {
        Self {
            dir: Arc::new(Directory {
                mm,
                kind,
                root_frame: root.frame(),
                shared: Mutex::new(Vec::new()),
                root: Mutex::new(root),
            }),
        }
    }

    /// The kernel directory, created on first call.
    ///
    /// Root slots covering the heap, MMIO and module windows are populated
    /// up front so that user spaces created later share whatever gets
    /// mapped there.
    pub fn new_for_kernel(mm: &'static KernelMemoryContext<A, M>) -> Result<Self, MemoryError> {
        if let Some(kernel) = mm.kernel_space() {
            return Ok(kernel.clone_ref());
        }

        let pages = mm.pages();
        let mut root = pages.new_root(None)?;
        let config = mm.config();
        for window in [
            config.heap.window(),
            config.mmio_window,
            config.module_window,
        ] {
            if !VirtAddr::is_canonical(window.start) || !VirtAddr::new(window.start).is_kernel() {
                continue;
            }
            if let Err(err) =
                pages.populate_root_slots(&mut root, VirtAddr::new(window.start), window.size)
            {
                pages.free_address_space(root);
                return Err(err);
            }
        }

        let space = Self::wrap(mm, SpaceKind::Kernel, root);
        info!("kernel directory at {}", space.root_frame());
        Ok(mm.install_kernel_space(space).clone_ref())
    }

    /// A fresh process directory sharing the kernel half.
    pub fn new_user(mm: &'static KernelMemoryContext<A, M>) -> Result<Self, MemoryError> {
        let kernel = mm.kernel_space().ok_or(MemoryError::NotMapped)?;
        let root = {
            let kernel_root = kernel.dir.root.lock();
            mm.pages().new_root(Some(&kernel_root))?
        };
        Ok(Self::wrap(mm, SpaceKind::User, root))
    }

    /// Another reference to the same directory.
    pub fn clone_ref(&self) -> Self {
        Self {
            dir: Arc::clone(&self.dir),
        }
    }

    /// A new directory holding a copy of this one's user mappings, using
    /// the configured fork policy.
    pub fn fork_copy(&self) -> Result<Self, MemoryError> {
        let mm = self.dir.mm;
        let child = {
            let mut root = self.dir.root.lock();
            mm.pages()
                .clone_address_space(&mut root, mm.config().fork_policy)?
        };
        debug!(
            "forked {} into {} ({:?})",
            self.root_frame(),
            child.frame(),
            mm.config().fork_policy
        );
        Ok(Self::wrap(mm, SpaceKind::User, child))
    }

    /// Give up this reference. Returns true if it was the last one and the
    /// tree has been freed.
    pub fn drop_ref(self) -> bool {
        Arc::into_inner(self.dir).is_some()
    }

    /// Number of live references.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.dir)
    }

    #[inline]
    pub fn root_frame(&self) -> FrameIndex {
        self.dir.root_frame
    }

    #[inline]
    pub fn kind(&self) -> SpaceKind {
        self.dir.kind
    }

    #[inline]
    pub fn is_kernel(&self) -> bool {
        self.dir.kind == SpaceKind::Kernel
    }

    /// Whether both references name the same directory.
    #[inline]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.dir, &other.dir)
    }

    /// Make this tree the active translation root of `cpu`.
    ///
    /// Must run on `cpu` itself.
    pub fn activate(&self, cpu: usize) {
        let frame = self.root_frame();
        // SAFETY: every directory carries the kernel half of the kernel
        // directory, which maps the running kernel.
        unsafe { A::load_root(frame) };
        A::flush_all();
        self.dir.mm.set_active(cpu, frame);
    }

    fn check(&self, va: VirtAddr, flags: PteFlags) -> Result<(), MemoryError> {
        if va.is_kernel() && (self.dir.kind == SpaceKind::User || flags.contains(PteFlags::USER)) {
            return Err(MemoryError::InvalidPermissions);
        }
        Ok(())
    }

    /// Map `frame` at `va`. The frame must already be allocated.
    pub fn map(&self, va: VirtAddr, frame: FrameIndex, flags: PteFlags) -> Result<(), MemoryError> {
        self.check(va, flags)?;
        let mut root = self.dir.root.lock();
        self.dir.mm.pages().map(&mut root, va, frame, flags)
    }

    /// Map a fresh zeroed frame at `va`.
    pub fn map_new(&self, va: VirtAddr, flags: PteFlags) -> Result<FrameIndex, MemoryError> {
        self.check(va, flags)?;
        let mut root = self.dir.root.lock();
        self.dir.mm.pages().map_new(&mut root, va, flags)
    }

    /// Map device registers at `phys`, bypassing frame bookkeeping.
    pub fn map_device(&self, va: VirtAddr, phys: PhysAddr, flags: PteFlags) -> Result<(), MemoryError> {
        self.check(va, flags)?;
        let mut root = self.dir.root.lock();
        self.dir.mm.pages().map_device(&mut root, va, phys, flags)
    }

    pub fn unmap(&self, va: VirtAddr) -> Result<(), MemoryError> {
        self.check(va, PteFlags::empty())?;
        let mut root = self.dir.root.lock();
        self.dir.mm.pages().unmap(&mut root, va)
    }

    /// Unmap `va` and hand its frame reference to the caller.
    pub fn unshare(&self, va: VirtAddr) -> Result<FrameIndex, MemoryError> {
        self.check(va, PteFlags::empty())?;
        let mut root = self.dir.root.lock();
        self.dir.mm.pages().unshare(&mut root, va)
    }

    /// Unmap every mapped page in `[start, start + pages * PAGE_SIZE)`.
    /// Holes are skipped. Returns how many pages were unmapped.
    pub fn unmap_range(&self, start: VirtAddr, pages: usize) -> Result<usize, MemoryError> {
        self.check(start, PteFlags::empty())?;
        let mut root = self.dir.root.lock();
        let manager = self.dir.mm.pages();
        let mut removed = 0;
        for page in 0..pages {
            match manager.unmap(&mut root, start.add(page * PAGE_SIZE)) {
                Ok(()) => removed += 1,
                Err(MemoryError::NotMapped) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(removed)
    }

    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        let root = self.dir.root.lock();
        self.dir.mm.pages().translate(&root, va)
    }

    pub fn query(&self, va: VirtAddr) -> Option<(FrameIndex, PteFlags)> {
        let root = self.dir.root.lock();
        self.dir.mm.pages().query(&root, va)
    }

    /// Resolve a page fault at `va`. Returns `Ok(false)` for a genuine
    /// fault the caller must report to the faulting thread.
    pub fn handle_page_fault(&self, va: VirtAddr, write: bool) -> Result<bool, MemoryError> {
        if !write || (va.is_kernel() && self.dir.kind == SpaceKind::User) {
            return Ok(false);
        }
        let mut root = self.dir.root.lock();
        self.dir.mm.pages().handle_write_fault(&mut root, va)
    }

    /// Check a raw pointer handed in by user space and turn it into an
    /// address. Non-canonical values are rejected rather than sign-extended.
    pub fn user_pointer(&self, addr: usize, len: usize, write: bool) -> Result<VirtAddr, MemoryError> {
        let va = VirtAddr::try_new(addr).ok_or(MemoryError::InvalidAddress)?;
        self.validate_user(va, len, write)?;
        Ok(va)
    }

    /// Check a user buffer before the kernel touches it.
    pub fn validate_user(&self, va: VirtAddr, len: usize, write: bool) -> Result<(), MemoryError> {
        let mut root = self.dir.root.lock();
        self.dir.mm.pages().validate_user(&mut root, va, len, write)
    }

    pub fn read_bytes(&self, va: VirtAddr, buf: &mut [u8]) -> Result<(), MemoryError> {
        let root = self.dir.root.lock();
        self.dir.mm.pages().read_bytes(&root, va, buf)
    }

    pub fn write_bytes(&self, va: VirtAddr, data: &[u8]) -> Result<(), MemoryError> {
        self.check(va, PteFlags::empty())?;
        let mut root = self.dir.root.lock();
        self.dir.mm.pages().write_bytes(&mut root, va, data)
    }

    /// Drop every user mapping and shared memory attachment, keeping the
    /// directory itself.
    pub fn clear_user(&self) -> usize {
        let mut attached = self.dir.shared.lock();
        let released = {
            let mut root = self.dir.root.lock();
            self.dir.mm.pages().clear_user(&mut root)
        };
        attached.clear();
        released
    }

    /// Map every page of `region` at the first free spot of the shared
    /// memory window. Returns the address of its first byte.
    pub fn attach_shared(&self, region: &SharedRegion<A, M>) -> Result<VirtAddr, MemoryError> {
        if self.is_kernel() {
            return Err(MemoryError::InvalidPermissions);
        }
        let mut attached = self.dir.shared.lock();
        if attached.iter().any(|a| a.region.same_as(region)) {
            return Err(MemoryError::AlreadyMapped);
        }
        let window = self.dir.mm.config().shm_window;
        let start = shm::find_gap(attached.as_slice(), window, region.size())
            .filter(|start| start.is_user())
            .ok_or(MemoryError::InvalidAddress)?;

        {
            let mut root = self.dir.root.lock();
            let pages = self.dir.mm.pages();
            let flags = PteFlags::USER_DATA | PteFlags::SHARED;
            for (index, &frame) in region.frames().iter().enumerate() {
                if let Err(err) = pages.map(&mut root, start.add(index * PAGE_SIZE), frame, flags) {
                    for done in 0..index {
                        let undone = pages.unmap(&mut root, start.add(done * PAGE_SIZE));
                        debug_assert!(undone.is_ok(), "rollback of {} failed: {:?}", start, undone);
                    }
                    return Err(err);
                }
            }
        }

        let at = attached.partition_point(|a| a.start < start);
        attached.insert(
            at,
            Attachment {
                start,
                region: region.clone(),
            },
        );
        debug!("{:?} attached at {} in {}", region.name(), start, self.root_frame());
        Ok(start)
    }

    /// Unmap `region` from this space. Its frames are freed once no other
    /// handle or attachment holds it.
    pub fn detach_shared(&self, region: &SharedRegion<A, M>) -> Result<(), MemoryError> {
        let mut attached = self.dir.shared.lock();
        let index = attached
            .iter()
            .position(|a| a.region.same_as(region))
            .ok_or(MemoryError::NotMapped)?;
        let attachment = attached.remove(index);

        let mut root = self.dir.root.lock();
        let pages = self.dir.mm.pages();
        for page in 0..attachment.region.pages() {
            match pages.unmap(&mut root, attachment.start.add(page * PAGE_SIZE)) {
                // Already unmapped page by page
                Ok(()) | Err(MemoryError::NotMapped) => {}
                Err(err) => warn!("detaching {:?}: {}", region.name(), err),
            }
        }
        Ok(())
    }

    /// Number of mapped pages that belong to shared memory regions.
    pub fn shared_pages(&self) -> usize {
        let root = self.dir.root.lock();
        self.dir.mm.pages().count_shared_pages(&root)
    }

    /// Number of mapped user pages.
    pub fn user_pages(&self) -> usize {
        let root = self.dir.root.lock();
        self.dir.mm.pages().count_user_pages(&root)
    }
}

impl<A: PageTableArch, M: FrameMapper> fmt::Debug for AddressSpace<A, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("root", &self.root_frame())
            .field("kind", &self.kind())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForkPolicy, MemoryConfig};
    use crate::mm::testing::{self, TestContext};

    fn used(mm: &TestContext) -> usize {
        mm.frames().lock().bitmap().used_frames()
    }

    #[test]
    fn kernel_directory_is_created_once() {
        let mm = testing::bare_context(64);
        let first = AddressSpace::new_for_kernel(mm).unwrap();
        let again = AddressSpace::new_for_kernel(mm).unwrap();
        assert!(first.same_as(&again));
        assert!(first.is_kernel());
        // Root plus the two level-1 tables behind the kernel windows
        assert_eq!(used(mm), 1 + 3);

        assert!(!again.drop_ref());
        assert!(!first.drop_ref());
        assert_eq!(mm.kernel_space().unwrap().ref_count(), 1);
    }

    #[test]
    fn refcount_frees_tree_on_last_drop() {
        let mm = testing::context(64);
        let before = used(mm);

        let space = AddressSpace::new_user(mm).unwrap();
        space.map_new(VirtAddr::new(0x40_0000), PteFlags::USER_DATA).unwrap();
        let refs: alloc::vec::Vec<_> = (0..3).map(|_| space.clone_ref()).collect();
        assert_eq!(space.ref_count(), 4);

        for r in refs {
            assert!(!r.drop_ref());
            assert!(used(mm) > before);
        }
        assert!(space.drop_ref());
        assert_eq!(used(mm), before);
    }

    #[test]
    fn fork_and_free_leaks_nothing() {
        for policy in [ForkPolicy::EagerCopy, ForkPolicy::CopyOnWrite] {
            let mm = testing::context_with(MemoryConfig::new(128).with_fork_policy(policy));
            let before = used(mm);

            let a = AddressSpace::new_user(mm).unwrap();
            a.map_new(VirtAddr::new(0x40_0000), PteFlags::USER_DATA).unwrap();
            let b = a.fork_copy().unwrap();
            assert!(!a.same_as(&b));
            assert_eq!(b.user_pages(), 1);

            assert!(a.drop_ref());
            assert!(b.drop_ref());
            assert_eq!(used(mm), before, "{:?}", policy);
        }
    }

    #[test]
    fn fork_is_isolated_under_both_policies() {
        for policy in [ForkPolicy::EagerCopy, ForkPolicy::CopyOnWrite] {
            let mm = testing::context_with(MemoryConfig::new(128).with_fork_policy(policy));
            let va = VirtAddr::new(0x40_0000);

            let parent = AddressSpace::new_user(mm).unwrap();
            parent.map_new(va, PteFlags::USER_DATA).unwrap();
            parent.write_bytes(va, b"before").unwrap();
            let child = parent.fork_copy().unwrap();

            child.write_bytes(va, b"child!").unwrap();
            parent.write_bytes(va.add(8), b"parent").unwrap();

            let mut buf = [0u8; 14];
            parent.read_bytes(va, &mut buf).unwrap();
            assert_eq!(&buf, b"before\0\0parent");
            child.read_bytes(va, &mut buf).unwrap();
            assert_eq!(&buf, b"child!\0\0\0\0\0\0\0\0");
        }
    }

    #[test]
    fn write_fault_resolves_cow() {
        let mm = testing::context_with(MemoryConfig::new(64).with_fork_policy(ForkPolicy::CopyOnWrite));
        let va = VirtAddr::new(0x40_0000);
        let parent = AddressSpace::new_user(mm).unwrap();
        let frame = parent.map_new(va, PteFlags::USER_DATA).unwrap();
        let child = parent.fork_copy().unwrap();

        assert_eq!(child.handle_page_fault(va.add(0x10), false), Ok(false));
        assert_eq!(child.handle_page_fault(va.add(0x10), true), Ok(true));
        assert_ne!(child.query(va).unwrap().0, frame);
        assert_eq!(parent.handle_page_fault(va, true), Ok(true));
        assert_eq!(parent.query(va), Some((frame, PteFlags::USER_DATA)));
        assert_eq!(parent.handle_page_fault(va, true), Ok(false));
    }

    #[test]
    fn kernel_mappings_reach_existing_user_spaces() {
        let mm = testing::context(64);
        let user = AddressSpace::new_user(mm).unwrap();
        let kernel = mm.kernel_space().unwrap();

        let heap = VirtAddr::new(mm.config().heap.start);
        let frame = kernel.map_new(heap, PteFlags::KERNEL_DATA).unwrap();
        assert_eq!(user.translate(heap).map(|p| p.frame()), Some(frame));

        assert_eq!(
            user.map_new(heap.add(PAGE_SIZE), PteFlags::KERNEL_DATA),
            Err(MemoryError::InvalidPermissions)
        );
        assert_eq!(
            kernel.map_new(heap.add(PAGE_SIZE), PteFlags::USER_DATA),
            Err(MemoryError::InvalidPermissions)
        );
        assert_eq!(user.unmap(heap), Err(MemoryError::InvalidPermissions));
    }

    #[test]
    fn unmap_range_skips_holes() {
        let mm = testing::context(64);
        let space = AddressSpace::new_user(mm).unwrap();
        let start = VirtAddr::new(0x10_0000);
        space.map_new(start, PteFlags::USER_DATA).unwrap();
        space.map_new(start.add(2 * PAGE_SIZE), PteFlags::USER_DATA).unwrap();

        assert_eq!(space.unmap_range(start, 4), Ok(2));
        assert_eq!(space.user_pages(), 0);
    }

    #[test]
    fn activation_is_tracked_per_cpu() {
        let mm = testing::context(64);
        let space = AddressSpace::new_user(mm).unwrap();
        space.activate(1);
        assert_eq!(mm.active_root(1), Some(space.root_frame()));
        assert_eq!(mm.active_root(0), None);
    }

    #[test]
    fn raw_user_pointers_must_be_canonical() {
        let mm = testing::context(64);
        let space = AddressSpace::new_user(mm).unwrap();
        let va = VirtAddr::new(0x40_0000);
        space.map_new(va, PteFlags::USER_DATA).unwrap();

        assert_eq!(space.user_pointer(0x40_0010, 16, true), Ok(va.add(0x10)));
        assert_eq!(
            space.user_pointer(0x0000_8000_0000_0000, 8, false),
            Err(MemoryError::InvalidAddress)
        );
        // Sign extension would have pointed this at the kernel heap
        assert_eq!(
            space.user_pointer(0x0000_FF00_0000_0000, 8, false),
            Err(MemoryError::InvalidAddress)
        );
        assert_eq!(space.user_pointer(0x50_0000, 8, false), Err(MemoryError::InvalidAddress));
    }

    #[test]
    fn kernel_directory_refuses_shared_regions() {
        let mm = testing::context(64);
        let region = SharedRegion::new(mm, "k", PAGE_SIZE).unwrap();
        let kernel = mm.kernel_space().unwrap();
        assert_eq!(kernel.attach_shared(&region), Err(MemoryError::InvalidPermissions));
    }

    #[test]
    fn user_space_needs_kernel_directory() {
        let mm = testing::bare_context(16);
        assert_eq!(
            AddressSpace::new_user(mm).map(|_| ()),
            Err(MemoryError::NotMapped)
        );
    }
}
