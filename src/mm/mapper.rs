//! Page Table Manager
//!
//! Creates, mutates and tears down 4-level page table trees. Table nodes are
//! allocated straight from the frame allocator and never from the kernel
//! heap, so the heap can grow through this module without a cycle.
//!
//! # Ownership
//! A tree is named by its [`Root`]. Mutating calls take `&mut Root`, so the
//! borrow checker forces every mutator through whoever owns the root (in
//! practice the locked [`AddressSpace`](super::space::AddressSpace)).
//! Read-only calls take `&Root`.
//!
//! # Security Properties
//! - A frame's bitmap bit is set before any entry points at it; `map`
//!   refuses frames the allocator has not handed out
//! - Other cores are told to drop a stale translation before its frame
//!   can be reused (see [`TlbShootdown`])
//! - Leaf frames are released exactly once, through their share count
//! - Device and externally shared mappings never touch the bitmap
//! - The kernel half of a tree (root slots 256..511) is never freed or copied

use core::marker::PhantomData;

use log::{trace, warn};

use super::address::{
    FrameIndex, PhysAddr, VirtAddr, ENTRIES_PER_TABLE, KERNEL_ROOT_FIRST, PAGE_LEVELS, PAGE_SIZE,
    USER_VIRT_TOP,
};
use super::frame::{FrameGuard, LockedFrameAllocator};
use super::paging::{Descriptor, PageTableEntry, PteFlags};
use super::phys::{self, FrameMapper};
use super::tlb::{LocalOnly, TlbShootdown};
use crate::arch::PageTableArch;
use crate::config::ForkPolicy;
use crate::error::MemoryError;

const LEAF_LEVEL: usize = PAGE_LEVELS - 1;

/// The root table of one page table tree.
///
/// Not `Clone`: holding a `Root` is holding the tree.
#[derive(Debug, PartialEq, Eq)]
pub struct Root {
    frame: FrameIndex,
}

impl Root {
    /// Frame holding the root table (what goes into CR3 / TTBR).
    #[inline]
    pub fn frame(&self) -> FrameIndex {
        self.frame
    }
}

/// Page table operations over one frame allocator and physical mapper.
pub struct PageTableManager<'a, A, M: ?Sized> {
    frames: &'a LockedFrameAllocator,
    phys: &'a M,
    shootdown: &'a dyn TlbShootdown,
    _arch: PhantomData<fn() -> A>,
}

impl<'a, A: PageTableArch, M: FrameMapper + ?Sized> PageTableManager<'a, A, M> {
    /// A manager that only flushes the local TLB.
    pub fn new(frames: &'a LockedFrameAllocator, phys: &'a M) -> Self {
        Self {
            frames,
            phys,
            shootdown: &LocalOnly,
            _arch: PhantomData,
        }
    }

    /// Broadcast invalidations through `shootdown` as well.
    pub fn with_shootdown(mut self, shootdown: &'a dyn TlbShootdown) -> Self {
        self.shootdown = shootdown;
        self
    }

    fn invalidate_page(&self, root: FrameIndex, va: VirtAddr) {
        A::flush_page(va);
        self.shootdown.shootdown_page(root, va);
    }

    fn invalidate_all(&self, root: FrameIndex) {
        A::flush_all();
        self.shootdown.shootdown_all(root);
    }

    /// Allocate a frame and zero it.
    fn alloc_zeroed(&self) -> Result<FrameIndex, MemoryError> {
        let guard = FrameGuard::allocate(self.frames)?;
        // SAFETY: the frame was just allocated so we have exclusive access.
        unsafe { phys::zero_frame(self.phys, guard.frame()) };
        Ok(guard.into_frame())
    }

    /// Allocate an empty root table.
    ///
    /// With `kernel` given, the kernel half of its root is copied in so the
    /// new tree shares every kernel mapping by reference.
    pub fn new_root(&self, kernel: Option<&Root>) -> Result<Root, MemoryError> {
        let frame = self.alloc_zeroed()?;
        if let Some(kernel) = kernel {
            // SAFETY: the new table is unreachable by anyone else; the kernel
            // root is only read.
            let (dst, src) = unsafe {
                (
                    phys::table_mut(self.phys, frame),
                    phys::table_ref(self.phys, kernel.frame),
                )
            };
            for index in KERNEL_ROOT_FIRST..ENTRIES_PER_TABLE {
                dst[index] = src[index];
            }
        }
        Ok(Root { frame })
    }

    /// Make sure every root slot covering `[start, start + size)` points to
    /// a level-1 table, so trees created later see mappings added there.
    pub fn populate_root_slots(
        &self,
        root: &mut Root,
        start: VirtAddr,
        size: usize,
    ) -> Result<(), MemoryError> {
        if size == 0 {
            return Ok(());
        }
        let first = start.table_index(0);
        let last = start.add(size - 1).table_index(0);

        // SAFETY: `root` is borrowed mutably.
        let table = unsafe { phys::table_mut(self.phys, root.frame) };
        for index in first..=last {
            if table[index].decode::<A>(0) == Descriptor::Absent {
                let next = self.alloc_zeroed()?;
                table[index].set(A::encode_table(next, index < KERNEL_ROOT_FIRST));
            }
        }
        Ok(())
    }

    /// Descend to the leaf entry for `va`.
    ///
    /// With `create`, missing intermediate tables are allocated, zeroed and
    /// installed on the way down and the result is always `Some`. Without
    /// it, a missing level yields `None`. A large-page leaf in the way
    /// yields `None`, or `AlreadyMapped` when creating.
    pub fn walk<'r>(
        &self,
        root: &'r mut Root,
        va: VirtAddr,
        create: bool,
    ) -> Result<Option<&'r mut PageTableEntry>, MemoryError> {
        let mut table_frame = root.frame;

        for level in 0..LEAF_LEVEL {
            // SAFETY: `root` is borrowed mutably, so this tree has no other mutator.
            let table = unsafe { phys::table_mut(self.phys, table_frame) };
            let entry = &mut table[va.table_index(level)];

            table_frame = match entry.decode::<A>(level) {
                Descriptor::Table(next) => next,
                Descriptor::Leaf { .. } if create => return Err(MemoryError::AlreadyMapped),
                Descriptor::Leaf { .. } => return Ok(None),
                Descriptor::Absent if create => {
                    // A fresh table is fully zeroed before it becomes reachable
                    let next = self.alloc_zeroed()?;
                    entry.set(A::encode_table(next, va.is_user()));
                    next
                }
                Descriptor::Absent => return Ok(None),
            };
        }

        // SAFETY: as above.
        let leaf_table = unsafe { phys::table_mut(self.phys, table_frame) };
        Ok(Some(&mut leaf_table[va.table_index(LEAF_LEVEL)]))
    }

    /// Map the page at `va` to `frame`.
    ///
    /// The frame must already be marked used, unless the mapping is a
    /// device or externally shared one.
    pub fn map(
        &self,
        root: &mut Root,
        va: VirtAddr,
        frame: FrameIndex,
        flags: PteFlags,
    ) -> Result<(), MemoryError> {
        if !va.is_aligned() {
            return Err(MemoryError::Misaligned);
        }
        if flags.owns_frame() && !self.frames.lock().is_allocated(frame) {
            warn!("refusing to map unallocated frame {} at {}", frame, va);
            return Err(MemoryError::InvalidAddress);
        }

        let entry = self
            .walk(root, va, true)?
            .ok_or(MemoryError::NotMapped)?;
        if entry.decode::<A>(LEAF_LEVEL) != Descriptor::Absent {
            return Err(MemoryError::AlreadyMapped);
        }

        entry.set(A::encode_leaf(frame, flags | PteFlags::PRESENT));
        A::flush_page(va);
        trace!("map {} -> {} ({:?})", va, frame, flags);
        Ok(())
    }

    /// Allocate a zeroed frame and map it at `va`.
    pub fn map_new(
        &self,
        root: &mut Root,
        va: VirtAddr,
        flags: PteFlags,
    ) -> Result<FrameIndex, MemoryError> {
        let frame = FrameGuard::allocate(self.frames)?;
        // SAFETY: the frame was just allocated so we have exclusive access.
        unsafe { phys::zero_frame(self.phys, frame.frame()) };
        self.map(root, va, frame.frame(), flags)?;
        Ok(frame.into_frame())
    }

    /// Map device registers at `phys`. The frame bitmap is not consulted
    /// and unmapping never frees anything.
    pub fn map_device(
        &self,
        root: &mut Root,
        va: VirtAddr,
        phys: PhysAddr,
        flags: PteFlags,
    ) -> Result<(), MemoryError> {
        if !phys.is_aligned() {
            return Err(MemoryError::Misaligned);
        }
        self.map(
            root,
            va,
            phys.frame(),
            flags | PteFlags::DEVICE | PteFlags::NO_CACHE,
        )
    }

    /// Remove the mapping at `va` and release its frame.
    ///
    /// Copy-on-write frames lose one sharer; device and externally shared
    /// mappings are cleared without touching the bitmap.
    pub fn unmap(&self, root: &mut Root, va: VirtAddr) -> Result<(), MemoryError> {
        let (frame, flags) = self.clear_leaf(root, va)?;
        if flags.owns_frame() {
            self.frames.lock().release(frame);
        }
        Ok(())
    }

    /// Remove the mapping at `va` without releasing the frame.
    ///
    /// The reference the entry held passes to the caller.
    pub fn unshare(&self, root: &mut Root, va: VirtAddr) -> Result<FrameIndex, MemoryError> {
        self.clear_leaf(root, va).map(|(frame, _)| frame)
    }

    fn clear_leaf(
        &self,
        root: &mut Root,
        va: VirtAddr,
    ) -> Result<(FrameIndex, PteFlags), MemoryError> {
        if !va.is_aligned() {
            return Err(MemoryError::Misaligned);
        }
        let entry = self
            .walk(root, va, false)?
            .ok_or(MemoryError::NotMapped)?;
        let Descriptor::Leaf { frame, flags, .. } = entry.decode::<A>(LEAF_LEVEL) else {
            return Err(MemoryError::NotMapped);
        };

        entry.clear();
        self.invalidate_page(root.frame, va);
        trace!("unmap {} (was {})", va, frame);

        if va.is_user() {
            self.prune(root, va);
        }
        Ok((frame, flags))
    }

    /// Release user-half tables along the path to `va` that became empty.
    /// The root itself is never released.
    fn prune(&self, root: &mut Root, va: VirtAddr) {
        let mut path = [root.frame; PAGE_LEVELS];
        for level in 0..LEAF_LEVEL {
            // SAFETY: `root` is borrowed mutably.
            let table = unsafe { phys::table_ref(self.phys, path[level]) };
            match table[va.table_index(level)].decode::<A>(level) {
                Descriptor::Table(next) => path[level + 1] = next,
                _ => return,
            }
        }

        for level in (1..PAGE_LEVELS).rev() {
            // SAFETY: `root` is borrowed mutably; child and parent are distinct frames.
            let (table, parent) = unsafe {
                (
                    phys::table_ref(self.phys, path[level]),
                    phys::table_mut(self.phys, path[level - 1]),
                )
            };
            if !table.is_empty_in(0..ENTRIES_PER_TABLE) {
                break;
            }
            parent[va.table_index(level - 1)].clear();
            self.frames.lock().free(path[level]);
        }
    }

    /// Resolve `va` to the 4 KiB frame backing it, its flags and the offset
    /// within that frame. Large-page leaves resolve to the covered frame.
    fn resolve(&self, root: &Root, va: VirtAddr) -> Option<(FrameIndex, PteFlags, usize)> {
        let mut table_frame = root.frame;
        for level in 0..PAGE_LEVELS {
            // SAFETY: read only; a mutator would need `&mut Root`.
            let table = unsafe { phys::table_ref(self.phys, table_frame) };
            match table[va.table_index(level)].decode::<A>(level) {
                Descriptor::Absent => return None,
                Descriptor::Table(next) => table_frame = next,
                Descriptor::Leaf { frame, flags, size } => {
                    let offset = va.as_usize() & (size - 1);
                    return Some((frame.offset(offset / PAGE_SIZE), flags, offset % PAGE_SIZE));
                }
            }
        }
        None
    }

    /// Physical address `va` translates to, if mapped.
    pub fn translate(&self, root: &Root, va: VirtAddr) -> Option<PhysAddr> {
        self.resolve(root, va)
            .map(|(frame, _, offset)| frame.start_address().add(offset))
    }

    /// Frame and flags of the mapping covering `va`.
    pub fn query(&self, root: &Root, va: VirtAddr) -> Option<(FrameIndex, PteFlags)> {
        self.resolve(root, va).map(|(frame, flags, _)| (frame, flags))
    }

    /// Build a new tree with the same user mappings as `source`.
    ///
    /// Kernel-half root slots are shared by reference. Device and externally
    /// shared mappings are not inherited. Under [`ForkPolicy::CopyOnWrite`]
    /// writable pages become read-only in both trees and are copied on the
    /// first write; everything else is copied right away.
    ///
    /// On failure the partial copy is torn down and `source` stays valid.
    pub fn clone_address_space(
        &self,
        source: &mut Root,
        policy: ForkPolicy,
    ) -> Result<Root, MemoryError> {
        let mut child = self.new_root(Some(&*source))?;

        let result = {
            let mut clone_leaf = |va: VirtAddr,
                                  entry: &mut PageTableEntry,
                                  frame: FrameIndex,
                                  flags: PteFlags|
             -> Result<(), MemoryError> {
                if !flags.owns_frame() {
                    return Ok(());
                }
                if policy == ForkPolicy::CopyOnWrite && self.frames.lock().share(frame) {
                    let shared = if flags.contains(PteFlags::WRITABLE) {
                        (flags - PteFlags::WRITABLE) | PteFlags::COW
                    } else {
                        flags
                    };
                    entry.set(A::encode_leaf(frame, shared));
                    return self.map(&mut child, va, frame, shared).map_err(|err| {
                        self.frames.lock().release(frame);
                        err
                    });
                }
                if policy == ForkPolicy::CopyOnWrite {
                    warn!("share count of {} saturated, copying {}", frame, va);
                }
                self.copy_into(&mut child, va, frame, writable_again(flags))
            };
            self.visit_user_leaves(source.frame, 0, [0; PAGE_LEVELS], &mut clone_leaf)
        };

        if policy == ForkPolicy::CopyOnWrite {
            // Parent entries lost their write permission
            self.invalidate_all(source.frame);
        }
        match result {
            Ok(()) => Ok(child),
            Err(err) => {
                warn!("address space clone failed: {}", err);
                self.free_address_space(child);
                Err(err)
            }
        }
    }

    fn copy_into(
        &self,
        child: &mut Root,
        va: VirtAddr,
        source: FrameIndex,
        flags: PteFlags,
    ) -> Result<(), MemoryError> {
        let copy = FrameGuard::allocate(self.frames)?;
        // SAFETY: `copy` is fresh and exclusively ours; `source` is only read.
        unsafe { phys::copy_frame(self.phys, source, copy.frame()) };
        self.map(child, va, copy.frame(), flags)?;
        copy.into_frame();
        Ok(())
    }

    /// Call `f` on every 4 KiB user-half leaf below `table_frame`.
    ///
    /// The caller must hold the tree's `Root` mutably.
    fn visit_user_leaves<F>(
        &self,
        table_frame: FrameIndex,
        level: usize,
        mut indices: [usize; PAGE_LEVELS],
        f: &mut F,
    ) -> Result<(), MemoryError>
    where
        F: FnMut(VirtAddr, &mut PageTableEntry, FrameIndex, PteFlags) -> Result<(), MemoryError>,
    {
        let end = if level == 0 {
            KERNEL_ROOT_FIRST
        } else {
            ENTRIES_PER_TABLE
        };
        // SAFETY: the caller holds the root mutably; recursion only reaches
        // distinct child frames.
        let table = unsafe { phys::table_mut(self.phys, table_frame) };

        for index in 0..end {
            indices[level] = index;
            match table[index].decode::<A>(level) {
                Descriptor::Absent => {}
                Descriptor::Table(next) => self.visit_user_leaves(next, level + 1, indices, f)?,
                Descriptor::Leaf { frame, flags, size } if size == PAGE_SIZE => {
                    f(VirtAddr::from_indices(indices), &mut table[index], frame, flags)?;
                }
                Descriptor::Leaf { size, .. } => {
                    warn!("skipping {:#x} byte block in user half", size);
                }
            }
        }
        Ok(())
    }

    /// Release every user mapping and user-half table, keeping the root and
    /// its kernel half. Returns the number of leaf mappings removed.
    pub fn clear_user(&self, root: &mut Root) -> usize {
        // Unhook every subtree first so nothing is freed while still reachable
        let mut detached = [FrameIndex::new(0); KERNEL_ROOT_FIRST];
        let mut count = 0;
        {
            // SAFETY: `root` is borrowed mutably.
            let table = unsafe { phys::table_mut(self.phys, root.frame) };
            for index in 0..KERNEL_ROOT_FIRST {
                if let Descriptor::Table(next) = table[index].decode::<A>(0) {
                    detached[count] = next;
                    count += 1;
                    table[index].clear();
                }
            }
        }
        if count == 0 {
            return 0;
        }
        self.invalidate_all(root.frame);

        detached[..count]
            .iter()
            .map(|&subtree| self.free_subtree(subtree, 1))
            .sum()
    }

    fn free_subtree(&self, table_frame: FrameIndex, level: usize) -> usize {
        // SAFETY: the subtree is private to a tree whose root the caller holds mutably.
        let table = unsafe { phys::table_ref(self.phys, table_frame) };
        let mut released = 0;
        for (_, entry) in table.iter_used() {
            match entry.decode::<A>(level) {
                Descriptor::Table(next) => released += self.free_subtree(next, level + 1),
                Descriptor::Leaf { frame, flags, size } => {
                    if size == PAGE_SIZE && flags.owns_frame() {
                        self.frames.lock().release(frame);
                    }
                    released += 1;
                }
                Descriptor::Absent => {}
            }
        }
        self.frames.lock().free(table_frame);
        released
    }

    /// Tear down a whole tree: user leaves, user tables, then the root.
    pub fn free_address_space(&self, mut root: Root) {
        self.free_tree(&mut root);
    }

    /// [`free_address_space`](Self::free_address_space) for owners that
    /// cannot give up the `Root` value. `root` must not be used afterwards.
    pub(crate) fn free_tree(&self, root: &mut Root) {
        let released = self.clear_user(root);
        self.frames.lock().free(root.frame);
        trace!("freed tree {} ({} leaves)", root.frame, released);
    }

    /// Resolve a write fault on a copy-on-write page.
    ///
    /// Returns `Ok(false)` if `va` is not a pending copy-on-write page (a
    /// genuine protection fault). The last sharer gets the frame back
    /// writable; anyone else gets a private copy.
    pub fn handle_write_fault(&self, root: &mut Root, va: VirtAddr) -> Result<bool, MemoryError> {
        let page = va.align_down();
        let Some(entry) = self.walk(root, page, false)? else {
            return Ok(false);
        };
        let Descriptor::Leaf { frame, flags, .. } = entry.decode::<A>(LEAF_LEVEL) else {
            return Ok(false);
        };
        if !flags.contains(PteFlags::COW) {
            return Ok(false);
        }
        let writable = writable_again(flags);

        let exclusive = self.frames.lock().is_exclusive(frame);
        if exclusive {
            entry.set(A::encode_leaf(frame, writable));
            self.invalidate_page(root.frame, page);
        } else {
            self.replace_with_copy(root, page, frame, writable)?;
        }
        trace!("cow fault at {} resolved (exclusive={})", page, exclusive);
        Ok(true)
    }

    /// Point the leaf at `page` to a private copy of `frame` with `flags`,
    /// then drop this tree's share of `frame`.
    fn replace_with_copy(
        &self,
        root: &mut Root,
        page: VirtAddr,
        frame: FrameIndex,
        flags: PteFlags,
    ) -> Result<(), MemoryError> {
        let copy = FrameGuard::allocate(self.frames)?;
        // SAFETY: `copy` is fresh; `frame` is only read.
        unsafe { phys::copy_frame(self.phys, frame, copy.frame()) };
        let entry = self
            .walk(root, page, false)?
            .ok_or(MemoryError::NotMapped)?;
        entry.set(A::encode_leaf(copy.into_frame(), flags));
        self.invalidate_page(root.frame, page);
        self.frames.lock().release(frame);
        Ok(())
    }

    /// Check that `[va, va + len)` is mapped user memory, writable when
    /// `write` is set. Pending copy-on-write pages are resolved on the way.
    pub fn validate_user(
        &self,
        root: &mut Root,
        va: VirtAddr,
        len: usize,
        write: bool,
    ) -> Result<(), MemoryError> {
        if len == 0 {
            return Ok(());
        }
        if va.as_usize() == 0 {
            return Err(MemoryError::InvalidAddress);
        }
        let end = va
            .as_usize()
            .checked_add(len)
            .ok_or(MemoryError::InvalidAddress)?;
        if end > USER_VIRT_TOP {
            return Err(MemoryError::InvalidAddress);
        }

        let mut page = va.align_down();
        while page.as_usize() < end {
            match self.query(root, page) {
                None => return Err(MemoryError::InvalidAddress),
                Some((_, flags)) if !flags.contains(PteFlags::USER) => {
                    return Err(MemoryError::InvalidPermissions)
                }
                Some((_, flags)) if write && !flags.contains(PteFlags::WRITABLE) => {
                    if !self.handle_write_fault(root, page)? {
                        return Err(MemoryError::InvalidPermissions);
                    }
                }
                Some(_) => {}
            }
            page = page.add(PAGE_SIZE);
        }
        Ok(())
    }

    /// Copy bytes out of the tree's memory starting at `va`.
    pub fn read_bytes(&self, root: &Root, va: VirtAddr, buf: &mut [u8]) -> Result<(), MemoryError> {
        let mut done = 0;
        while done < buf.len() {
            let at = va.add(done);
            let (frame, flags, offset) = self.resolve(root, at).ok_or(MemoryError::NotMapped)?;
            if flags.contains(PteFlags::DEVICE) {
                return Err(MemoryError::InvalidPermissions);
            }
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            // SAFETY: the frame is mapped in this tree and chunk stays inside it.
            unsafe { phys::read_frame(self.phys, frame, offset, &mut buf[done..done + chunk]) };
            done += chunk;
        }
        Ok(())
    }

    /// Copy bytes into the tree's memory starting at `va`.
    ///
    /// Copy-on-write pages are made private first; other read-only pages are
    /// written as the kernel sees them (this is how loaders fill code pages).
    /// A read-only page a fork left shared is copied before it is written,
    /// so the write never shows through in the other tree. Pages of a
    /// shared memory region are written in place.
    pub fn write_bytes(&self, root: &mut Root, va: VirtAddr, data: &[u8]) -> Result<(), MemoryError> {
        let mut done = 0;
        while done < data.len() {
            let at = va.add(done);
            let (frame, flags) = self.query(root, at).ok_or(MemoryError::NotMapped)?;
            if flags.contains(PteFlags::DEVICE) {
                return Err(MemoryError::InvalidPermissions);
            }
            if flags.contains(PteFlags::COW) {
                self.handle_write_fault(root, at)?;
            } else if flags.owns_frame() && !self.frames.lock().is_exclusive(frame) {
                self.replace_with_copy(root, at.align_down(), frame, flags)?;
            }
            let (frame, _, offset) = self.resolve(root, at).ok_or(MemoryError::NotMapped)?;
            let chunk = (PAGE_SIZE - offset).min(data.len() - done);
            // SAFETY: the frame is privately mapped in this tree, which we hold mutably.
            unsafe { phys::write_frame(self.phys, frame, offset, &data[done..done + chunk]) };
            done += chunk;
        }
        Ok(())
    }

    /// Number of 4 KiB leaf mappings in the user half.
    pub fn count_user_pages(&self, root: &Root) -> usize {
        self.count_user_leaves(root, &|_| true)
    }

    /// Number of user leaves that map shared memory.
    pub fn count_shared_pages(&self, root: &Root) -> usize {
        self.count_user_leaves(root, &|flags| flags.contains(PteFlags::SHARED))
    }

    fn count_user_leaves(&self, root: &Root, keep: &dyn Fn(PteFlags) -> bool) -> usize {
        // SAFETY: read only.
        let table = unsafe { phys::table_ref(self.phys, root.frame) };
        (0..KERNEL_ROOT_FIRST)
            .filter_map(|index| match table[index].decode::<A>(0) {
                Descriptor::Table(next) => Some(self.count_leaves(next, 1, keep)),
                _ => None,
            })
            .sum()
    }

    fn count_leaves(
        &self,
        table_frame: FrameIndex,
        level: usize,
        keep: &dyn Fn(PteFlags) -> bool,
    ) -> usize {
        // SAFETY: read only.
        let table = unsafe { phys::table_ref(self.phys, table_frame) };
        table
            .iter()
            .map(|entry| match entry.decode::<A>(level) {
                Descriptor::Table(next) => self.count_leaves(next, level + 1, keep),
                Descriptor::Leaf { size, flags, .. } if size == PAGE_SIZE && keep(flags) => 1,
                _ => 0,
            })
            .sum()
    }
}

/// Flags a private copy of a copy-on-write page gets.
#[inline]
fn writable_again(flags: PteFlags) -> PteFlags {
    if flags.contains(PteFlags::COW) {
        (flags - PteFlags::COW) | PteFlags::WRITABLE
    } else {
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::X86_64;
    use core::sync::atomic::Ordering;

    use crate::mm::phys::DirectMapper;
    use crate::mm::testing;
    use crate::mm::tlb::recording::Recorder;

    type Manager<'a> = PageTableManager<'a, X86_64, DirectMapper>;

    fn used(frames: &LockedFrameAllocator) -> usize {
        frames.lock().bitmap().used_frames()
    }

    #[test]
    fn map_then_fault() {
        let (frames, phys) = (testing::frame_allocator(64), testing::ram(64));
        let pages = Manager::new(&frames, &phys);
        let mut root = pages.new_root(None).unwrap();

        let frame = FrameIndex::new(5);
        frames.lock().bitmap_mut().mark_used(frame);
        pages
            .map(&mut root, VirtAddr::new(0x40_0000), frame, PteFlags::USER_DATA)
            .unwrap();

        let phys_addr = pages.translate(&root, VirtAddr::new(0x40_0000)).unwrap();
        assert_eq!(phys_addr.frame(), frame);
        assert_eq!(pages.translate(&root, VirtAddr::new(0x40_1000)), None);
        assert_eq!(
            pages.translate(&root, VirtAddr::new(0x40_0123)),
            Some(frame.start_address().add(0x123))
        );
    }

    #[test]
    fn map_unmap_round_trip_releases_everything() {
        let (frames, phys) = (testing::frame_allocator(64), testing::ram(64));
        let pages = Manager::new(&frames, &phys);
        let mut root = pages.new_root(None).unwrap();
        let before = used(&frames);

        let va = VirtAddr::new(0x7FFF_0000_0000);
        pages.map_new(&mut root, va, PteFlags::USER_DATA).unwrap();
        // Three intermediate tables plus the page itself
        assert_eq!(used(&frames), before + 4);

        pages.unmap(&mut root, va).unwrap();
        assert_eq!(pages.translate(&root, va), None);
        assert_eq!(used(&frames), before);
        assert_eq!(pages.unmap(&mut root, va), Err(MemoryError::NotMapped));
    }

    #[test]
    fn walk_without_create_does_not_allocate() {
        let (frames, phys) = (testing::frame_allocator(32), testing::ram(32));
        let pages = Manager::new(&frames, &phys);
        let mut root = pages.new_root(None).unwrap();
        let before = used(&frames);

        let va = VirtAddr::new(0x1000);
        assert!(pages.walk(&mut root, va, false).unwrap().is_none());
        assert_eq!(used(&frames), before);

        let entry = pages.walk(&mut root, va, true).unwrap().unwrap();
        assert!(entry.is_empty());
        assert_eq!(used(&frames), before + 3);
    }

    #[test]
    fn rejects_double_map_and_misalignment() {
        let (frames, phys) = (testing::frame_allocator(32), testing::ram(32));
        let pages = Manager::new(&frames, &phys);
        let mut root = pages.new_root(None).unwrap();

        let va = VirtAddr::new(0x20_0000);
        let frame = pages.map_new(&mut root, va, PteFlags::USER_DATA).unwrap();
        assert_eq!(
            pages.map(&mut root, va, frame, PteFlags::USER_DATA),
            Err(MemoryError::AlreadyMapped)
        );
        assert_eq!(
            pages.map(&mut root, VirtAddr::new(0x20_0010), frame, PteFlags::USER_DATA),
            Err(MemoryError::Misaligned)
        );
    }

    #[test]
    fn map_fails_cleanly_when_out_of_frames() {
        let (frames, phys) = (testing::frame_allocator(4), testing::ram(4));
        let pages = Manager::new(&frames, &phys);
        let mut root = pages.new_root(None).unwrap();

        // Frame 0 reserved, one root: two frames left, four needed
        let result = pages.map_new(&mut root, VirtAddr::new(0x1000), PteFlags::USER_DATA);
        assert_eq!(result, Err(MemoryError::OutOfFrames));
        assert_eq!(pages.translate(&root, VirtAddr::new(0x1000)), None);
    }

    #[test]
    fn eager_clone_is_isolated() {
        let (frames, phys) = (testing::frame_allocator(128), testing::ram(128));
        let pages = Manager::new(&frames, &phys);
        let mut parent = pages.new_root(None).unwrap();

        let va = VirtAddr::new(0x40_0000);
        pages.map_new(&mut parent, va, PteFlags::USER_DATA).unwrap();
        pages.write_bytes(&mut parent, va, b"parent").unwrap();

        let mut child = pages
            .clone_address_space(&mut parent, ForkPolicy::EagerCopy)
            .unwrap();
        assert_ne!(
            pages.translate(&parent, va),
            pages.translate(&child, va)
        );

        pages.write_bytes(&mut child, va, b"child!").unwrap();
        let mut buf = [0u8; 6];
        pages.read_bytes(&parent, va, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");
        pages.read_bytes(&child, va, &mut buf).unwrap();
        assert_eq!(&buf, b"child!");
    }

    #[test]
    fn cow_clone_shares_until_written() {
        let (frames, phys) = (testing::frame_allocator(128), testing::ram(128));
        let pages = Manager::new(&frames, &phys);
        let mut parent = pages.new_root(None).unwrap();

        let va = VirtAddr::new(0x40_0000);
        let frame = pages.map_new(&mut parent, va, PteFlags::USER_DATA).unwrap();
        pages.write_bytes(&mut parent, va, b"shared").unwrap();

        let mut child = pages
            .clone_address_space(&mut parent, ForkPolicy::CopyOnWrite)
            .unwrap();
        assert_eq!(pages.query(&child, va).map(|(f, _)| f), Some(frame));
        let (_, flags) = pages.query(&parent, va).unwrap();
        assert!(flags.contains(PteFlags::COW));
        assert!(!flags.contains(PteFlags::WRITABLE));
        assert_eq!(frames.lock().share_count(frame), 2);

        // Child writes: gets a private copy, parent keeps the original
        pages.write_bytes(&mut child, va, b"CHILD").unwrap();
        let (child_frame, child_flags) = pages.query(&child, va).unwrap();
        assert_ne!(child_frame, frame);
        assert!(child_flags.contains(PteFlags::WRITABLE));
        let mut buf = [0u8; 6];
        pages.read_bytes(&parent, va, &mut buf).unwrap();
        assert_eq!(&buf, b"shared");

        // Parent is now the last sharer: no copy, just write permission back
        let before = used(&frames);
        assert!(pages.handle_write_fault(&mut parent, va).unwrap());
        assert_eq!(pages.query(&parent, va), Some((frame, PteFlags::USER_DATA)));
        assert_eq!(used(&frames), before);
    }

    #[test]
    fn free_after_clone_leaks_nothing() {
        for policy in [ForkPolicy::EagerCopy, ForkPolicy::CopyOnWrite] {
            let (frames, phys) = (testing::frame_allocator(128), testing::ram(128));
            let pages = Manager::new(&frames, &phys);
            let before = used(&frames);

            let mut parent = pages.new_root(None).unwrap();
            for i in 0..4 {
                let va = VirtAddr::new(0x40_0000 + i * PAGE_SIZE);
                pages.map_new(&mut parent, va, PteFlags::USER_DATA).unwrap();
            }
            let code = VirtAddr::new(0x1_0000_0000);
            pages.map_new(&mut parent, code, PteFlags::USER_CODE).unwrap();

            let child = pages.clone_address_space(&mut parent, policy).unwrap();
            assert_eq!(pages.count_user_pages(&child), 5);

            pages.free_address_space(parent);
            pages.free_address_space(child);
            assert_eq!(used(&frames), before, "{:?}", policy);
        }
    }

    #[test]
    fn failed_clone_leaks_nothing() {
        let (frames, phys) = (testing::frame_allocator(16), testing::ram(16));
        let pages = Manager::new(&frames, &phys);
        let mut parent = pages.new_root(None).unwrap();
        for i in 0..4 {
            let va = VirtAddr::new(0x40_0000 + i * PAGE_SIZE);
            pages.map_new(&mut parent, va, PteFlags::USER_DATA).unwrap();
        }
        let before = used(&frames);

        let result = pages.clone_address_space(&mut parent, ForkPolicy::EagerCopy);
        assert_eq!(result, Err(MemoryError::OutOfFrames));
        assert_eq!(used(&frames), before);
        assert_eq!(pages.count_user_pages(&parent), 4);
    }

    #[test]
    fn device_mappings_bypass_the_bitmap() {
        let (frames, phys) = (testing::frame_allocator(32), testing::ram(32));
        let pages = Manager::new(&frames, &phys);
        let mut root = pages.new_root(None).unwrap();

        // Far outside the 32 managed frames
        let regs = PhysAddr::new(0xFEE0_0000);
        let va = VirtAddr::new(0x50_0000);
        pages
            .map_device(&mut root, va, regs, PteFlags::USER_DATA)
            .unwrap();
        let (_, flags) = pages.query(&root, va).unwrap();
        assert!(flags.contains(PteFlags::DEVICE | PteFlags::NO_CACHE));

        let child = pages
            .clone_address_space(&mut root, ForkPolicy::EagerCopy)
            .unwrap();
        assert_eq!(pages.translate(&child, va), None);

        let free_before = frames.lock().bitmap().free_frames();
        pages.unmap(&mut root, va).unwrap();
        // Only the pruned tables came back
        assert_eq!(frames.lock().bitmap().free_frames(), free_before + 3);
    }

    #[test]
    fn unshare_hands_the_frame_back() {
        let (frames, phys) = (testing::frame_allocator(32), testing::ram(32));
        let pages = Manager::new(&frames, &phys);
        let mut root = pages.new_root(None).unwrap();

        let va = VirtAddr::new(0x3000);
        let frame = pages.map_new(&mut root, va, PteFlags::USER_DATA).unwrap();
        assert_eq!(pages.unshare(&mut root, va), Ok(frame));
        assert!(frames.lock().bitmap().test(frame));
        frames.lock().free(frame);
    }

    #[test]
    fn kernel_half_is_shared_by_reference() {
        let (frames, phys) = (testing::frame_allocator(64), testing::ram(64));
        let pages = Manager::new(&frames, &phys);
        let mut kernel = pages.new_root(None).unwrap();
        let heap = VirtAddr::new(0xFFFF_FF00_0000_0000);
        pages.populate_root_slots(&mut kernel, heap, 1 << 20).unwrap();

        let mut user = pages.new_root(Some(&kernel)).unwrap();
        let frame = pages.map_new(&mut kernel, heap, PteFlags::KERNEL_DATA).unwrap();
        assert_eq!(pages.translate(&user, heap).map(|p| p.frame()), Some(frame));

        let before = used(&frames);
        assert_eq!(pages.clear_user(&mut user), 0);
        assert_eq!(used(&frames), before);
        assert_eq!(pages.translate(&user, heap).map(|p| p.frame()), Some(frame));
    }

    #[test]
    fn validates_user_pointers() {
        let (frames, phys) = (testing::frame_allocator(64), testing::ram(64));
        let pages = Manager::new(&frames, &phys);
        let mut root = pages.new_root(None).unwrap();

        let data = VirtAddr::new(0x40_0000);
        let code = VirtAddr::new(0x40_1000);
        pages.map_new(&mut root, data, PteFlags::USER_DATA).unwrap();
        pages.map_new(&mut root, code, PteFlags::USER_CODE).unwrap();

        assert_eq!(pages.validate_user(&mut root, data, 2 * PAGE_SIZE, false), Ok(()));
        assert_eq!(
            pages.validate_user(&mut root, data, 2 * PAGE_SIZE, true),
            Err(MemoryError::InvalidPermissions)
        );
        assert_eq!(
            pages.validate_user(&mut root, VirtAddr::new(0), 8, false),
            Err(MemoryError::InvalidAddress)
        );
        assert_eq!(
            pages.validate_user(&mut root, data.add(PAGE_SIZE * 2), 1, false),
            Err(MemoryError::InvalidAddress)
        );
        assert_eq!(
            pages.validate_user(&mut root, VirtAddr::new(0x7FFF_FFFF_F000), 0x2000, false),
            Err(MemoryError::InvalidAddress)
        );
    }

    #[test]
    fn validate_resolves_pending_cow() {
        let (frames, phys) = (testing::frame_allocator(64), testing::ram(64));
        let pages = Manager::new(&frames, &phys);
        let mut parent = pages.new_root(None).unwrap();
        let va = VirtAddr::new(0x40_0000);
        pages.map_new(&mut parent, va, PteFlags::USER_DATA).unwrap();
        let mut child = pages
            .clone_address_space(&mut parent, ForkPolicy::CopyOnWrite)
            .unwrap();

        assert_eq!(pages.validate_user(&mut child, va, 16, true), Ok(()));
        let (_, flags) = pages.query(&child, va).unwrap();
        assert!(flags.contains(PteFlags::WRITABLE));
        assert!(!pages.handle_write_fault(&mut child, va).unwrap());
    }

    #[test]
    fn map_refuses_unallocated_frames() {
        let (frames, phys) = (testing::frame_allocator(64), testing::ram(64));
        let pages = Manager::new(&frames, &phys);
        let mut root = pages.new_root(None).unwrap();
        let before = used(&frames);

        let va = VirtAddr::new(0x40_0000);
        for frame in [FrameIndex::new(40), FrameIndex::new(4096)] {
            assert_eq!(
                pages.map(&mut root, va, frame, PteFlags::USER_DATA),
                Err(MemoryError::InvalidAddress)
            );
        }
        assert_eq!(pages.translate(&root, va), None);
        assert_eq!(used(&frames), before);
        assert!(!frames.lock().bitmap().test(FrameIndex::new(40)));
    }

    #[test]
    fn remote_cores_are_told_about_every_stale_entry() {
        let (frames, phys) = (testing::frame_allocator(128), testing::ram(128));
        let remote = Recorder::new();
        let pages = Manager::new(&frames, &phys).with_shootdown(&remote);
        let mut parent = pages.new_root(None).unwrap();

        let va = VirtAddr::new(0x40_0000);
        pages.map_new(&mut parent, va, PteFlags::USER_DATA).unwrap();
        pages.map_new(&mut parent, va.add(PAGE_SIZE), PteFlags::USER_DATA).unwrap();
        // A fresh entry cannot be cached anywhere
        assert_eq!(remote.counts(), (0, 0));

        let mut child = pages
            .clone_address_space(&mut parent, ForkPolicy::CopyOnWrite)
            .unwrap();
        assert_eq!(remote.counts(), (0, 1));

        // Copy on one side, plain upgrade on the other
        pages.write_bytes(&mut child, va, b"x").unwrap();
        assert_eq!(remote.counts(), (1, 1));
        assert!(pages.handle_write_fault(&mut parent, va).unwrap());
        assert_eq!(remote.counts(), (2, 1));

        pages.unmap(&mut parent, va).unwrap();
        assert_eq!(remote.counts(), (3, 1));

        assert_eq!(pages.clear_user(&mut child), 2);
        assert_eq!(remote.counts(), (3, 2));
        // Nothing mapped, nothing to broadcast
        assert_eq!(pages.clear_user(&mut child), 0);
        assert_eq!(remote.counts(), (3, 2));
    }

    #[test]
    fn frames_stay_allocated_until_remote_flush() {
        let (frames, phys) = (testing::frame_allocator(64), testing::ram(64));
        let mut root = Manager::new(&frames, &phys).new_root(None).unwrap();
        let va = VirtAddr::new(0x40_0000);
        let frame = Manager::new(&frames, &phys)
            .map_new(&mut root, va, PteFlags::USER_DATA)
            .unwrap();

        let remote = Recorder::watching(&frames, frame);
        let pages = Manager::new(&frames, &phys).with_shootdown(&remote);
        pages.unmap(&mut root, va).unwrap();
        assert_eq!(remote.watched_still_used.load(Ordering::SeqCst), 1);
        assert!(!frames.lock().bitmap().test(frame));

        let frame = pages.map_new(&mut root, va, PteFlags::USER_DATA).unwrap();
        let remote = Recorder::watching(&frames, frame);
        let pages = Manager::new(&frames, &phys).with_shootdown(&remote);
        pages.clear_user(&mut root);
        assert_eq!(remote.counts(), (0, 1));
        assert_eq!(remote.watched_still_used.load(Ordering::SeqCst), 1);
        assert!(!frames.lock().bitmap().test(frame));
    }

    #[test]
    fn kernel_writes_to_forked_read_only_pages_stay_private() {
        let (frames, phys) = (testing::frame_allocator(64), testing::ram(64));
        let pages = Manager::new(&frames, &phys);
        let mut parent = pages.new_root(None).unwrap();

        let va = VirtAddr::new(0x40_0000);
        let frame = pages.map_new(&mut parent, va, PteFlags::USER_CODE).unwrap();
        pages.write_bytes(&mut parent, va, b"AAAA").unwrap();
        let child = pages
            .clone_address_space(&mut parent, ForkPolicy::CopyOnWrite)
            .unwrap();
        assert_eq!(frames.lock().share_count(frame), 2);

        pages.write_bytes(&mut parent, va, b"BBBB").unwrap();

        let mut buf = [0u8; 4];
        pages.read_bytes(&child, va, &mut buf).unwrap();
        assert_eq!(&buf, b"AAAA");
        pages.read_bytes(&parent, va, &mut buf).unwrap();
        assert_eq!(&buf, b"BBBB");
        assert_eq!(pages.query(&child, va), Some((frame, PteFlags::USER_CODE)));
        let (parent_frame, parent_flags) = pages.query(&parent, va).unwrap();
        assert_ne!(parent_frame, frame);
        assert_eq!(parent_flags, PteFlags::USER_CODE);
        assert!(frames.lock().is_exclusive(frame));
    }
}
