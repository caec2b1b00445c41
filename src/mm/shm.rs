//! Shared Memory
//!
//! Named runs of physical frames that several address spaces map at once.
//! A [`SharedRegion`] is a counted handle on the frames. The
//! [`ShmRegistry`] only remembers names weakly, so a region lives as long
//! as some handle or attachment does, and its frames go back to the
//! allocator with the last one.
//!
//! Attached pages carry [`PteFlags::SHARED`](super::paging::PteFlags::SHARED):
//! unmapping them never touches the bitmap, fork does not inherit them and
//! kernel writes land in the shared frame.
//!
//! # Lock Order
//! Registry, then an address space's attachment list, then its root.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;

use log::{debug, trace};
use spin::Mutex;

use super::address::{pages_for, FrameIndex, VirtAddr, PAGE_SIZE};
use super::context::KernelMemoryContext;
use super::frame::FrameGuard;
use super::phys::{self, FrameMapper};
use super::space::AddressSpace;
use crate::arch::PageTableArch;
use crate::config::VirtWindow;
use crate::error::MemoryError;

struct Chunk<A: PageTableArch, M: FrameMapper> {
    mm: &'static KernelMemoryContext<A, M>,
    name: String,
    frames: Vec<FrameIndex>,
}

impl<A: PageTableArch, M: FrameMapper> Drop for Chunk<A, M> {
    fn drop(&mut self) {
        let mut frames = self.mm.frames().lock();
        for &frame in &self.frames {
            frames.free(frame);
        }
        debug!("shared region {:?} freed ({} pages)", self.name, self.frames.len());
    }
}

/// A counted handle on one shared memory region.
pub struct SharedRegion<A: PageTableArch, M: FrameMapper> {
    chunk: Arc<Chunk<A, M>>,
}

impl<A: PageTableArch, M: FrameMapper> SharedRegion<A, M> {
    /// Allocate `size` bytes (rounded up to whole pages) of zeroed frames.
    /// Nothing is kept if an allocation fails part way.
    pub fn new(
        mm: &'static KernelMemoryContext<A, M>,
        name: &str,
        size: usize,
    ) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidAddress);
        }
        let pages = pages_for(size);
        let mut chunk = Chunk {
            mm,
            name: String::from(name),
            frames: Vec::with_capacity(pages),
        };
        for _ in 0..pages {
            let frame = FrameGuard::allocate(mm.frames())?;
            // SAFETY: the frame was just allocated so we have exclusive access.
            unsafe { phys::zero_frame(mm.phys(), frame.frame()) };
            chunk.frames.push(frame.into_frame());
        }
        trace!("shared region {:?}: {} pages", name, pages);
        Ok(Self {
            chunk: Arc::new(chunk),
        })
    }

    pub fn name(&self) -> &str {
        &self.chunk.name
    }

    #[inline]
    pub fn pages(&self) -> usize {
        self.chunk.frames.len()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.pages() * PAGE_SIZE
    }

    /// Backing frames, in address order.
    #[inline]
    pub fn frames(&self) -> &[FrameIndex] {
        &self.chunk.frames
    }

    /// Live handles, attachments included.
    pub fn handles(&self) -> usize {
        Arc::strong_count(&self.chunk)
    }

    /// Whether both handles name the same region.
    #[inline]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.chunk, &other.chunk)
    }
}

impl<A: PageTableArch, M: FrameMapper> Clone for SharedRegion<A, M> {
    fn clone(&self) -> Self {
        Self {
            chunk: Arc::clone(&self.chunk),
        }
    }
}

impl<A: PageTableArch, M: FrameMapper> fmt::Debug for SharedRegion<A, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name())
            .field("pages", &self.pages())
            .field("handles", &self.handles())
            .finish()
    }
}

/// One region mapped into one address space.
pub(crate) struct Attachment<A: PageTableArch, M: FrameMapper> {
    pub start: VirtAddr,
    pub region: SharedRegion<A, M>,
}

impl<A: PageTableArch, M: FrameMapper> Attachment<A, M> {
    fn end(&self) -> usize {
        self.start.as_usize() + self.region.size()
    }
}

/// First address in `window` where `size` bytes fit between the
/// attachments, which are sorted by start address.
pub(crate) fn find_gap<A: PageTableArch, M: FrameMapper>(
    attached: &[Attachment<A, M>],
    window: VirtWindow,
    size: usize,
) -> Option<VirtAddr> {
    let mut cursor = window.start;
    for attachment in attached {
        if cursor.checked_add(size)? <= attachment.start.as_usize() {
            break;
        }
        cursor = cursor.max(attachment.end());
    }
    match cursor.checked_add(size) {
        Some(end) if end <= window.end() => Some(VirtAddr::new(cursor)),
        _ => None,
    }
}

/// Regions by name.
pub struct ShmRegistry<A: PageTableArch, M: FrameMapper> {
    mm: &'static KernelMemoryContext<A, M>,
    regions: Mutex<BTreeMap<String, Weak<Chunk<A, M>>>>,
}

impl<A: PageTableArch, M: FrameMapper> ShmRegistry<A, M> {
    pub fn new(mm: &'static KernelMemoryContext<A, M>) -> Self {
        Self {
            mm,
            regions: Mutex::new(BTreeMap::new()),
        }
    }

    /// The live region called `name`, or a new one of `size` bytes.
    ///
    /// An existing region keeps the size it was created with; check
    /// [`SharedRegion::size`].
    pub fn obtain(&self, name: &str, size: usize) -> Result<SharedRegion<A, M>, MemoryError> {
        let mut regions = self.regions.lock();
        if let Some(chunk) = regions.get(name).and_then(Weak::upgrade) {
            return Ok(SharedRegion { chunk });
        }
        regions.retain(|_, chunk| chunk.strong_count() > 0);

        let region = SharedRegion::new(self.mm, name, size)?;
        regions.insert(String::from(name), Arc::downgrade(&region.chunk));
        debug!("shared region {:?} created ({} pages)", name, region.pages());
        Ok(region)
    }

    pub fn lookup(&self, name: &str) -> Option<SharedRegion<A, M>> {
        let chunk = self.regions.lock().get(name).and_then(Weak::upgrade)?;
        Some(SharedRegion { chunk })
    }

    /// Detach the region called `name` from `space`.
    pub fn release(&self, space: &AddressSpace<A, M>, name: &str) -> Result<(), MemoryError> {
        let region = self.lookup(name).ok_or(MemoryError::NotMapped)?;
        space.detach_shared(&region)
    }

    /// Number of regions still alive.
    pub fn live_regions(&self) -> usize {
        self.regions
            .lock()
            .values()
            .filter(|chunk| chunk.strong_count() > 0)
            .count()
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
    fn two_spaces_see_each_others_writes() {
        let mm = testing::context(128);
        let registry = ShmRegistry::new(mm);
        let a = AddressSpace::new_user(mm).unwrap();
        let b = AddressSpace::new_user(mm).unwrap();

        let region = registry.obtain("compositor/buffer", 5000).unwrap();
        assert_eq!(region.pages(), 2);
        let at_a = a.attach_shared(&region).unwrap();
        let same = registry.obtain("compositor/buffer", 1).unwrap();
        assert!(same.same_as(&region));
        assert_eq!(same.size(), 2 * PAGE_SIZE);
        let at_b = b.attach_shared(&same).unwrap();

        a.write_bytes(at_a.add(PAGE_SIZE - 2), b"span").unwrap();
        let mut buf = [0u8; 4];
        b.read_bytes(at_b.add(PAGE_SIZE - 2), &mut buf).unwrap();
        assert_eq!(&buf, b"span");
        assert_eq!(a.shared_pages(), 2);
        assert_eq!(a.user_pages(), 2);
        assert_eq!(a.query(at_a).map(|(f, _)| f), Some(region.frames()[0]));
    }

    #[test]
    fn frames_return_after_the_last_detach() {
        let mm = testing::context(128);
        let registry = ShmRegistry::new(mm);
        let a = AddressSpace::new_user(mm).unwrap();
        let b = AddressSpace::new_user(mm).unwrap();
        let before = used(mm);

        let region = registry.obtain("shared", 3 * PAGE_SIZE).unwrap();
        a.attach_shared(&region).unwrap();
        b.attach_shared(&region).unwrap();
        let frames: Vec<_> = region.frames().to_vec();
        drop(region);
        assert_eq!(registry.live_regions(), 1);

        registry.release(&a, "shared").unwrap();
        assert_eq!(a.shared_pages(), 0);
        assert!(frames.iter().all(|&f| mm.frames().lock().bitmap().test(f)));
        assert_eq!(registry.release(&a, "shared"), Err(MemoryError::NotMapped));

        // Dropping the space drops its attachment with it
        assert!(b.drop_ref());
        assert!(frames.iter().all(|&f| !mm.frames().lock().bitmap().test(f)));
        assert_eq!(registry.live_regions(), 0);
        assert!(registry.lookup("shared").is_none());
        assert!(a.drop_ref());
        assert_eq!(used(mm), before - 2);
    }

    #[test]
    fn attachments_fill_gaps_first_fit() {
        let mm = testing::context(128);
        let registry = ShmRegistry::new(mm);
        let space = AddressSpace::new_user(mm).unwrap();
        let base = VirtAddr::new(mm.config().shm_window.start);

        let one = registry.obtain("one", PAGE_SIZE).unwrap();
        let two = registry.obtain("two", 2 * PAGE_SIZE).unwrap();
        let three = registry.obtain("three", PAGE_SIZE).unwrap();
        assert_eq!(space.attach_shared(&one), Ok(base));
        assert_eq!(space.attach_shared(&two), Ok(base.add(PAGE_SIZE)));
        assert_eq!(space.attach_shared(&one), Err(MemoryError::AlreadyMapped));

        space.detach_shared(&one).unwrap();
        assert_eq!(space.attach_shared(&three), Ok(base));
        assert_eq!(space.attach_shared(&one), Ok(base.add(3 * PAGE_SIZE)));
    }

    #[test]
    fn window_exhaustion_is_reported() {
        let config = MemoryConfig::new(64)
            .with_shm_window(VirtWindow::new(0x2_0000_0000, 2 * PAGE_SIZE));
        let mm = testing::context_with(config);
        let registry = ShmRegistry::new(mm);
        let space = AddressSpace::new_user(mm).unwrap();

        let big = registry.obtain("big", 3 * PAGE_SIZE).unwrap();
        assert_eq!(space.attach_shared(&big), Err(MemoryError::InvalidAddress));
        assert_eq!(space.user_pages(), 0);
        assert_eq!(registry.obtain("empty", 0).map(|_| ()), Err(MemoryError::InvalidAddress));
    }

    #[test]
    fn failed_allocation_keeps_nothing() {
        let mm = testing::context(32);
        let registry = ShmRegistry::new(mm);
        let before = used(mm);

        let result = registry.obtain("huge", 64 * PAGE_SIZE);
        assert_eq!(result.map(|_| ()), Err(MemoryError::OutOfFrames));
        assert_eq!(used(mm), before);
        assert_eq!(registry.live_regions(), 0);
    }

    #[test]
    fn fork_does_not_inherit_attachments() {
        for policy in [ForkPolicy::EagerCopy, ForkPolicy::CopyOnWrite] {
            let mm = testing::context_with(MemoryConfig::new(128).with_fork_policy(policy));
            let registry = ShmRegistry::new(mm);
            let parent = AddressSpace::new_user(mm).unwrap();
            parent.map_new(VirtAddr::new(0x40_0000), crate::mm::PteFlags::USER_DATA).unwrap();

            let region = registry.obtain("fb", PAGE_SIZE).unwrap();
            let at = parent.attach_shared(&region).unwrap();
            let child = parent.fork_copy().unwrap();

            assert_eq!(child.user_pages(), 1);
            assert_eq!(child.shared_pages(), 0);
            assert_eq!(child.translate(at), None);
            assert_eq!(region.handles(), 2);
        }
    }

    #[test]
    fn clearing_a_space_detaches_everything() {
        let mm = testing::context(64);
        let registry = ShmRegistry::new(mm);
        let space = AddressSpace::new_user(mm).unwrap();
        let region = registry.obtain("log", PAGE_SIZE).unwrap();
        space.attach_shared(&region).unwrap();
        assert_eq!(region.handles(), 2);

        assert_eq!(space.clear_user(), 1);
        assert_eq!(region.handles(), 1);
        assert_eq!(space.detach_shared(&region), Err(MemoryError::NotMapped));
        assert!(mm.frames().lock().bitmap().test(region.frames()[0]));
    }
}
