//! Kernel Memory Context
//!
//! Everything the memory core shares across cores, in one place: the frame
//! allocator, the physical mapper, the kernel directory and the bump
//! pointers of the fixed kernel windows.
//!
//! # Lifecycle
//! - Built once at boot (see [`boot::init`](super::boot::init))
//! - The kernel directory is installed once and never torn down
//! - Components receive `&'static KernelMemoryContext` explicitly

use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{info, warn};
use spin::{Mutex, Once};

use super::address::{page_align_up, FrameIndex, PhysAddr, VirtAddr, PAGE_SHIFT, PAGE_SIZE};
use super::frame::{FrameAllocator, LockedFrameAllocator};
use super::heap::HeapGrowth;
use super::mapper::PageTableManager;
use super::paging::PteFlags;
use super::phys::FrameMapper;
use super::space::AddressSpace;
use super::tlb::TlbShootdown;
use crate::arch::PageTableArch;
use crate::config::{MemoryConfig, VirtWindow, MAX_CPUS};
use crate::error::MemoryError;

#[allow(clippy::declare_interior_mutable_const)]
const NO_ROOT: AtomicUsize = AtomicUsize::new(0);

/// Shared state of the memory management core.
pub struct KernelMemoryContext<A: PageTableArch, M: FrameMapper> {
    config: MemoryConfig,
    frames: LockedFrameAllocator,
    phys: M,
    kernel_space: Once<AddressSpace<A, M>>,
    /// Next free address in the MMIO window.
    mmio_next: Mutex<usize>,
    /// Next free address in the module window.
    module_next: Mutex<usize>,
    /// Root frame + 1 active on each core, 0 if none.
    active: [AtomicUsize; MAX_CPUS],
    shootdown: Once<&'static dyn TlbShootdown>,
    _arch: PhantomData<fn() -> A>,
}

impl<A: PageTableArch, M: FrameMapper> KernelMemoryContext<A, M> {
    pub fn new(config: MemoryConfig, frames: FrameAllocator, phys: M) -> Self {
        info!(
            "[{}] {} frames ({} KiB), {} in use",
            A::NAME,
            frames.bitmap().total_frames(),
            frames.bitmap().total_frames() * PAGE_SIZE / 1024,
            frames.bitmap().used_frames()
        );
        Self {
            mmio_next: Mutex::new(config.mmio_window.start),
            module_next: Mutex::new(config.module_window.start),
            config,
            frames: Mutex::new(frames),
            phys,
            kernel_space: Once::new(),
            active: [NO_ROOT; MAX_CPUS],
            shootdown: Once::new(),
            _arch: PhantomData,
        }
    }

    #[inline]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    #[inline]
    pub fn frames(&self) -> &LockedFrameAllocator {
        &self.frames
    }

    #[inline]
    pub fn phys(&self) -> &M {
        &self.phys
    }

    /// Page table operations backed by this context.
    #[inline]
    pub fn pages(&self) -> PageTableManager<'_, A, M> {
        let pages = PageTableManager::new(&self.frames, &self.phys);
        match self.shootdown.get() {
            Some(remote) => pages.with_shootdown(*remote),
            None => pages,
        }
    }

    /// Install the cross-core invalidation used by every later page table
    /// change. Call before secondary cores start; only the first one sticks.
    pub fn set_shootdown(&self, remote: &'static dyn TlbShootdown) {
        let mut installed = false;
        self.shootdown.call_once(|| {
            installed = true;
            remote
        });
        if !installed {
            warn!("TLB shootdown already installed, ignoring");
        }
    }

    /// The kernel directory, once [`AddressSpace::new_for_kernel`] has run.
    #[inline]
    pub fn kernel_space(&self) -> Option<&AddressSpace<A, M>> {
        self.kernel_space.get()
    }

    fn kernel(&self) -> Result<&AddressSpace<A, M>, MemoryError> {
        self.kernel_space().ok_or(MemoryError::NotMapped)
    }

    /// Record the kernel directory. The first space installed wins.
    pub(crate) fn install_kernel_space(&self, space: AddressSpace<A, M>) -> &AddressSpace<A, M> {
        self.kernel_space.call_once(|| space)
    }

    fn active_slot(&self, cpu: usize) -> &AtomicUsize {
        assert!(cpu < MAX_CPUS, "cpu {} out of range ({} supported)", cpu, MAX_CPUS);
        &self.active[cpu]
    }

    /// Record that `root` is now live on `cpu`.
    ///
    /// # Panics
    /// Panics if `cpu` is not below [`MAX_CPUS`].
    pub(crate) fn set_active(&self, cpu: usize, root: FrameIndex) {
        self.active_slot(cpu)
            .store(root.as_usize() + 1, Ordering::Release);
    }

    /// Root frame currently loaded on `cpu`.
    ///
    /// # Panics
    /// Panics if `cpu` is not below [`MAX_CPUS`].
    pub fn active_root(&self, cpu: usize) -> Option<FrameIndex> {
        match self.active_slot(cpu).load(Ordering::Acquire) {
            0 => None,
            raw => Some(FrameIndex::new(raw - 1)),
        }
    }

    /// Physical memory in use, in KiB.
    pub fn used_memory_kib(&self) -> usize {
        self.frames.lock().bitmap().used_frames() * PAGE_SIZE / 1024
    }

    /// Physical memory under management, in KiB.
    pub fn total_memory_kib(&self) -> usize {
        self.frames.lock().bitmap().total_frames() * PAGE_SIZE / 1024
    }

    /// Map device registers at `phys` into the MMIO window, uncached.
    ///
    /// Window space is never reclaimed; drivers keep their mappings.
    pub fn map_mmio_region(&self, phys: PhysAddr, size: usize) -> Result<VirtAddr, MemoryError> {
        if size == 0 || size % PAGE_SIZE != 0 || !phys.is_aligned() {
            return Err(MemoryError::Misaligned);
        }
        let kernel = self.kernel()?;

        let mut next = self.mmio_next.lock();
        let start = *next;
        check_window(&self.config.mmio_window, start, size)?;

        for offset in (0..size).step_by(PAGE_SIZE) {
            let va = VirtAddr::new(start + offset);
            if let Err(err) = kernel.map_device(va, phys.add(offset), PteFlags::KERNEL_DEVICE) {
                roll_back(kernel, VirtAddr::new(start), offset / PAGE_SIZE);
                return Err(err);
            }
        }
        *next = start + size;
        info!("mmio {} mapped at {:#x} ({} pages)", phys, start, size >> PAGE_SHIFT);
        Ok(VirtAddr::new(start))
    }

    /// Allocate and map fresh memory in the module window.
    pub fn map_module(&self, size: usize) -> Result<VirtAddr, MemoryError> {
        let size = page_align_up(size.max(1));
        let kernel = self.kernel()?;

        let mut next = self.module_next.lock();
        let start = *next;
        check_window(&self.config.module_window, start, size)?;

        for offset in (0..size).step_by(PAGE_SIZE) {
            let va = VirtAddr::new(start + offset);
            if let Err(err) = kernel.map_new(va, PteFlags::KERNEL_DATA) {
                roll_back(kernel, VirtAddr::new(start), offset / PAGE_SIZE);
                warn!("module region of {} bytes failed: {}", size, err);
                return Err(err);
            }
        }
        *next = start + size;
        Ok(VirtAddr::new(start))
    }

    /// Unmap and free a module region. If it was the most recent one, its
    /// window space is reused.
    pub fn unmap_module(&self, start: VirtAddr, size: usize) -> Result<(), MemoryError> {
        if !start.is_aligned() || size % PAGE_SIZE != 0 {
            return Err(MemoryError::Misaligned);
        }
        let kernel = self.kernel()?;

        let mut next = self.module_next.lock();
        for offset in (0..size).step_by(PAGE_SIZE) {
            kernel.unmap(start.add(offset))?;
        }
        if start.as_usize() + size == *next {
            *next = start.as_usize();
        }
        Ok(())
    }
}

/// Unmap the first `pages` pages at `start` after a mapping run failed
/// part way. Every one of them was mapped by the caller just before.
fn roll_back<A: PageTableArch, M: FrameMapper>(
    kernel: &AddressSpace<A, M>,
    start: VirtAddr,
    pages: usize,
) {
    for page in 0..pages {
        let va = start.add(page * PAGE_SIZE);
        let undone = kernel.unmap(va);
        debug_assert!(undone.is_ok(), "rollback of {} failed: {:?}", va, undone);
    }
}

fn check_window(window: &VirtWindow, start: usize, size: usize) -> Result<(), MemoryError> {
    match start.checked_add(size) {
        Some(end) if end <= window.end() => Ok(()),
        _ => Err(MemoryError::InvalidAddress),
    }
}

/// The kernel heap grows by mapping fresh frames into the kernel directory.
impl<A: PageTableArch, M: FrameMapper> HeapGrowth for KernelMemoryContext<A, M> {
    fn grow(&self, at: VirtAddr, pages: usize) -> Result<(), MemoryError> {
        let kernel = self.kernel()?;
        for page in 0..pages {
            let va = at.add(page * PAGE_SIZE);
            if let Err(err) = kernel.map_new(va, PteFlags::KERNEL_DATA) {
                roll_back(kernel, at, page);
                warn!("heap growth at {} failed after {} pages: {}", at, page, err);
                return Err(err);
            }
        }
        Ok(())
    }
}
