//! Boot-time Configuration
//!
//! Every tunable of the memory and scheduling core lives here and is handed
//! to the component constructors explicitly. All constructors are `const` so
//! a kernel image can build its configuration in a `static`.

/// Start of the kernel heap's reserved virtual range.
pub const DEFAULT_HEAP_START: usize = 0xFFFF_FF00_0000_0000;
/// Start of the window used for device register mappings.
pub const DEFAULT_MMIO_START: usize = 0xFFFF_FF1F_C000_0000;
/// Start of the window used for loadable kernel modules (-2 GiB).
pub const DEFAULT_MODULE_START: usize = 0xFFFF_FFFF_8000_0000;

/// Start of the user window shared memory regions are attached in.
pub const DEFAULT_SHM_START: usize = 0x0000_0002_0000_0000;

/// Maximum number of cores the scheduler and activation tracking support.
pub const MAX_CPUS: usize = 64;

/// How `fork` duplicates user memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkPolicy {
    /// Copy every user page into a fresh frame at fork time.
    EagerCopy,
    /// Share frames read-only and copy on the first write fault.
    CopyOnWrite,
}

/// A reserved range of virtual address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtWindow {
    pub start: usize,
    pub size: usize,
}

impl VirtWindow {
    pub const fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    /// One past the last address of the window.
    pub const fn end(&self) -> usize {
        self.start + self.size
    }
}

/// Kernel heap layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// First virtual address of the heap arena.
    pub start: usize,
    /// Bytes mapped when the general allocator takes over.
    pub initial_size: usize,
    /// Upper bound on the arena; growth past it fails.
    pub max_size: usize,
    /// Minimum bytes mapped per growth step.
    pub grow_step: usize,
}

impl HeapConfig {
    pub const fn new(start: usize) -> Self {
        Self {
            start,
            initial_size: 64 * 1024,
            max_size: 1 << 30,
            grow_step: 64 * 1024,
        }
    }

    pub const fn window(&self) -> VirtWindow {
        VirtWindow::new(self.start, self.max_size)
    }
}

/// Memory management configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Number of physical frames tracked by the bitmap.
    pub total_frames: usize,
    /// Frames `0..reserved_frames` are marked used at init (frame 0 at minimum).
    pub reserved_frames: usize,
    pub heap: HeapConfig,
    pub mmio_window: VirtWindow,
    pub module_window: VirtWindow,
    /// User range where shared memory regions are attached.
    pub shm_window: VirtWindow,
    pub fork_policy: ForkPolicy,
}

impl MemoryConfig {
    pub const fn new(total_frames: usize) -> Self {
        Self {
            total_frames,
            reserved_frames: 1,
            heap: HeapConfig::new(DEFAULT_HEAP_START),
            mmio_window: VirtWindow::new(DEFAULT_MMIO_START, 1 << 30),
            module_window: VirtWindow::new(DEFAULT_MODULE_START, 1 << 30),
            shm_window: VirtWindow::new(DEFAULT_SHM_START, 1 << 33),
            fork_policy: ForkPolicy::EagerCopy,
        }
    }

    pub const fn with_reserved_frames(mut self, count: usize) -> Self {
        // Frame 0 is never handed out
        self.reserved_frames = if count == 0 { 1 } else { count };
        self
    }

    pub const fn with_heap(mut self, heap: HeapConfig) -> Self {
        self.heap = heap;
        self
    }

    pub const fn with_mmio_window(mut self, window: VirtWindow) -> Self {
        self.mmio_window = window;
        self
    }

    pub const fn with_module_window(mut self, window: VirtWindow) -> Self {
        self.module_window = window;
        self
    }

    pub const fn with_shm_window(mut self, window: VirtWindow) -> Self {
        self.shm_window = window;
        self
    }

    pub const fn with_fork_policy(mut self, policy: ForkPolicy) -> Self {
        self.fork_policy = policy;
        self
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedConfig {
    /// Number of cores running the scheduler loop.
    pub cpus: usize,
    /// Timer ticks a thread may run before it is preempted.
    pub time_slice: u32,
}

impl SchedConfig {
    pub const fn new(cpus: usize) -> Self {
        Self { cpus, time_slice: 4 }
    }

    pub const fn with_time_slice(mut self, ticks: u32) -> Self {
        self.time_slice = if ticks == 0 { 1 } else { ticks };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_kernel_layout() {
        let config = MemoryConfig::new(1024);
        assert_eq!(config.reserved_frames, 1);
        assert_eq!(config.fork_policy, ForkPolicy::EagerCopy);
        assert!(config.heap.window().end() <= config.mmio_window.start);
    }

    #[test]
    fn frame_zero_stays_reserved() {
        let config = MemoryConfig::new(1024).with_reserved_frames(0);
        assert_eq!(config.reserved_frames, 1);
    }
}
