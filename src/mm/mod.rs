//! Memory management for PantherOS
//!
//! Provides, leaf first:
//! - Physical frame tracking ([`frame`])
//! - Page table trees over an architecture codec ([`mapper`], [`paging`])
//! - Reference-counted address spaces ([`space`]) and the shared memory
//!   regions they attach ([`shm`])
//! - Cross-core TLB invalidation hooks ([`tlb`])
//! - The kernel heap ([`heap`])
//! - The shared context tying them together ([`context`]) and its boot path
//!
//! # Security Principles
//! - Physical memory is dereferenced only in [`phys`]
//! - Page tables are built from frames, never from the heap
//! - A page table tree has exactly one mutator at a time

pub mod address;
pub mod boot;
pub mod context;
pub mod frame;
pub mod heap;
pub mod mapper;
pub mod paging;
pub mod phys;
pub mod shm;
pub mod space;
pub mod tlb;

#[cfg(test)]
pub(crate) mod testing;

pub use address::{FrameIndex, PhysAddr, VirtAddr, PAGE_SIZE};
pub use context::KernelMemoryContext;
pub use frame::{FrameAllocator, FrameBitmap, FrameGuard, LockedFrameAllocator};
pub use heap::{DeferredGrowth, HeapGrowth, KernelHeap};
pub use mapper::{PageTableManager, Root};
pub use paging::PteFlags;
pub use phys::{DirectMapper, FrameMapper};
pub use shm::{SharedRegion, ShmRegistry};
pub use space::{AddressSpace, SpaceKind};
pub use tlb::{LocalOnly, TlbShootdown};
