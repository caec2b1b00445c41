//! PantherOS kernel core
//!
//! Memory management and process lifecycle for the PantherOS kernel,
//! built as a library so the same code runs on bare metal and under the
//! host test harness.
//!
//! # Components (leaf first)
//! - [`mm::frame`]: physical frame bitmap allocator
//! - [`mm::mapper`]: 4-level page table manager
//! - [`mm::space`]: reference-counted address spaces
//! - [`mm::heap`]: kernel heap (early bump phase, then free-list phase)
//! - [`sched`]: process/thread control blocks and the round-robin scheduler
//!
//! Logging goes through the `log` facade; [`klog`] backs it with the kernel
//! console.
//!
//! # Security Principles
//! - Physical memory is only ever touched through [`mm::phys`]
//! - Invariant violations (double free, refcount underflow) halt, they are never returned
//! - Allocation failure is always a typed error the caller must handle

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod klog;
pub mod mm;
pub mod sched;

pub use config::{ForkPolicy, HeapConfig, MemoryConfig, SchedConfig, VirtWindow};
pub use error::{Errno, MemoryError, SchedError};
