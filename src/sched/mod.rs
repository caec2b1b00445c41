//! Processes, threads and the scheduler
//!
//! A process owns nothing but its place in the process tree; each of its
//! threads holds a reference to the shared address space. Threads are
//! scheduled round-robin across all cores from one ready queue.

pub mod process;
pub mod scheduler;
pub mod thread;

pub use process::{Process, ProcessState};
pub use scheduler::Scheduler;
pub use thread::{Pid, Thread, ThreadState, Tid, TrapFrame, WaitChannel};
