//! Thread control blocks

use core::fmt;

use crate::arch::PageTableArch;
use crate::mm::phys::FrameMapper;
use crate::mm::space::AddressSpace;

/// Thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(u32);

impl Tid {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

/// Process identifier. Pid 0 is the kernel, pid 1 adopts orphans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    pub const KERNEL: Self = Self(0);
    pub const INIT: Self = Self(1);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

/// Lifecycle of a thread.
///
/// ```text
/// Created -> Ready <-> Running -> Finished
///              ^          |
///              +- Sleeping <-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Ready,
    Running,
    Sleeping,
    Finished,
}

/// Something a sleeping thread waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitChannel {
    /// A kernel object, named by its address.
    Object(usize),
    /// Any child of this process changing state.
    Children(Pid),
}

impl WaitChannel {
    pub fn object<T>(object: &T) -> Self {
        Self::Object(object as *const T as usize)
    }
}

/// Register state saved when a thread leaves the CPU.
///
/// The exception entry code fills one of these on every trap; switching
/// threads means swapping its contents.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    /// General purpose registers. Register 0 carries syscall results.
    pub gpr: [u64; 31],
    /// Resume address.
    pub ip: u64,
    pub sp: u64,
    /// Saved status / flags register.
    pub flags: u64,
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        Self {
            gpr: [0; 31],
            ip: 0,
            sp: 0,
            flags: 0,
        }
    }

    /// A frame that starts executing at `ip` on stack `sp`.
    pub const fn new(ip: u64, sp: u64) -> Self {
        let mut frame = Self::zeroed();
        frame.ip = ip;
        frame.sp = sp;
        frame
    }

    #[inline]
    pub fn set_return(&mut self, value: u64) {
        self.gpr[0] = value;
    }

    #[inline]
    pub fn return_value(&self) -> u64 {
        self.gpr[0]
    }
}

impl Default for TrapFrame {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// A thread control block.
pub struct Thread<A: PageTableArch, M: FrameMapper> {
    pub tid: Tid,
    pub pid: Pid,
    pub state: ThreadState,
    /// Registers as of the last time the thread left the CPU.
    pub context: TrapFrame,
    /// This thread's reference to its address space.
    pub space: AddressSpace<A, M>,
    /// Tick at which a sleeping thread becomes ready again.
    pub wake_at: Option<u64>,
    pub channel: Option<WaitChannel>,
}

impl<A: PageTableArch, M: FrameMapper> Thread<A, M> {
    pub fn new(tid: Tid, pid: Pid, context: TrapFrame, space: AddressSpace<A, M>) -> Self {
        Self {
            tid,
            pid,
            state: ThreadState::Created,
            context,
            space,
            wake_at: None,
            channel: None,
        }
    }

    /// Move a sleeping thread back to ready, forgetting what it waited for.
    pub(crate) fn wake(&mut self) {
        self.state = ThreadState::Ready;
        self.wake_at = None;
        self.channel = None;
    }
}

impl<A: PageTableArch, M: FrameMapper> fmt::Debug for Thread<A, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("space", &self.space.root_frame())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_frame_return_register() {
        let mut frame = TrapFrame::new(0x40_0000, 0x7FFF_F000);
        assert_eq!(frame.return_value(), 0);
        frame.set_return(-12i64 as u64);
        assert_eq!(frame.gpr[0] as i64, -12);
        assert_eq!(frame.ip, 0x40_0000);
    }

    #[test]
    fn wait_channels_name_objects() {
        let a = 1u64;
        let b = 2u64;
        assert_eq!(WaitChannel::object(&a), WaitChannel::object(&a));
        assert_ne!(WaitChannel::object(&a), WaitChannel::object(&b));
        assert_ne!(
            WaitChannel::Children(Pid::INIT),
            WaitChannel::Children(Pid::KERNEL)
        );
    }
}
