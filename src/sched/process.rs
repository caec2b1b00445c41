//! Process control blocks

use alloc::string::String;
use alloc::vec::Vec;

use super::thread::{Pid, Tid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Alive,
    /// Every thread has finished; waiting for the parent to reap it.
    Zombie(i32),
}

/// A process: a group of threads plus its place in the process tree.
///
/// The address space is referenced by the threads, one reference each.
#[derive(Debug)]
pub struct Process {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub name: String,
    pub state: ProcessState,
    pub threads: Vec<Tid>,
    pub children: Vec<Pid>,
}

impl Process {
    pub fn new(pid: Pid, parent: Option<Pid>, name: &str) -> Self {
        Self {
            pid,
            parent,
            name: String::from(name),
            state: ProcessState::Alive,
            threads: Vec::new(),
            children: Vec::new(),
        }
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.state == ProcessState::Alive
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            ProcessState::Zombie(code) => Some(code),
            ProcessState::Alive => None,
        }
    }

    pub(crate) fn forget_child(&mut self, child: Pid) {
        self.children.retain(|&pid| pid != child);
    }
}
