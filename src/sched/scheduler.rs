//! Round-robin scheduler
//!
//! One shared ready queue serves every core. Each core calls into the
//! scheduler from its trap path with the [`TrapFrame`] it is about to return
//! through: the outgoing thread's registers are saved from that frame and
//! the incoming thread's are written into it, so the core resumes wherever
//! the incoming thread last left off.
//!
//! # Invariants
//! - A thread is current on at most one core
//! - Every thread holds exactly one reference to its address space; the
//!   reference is dropped when the process is reaped
//! - Each core has an idle thread that never enters the ready queue and is
//!   run when the queue is empty
//!
//! # Lock Order
//! Scheduler, then an address space (attachment list before root), then
//! heap and frame allocator.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::mem;

use log::{debug, info, trace, warn};
use spin::Mutex;

use super::process::{Process, ProcessState};
use super::thread::{Pid, Thread, ThreadState, Tid, TrapFrame, WaitChannel};
use crate::arch::PageTableArch;
use crate::config::{SchedConfig, MAX_CPUS};
use crate::error::{MemoryError, SchedError};
use crate::mm::context::KernelMemoryContext;
use crate::mm::phys::FrameMapper;
use crate::mm::space::AddressSpace;

struct CpuState {
    current: Tid,
    idle: Tid,
    /// Process whose address space this core last activated.
    last_pid: Option<Pid>,
    slice_left: u32,
}

struct SchedState<A: PageTableArch, M: FrameMapper> {
    threads: BTreeMap<Tid, Thread<A, M>>,
    processes: BTreeMap<Pid, Process>,
    ready: VecDeque<Tid>,
    cpus: Vec<CpuState>,
    /// Parentless zombies waiting for their last thread to leave a core.
    orphans: Vec<Pid>,
    next_tid: u32,
    next_pid: u32,
    now: u64,
}

impl<A: PageTableArch, M: FrameMapper> SchedState<A, M> {
    fn thread(&self, tid: Tid) -> Result<&Thread<A, M>, SchedError> {
        self.threads.get(&tid).ok_or(SchedError::NoSuchThread)
    }

    fn thread_mut(&mut self, tid: Tid) -> Result<&mut Thread<A, M>, SchedError> {
        self.threads.get_mut(&tid).ok_or(SchedError::NoSuchThread)
    }

    /// A thread the scheduler itself is tracking as current.
    fn running(&mut self, tid: Tid) -> &mut Thread<A, M> {
        match self.threads.get_mut(&tid) {
            Some(thread) => thread,
            None => panic!("scheduler lost track of {}", tid),
        }
    }

    fn live_process_mut(&mut self, pid: Pid) -> Result<&mut Process, SchedError> {
        match self.processes.get_mut(&pid) {
            Some(process) if process.is_alive() => Ok(process),
            _ => Err(SchedError::NoSuchProcess),
        }
    }

    fn is_on_cpu(&self, tid: Tid) -> bool {
        self.cpus.iter().any(|cpu| cpu.current == tid)
    }

    fn add_thread(&mut self, pid: Pid, context: TrapFrame, space: AddressSpace<A, M>) -> Tid {
        let tid = Tid::new(self.next_tid);
        self.next_tid += 1;
        self.threads.insert(tid, Thread::new(tid, pid, context, space));
        if let Some(process) = self.processes.get_mut(&pid) {
            process.threads.push(tid);
        }
        tid
    }

    fn add_process(&mut self, parent: Option<Pid>, name: &str) -> Pid {
        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;
        self.processes.insert(pid, Process::new(pid, parent, name));
        if let Some(parent) = parent.and_then(|p| self.processes.get_mut(&p)) {
            parent.children.push(pid);
        }
        pid
    }

    fn pick_next(&mut self) -> Option<Tid> {
        while let Some(tid) = self.ready.pop_front() {
            // Entries of threads that finished while queued are skipped
            if self
                .threads
                .get(&tid)
                .map_or(false, |t| t.state == ThreadState::Ready)
            {
                return Some(tid);
            }
        }
        None
    }

    fn wake_where(&mut self, mut pred: impl FnMut(&Thread<A, M>) -> bool) -> usize {
        let mut woken = 0;
        for thread in self.threads.values_mut() {
            if thread.state == ThreadState::Sleeping && pred(thread) {
                thread.wake();
                self.ready.push_back(thread.tid);
                woken += 1;
            }
        }
        woken
    }

    /// Turn `pid` into a zombie, hand its children to init and wake its
    /// parent.
    fn make_zombie(&mut self, pid: Pid, code: i32) {
        let Some(process) = self.processes.get_mut(&pid) else {
            return;
        };
        process.state = ProcessState::Zombie(code);
        let parent = process.parent;
        let children = mem::take(&mut process.children);

        let adopter = (pid != Pid::INIT
            && self.processes.get(&Pid::INIT).map_or(false, Process::is_alive))
        .then_some(Pid::INIT);
        let mut zombie_adopted = false;
        for &child in &children {
            if let Some(process) = self.processes.get_mut(&child) {
                process.parent = adopter;
                if !process.is_alive() {
                    zombie_adopted = true;
                    if adopter.is_none() {
                        self.orphans.push(child);
                    }
                }
            }
        }
        if let Some(init) = adopter.and_then(|pid| self.processes.get_mut(&pid)) {
            init.children.extend_from_slice(&children);
            if zombie_adopted {
                self.wake_where(|t| t.channel == Some(WaitChannel::Children(Pid::INIT)));
            }
        }

        match parent {
            Some(parent) => {
                self.wake_where(|t| t.channel == Some(WaitChannel::Children(parent)));
            }
            None => self.orphans.push(pid),
        }
        debug!("{} exited with {} ({} children reparented)", pid, code, children.len());
    }

    /// Drop a process record and its threads' address space references.
    fn release(&mut self, pid: Pid) {
        let Some(process) = self.processes.remove(&pid) else {
            return;
        };
        let mut freed = false;
        for tid in &process.threads {
            if let Some(thread) = self.threads.remove(tid) {
                freed |= thread.space.drop_ref();
            }
        }
        if let Some(parent) = process.parent.and_then(|p| self.processes.get_mut(&p)) {
            parent.forget_child(pid);
        }
        debug!("released {} ({}), address space freed: {}", pid, process.name, freed);
    }

    fn reap(&mut self, parent: Pid, child: Pid) -> Result<i32, SchedError> {
        let process = self.processes.get(&child).ok_or(SchedError::NoSuchProcess)?;
        if process.parent != Some(parent) {
            return Err(SchedError::NotAChild);
        }
        let code = process.exit_code().ok_or(SchedError::WouldBlock)?;
        if process.threads.iter().any(|&tid| self.is_on_cpu(tid)) {
            return Err(SchedError::Busy);
        }
        self.release(child);
        Ok(code)
    }

    fn collect_orphans(&mut self) {
        for pid in mem::take(&mut self.orphans) {
            let busy = self
                .processes
                .get(&pid)
                .map_or(false, |p| p.threads.iter().any(|&tid| self.is_on_cpu(tid)));
            if busy {
                self.orphans.push(pid);
            } else {
                self.release(pid);
            }
        }
    }

    /// Finished kernel threads have no parent to reap them.
    fn retire_kernel_thread(&mut self, tid: Tid) {
        let finished = self
            .threads
            .get(&tid)
            .map_or(false, |t| t.pid == Pid::KERNEL && t.state == ThreadState::Finished);
        if !finished {
            return;
        }
        if let Some(thread) = self.threads.remove(&tid) {
            thread.space.drop_ref();
        }
        if let Some(kernel) = self.processes.get_mut(&Pid::KERNEL) {
            kernel.threads.retain(|&t| t != tid);
        }
        trace!("retired kernel thread {}", tid);
    }
}

/// The process and thread scheduler.
///
/// Every call taking a `cpu` panics if it is not below [`cpus`](Self::cpus):
/// a core the scheduler was not configured for has no idle thread to fall
/// back to.
pub struct Scheduler<A: PageTableArch, M: FrameMapper> {
    mm: &'static KernelMemoryContext<A, M>,
    cpus: usize,
    time_slice: u32,
    inner: Mutex<SchedState<A, M>>,
}

impl<A: PageTableArch, M: FrameMapper> Scheduler<A, M> {
    /// Create the scheduler with the kernel process (pid 0) and one idle
    /// thread per core. Each idle thread stands for the code already running
    /// on that core. Requires the kernel directory.
    pub fn new(
        mm: &'static KernelMemoryContext<A, M>,
        config: SchedConfig,
    ) -> Result<Self, SchedError> {
        let kernel = mm.kernel_space().ok_or(MemoryError::NotMapped)?;
        let cpus = config.cpus.clamp(1, MAX_CPUS);
        let time_slice = config.time_slice.max(1);

        let mut state = SchedState {
            threads: BTreeMap::new(),
            processes: BTreeMap::new(),
            ready: VecDeque::new(),
            cpus: Vec::with_capacity(cpus),
            orphans: Vec::new(),
            next_tid: 0,
            next_pid: Pid::KERNEL.as_u32() + 1,
            now: 0,
        };
        state
            .processes
            .insert(Pid::KERNEL, Process::new(Pid::KERNEL, None, "kernel"));
        for _ in 0..cpus {
            let idle = state.add_thread(Pid::KERNEL, TrapFrame::zeroed(), kernel.clone_ref());
            state.running(idle).state = ThreadState::Running;
            state.cpus.push(CpuState {
                current: idle,
                idle,
                last_pid: None,
                slice_left: time_slice,
            });
        }

        info!("scheduler: {} cpus, {} tick slice", cpus, time_slice);
        Ok(Self {
            mm,
            cpus,
            time_slice,
            inner: Mutex::new(state),
        })
    }

    #[inline]
    fn check_cpu(&self, cpu: usize) {
        assert!(
            cpu < self.cpus,
            "cpu {} out of range ({} configured)",
            cpu,
            self.cpus
        );
    }

    /// Create a process with a fresh address space and one thread in
    /// `Created` state. The caller loads the image through
    /// [`space_of`](Self::space_of), then calls [`make_ready`](Self::make_ready).
    ///
    /// Processes without a parent are reaped by the scheduler when they exit.
    pub fn spawn(
        &self,
        name: &str,
        parent: Option<Pid>,
        entry: TrapFrame,
    ) -> Result<(Pid, Tid), SchedError> {
        let space = AddressSpace::new_user(self.mm)?;
        let mut state = self.inner.lock();
        if let Some(parent) = parent {
            state.live_process_mut(parent)?;
        }
        let pid = state.add_process(parent, name);
        let tid = state.add_thread(pid, entry, space);
        debug!("spawned {} ({}) with {}", pid, name, tid);
        Ok((pid, tid))
    }

    /// Create a kernel thread running in the kernel directory.
    pub fn spawn_kernel_thread(&self, entry: TrapFrame) -> Result<Tid, SchedError> {
        let kernel = self.mm.kernel_space().ok_or(MemoryError::NotMapped)?;
        let mut state = self.inner.lock();
        Ok(state.add_thread(Pid::KERNEL, entry, kernel.clone_ref()))
    }

    /// Add a thread to `pid`, sharing its address space.
    pub fn spawn_thread(&self, pid: Pid, entry: TrapFrame) -> Result<Tid, SchedError> {
        let mut state = self.inner.lock();
        let sibling = *state
            .live_process_mut(pid)?
            .threads
            .first()
            .ok_or(SchedError::InvalidState)?;
        let space = state.thread(sibling)?.space.clone_ref();
        let tid = state.add_thread(pid, entry, space);
        trace!("{} joined {}", tid, pid);
        Ok(tid)
    }

    /// Fork the process of the thread current on `cpu`, whose registers are
    /// in `frame`. The child's single thread resumes from the same frame
    /// with a return value of 0 and starts out ready.
    pub fn fork(&self, cpu: usize, frame: &TrapFrame) -> Result<Pid, SchedError> {
        self.check_cpu(cpu);
        let (parent, space) = {
            let mut state = self.inner.lock();
            let current = state.cpus[cpu].current;
            let thread = state.running(current);
            if thread.pid == Pid::KERNEL {
                return Err(SchedError::InvalidState);
            }
            (thread.pid, thread.space.clone_ref())
        };
        let child_space = space.fork_copy();
        space.drop_ref();
        let child_space = child_space?;

        let mut state = self.inner.lock();
        let name = state.live_process_mut(parent)?.name.clone();
        let child = state.add_process(Some(parent), &name);
        let mut context = *frame;
        context.set_return(0);
        let tid = state.add_thread(child, context, child_space);
        state.running(tid).state = ThreadState::Ready;
        state.ready.push_back(tid);
        debug!("{} forked {}", parent, child);
        Ok(child)
    }

    /// Replace the image of the process current on `cpu`.
    ///
    /// Every other thread of the process is finished. If the address space
    /// was not shared, its user half is cleared in place; otherwise the
    /// thread moves to a fresh space. `frame` is reset to `entry`. Returns a
    /// reference to the space for the loader, which should drop it once the
    /// image is mapped.
    pub fn exec(
        &self,
        cpu: usize,
        frame: &mut TrapFrame,
        entry: TrapFrame,
    ) -> Result<AddressSpace<A, M>, SchedError> {
        self.check_cpu(cpu);
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let current = state.cpus[cpu].current;
        let pid = state.running(current).pid;
        if pid == Pid::KERNEL {
            return Err(SchedError::InvalidState);
        }

        let thread = state.running(current);
        if thread.space.ref_count() == 1 {
            let cleared = thread.space.clear_user();
            debug!("exec in {}: cleared {} pages in place", pid, cleared);
        } else {
            let fresh = AddressSpace::new_user(self.mm)?;
            let old = mem::replace(&mut thread.space, fresh);
            old.drop_ref();
            thread.space.activate(cpu);
            debug!("exec in {}: moved to {}", pid, thread.space.root_frame());
        }
        thread.context = entry;
        *frame = entry;
        let space = thread.space.clone_ref();
        state.cpus[cpu].last_pid = Some(pid);

        let siblings = state
            .processes
            .get(&pid)
            .map(|p| p.threads.clone())
            .unwrap_or_default();
        for tid in siblings.into_iter().filter(|&tid| tid != current) {
            if let Some(thread) = state.threads.get_mut(&tid) {
                thread.state = ThreadState::Finished;
                thread.wake_at = None;
                thread.channel = None;
            }
        }
        Ok(space)
    }

    /// Queue a created or sleeping thread.
    pub fn make_ready(&self, tid: Tid) -> Result<(), SchedError> {
        let mut state = self.inner.lock();
        let thread = state.thread_mut(tid)?;
        match thread.state {
            ThreadState::Created | ThreadState::Sleeping => {
                thread.wake();
                state.ready.push_back(tid);
                Ok(())
            }
            ThreadState::Ready | ThreadState::Running => Ok(()),
            ThreadState::Finished => Err(SchedError::InvalidState),
        }
    }

    /// Switch `cpu` to the next ready thread (or its idle thread).
    ///
    /// `frame` holds the outgoing thread's registers on entry and the
    /// incoming thread's on return.
    pub fn schedule(&self, cpu: usize, frame: &mut TrapFrame) -> Tid {
        self.check_cpu(cpu);
        let mut state = self.inner.lock();
        self.switch(&mut state, cpu, frame)
    }

    /// Give up the rest of the current time slice.
    pub fn yield_now(&self, cpu: usize, frame: &mut TrapFrame) -> Tid {
        self.schedule(cpu, frame)
    }

    fn switch(&self, state: &mut SchedState<A, M>, cpu: usize, frame: &mut TrapFrame) -> Tid {
        let prev = state.cpus[cpu].current;
        let idle = state.cpus[cpu].idle;
        let outgoing = state.running(prev);
        outgoing.context = *frame;
        if outgoing.state == ThreadState::Running {
            outgoing.state = ThreadState::Ready;
            if prev != idle {
                state.ready.push_back(prev);
            }
        }

        let next = state.pick_next().unwrap_or(idle);
        let slot = &mut state.cpus[cpu];
        let incoming = match state.threads.get_mut(&next) {
            Some(thread) => thread,
            None => panic!("scheduler lost track of {}", next),
        };
        incoming.state = ThreadState::Running;
        let root = incoming.space.root_frame();
        if slot.last_pid != Some(incoming.pid) || self.mm.active_root(cpu) != Some(root) {
            incoming.space.activate(cpu);
            slot.last_pid = Some(incoming.pid);
        }
        slot.current = next;
        slot.slice_left = self.time_slice;
        *frame = incoming.context;

        if prev != next {
            trace!("cpu {}: {} -> {}", cpu, prev, next);
            state.retire_kernel_thread(prev);
        }
        if !state.orphans.is_empty() {
            state.collect_orphans();
        }
        next
    }

    /// Timer interrupt on `cpu` at tick `now`: wake expired sleepers and
    /// preempt the current thread once its slice is used up.
    pub fn tick(&self, cpu: usize, now: u64, frame: &mut TrapFrame) -> Tid {
        self.check_cpu(cpu);
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        state.now = state.now.max(now);
        let now = state.now;
        let woken = state.wake_where(|t| t.wake_at.map_or(false, |at| at <= now));
        if woken > 0 {
            trace!("tick {}: woke {} sleepers", now, woken);
        }

        let slot = &mut state.cpus[cpu];
        slot.slice_left = slot.slice_left.saturating_sub(1);
        let expired = slot.slice_left == 0;
        let on_idle = slot.current == slot.idle;
        let current = slot.current;
        if expired || (on_idle && !state.ready.is_empty()) {
            self.switch(state, cpu, frame)
        } else {
            current
        }
    }

    fn suspend(
        &self,
        cpu: usize,
        frame: &mut TrapFrame,
        block: impl FnOnce(&mut Thread<A, M>),
    ) -> Tid {
        self.check_cpu(cpu);
        let mut state = self.inner.lock();
        let current = state.cpus[cpu].current;
        if current == state.cpus[cpu].idle {
            warn!("cpu {}: idle thread cannot block", cpu);
            return current;
        }
        let thread = state.running(current);
        thread.state = ThreadState::Sleeping;
        block(thread);
        self.switch(&mut state, cpu, frame)
    }

    /// Put the current thread to sleep until tick `deadline`.
    pub fn sleep_until(&self, cpu: usize, deadline: u64, frame: &mut TrapFrame) -> Tid {
        self.check_cpu(cpu);
        if deadline <= self.now() {
            return self.yield_now(cpu, frame);
        }
        self.suspend(cpu, frame, |thread| thread.wake_at = Some(deadline))
    }

    /// Block the current thread until `channel` is woken.
    pub fn block_on(&self, cpu: usize, channel: WaitChannel, frame: &mut TrapFrame) -> Tid {
        self.suspend(cpu, frame, |thread| thread.channel = Some(channel))
    }

    /// Wake one sleeping thread. Returns false if it was not asleep.
    pub fn wake(&self, tid: Tid) -> Result<bool, SchedError> {
        let mut state = self.inner.lock();
        let thread = state.thread_mut(tid)?;
        if thread.state != ThreadState::Sleeping {
            return Ok(false);
        }
        thread.wake();
        state.ready.push_back(tid);
        Ok(true)
    }

    /// Wake every thread blocked on `channel`. Returns how many woke.
    pub fn wake_channel(&self, channel: WaitChannel) -> usize {
        self.inner
            .lock()
            .wake_where(|t| t.channel == Some(channel))
    }

    /// Finish the current thread. The last thread of a process takes the
    /// process with it, with exit code `code`.
    pub fn exit_thread(&self, cpu: usize, code: i32, frame: &mut TrapFrame) -> Tid {
        self.check_cpu(cpu);
        let mut state = self.inner.lock();
        let current = state.cpus[cpu].current;
        if current == state.cpus[cpu].idle {
            warn!("cpu {}: idle thread cannot exit", cpu);
            return current;
        }
        let thread = state.running(current);
        thread.state = ThreadState::Finished;
        let pid = thread.pid;

        let last = pid != Pid::KERNEL
            && state.processes.get(&pid).map_or(false, |p| {
                p.threads.iter().all(|tid| {
                    state
                        .threads
                        .get(tid)
                        .map_or(true, |t| t.state == ThreadState::Finished)
                })
            });
        if last {
            state.make_zombie(pid, code);
        }
        self.switch(&mut state, cpu, frame)
    }

    /// Finish every thread of the current process and make it a zombie.
    pub fn exit_process(&self, cpu: usize, code: i32, frame: &mut TrapFrame) -> Tid {
        self.check_cpu(cpu);
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let current = state.cpus[cpu].current;
        let pid = state.running(current).pid;
        if pid == Pid::KERNEL {
            drop(guard);
            return self.exit_thread(cpu, code, frame);
        }

        let threads = state
            .processes
            .get(&pid)
            .map(|p| p.threads.clone())
            .unwrap_or_default();
        for tid in threads {
            if let Some(thread) = state.threads.get_mut(&tid) {
                thread.state = ThreadState::Finished;
                thread.wake_at = None;
                thread.channel = None;
            }
        }
        state.make_zombie(pid, code);
        self.switch(state, cpu, frame)
    }

    /// Collect the exit code of `child`, releasing it and its address
    /// space.
    pub fn reap(&self, parent: Pid, child: Pid) -> Result<i32, SchedError> {
        self.inner.lock().reap(parent, child)
    }

    /// Collect any exited child of `parent`. `Ok(None)` means children
    /// exist but none can be reaped yet.
    pub fn reap_any(&self, parent: Pid) -> Result<Option<(Pid, i32)>, SchedError> {
        let mut state = self.inner.lock();
        let children = state
            .processes
            .get(&parent)
            .ok_or(SchedError::NoSuchProcess)?
            .children
            .clone();
        if children.is_empty() {
            return Err(SchedError::NotAChild);
        }
        for child in children {
            match state.reap(parent, child) {
                Ok(code) => return Ok(Some((child, code))),
                Err(SchedError::WouldBlock | SchedError::Busy) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    pub fn current(&self, cpu: usize) -> Tid {
        self.check_cpu(cpu);
        self.inner.lock().cpus[cpu].current
    }

    pub fn idle_thread(&self, cpu: usize) -> Tid {
        self.check_cpu(cpu);
        self.inner.lock().cpus[cpu].idle
    }

    pub fn cpus(&self) -> usize {
        self.cpus
    }

    /// Latest tick seen by [`tick`](Self::tick).
    pub fn now(&self) -> u64 {
        self.inner.lock().now
    }

    pub fn ready_count(&self) -> usize {
        let state = self.inner.lock();
        state
            .ready
            .iter()
            .filter(|&&tid| state.threads.get(&tid).map_or(false, |t| t.state == ThreadState::Ready))
            .count()
    }

    pub fn thread_state(&self, tid: Tid) -> Option<ThreadState> {
        self.inner.lock().threads.get(&tid).map(|t| t.state)
    }

    pub fn pid_of(&self, tid: Tid) -> Option<Pid> {
        self.inner.lock().threads.get(&tid).map(|t| t.pid)
    }

    /// Saved registers of a thread that is not on a core.
    pub fn context_of(&self, tid: Tid) -> Option<TrapFrame> {
        self.inner.lock().threads.get(&tid).map(|t| t.context)
    }

    /// A new reference to the thread's address space.
    pub fn space_of(&self, tid: Tid) -> Option<AddressSpace<A, M>> {
        self.inner.lock().threads.get(&tid).map(|t| t.space.clone_ref())
    }

    pub fn process_state(&self, pid: Pid) -> Option<ProcessState> {
        self.inner.lock().processes.get(&pid).map(|p| p.state)
    }

    pub fn parent_of(&self, pid: Pid) -> Option<Pid> {
        self.inner.lock().processes.get(&pid).and_then(|p| p.parent)
    }

    pub fn children_of(&self, pid: Pid) -> Vec<Pid> {
        self.inner
            .lock()
            .processes
            .get(&pid)
            .map(|p| p.children.clone())
            .unwrap_or_default()
    }

    pub fn threads_of(&self, pid: Pid) -> Vec<Tid> {
        self.inner
            .lock()
            .processes
            .get(&pid)
            .map(|p| p.threads.clone())
            .unwrap_or_default()
    }
}
