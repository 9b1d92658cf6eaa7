// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-CPU round-robin scheduler, process registry, termination and reaping
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/blocking.rs + tests/process_lifecycle.rs
//! PUBLIC API: Scheduler (spawn/fork/insert_thread/timer_tick/yield_now/terminate/exit_thread/reap),
//!             CpuLocal, SchedError
//! DEPENDS_ON: task::{Process, Thread}, mm::AddressSpace (fault entry), time, config::SchedulerConfig
//! INVARIANTS:
//!   - a thread is in exactly one run queue from insertion until removal
//!   - lock order: CPU current slot -> thread queue slot -> run queue -> thread state
//!   - a destroyed process is reaped only when its state lock is uncontended and none of
//!     its threads is current on any CPU
//!
//! Run queues hold every thread assigned to a CPU, Blocked ones included. The
//! tick rotates the queue and picks the first Running thread not already on
//! another CPU; with none, the CPU idles (`None`).

extern crate alloc;

use alloc::{collections::BTreeMap, collections::VecDeque, sync::Arc, vec::Vec};
use core::fmt;
use core::ops::Range;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::RegisterContext;
use crate::config::SchedulerConfig;
use crate::mm::{AddressSpace, FaultAccess, FaultError, FrameNumber};
use crate::sync::SpinLock;
use crate::task::{Process, ProcessError, Thread, ThreadState, SIGKILL, SIGSEGV};
use crate::time;
use crate::types::{CpuId, Pid};

/// Exit code of a process killed by its dying parent.
pub const EXIT_KILLED: i32 = -(SIGKILL as i32);
/// Exit code of a process torn down after a fatal page fault.
pub const EXIT_FAULT: i32 = -(SIGSEGV as i32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedError {
    InvalidCpu { cpu: CpuId },
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCpu { cpu } => write!(f, "cpu {} does not exist", cpu),
        }
    }
}

/// Scheduling state owned by one CPU.
pub struct CpuLocal {
    id: CpuId,
    run_queue: SpinLock<VecDeque<Arc<Thread>>>,
    current: SpinLock<Option<Arc<Thread>>>,
}

impl CpuLocal {
    fn new(id: CpuId) -> Self {
        Self { id, run_queue: SpinLock::new(VecDeque::new()), current: SpinLock::new(None) }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn queue_len(&self) -> usize {
        self.run_queue.lock().len()
    }

    pub fn current(&self) -> Option<Arc<Thread>> {
        self.current.lock().clone()
    }
}

/// The scheduler shared by all CPUs.
pub struct Scheduler {
    cpus: Vec<CpuLocal>,
    processes: SpinLock<BTreeMap<Pid, Arc<Process>>>,
    destroyed: SpinLock<VecDeque<Arc<Process>>>,
    next_pid: AtomicU32,
    config: SchedulerConfig,
}

static_assertions::assert_impl_all!(Scheduler: Send, Sync);
static_assertions::assert_impl_all!(Process: Send, Sync);
static_assertions::assert_impl_all!(Thread: Send, Sync);
static_assertions::assert_impl_all!(AddressSpace: Send, Sync);

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let cpus = (0..config.cpu_count()).map(|index| CpuLocal::new(CpuId::from_raw(index as u16))).collect();
        Self {
            cpus,
            processes: SpinLock::new(BTreeMap::new()),
            destroyed: SpinLock::new(VecDeque::new()),
            next_pid: AtomicU32::new(1),
            config,
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu(&self, cpu: CpuId) -> Result<&CpuLocal, SchedError> {
        self.cpus.get(cpu.as_index()).ok_or(SchedError::InvalidCpu { cpu })
    }

    /// Hands out the next unused PID.
    pub fn next_pid(&self) -> Pid {
        Pid::from_raw(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register_process(&self, process: Arc<Process>) {
        self.processes.lock().insert(process.pid(), process);
    }

    pub fn find_process(&self, pid: Pid) -> Option<Arc<Process>> {
        self.processes.lock().get(&pid).cloned()
    }

    /// Number of live (registered) processes.
    pub fn process_count(&self) -> usize {
        self.processes.lock().len()
    }

    /// Creates, registers and schedules a process whose main thread starts at `entry`.
    pub fn spawn(
        &self,
        name: &str,
        address_space: Arc<AddressSpace>,
        parent: Option<&Arc<Process>>,
        entry: usize,
        stack: Range<usize>,
    ) -> Arc<Process> {
        let process = Process::create(self.next_pid(), name, address_space, parent, entry, stack);
        self.register_process(process.clone());
        for thread in process.threads() {
            self.insert_new_thread(thread);
        }
        log_debug!(target: "sched", "spawned pid {} ({})", process.pid(), name);
        process
    }

    /// Adds a thread to `process` and schedules it.
    pub fn spawn_thread(&self, process: &Arc<Process>, entry: usize, stack: Range<usize>) -> Result<Arc<Thread>, ProcessError> {
        let thread = process.create_child_thread(entry, stack)?;
        self.insert_new_thread(thread.clone());
        Ok(thread)
    }

    /// Forks `process` from `thread`, registering and scheduling the child.
    pub fn fork(&self, process: &Arc<Process>, thread: &Thread) -> Result<Arc<Process>, ProcessError> {
        let child = process.fork(self.next_pid(), thread)?;
        self.register_process(child.clone());
        for thread in child.threads() {
            self.insert_new_thread(thread);
        }
        Ok(child)
    }

    /// Queues `thread` on the least loaded CPU and returns that CPU.
    pub fn insert_new_thread(&self, thread: Arc<Thread>) -> CpuId {
        thread.set_time_slice_default(self.config.time_slice);
        let target = self
            .cpus
            .iter()
            .min_by_key(|cpu| cpu.queue_len())
            .map_or(CpuId::BOOT, |cpu| cpu.id);
        // The target comes from our own CPU list.
        let _ = self.insert_thread(thread, target);
        target
    }

    /// Queues `thread` on `cpu`, taking it off the queue it was on before.
    pub fn insert_thread(&self, thread: Arc<Thread>, cpu: CpuId) -> Result<(), SchedError> {
        let target = self.cpu(cpu)?;
        let mut queued_on = thread.queued_on.lock();
        match *queued_on {
            Some(old) if old == cpu => return Ok(()),
            Some(old) => {
                if let Ok(previous) = self.cpu(old) {
                    previous.run_queue.lock().retain(|queued| !Arc::ptr_eq(queued, &thread));
                }
            }
            None => {}
        }
        target.run_queue.lock().push_back(thread.clone());
        *queued_on = Some(cpu);
        Ok(())
    }

    /// Takes `thread` off its run queue. Returns false if it was not queued.
    pub fn remove_thread(&self, thread: &Arc<Thread>) -> bool {
        let mut queued_on = thread.queued_on.lock();
        let Some(cpu) = queued_on.take() else {
            return false;
        };
        if let Ok(local) = self.cpu(cpu) {
            local.run_queue.lock().retain(|queued| !Arc::ptr_eq(queued, thread));
        }
        true
    }

    pub fn current(&self, cpu: CpuId) -> Option<Arc<Thread>> {
        self.cpu(cpu).ok().and_then(CpuLocal::current)
    }

    /// Timer interrupt on `cpu`. `context` holds the interrupted registers and
    /// receives those of the thread to resume. Returns the thread now current.
    pub fn timer_tick(&self, cpu: CpuId, context: &mut RegisterContext) -> Option<Arc<Thread>> {
        let Ok(local) = self.cpu(cpu) else {
            log_error!(target: "sched", "tick on unknown cpu {}", cpu);
            return None;
        };
        if cpu.is_boot() {
            time::advance(self.config.tick_us);
        }
        {
            let current = local.current.lock();
            if let Some(thread) = current.as_ref() {
                let stays = thread.state() == ThreadState::Running
                    && *thread.queued_on.lock() == Some(cpu)
                    && !thread.consume_tick();
                if stays {
                    return Some(thread.clone());
                }
            }
        }
        self.switch(local, context)
    }

    /// Gives up the rest of the current thread's slice.
    pub fn yield_now(&self, cpu: CpuId, context: &mut RegisterContext) -> Option<Arc<Thread>> {
        let local = self.cpu(cpu).ok()?;
        self.switch(local, context)
    }

    fn switch(&self, local: &CpuLocal, context: &mut RegisterContext) -> Option<Arc<Thread>> {
        let mut current = local.current.lock();
        if let Some(outgoing) = current.take() {
            outgoing.save_context(context);
            if outgoing.state() == ThreadState::Running {
                outgoing.reset_time_slice();
            }
            outgoing.on_cpu.store(false, Ordering::Release);
        }

        let next = {
            let mut queue = local.run_queue.lock();
            let mut picked = None;
            for _ in 0..queue.len() {
                let Some(candidate) = queue.pop_front() else {
                    break;
                };
                let eligible = candidate.state() == ThreadState::Running
                    && candidate.on_cpu.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok();
                queue.push_back(candidate.clone());
                if eligible {
                    picked = Some(candidate);
                    break;
                }
            }
            picked
        };

        if let Some(thread) = &next {
            *context = thread.context();
        }
        current.clone_from(&next);
        next
    }

    /// Starts tearing `process` down. Memory is reclaimed later by [`reap`](Self::reap).
    ///
    /// Returns false if the process was already being torn down.
    pub fn terminate(&self, process: &Arc<Process>, exit_code: i32) -> bool {
        let Some((threads, children)) = process.begin_teardown(exit_code) else {
            return false;
        };
        log_debug!(
            target: "sched",
            "terminating pid {} ({}) code {} threads {}",
            process.pid(),
            process.name(),
            exit_code,
            threads.len()
        );
        for thread in &threads {
            thread.kill();
        }
        for child in &children {
            self.terminate(child, EXIT_KILLED);
        }
        for thread in &threads {
            self.remove_thread(thread);
            thread.set_state(ThreadState::Dying);
        }
        process.finish_teardown();
        self.processes.lock().remove(&process.pid());
        self.destroyed.lock().push_back(process.clone());
        true
    }

    /// Ends `thread`. The last thread of a process takes the process down with it.
    pub fn exit_thread(&self, thread: &Arc<Thread>, exit_code: i32) {
        if let Some(process) = thread.process() {
            if !process.detach_thread(thread.tid()) {
                self.terminate(&process, exit_code);
                return;
            }
        }
        thread.kill();
        self.remove_thread(thread);
        thread.set_state(ThreadState::Dying);
    }

    /// Frees destroyed processes that nobody is using anymore. Returns how many were freed.
    pub fn reap(&self) -> usize {
        let pending = core::mem::take(&mut *self.destroyed.lock());
        let mut busy = VecDeque::new();
        let mut reaped = 0;
        for process in pending {
            if self.is_on_any_cpu(&process) || !process.try_release() {
                busy.push_back(process);
                continue;
            }
            log_debug!(target: "sched", "reaped pid {}", process.pid());
            reaped += 1;
        }
        self.destroyed.lock().extend(busy);
        reaped
    }

    /// Destroyed processes still waiting for [`reap`](Self::reap).
    pub fn pending_reap(&self) -> usize {
        self.destroyed.lock().len()
    }

    fn is_on_any_cpu(&self, process: &Process) -> bool {
        self.cpus
            .iter()
            .any(|cpu| cpu.current.lock().as_ref().is_some_and(|thread| thread.belongs_to(process)))
    }

    /// Resolves a page fault taken by `thread`. A fatal fault terminates the process.
    pub fn handle_page_fault(&self, thread: &Arc<Thread>, addr: usize, access: FaultAccess) -> Result<FrameNumber, FaultError> {
        let Some(process) = thread.process() else {
            return Err(FaultError::NoRegion);
        };
        let resolved = match process.address_space() {
            Some(space) => space.handle_fault(addr, access),
            None => Err(FaultError::NoRegion),
        };
        if let Err(err) = resolved {
            log_error!(
                target: "mm",
                "pid {} tid {}: fatal {:?} fault at {:#x}: {}",
                process.pid(),
                thread.tid(),
                access,
                addr,
                err
            );
            self.terminate(&process, EXIT_FAULT);
        }
        resolved
    }
}
