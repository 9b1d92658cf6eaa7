// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process object: threads, address space, descriptor and handle tables, children
//! OWNERS: @kernel-task-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/process_lifecycle.rs + tests/fork_cow.rs
//! PUBLIC API: Process, ProcessState, ProcessError, WaitError, ProcessReadGuard
//! DEPENDS_ON: task::{thread, blocker, fd, handle}, mm::AddressSpace
//! INVARIANTS:
//!   - the thread list is never empty while the process is Running
//!   - parent links are weak; the child list owns the children until they are waited for
//!   - lock order: process state lock -> child state lock; fd and handle tables lock independently
//!
//! Teardown is driven by the scheduler (`Scheduler::terminate`); this module
//! only provides the per-process steps.

extern crate alloc;

use alloc::{
    collections::BTreeMap,
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::fmt;
use core::ops::Range;

use super::blocker::{BlockResult, Blocker, WaitQueue};
use super::fd::{FdError, FdTable, OpenFile};
use super::handle::{HandleError, HandleTable, KernelObject, ObjectType};
use super::thread::{Thread, ThreadState, SIGCHLD};
use crate::arch::RegisterContext;
use crate::mm::{AddressSpace, AddressSpaceError, FaultError};
use crate::sync::{RwReadGuard, RwSpinLock, SpinLock};
use crate::types::{Fd, HandleId, Pid, Tid};

/// Lifecycle state of a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Teardown in progress.
    Dying,
    /// Torn down; waiting to be reaped and waited for.
    Dead,
}

/// Failures of process-level operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessError {
    /// The process is dying or dead.
    NotRunning,
    /// The address space was already released.
    NoAddressSpace,
    /// Futex word did not hold the expected value.
    WouldBlock,
    AddressSpace(AddressSpaceError),
    Fault(FaultError),
}

impl From<AddressSpaceError> for ProcessError {
    fn from(value: AddressSpaceError) -> Self {
        Self::AddressSpace(value)
    }
}

impl From<FaultError> for ProcessError {
    fn from(value: FaultError) -> Self {
        Self::Fault(value)
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRunning => f.write_str("process is not running"),
            Self::NoAddressSpace => f.write_str("process has no address space"),
            Self::WouldBlock => f.write_str("futex value changed"),
            Self::AddressSpace(err) => write!(f, "address space: {}", err),
            Self::Fault(err) => write!(f, "fault: {}", err),
        }
    }
}

/// Errors returned when waiting for child processes.
#[must_use = "wait errors must be handled explicitly"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitError {
    /// The caller has no children.
    NoChildren,
    /// The wait was cancelled by a signal or teardown.
    Interrupted,
}

struct ProcessInner {
    state: ProcessState,
    threads: Vec<Arc<Thread>>,
    children: Vec<Arc<Process>>,
    parent: Weak<Process>,
    next_tid: u32,
    exit_code: i32,
    uid: u32,
    gid: u32,
}

/// Read view of the process state lock.
pub struct ProcessReadGuard<'a>(RwReadGuard<'a, ProcessInner>);

impl ProcessReadGuard<'_> {
    pub fn state(&self) -> ProcessState {
        self.0.state
    }

    pub fn thread_count(&self) -> usize {
        self.0.threads.len()
    }
}

/// A process.
pub struct Process {
    pid: Pid,
    name: String,
    inner: RwSpinLock<ProcessInner>,
    address_space: SpinLock<Option<Arc<AddressSpace>>>,
    fds: SpinLock<FdTable>,
    handles: SpinLock<HandleTable>,
    child_exit: WaitQueue,
    futexes: SpinLock<BTreeMap<usize, Arc<WaitQueue>>>,
}

impl Process {
    /// New Running process whose main thread starts at `entry` on `stack`.
    ///
    /// The caller registers it with the scheduler. `parent` adopts it as a child.
    pub fn create(
        pid: Pid,
        name: &str,
        address_space: Arc<AddressSpace>,
        parent: Option<&Arc<Process>>,
        entry: usize,
        stack: Range<usize>,
    ) -> Arc<Self> {
        let context = RegisterContext::new(entry, stack.end);
        let process = Self::assemble(pid, String::from(name), address_space, parent, FdTable::new(), (0, 0), context, stack);
        if let Some(parent) = parent {
            parent.inner.write().children.push(process.clone());
        }
        process
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        pid: Pid,
        name: String,
        address_space: Arc<AddressSpace>,
        parent: Option<&Arc<Process>>,
        fds: FdTable,
        (uid, gid): (u32, u32),
        context: RegisterContext,
        stack: Range<usize>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            pid,
            name,
            inner: RwSpinLock::new(ProcessInner {
                state: ProcessState::Running,
                threads: alloc::vec![Thread::new(weak.clone(), Tid::MAIN, context, stack)],
                children: Vec::new(),
                parent: parent.map(Arc::downgrade).unwrap_or_default(),
                next_tid: Tid::MAIN.as_raw() + 1,
                exit_code: 0,
                uid,
                gid,
            }),
            address_space: SpinLock::new(Some(address_space)),
            fds: SpinLock::new(fds),
            handles: SpinLock::new(HandleTable::new()),
            child_exit: WaitQueue::new(),
            futexes: SpinLock::new(BTreeMap::new()),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        self.inner.read().state
    }

    /// Exit code recorded at termination; 0 while running.
    pub fn exit_code(&self) -> i32 {
        self.inner.read().exit_code
    }

    /// Takes the process state lock for reading.
    pub fn lock(&self) -> ProcessReadGuard<'_> {
        ProcessReadGuard(self.inner.read())
    }

    pub fn uid(&self) -> u32 {
        self.inner.read().uid
    }

    pub fn gid(&self) -> u32 {
        self.inner.read().gid
    }

    pub fn set_ids(&self, uid: u32, gid: u32) {
        let mut inner = self.inner.write();
        inner.uid = uid;
        inner.gid = gid;
    }

    pub fn parent(&self) -> Option<Arc<Process>> {
        self.inner.read().parent.upgrade()
    }

    pub fn children(&self) -> Vec<Pid> {
        self.inner.read().children.iter().map(|child| child.pid).collect()
    }

    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.inner.read().threads.clone()
    }

    pub fn thread(&self, tid: Tid) -> Option<Arc<Thread>> {
        self.inner.read().threads.iter().find(|thread| thread.tid() == tid).cloned()
    }

    /// Oldest live thread, the one signals are delivered to.
    pub fn main_thread(&self) -> Option<Arc<Thread>> {
        self.inner.read().threads.first().cloned()
    }

    pub fn address_space(&self) -> Option<Arc<AddressSpace>> {
        self.address_space.lock().clone()
    }

    /// Adds a thread starting at `entry` on `stack`. The caller schedules it.
    pub fn create_child_thread(self: &Arc<Self>, entry: usize, stack: Range<usize>) -> Result<Arc<Thread>, ProcessError> {
        let mut inner = self.inner.write();
        if inner.state != ProcessState::Running {
            return Err(ProcessError::NotRunning);
        }
        let tid = Tid::from_raw(inner.next_tid);
        inner.next_tid += 1;
        let thread = Thread::new(Arc::downgrade(self), tid, RegisterContext::new(entry, stack.end), stack);
        inner.threads.push(thread.clone());
        Ok(thread)
    }

    /// Clones the process as `pid`. The child's only thread resumes with `from`'s registers.
    ///
    /// Private memory turns copy-on-write in both processes; descriptors are shared.
    pub fn fork(self: &Arc<Self>, pid: Pid, from: &Thread) -> Result<Arc<Process>, ProcessError> {
        let ids = {
            let inner = self.inner.read();
            if inner.state != ProcessState::Running {
                return Err(ProcessError::NotRunning);
            }
            (inner.uid, inner.gid)
        };
        let space = self.address_space().ok_or(ProcessError::NoAddressSpace)?;
        let child_space = Arc::new(space.fork()?);
        let regions = child_space.region_count();
        let fds = self.fds.lock().clone_for_fork();
        let child = Self::assemble(pid, self.name.clone(), child_space, Some(self), fds, ids, from.context(), from.stack());

        let mut inner = self.inner.write();
        if inner.state != ProcessState::Running {
            return Err(ProcessError::NotRunning);
        }
        inner.children.push(child.clone());
        log_debug!(target: "task", "fork: pid {} -> pid {} ({} regions)", self.pid, pid, regions);
        Ok(child)
    }

    /// Waits until a child has died and removes it. Returns the child.
    pub fn wait_for_child(&self, thread: &Arc<Thread>) -> Result<Arc<Process>, WaitError> {
        loop {
            // Queued before the scan so a child dying in between still wakes us.
            let blocker = Blocker::new();
            self.child_exit.enqueue(blocker.clone());
            {
                let mut inner = self.inner.write();
                if let Some(index) = inner.children.iter().position(|child| child.state() == ProcessState::Dead) {
                    let child = inner.children.remove(index);
                    drop(inner);
                    self.child_exit.remove(&blocker);
                    return Ok(child);
                }
                if inner.children.is_empty() {
                    drop(inner);
                    self.child_exit.remove(&blocker);
                    return Err(WaitError::NoChildren);
                }
            }
            let result = thread.block(&blocker);
            self.child_exit.remove(&blocker);
            if result.was_interrupted() {
                return Err(WaitError::Interrupted);
            }
        }
    }

    /// Blocks `thread` while the user word at `addr` equals `expected`.
    ///
    /// `timeout_us` bounds the wait when given.
    pub fn futex_wait(
        &self,
        thread: &Arc<Thread>,
        addr: usize,
        expected: u32,
        timeout_us: Option<i64>,
    ) -> Result<BlockResult, ProcessError> {
        let blocker = Blocker::new();
        let queue = self.futex_enqueue(addr, &blocker);
        let outcome = self.futex_park(thread, addr, expected, timeout_us, &blocker);
        queue.remove(&blocker);
        self.futex_retire(addr, &queue);
        outcome
    }

    fn futex_park(
        &self,
        thread: &Arc<Thread>,
        addr: usize,
        expected: u32,
        timeout_us: Option<i64>,
        blocker: &Arc<Blocker>,
    ) -> Result<BlockResult, ProcessError> {
        let space = self.address_space().ok_or(ProcessError::NoAddressSpace)?;
        let mut word = [0u8; 4];
        space.read_user(addr, &mut word)?;
        if u32::from_ne_bytes(word) != expected {
            return Err(ProcessError::WouldBlock);
        }
        Ok(match timeout_us {
            Some(mut left) => thread.block_with_timeout(blocker, &mut left),
            None => thread.block(blocker),
        })
    }

    /// Wakes up to `count` waiters on `addr`. Returns how many were woken.
    pub fn futex_wake(&self, addr: usize, count: usize) -> usize {
        let mut futexes = self.futexes.lock();
        let Some(queue) = futexes.get(&addr).cloned() else {
            return 0;
        };
        let mut woken = 0;
        while woken < count && queue.wake_one() {
            woken += 1;
        }
        if queue.is_empty() {
            futexes.remove(&addr);
        }
        woken
    }

    /// Drops the queue for `addr` once nobody waits on it, unless it was already replaced.
    fn futex_retire(&self, addr: usize, queue: &Arc<WaitQueue>) {
        let mut futexes = self.futexes.lock();
        let idle = futexes.get(&addr).is_some_and(|current| Arc::ptr_eq(current, queue) && current.is_empty());
        if idle {
            futexes.remove(&addr);
        }
    }

    /// Enqueues under the map lock so `futex_wake` cannot retire the queue in between.
    fn futex_enqueue(&self, addr: usize, blocker: &Arc<Blocker>) -> Arc<WaitQueue> {
        let mut futexes = self.futexes.lock();
        let queue = futexes.entry(addr).or_insert_with(|| Arc::new(WaitQueue::new()));
        queue.enqueue(blocker.clone());
        queue.clone()
    }

    pub fn allocate_file_descriptor(&self, file: Arc<dyn OpenFile>) -> Fd {
        self.fds.lock().allocate(file)
    }

    pub fn replace_file_descriptor(&self, fd: Fd, file: Arc<dyn OpenFile>) -> Result<(), FdError> {
        self.fds.lock().replace(fd, file)
    }

    pub fn destroy_file_descriptor(&self, fd: Fd) -> Result<(), FdError> {
        self.fds.lock().destroy(fd)
    }

    pub fn get_file_descriptor(&self, fd: Fd) -> Result<Arc<dyn OpenFile>, FdError> {
        self.fds.lock().get(fd)
    }

    /// Size of the descriptor table, open or not.
    pub fn fd_count(&self) -> usize {
        self.fds.lock().len()
    }

    pub fn register_handle(&self, object: Arc<dyn KernelObject>) -> HandleId {
        self.handles.lock().register(object)
    }

    pub fn find_handle(&self, id: HandleId) -> Result<Arc<dyn KernelObject>, HandleError> {
        self.handles.lock().find(id)
    }

    pub fn destroy_handle(&self, id: HandleId) -> Result<(), HandleError> {
        self.handles.lock().destroy(id).map(drop)
    }

    /// Moves Running to Dying and records `exit_code`.
    ///
    /// Returns the threads and children to tear down, or `None` if teardown
    /// already started.
    pub(crate) fn begin_teardown(&self, exit_code: i32) -> Option<(Vec<Arc<Thread>>, Vec<Arc<Process>>)> {
        let mut inner = self.inner.write();
        if inner.state != ProcessState::Running {
            return None;
        }
        inner.state = ProcessState::Dying;
        inner.exit_code = exit_code;
        Some((inner.threads.clone(), inner.children.clone()))
    }

    /// Marks the process Dead, releases its descriptors and handles and tells the parent.
    pub(crate) fn finish_teardown(&self) {
        self.inner.write().state = ProcessState::Dead;
        self.fds.lock().close_all();
        self.handles.lock().destroy_all();

        if let Some(parent) = self.parent() {
            parent.child_exit.wake_all();
            if let Some(main) = parent.main_thread() {
                main.signal(SIGCHLD);
            }
        }
    }

    /// Removes `tid` unless it is the last thread. Returns false for the last thread.
    pub(crate) fn detach_thread(&self, tid: Tid) -> bool {
        let mut inner = self.inner.write();
        if inner.threads.len() <= 1 {
            return false;
        }
        inner.threads.retain(|thread| thread.tid() != tid);
        true
    }

    /// Frees threads and memory once nobody holds the state lock. False if it is contended.
    pub(crate) fn try_release(&self) -> bool {
        let Some(mut inner) = self.inner.try_write() else {
            return false;
        };
        for thread in inner.threads.drain(..) {
            thread.set_state(ThreadState::Dying);
        }
        inner.children.clear();
        drop(inner);
        // Dropping the last reference unmaps every region and returns its frames.
        self.address_space.lock().take();
        true
    }
}

impl KernelObject for Process {
    fn object_type(&self) -> ObjectType {
        ObjectType::Process
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process").field("pid", &self.pid).field("name", &self.name).field("state", &self.state()).finish()
    }
}
