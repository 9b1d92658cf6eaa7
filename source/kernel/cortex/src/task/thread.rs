// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Schedulable execution context: state machine, time slice, blocking, signals
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/blocking.rs
//! PUBLIC API: Thread, ThreadState, SIGKILL, SIGCHLD
//! DEPENDS_ON: task::blocker, task::process (weak back-reference), time, arch
//! INVARIANTS:
//!   - Dying is terminal; unblock never revives a Zombie or Dying thread
//!   - at most one active blocker; it is cleared before `block` returns
//!   - a thread sits in at most one run queue (`queued_on`) and runs on at most one CPU (`on_cpu`)
//!
//! `block` parks by spinning on the thread's own state with `cpu_relax`; the
//! timer tick skips Blocked threads meanwhile, and any waker flips the state
//! back to Running.

extern crate alloc;

use alloc::sync::{Arc, Weak};
use core::fmt;
use core::ops::Range;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::blocker::{BlockResult, Blocker};
use super::process::Process;
use crate::arch::{cpu_relax, RegisterContext};
use crate::config::DEFAULT_TIME_SLICE;
use crate::sync::SpinLock;
use crate::time;
use crate::types::{CpuId, Tid};

/// Kill signal: cannot be masked.
pub const SIGKILL: u8 = 9;
/// Invalid memory access.
pub const SIGSEGV: u8 = 11;
/// Sent to a parent when a child dies.
pub const SIGCHLD: u8 = 17;
/// Highest signal number.
pub const SIGNAL_MAX: u8 = 64;

const UNMASKABLE: u64 = 1 << (SIGKILL - 1);

/// Lifecycle state of a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Blocked,
    /// Process teardown requested; the thread never runs user code again.
    Zombie,
    /// Resources are being reclaimed.
    Dying,
}

struct ThreadInner {
    state: ThreadState,
    time_slice: u32,
    time_slice_default: u32,
    priority: u8,
    context: RegisterContext,
    stack: Range<usize>,
    blocker: Option<Arc<Blocker>>,
}

/// A thread of a process.
pub struct Thread {
    tid: Tid,
    process: Weak<Process>,
    inner: SpinLock<ThreadInner>,
    pending_signals: AtomicU64,
    signal_mask: AtomicU64,
    pub(crate) queued_on: SpinLock<Option<CpuId>>,
    /// Set while the thread is some CPU's current thread.
    pub(crate) on_cpu: AtomicBool,
}

impl Thread {
    /// New Running thread starting with `context` on `stack`.
    pub fn new(process: Weak<Process>, tid: Tid, context: RegisterContext, stack: Range<usize>) -> Arc<Self> {
        let slice = DEFAULT_TIME_SLICE;
        Arc::new(Self {
            tid,
            process,
            inner: SpinLock::new(ThreadInner {
                state: ThreadState::Running,
                time_slice: slice,
                time_slice_default: slice,
                priority: 0,
                context,
                stack,
                blocker: None,
            }),
            pending_signals: AtomicU64::new(0),
            signal_mask: AtomicU64::new(0),
            queued_on: SpinLock::new(None),
            on_cpu: AtomicBool::new(false),
        })
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Owning process, if it is still alive.
    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    pub(crate) fn belongs_to(&self, process: &Process) -> bool {
        core::ptr::eq(self.process.as_ptr(), process)
    }

    pub fn state(&self) -> ThreadState {
        self.inner.lock().state
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        let mut inner = self.inner.lock();
        if inner.state != ThreadState::Dying {
            inner.state = state;
        }
    }

    pub fn priority(&self) -> u8 {
        self.inner.lock().priority
    }

    pub fn set_priority(&self, priority: u8) {
        self.inner.lock().priority = priority;
    }

    pub fn time_slice(&self) -> u32 {
        self.inner.lock().time_slice
    }

    pub fn set_time_slice_default(&self, ticks: u32) {
        let mut inner = self.inner.lock();
        inner.time_slice_default = ticks;
        inner.time_slice = ticks;
    }

    /// Burns one tick. Returns true when the slice is used up.
    pub(crate) fn consume_tick(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.time_slice = inner.time_slice.saturating_sub(1);
        inner.time_slice == 0
    }

    pub(crate) fn reset_time_slice(&self) {
        let mut inner = self.inner.lock();
        inner.time_slice = inner.time_slice_default;
    }

    pub fn context(&self) -> RegisterContext {
        self.inner.lock().context
    }

    pub(crate) fn save_context(&self, context: &RegisterContext) {
        self.inner.lock().context = *context;
    }

    pub fn stack(&self) -> Range<usize> {
        self.inner.lock().stack.clone()
    }

    /// Blocker the thread is currently parked on.
    pub fn current_blocker(&self) -> Option<Arc<Blocker>> {
        self.inner.lock().blocker.clone()
    }

    /// Parks until `blocker` is woken or interrupted.
    ///
    /// Returns at once if a wake already arrived, if the thread is a zombie or
    /// if an unmasked signal is pending. A bare [`unblock`](Self::unblock) that
    /// did not come through the blocker parks the thread again.
    pub fn block(self: &Arc<Self>, blocker: &Arc<Blocker>) -> BlockResult {
        loop {
            if let Some(early) = self.prepare_block(blocker) {
                return early;
            }
            self.park(None);
            self.finish_block();
            if self.is_terminating() {
                return BlockResult::Interrupted;
            }
            if !blocker.should_block() {
                return blocker.result();
            }
        }
    }

    /// Like [`block`](Self::block) with a deadline. `timeout_us` is updated with the time left.
    ///
    /// A timeout of zero or less expires on the first check; the early-return
    /// conditions of `block` are still honoured first.
    pub fn block_with_timeout(self: &Arc<Self>, blocker: &Arc<Blocker>, timeout_us: &mut i64) -> BlockResult {
        let budget = u64::try_from(*timeout_us).unwrap_or(0);
        let deadline = time::uptime_us().saturating_add(budget);
        loop {
            if let Some(early) = self.prepare_block(blocker) {
                return early;
            }
            let timed_out = self.park(Some(deadline));
            self.finish_block();

            if self.is_terminating() {
                return BlockResult::Interrupted;
            }
            if timed_out {
                *timeout_us = 0;
                if blocker.expire() {
                    return BlockResult::TimedOut;
                }
                // A waker claimed the blocker in the same instant.
                return blocker.result();
            }
            if !blocker.should_block() {
                let left = deadline.saturating_sub(time::uptime_us());
                *timeout_us = i64::try_from(left).unwrap_or(i64::MAX);
                return blocker.result();
            }
        }
    }

    fn prepare_block(self: &Arc<Self>, blocker: &Arc<Blocker>) -> Option<BlockResult> {
        let mut waiter = blocker.waiter.lock();
        let mut inner = self.inner.lock();
        *waiter = Some(Arc::downgrade(self));
        if !blocker.should_block() {
            return Some(blocker.result());
        }
        if matches!(inner.state, ThreadState::Zombie | ThreadState::Dying) || self.has_deliverable_signal() {
            return Some(BlockResult::Interrupted);
        }
        inner.blocker = Some(blocker.clone());
        inner.state = ThreadState::Blocked;
        None
    }

    fn finish_block(&self) {
        self.inner.lock().blocker = None;
    }

    /// Spins until the thread leaves Blocked. Returns true if `deadline` passed first.
    fn park(&self, deadline: Option<u64>) -> bool {
        loop {
            if self.state() != ThreadState::Blocked {
                return false;
            }
            if let Some(deadline) = deadline {
                if time::uptime_us() >= deadline {
                    self.unblock();
                    return true;
                }
            }
            cpu_relax();
        }
    }

    /// Sleeps for `us` microseconds. Returns true if the sleep was cut short.
    pub fn sleep(&self, us: u64) -> bool {
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, ThreadState::Zombie | ThreadState::Dying) || self.has_deliverable_signal() {
                return true;
            }
            inner.state = ThreadState::Blocked;
        }
        let deadline = time::uptime_us().saturating_add(us);
        let timed_out = self.park(Some(deadline));
        !timed_out
    }

    /// Makes a Blocked thread Running again and refreshes its time slice.
    pub fn unblock(&self) {
        let mut inner = self.inner.lock();
        inner.time_slice = inner.time_slice_default;
        if inner.state == ThreadState::Blocked {
            inner.state = ThreadState::Running;
        }
    }

    fn is_terminating(&self) -> bool {
        matches!(self.state(), ThreadState::Zombie | ThreadState::Dying)
    }

    /// Turns the thread into a zombie and cancels its current wait.
    pub(crate) fn kill(&self) {
        let blocker = {
            let mut inner = self.inner.lock();
            if inner.state == ThreadState::Dying {
                return;
            }
            inner.state = ThreadState::Zombie;
            inner.blocker.clone()
        };
        if let Some(blocker) = blocker {
            blocker.interrupt();
        }
    }

    /// Cancels whatever the thread is blocked on.
    pub fn interrupt(&self) {
        let blocker = {
            let inner = self.inner.lock();
            if inner.state != ThreadState::Blocked {
                return;
            }
            inner.blocker.clone()
        };
        match blocker {
            Some(blocker) => {
                blocker.interrupt();
            }
            None => self.unblock(),
        }
    }

    /// Marks `signal` pending and breaks a current wait.
    pub fn signal(&self, signal: u8) {
        debug_assert!((1..=SIGNAL_MAX).contains(&signal), "bad signal number {}", signal);
        self.pending_signals.fetch_or(1 << (signal - 1), Ordering::AcqRel);
        if self.has_deliverable_signal() {
            self.interrupt();
        }
    }

    pub fn pending_signals(&self) -> u64 {
        self.pending_signals.load(Ordering::Acquire)
    }

    pub fn signal_mask(&self) -> u64 {
        self.signal_mask.load(Ordering::Acquire)
    }

    pub fn set_signal_mask(&self, mask: u64) {
        self.signal_mask.store(mask & !UNMASKABLE, Ordering::Release);
    }

    pub fn has_deliverable_signal(&self) -> bool {
        self.pending_signals() & !self.signal_mask() != 0
    }

    /// Takes the lowest-numbered deliverable signal off the pending set.
    pub fn take_pending_signal(&self) -> Option<u8> {
        loop {
            let pending = self.pending_signals();
            let deliverable = pending & !self.signal_mask();
            if deliverable == 0 {
                return None;
            }
            let bit = deliverable.trailing_zeros();
            let cleared = pending & !(1 << bit);
            if self
                .pending_signals
                .compare_exchange(pending, cleared, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(bit as u8 + 1);
            }
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread").field("tid", &self.tid).field("state", &self.state()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orphan_thread() -> Arc<Thread> {
        Thread::new(Weak::new(), Tid::MAIN, RegisterContext::new(0x1000, 0x8000), 0x4000..0x8000)
    }

    #[test]
    fn unblock_before_park_returns_immediately() {
        let thread = orphan_thread();
        let blocker = Blocker::new();
        blocker.unblock();
        assert_eq!(thread.block(&blocker), BlockResult::Woken);
        assert_eq!(thread.state(), ThreadState::Running);
        assert!(thread.current_blocker().is_none());
    }

    #[test]
    fn interrupted_before_park() {
        let thread = orphan_thread();
        let blocker = Blocker::new();
        blocker.interrupt();
        assert_eq!(thread.block(&blocker), BlockResult::Interrupted);
    }

    #[test]
    fn zombie_does_not_park() {
        let thread = orphan_thread();
        thread.set_state(ThreadState::Zombie);
        assert_eq!(thread.block(&Blocker::new()), BlockResult::Interrupted);
        assert!(thread.sleep(1_000_000));
    }

    #[test]
    fn pending_signal_prevents_parking() {
        let thread = orphan_thread();
        thread.signal(SIGCHLD);
        assert_eq!(thread.block(&Blocker::new()), BlockResult::Interrupted);
        assert_eq!(thread.take_pending_signal(), Some(SIGCHLD));
        assert_eq!(thread.take_pending_signal(), None);
    }

    #[test]
    fn masked_signal_does_not_interrupt() {
        let thread = orphan_thread();
        thread.set_signal_mask(1 << (SIGCHLD - 1));
        thread.signal(SIGCHLD);
        assert!(!thread.has_deliverable_signal());
        let blocker = Blocker::new();
        blocker.unblock();
        assert_eq!(thread.block(&blocker), BlockResult::Woken);
    }

    #[test]
    fn sigkill_cannot_be_masked() {
        let thread = orphan_thread();
        thread.set_signal_mask(u64::MAX);
        thread.signal(SIGKILL);
        assert_eq!(thread.take_pending_signal(), Some(SIGKILL));
    }

    #[test]
    fn zero_timeout_expires_immediately() {
        let thread = orphan_thread();
        let blocker = Blocker::new();
        let mut timeout = 0;
        assert_eq!(thread.block_with_timeout(&blocker, &mut timeout), BlockResult::TimedOut);
        assert_eq!(timeout, 0);
        assert!(blocker.was_interrupted());
        assert_eq!(thread.state(), ThreadState::Running);
    }

    #[test]
    fn stray_unblock_parks_again() {
        let thread = orphan_thread();
        let blocker = Blocker::new();
        let handle = {
            let (thread, blocker) = (thread.clone(), blocker.clone());
            std::thread::spawn(move || thread.block(&blocker))
        };
        while thread.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }
        thread.unblock();
        while thread.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }
        assert!(blocker.should_block());
        assert!(blocker.unblock());
        assert_eq!(handle.join().unwrap(), BlockResult::Woken);
    }

    #[test]
    fn unblock_never_revives_terminated_threads() {
        let thread = orphan_thread();
        thread.set_state(ThreadState::Dying);
        thread.unblock();
        assert_eq!(thread.state(), ThreadState::Dying);
        thread.set_state(ThreadState::Running);
        assert_eq!(thread.state(), ThreadState::Dying);
    }

    #[test]
    fn kill_wakes_a_sleeping_thread() {
        let thread = orphan_thread();
        let sleeper = thread.clone();
        let handle = std::thread::spawn(move || sleeper.sleep(u64::MAX));
        while thread.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }
        thread.kill();
        assert!(handle.join().unwrap());
        assert_eq!(thread.state(), ThreadState::Zombie);
    }

    #[test]
    fn time_slice_accounting() {
        let thread = orphan_thread();
        thread.set_time_slice_default(2);
        assert!(!thread.consume_tick());
        assert!(thread.consume_tick());
        thread.reset_time_slice();
        assert_eq!(thread.time_slice(), 2);
    }
}
