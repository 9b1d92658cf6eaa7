// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cancellable wait primitive linking one thread to wait queues
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/blocking.rs (cross-thread wake races)
//! PUBLIC API: Blocker, BlockerKind, BlockResult, WaitQueue
//! DEPENDS_ON: task::thread (Thread::unblock), sync::SpinLock
//! INVARIANTS:
//!   - a wake that lands before the waiter parks clears `should_block`, so the park returns at once
//!   - the outcome is claimed once: the first of wake, interrupt or expiry wins, later ones are no-ops
//!   - lock order: blocker lock -> thread state lock
//!   - `unblock()` on a multi-target blocker is a programming error (debug assertion)
//!
//! A blocker lives for one blocking call. Queues hold it by `Arc`; the waiter
//! removes it from any queue that did not fire once `Thread::block` returns.

extern crate alloc;

use alloc::{
    collections::VecDeque,
    sync::{Arc, Weak},
};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use super::thread::Thread;
use crate::sync::SpinLock;

const NO_SOURCE: usize = usize::MAX;

const PENDING: u8 = 0;
const WOKEN: u8 = 1;
const INTERRUPTED: u8 = 2;

/// Whether a blocker waits on one queue or several.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockerKind {
    /// Waits on exactly one queue; any wake is unambiguous.
    Single,
    /// Waits on several queues; wakers must say which one fired via [`Blocker::notify`].
    Multi,
}

/// Outcome of a blocking call.
#[must_use = "an interrupted wait must be surfaced to the caller"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockResult {
    /// The awaited event happened.
    Woken,
    /// The wait was cancelled (process teardown or a pending signal).
    Interrupted,
    /// The deadline passed first.
    TimedOut,
}

impl BlockResult {
    /// Timeouts count as interruptions: the awaited event did not happen.
    pub fn was_interrupted(self) -> bool {
        !matches!(self, BlockResult::Woken)
    }
}

/// One-shot association between a waiting thread and the queues it sits on.
pub struct Blocker {
    pub(super) waiter: SpinLock<Option<Weak<Thread>>>,
    outcome: AtomicU8,
    source: AtomicUsize,
    kind: BlockerKind,
}

impl Blocker {
    fn with_kind(kind: BlockerKind) -> Arc<Self> {
        Arc::new(Self {
            waiter: SpinLock::new(None),
            outcome: AtomicU8::new(PENDING),
            source: AtomicUsize::new(NO_SOURCE),
            kind,
        })
    }

    /// Blocker for a single wait queue.
    pub fn new() -> Arc<Self> {
        Self::with_kind(BlockerKind::Single)
    }

    /// Blocker that may sit on several queues at once.
    pub fn multi() -> Arc<Self> {
        Self::with_kind(BlockerKind::Multi)
    }

    pub fn kind(&self) -> BlockerKind {
        self.kind
    }

    /// False once a wake or interrupt arrived, even if the waiter never parked.
    pub fn should_block(&self) -> bool {
        self.outcome.load(Ordering::Acquire) == PENDING
    }

    /// True if the wait was cancelled or expired rather than woken.
    pub fn was_interrupted(&self) -> bool {
        self.outcome.load(Ordering::Acquire) == INTERRUPTED
    }

    /// True once a waker claimed the blocker.
    pub fn was_removed(&self) -> bool {
        self.outcome.load(Ordering::Acquire) == WOKEN
    }

    /// Tag of the queue that fired, for multi-target blockers.
    pub fn fired_source(&self) -> Option<usize> {
        match self.source.load(Ordering::Acquire) {
            NO_SOURCE => None,
            source => Some(source),
        }
    }

    /// Wakes the waiter. Only valid for single-target blockers.
    ///
    /// Returns false if the wait already ended through another path.
    pub fn unblock(&self) -> bool {
        debug_assert!(self.kind == BlockerKind::Single, "unblock() on a multi-target blocker, use notify()");
        self.wake(NO_SOURCE)
    }

    /// Wakes the waiter on behalf of the queue tagged `source`.
    pub fn notify(&self, source: usize) -> bool {
        self.wake(source)
    }

    /// Cancels the wait: the pending `block` returns [`BlockResult::Interrupted`].
    pub fn interrupt(&self) -> bool {
        if !self.claim(INTERRUPTED) {
            return false;
        }
        self.resume_waiter();
        true
    }

    /// Ends the wait on behalf of an expired deadline. False if a waker got there first.
    pub(super) fn expire(&self) -> bool {
        self.claim(INTERRUPTED)
    }

    fn claim(&self, outcome: u8) -> bool {
        self.outcome.compare_exchange(PENDING, outcome, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    fn wake(&self, source: usize) -> bool {
        if !self.claim(WOKEN) {
            return false;
        }
        if source != NO_SOURCE {
            self.source.store(source, Ordering::Release);
        }
        self.resume_waiter();
        true
    }

    fn resume_waiter(&self) {
        let waiter = self.waiter.lock();
        if let Some(thread) = waiter.as_ref().and_then(Weak::upgrade) {
            thread.unblock();
        }
    }

    /// Outcome for a waiter that returns without having parked or after waking.
    pub(super) fn result(&self) -> BlockResult {
        if self.was_interrupted() {
            BlockResult::Interrupted
        } else {
            BlockResult::Woken
        }
    }
}

/// FIFO of blockers waiting for one event source.
pub struct WaitQueue {
    tag: usize,
    waiters: SpinLock<VecDeque<Arc<Blocker>>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self::tagged(0)
    }

    /// Queue whose wakes report `tag` to multi-target blockers.
    pub const fn tagged(tag: usize) -> Self {
        Self { tag, waiters: SpinLock::new(VecDeque::new()) }
    }

    pub fn tag(&self) -> usize {
        self.tag
    }

    pub fn enqueue(&self, blocker: Arc<Blocker>) {
        self.waiters.lock().push_back(blocker);
    }

    /// Drops `blocker` from the queue if it is still queued.
    pub fn remove(&self, blocker: &Arc<Blocker>) -> bool {
        let mut waiters = self.waiters.lock();
        let before = waiters.len();
        waiters.retain(|queued| !Arc::ptr_eq(queued, blocker));
        waiters.len() != before
    }

    /// Wakes the oldest waiter still waiting. Returns false if none was.
    pub fn wake_one(&self) -> bool {
        loop {
            let Some(blocker) = self.waiters.lock().pop_front() else {
                return false;
            };
            // Interrupted, timed out or already woken through another queue.
            if self.fire(&blocker) {
                return true;
            }
        }
    }

    /// Wakes every queued waiter, returning how many were still waiting.
    pub fn wake_all(&self) -> usize {
        let drained: VecDeque<_> = core::mem::take(&mut *self.waiters.lock());
        drained.into_iter().filter(|blocker| self.fire(blocker)).count()
    }

    fn fire(&self, blocker: &Blocker) -> bool {
        match blocker.kind() {
            BlockerKind::Single => blocker.unblock(),
            BlockerKind::Multi => blocker.notify(self.tag),
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
