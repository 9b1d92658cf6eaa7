// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host integration tests for the blocking protocol
//! OWNERS: @kernel-sched-team
//! NOTE: Host threads stand in for CPUs; each kernel thread is driven by one host thread.
//!
//! TEST_SCENARIOS:
//!   - a wake racing the park is never lost
//!   - wait queues, multi-target blockers, futexes
//!   - timeouts against the tick-driven clock, signals, process teardown

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use cortex::arch::RegisterContext;
use cortex::config::{SchedulerConfig, PAGE_SIZE};
use cortex::mm::{AddressSpace, FramePool, SoftPageMap};
use cortex::sched::Scheduler;
use cortex::task::{BlockResult, Blocker, Thread, ThreadState, WaitQueue, SIGCHLD};
use cortex::types::{CpuId, Tid};

fn detached_thread() -> Arc<Thread> {
    Thread::new(Weak::new(), Tid::MAIN, RegisterContext::new(0x1000, 0x8000), 0x7000..0x8000)
}

fn wait_until_blocked(thread: &Thread) {
    while thread.state() != ThreadState::Blocked {
        thread::yield_now();
    }
}

#[test]
fn wake_racing_park_is_never_lost() {
    for _ in 0..500 {
        let waiter = detached_thread();
        let blocker = Blocker::new();
        let waker = {
            let blocker = blocker.clone();
            thread::spawn(move || blocker.unblock())
        };
        assert_eq!(waiter.block(&blocker), BlockResult::Woken);
        waker.join().unwrap();
        assert_eq!(waiter.state(), ThreadState::Running);
    }
}

#[test]
fn wait_queue_hands_off_to_blocked_thread() {
    let queue = Arc::new(WaitQueue::new());
    let waiter = detached_thread();
    let handle = {
        let (queue, waiter) = (queue.clone(), waiter.clone());
        thread::spawn(move || {
            let blocker = Blocker::new();
            queue.enqueue(blocker.clone());
            waiter.block(&blocker)
        })
    };
    wait_until_blocked(&waiter);
    assert!(queue.wake_one());
    assert_eq!(handle.join().unwrap(), BlockResult::Woken);
    assert!(queue.is_empty());
}

#[test]
fn multi_target_blocker_reports_which_queue_fired() {
    let first = Arc::new(WaitQueue::tagged(1));
    let second = Arc::new(WaitQueue::tagged(2));
    let waiter = detached_thread();
    let blocker = Blocker::multi();
    first.enqueue(blocker.clone());
    second.enqueue(blocker.clone());

    let handle = {
        let (waiter, blocker) = (waiter.clone(), blocker.clone());
        thread::spawn(move || waiter.block(&blocker))
    };
    wait_until_blocked(&waiter);
    assert_eq!(second.wake_all(), 1);
    assert_eq!(handle.join().unwrap(), BlockResult::Woken);
    assert_eq!(blocker.fired_source(), Some(2));
    assert!(first.remove(&blocker));
}

#[test]
fn timeout_expires_with_ticking_clock() {
    let sched = Arc::new(Scheduler::new(SchedulerConfig::with_cpus(1)));
    let stop = Arc::new(AtomicBool::new(false));
    let ticker = {
        let (sched, stop) = (sched.clone(), stop.clone());
        thread::spawn(move || {
            let mut context = RegisterContext::default();
            while !stop.load(Ordering::Acquire) {
                sched.timer_tick(CpuId::BOOT, &mut context);
                thread::yield_now();
            }
        })
    };

    let waiter = detached_thread();
    let blocker = Blocker::new();
    let mut timeout = 5_000;
    assert_eq!(waiter.block_with_timeout(&blocker, &mut timeout), BlockResult::TimedOut);
    assert_eq!(timeout, 0);
    assert!(blocker.was_interrupted());
    assert!(!waiter.sleep(2_000));

    stop.store(true, Ordering::Release);
    ticker.join().unwrap();
}

#[test]
fn early_wake_reports_remaining_time() {
    let waiter = detached_thread();
    let blocker = Blocker::new();
    let handle = {
        let (waiter, blocker) = (waiter.clone(), blocker.clone());
        thread::spawn(move || {
            let mut timeout = i64::MAX / 2;
            let result = waiter.block_with_timeout(&blocker, &mut timeout);
            (result, timeout)
        })
    };
    wait_until_blocked(&waiter);
    blocker.unblock();
    let (result, left) = handle.join().unwrap();
    assert_eq!(result, BlockResult::Woken);
    assert!(left > 0);
}

#[test]
fn signal_interrupts_blocked_thread() {
    let waiter = detached_thread();
    let handle = {
        let waiter = waiter.clone();
        thread::spawn(move || waiter.block(&Blocker::new()))
    };
    wait_until_blocked(&waiter);
    waiter.signal(SIGCHLD);
    assert_eq!(handle.join().unwrap(), BlockResult::Interrupted);
    assert_eq!(waiter.take_pending_signal(), Some(SIGCHLD));
}

fn futex_process(sched: &Scheduler) -> Arc<cortex::task::Process> {
    let space = Arc::new(AddressSpace::new(Box::new(SoftPageMap::new()), Arc::new(FramePool::with_capacity(8))));
    space.allocate_anonymous(PAGE_SIZE, 0x20_000, true).unwrap();
    sched.spawn("futex", space, None, 0x1000, 0x7000..0x8000)
}

#[test]
fn futex_wake_releases_waiter() {
    let sched = Scheduler::new(SchedulerConfig::with_cpus(2));
    let process = futex_process(&sched);
    let main = process.main_thread().unwrap();
    let handle = {
        let (process, main) = (process.clone(), main.clone());
        thread::spawn(move || process.futex_wait(&main, 0x20_000, 0, None))
    };
    wait_until_blocked(&main);
    assert_eq!(process.futex_wake(0x20_000, 8), 1);
    assert_eq!(handle.join().unwrap(), Ok(BlockResult::Woken));
    assert_eq!(process.futex_wake(0x20_000, 8), 0);
}

#[test]
fn teardown_interrupts_futex_waiter() {
    let sched = Scheduler::new(SchedulerConfig::with_cpus(1));
    let process = futex_process(&sched);
    let main = process.main_thread().unwrap();
    let handle = {
        let (process, main) = (process.clone(), main.clone());
        thread::spawn(move || process.futex_wait(&main, 0x20_000, 0, None))
    };
    wait_until_blocked(&main);
    assert!(sched.terminate(&process, 1));
    assert_eq!(handle.join().unwrap(), Ok(BlockResult::Interrupted));
    assert_eq!(main.state(), ThreadState::Dying);
    assert_eq!(main.block(&Blocker::new()), BlockResult::Interrupted);
}
