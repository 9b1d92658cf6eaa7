// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Lock vocabulary of the kernel core
//! OWNERS: @kernel-sync-team
//! PUBLIC API: SpinLock, SpinLockGuard, RwSpinLock, RwReadGuard, RwWriteGuard, RwUpgradeableGuard
//! DEPENDS_ON: spin
//! INVARIANTS: Short critical sections only; never held across Thread::block or a page fault
//!
//! All locks busy-wait. There is no queueing, fairness or priority inheritance,
//! so a low-priority holder preempted on its core delays every spinner on the
//! others. Critical sections are kept to table updates and page-map edits.

pub type SpinLock<T> = spin::Mutex<T>;
pub type SpinLockGuard<'a, T> = spin::MutexGuard<'a, T>;

pub type RwSpinLock<T> = spin::RwLock<T>;
pub type RwReadGuard<'a, T> = spin::RwLockReadGuard<'a, T>;
pub type RwWriteGuard<'a, T> = spin::RwLockWriteGuard<'a, T>;
pub type RwUpgradeableGuard<'a, T> = spin::RwLockUpgradableGuard<'a, T>;
