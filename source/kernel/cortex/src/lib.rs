// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: CORTEX kernel core: execution model, scheduler and virtual memory
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + host integration tests (tests/)
//! PUBLIC API: mm (AddressSpace, VmObject, PageMap, FrameAllocator), task (Process, Thread, Blocker),
//!             sched (Scheduler), types, config, time
//! DEPENDS_ON: spin (locks), bitflags (page/VM flags), static_assertions
//! INVARIANTS: Spinlocks are never held across a suspension point; region lists sorted and disjoint
//!
//! The crate is `no_std` + `alloc`. Architecture specifics (page-table encoding,
//! trap entry, context-switch assembly) stay outside: the core drives them through
//! [`mm::PageMap`], [`mm::FrameAllocator`] and [`arch::RegisterContext`].

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

#[macro_use]
mod diag;

pub mod arch;
pub mod config;
pub mod mm;
pub mod sched;
pub mod sync;
pub mod task;
pub mod time;
pub mod types;

pub use diag::log;
