// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Monotonic uptime clock driven by the boot CPU's timer tick
//! OWNERS: @kernel-sched-team
//! PUBLIC API: uptime_us(), advance(us)
//! DEPENDS_ON: core::sync::atomic
//! INVARIANTS: Uptime never decreases
//!
//! Timeouts in the blocking layer are deadlines against this clock. Only the
//! boot CPU's tick advances it, so secondary CPUs do not count time twice.

use core::sync::atomic::{AtomicU64, Ordering};

static UPTIME_US: AtomicU64 = AtomicU64::new(0);

/// Microseconds elapsed since the clock started.
#[inline]
pub fn uptime_us() -> u64 {
    UPTIME_US.load(Ordering::Acquire)
}

/// Moves the clock forward by `us` microseconds.
#[inline]
pub fn advance(us: u64) {
    UPTIME_US.fetch_add(us, Ordering::AcqRel);
}
