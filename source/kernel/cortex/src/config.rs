// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel-core tunables: page geometry, user address window, scheduling quanta
//! OWNERS: @kernel-team
//! PUBLIC API: PAGE_SIZE, PAGE_SHIFT, USER_SPACE_START/END, DEFAULT_TIME_SLICE, TICK_US, MAX_CPUS,
//!             RESERVED_FDS, SchedulerConfig
//! DEPENDS_ON: static_assertions
//! INVARIANTS: PAGE_SIZE is a power of two; USER_SPACE_START/END are page aligned
//!
//! Constants are fixed at build time. Per-scheduler quanta live in [`SchedulerConfig`].

use static_assertions::const_assert;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// Lowest address the free-range search hands out. Page zero stays unmapped.
pub const USER_SPACE_START: usize = PAGE_SIZE;
/// First address of the kernel-reserved half of every address space (exclusive user bound).
pub const USER_SPACE_END: usize = 0x0000_8000_0000_0000;

/// Ticks a thread runs before it is preempted.
pub const DEFAULT_TIME_SLICE: u32 = 10;
/// Length of one timer tick in microseconds.
pub const TICK_US: u64 = 1_000;
/// Upper bound on logical CPUs.
pub const MAX_CPUS: usize = 64;
/// Descriptor slots every process starts with (stdin, stdout, stderr), initially empty.
pub const RESERVED_FDS: usize = 3;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(1 << PAGE_SHIFT == PAGE_SIZE);
const_assert!(USER_SPACE_START % PAGE_SIZE == 0);
const_assert!(USER_SPACE_END % PAGE_SIZE == 0);

/// Scheduler construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of logical CPUs (one run queue each), clamped to `1..=MAX_CPUS`.
    pub cpus: usize,
    /// Ticks handed to every new thread and to threads whose slice ran out.
    pub time_slice: u32,
    /// Microseconds the uptime clock advances per boot-CPU tick.
    pub tick_us: u64,
}

impl SchedulerConfig {
    pub const fn with_cpus(cpus: usize) -> Self {
        Self { cpus, time_slice: DEFAULT_TIME_SLICE, tick_us: TICK_US }
    }

    /// Returns the CPU count clamped to the supported range.
    pub fn cpu_count(&self) -> usize {
        self.cpus.clamp(1, MAX_CPUS)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::with_cpus(1)
    }
}

/// Rounds `value` up to the next page boundary, `None` on overflow.
#[inline]
pub fn page_align_up(value: usize) -> Option<usize> {
    value.checked_add(PAGE_SIZE - 1).map(|v| v & !(PAGE_SIZE - 1))
}

/// Returns true if `value` is a multiple of the page size.
#[inline]
pub const fn is_page_aligned(value: usize) -> bool {
    value & (PAGE_SIZE - 1) == 0
}
