// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Architecture seam: saved register state and the spin-wait hint.
//!
//! The layout of [`RegisterContext`] matches what the trap prologue pushes;
//! the core only copies it between threads and never interprets the
//! general-purpose slots.

/// Saved user/kernel register state of a thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RegisterContext {
    pub gpr: [usize; 31],
    pub pc: usize,
    pub sp: usize,
    pub status: usize,
    /// Thread-pointer / FS base.
    pub tls: usize,
}

impl RegisterContext {
    /// Context that starts executing at `entry` on the stack ending at `stack_top`.
    pub fn new(entry: usize, stack_top: usize) -> Self {
        Self { pc: entry, sp: stack_top, ..Self::default() }
    }
}

/// Hint issued by every busy-wait loop in the core.
#[inline(always)]
pub fn cpu_relax() {
    core::hint::spin_loop();
}
