// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Execution model: processes, threads, blocking primitives and per-process tables
//! OWNERS: @kernel-task-team
//! PUBLIC API: Process, Thread, Blocker, WaitQueue, FdTable, HandleTable
//! DEPENDS_ON: mm (address spaces), sync, time
//! INVARIANTS: a thread only suspends inside Thread::block / block_with_timeout / sleep

pub mod blocker;
pub mod fd;
pub mod handle;
pub mod process;
pub mod thread;

pub use blocker::{BlockResult, Blocker, BlockerKind, WaitQueue};
pub use fd::{FdError, FdTable, OpenFile};
pub use handle::{HandleError, HandleTable, KernelObject, ObjectType};
pub use process::{Process, ProcessError, ProcessReadGuard, ProcessState, WaitError};
pub use thread::{Thread, ThreadState, SIGCHLD, SIGKILL, SIGSEGV};

#[cfg(test)]
mod tests_prop;
