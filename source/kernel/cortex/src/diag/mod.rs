// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel diagnostics
//! OWNERS: @kernel-team
//! PUBLIC API: log (Level, Record, emit, set_sink, set_max_level, log_* macros)

#[macro_use]
pub mod log;
