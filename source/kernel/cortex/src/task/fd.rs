// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process file-descriptor table
//! OWNERS: @kernel-task-team
//! PUBLIC API: FdTable, OpenFile, FdError
//! DEPENDS_ON: config::RESERVED_FDS, types::Fd
//! INVARIANTS: allocation returns the lowest free index; slots are never shifted
//!
//! The table only stores and indexes open files. Reading and writing them is
//! the file layer's business.

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use crate::config::RESERVED_FDS;
use crate::types::Fd;

/// An open file as seen by the descriptor table.
pub trait OpenFile: Send + Sync {
    /// Called when a descriptor referring to the file is closed.
    fn close(&self) {}
}

/// Descriptor-table failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FdError {
    /// Index beyond the end of the table.
    OutOfRange,
    /// Slot exists but holds no file.
    NotOpen,
}

impl fmt::Display for FdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange => f.write_str("descriptor index out of range"),
            Self::NotOpen => f.write_str("descriptor not open"),
        }
    }
}

/// Index -> open file, growing on demand.
pub struct FdTable {
    slots: Vec<Option<Arc<dyn OpenFile>>>,
}

impl FdTable {
    /// Table with the standard stream slots present but empty.
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(RESERVED_FDS);
        slots.resize_with(RESERVED_FDS, || None);
        Self { slots }
    }

    /// Stores `file` at the lowest free index, appending if the table is full.
    pub fn allocate(&mut self, file: Arc<dyn OpenFile>) -> Fd {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                self.slots[index] = Some(file);
                index
            }
            None => {
                self.slots.push(Some(file));
                self.slots.len() - 1
            }
        };
        Fd::from_raw(index as u32)
    }

    /// Closes whatever sits at `fd` and stores `file` there. `fd == len` appends.
    #[must_use = "an out-of-range replacement leaves the table unchanged"]
    pub fn replace(&mut self, fd: Fd, file: Arc<dyn OpenFile>) -> Result<(), FdError> {
        let index = fd.as_index();
        if index == self.slots.len() {
            self.slots.push(Some(file));
            return Ok(());
        }
        let slot = self.slots.get_mut(index).ok_or(FdError::OutOfRange)?;
        if let Some(old) = slot.replace(file) {
            old.close();
        }
        Ok(())
    }

    /// Closes `fd` and empties its slot.
    #[must_use = "closing an unknown descriptor is reported, not ignored"]
    pub fn destroy(&mut self, fd: Fd) -> Result<(), FdError> {
        let slot = self.slots.get_mut(fd.as_index()).ok_or(FdError::OutOfRange)?;
        let file = slot.take().ok_or(FdError::NotOpen)?;
        file.close();
        Ok(())
    }

    pub fn get(&self, fd: Fd) -> Result<Arc<dyn OpenFile>, FdError> {
        let slot = self.slots.get(fd.as_index()).ok_or(FdError::OutOfRange)?;
        slot.clone().ok_or(FdError::NotOpen)
    }

    /// Number of slots, open or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Copy for a forked child. Both tables refer to the same open files.
    pub fn clone_for_fork(&self) -> Self {
        Self { slots: self.slots.clone() }
    }

    /// Closes every open descriptor.
    pub fn close_all(&mut self) {
        for file in self.slots.iter_mut().filter_map(Option::take) {
            file.close();
        }
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counted(AtomicUsize);

    impl OpenFile for Counted {
        fn close(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn file() -> Arc<Counted> {
        Arc::new(Counted::default())
    }

    #[test]
    fn allocation_fills_reserved_slots_first() {
        let mut table = FdTable::new();
        assert_eq!(table.allocate(file()), Fd::STDIN);
        assert_eq!(table.allocate(file()), Fd::STDOUT);
        assert_eq!(table.allocate(file()), Fd::STDERR);
        assert_eq!(table.allocate(file()).as_raw(), 3);
        table.destroy(Fd::STDOUT).unwrap();
        assert_eq!(table.allocate(file()), Fd::STDOUT);
    }

    #[test]
    fn replace_appends_only_at_len() {
        let mut table = FdTable::new();
        assert_eq!(table.replace(Fd::from_raw(4), file()), Err(FdError::OutOfRange));
        assert_eq!(table.len(), RESERVED_FDS);
        table.replace(Fd::from_raw(3), file()).unwrap();
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn replace_closes_previous_file() {
        let mut table = FdTable::new();
        let old = file();
        table.replace(Fd::STDERR, old.clone()).unwrap();
        table.replace(Fd::STDERR, file()).unwrap();
        assert_eq!(old.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn double_destroy_is_an_error() {
        let mut table = FdTable::new();
        let fd = table.allocate(file());
        table.destroy(fd).unwrap();
        assert_eq!(table.destroy(fd), Err(FdError::NotOpen));
        assert_eq!(table.destroy(Fd::from_raw(table.len() as u32)), Err(FdError::OutOfRange));
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn fork_copy_shares_files() {
        let mut table = FdTable::new();
        let shared = file();
        let fd = table.allocate(shared.clone());
        let child = table.clone_for_fork();
        assert_eq!(Arc::strong_count(&shared), 3);
        table.close_all();
        assert!(child.get(fd).is_ok());
    }
}
