// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process kernel-object handle table
//! OWNERS: @kernel-task-team
//! PUBLIC API: HandleTable, KernelObject, ObjectType, HandleError
//! DEPENDS_ON: types::HandleId
//! INVARIANTS: handle ids are slot + 1; id 0 never names an object; slots are reused lowest first

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use crate::types::HandleId;

/// Coarse type tag of a kernel object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectType {
    Process,
    Thread,
    VmObject,
    Channel,
    Other,
}

/// Reference-counted object a handle can name.
pub trait KernelObject: Send + Sync {
    fn object_type(&self) -> ObjectType;

    /// Called when the owning table destroys every handle at process exit.
    fn destroy(&self) {}
}

/// Handle-table failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleError {
    /// Id does not name a slot of the table.
    InvalidHandle,
    /// Slot exists but is empty.
    Closed,
}

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHandle => f.write_str("invalid handle id"),
            Self::Closed => f.write_str("handle already destroyed"),
        }
    }
}

/// Id -> kernel object.
#[derive(Default)]
pub struct HandleTable {
    slots: Vec<Option<Arc<dyn KernelObject>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `object` in the first free slot and returns its id.
    pub fn register(&mut self, object: Arc<dyn KernelObject>) -> HandleId {
        for (index, entry) in self.slots.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(object);
                return HandleId::from_slot(index);
            }
        }
        self.slots.push(Some(object));
        HandleId::from_slot(self.slots.len() - 1)
    }

    pub fn find(&self, id: HandleId) -> Result<Arc<dyn KernelObject>, HandleError> {
        let slot = id.slot().ok_or(HandleError::InvalidHandle)?;
        let entry = self.slots.get(slot).ok_or(HandleError::InvalidHandle)?;
        entry.clone().ok_or(HandleError::Closed)
    }

    /// Drops the table's reference to the object named by `id`.
    #[must_use = "destroying an unknown handle is reported, not ignored"]
    pub fn destroy(&mut self, id: HandleId) -> Result<Arc<dyn KernelObject>, HandleError> {
        let slot = id.slot().ok_or(HandleError::InvalidHandle)?;
        let entry = self.slots.get_mut(slot).ok_or(HandleError::InvalidHandle)?;
        entry.take().ok_or(HandleError::Closed)
    }

    /// Destroys every handle, notifying each object.
    pub fn destroy_all(&mut self) {
        for object in self.slots.drain(..).flatten() {
            object.destroy();
        }
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|entry| entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[derive(Default)]
    struct Channel(AtomicBool);

    impl KernelObject for Channel {
        fn object_type(&self) -> ObjectType {
            ObjectType::Channel
        }

        fn destroy(&self) {
            self.0.store(true, Ordering::Relaxed);
        }
    }

    #[test]
    fn ids_start_at_one_and_reuse_slots() {
        let mut table = HandleTable::new();
        let first = table.register(Arc::new(Channel::default()));
        let second = table.register(Arc::new(Channel::default()));
        assert_eq!(first.as_raw(), 1);
        assert_eq!(second.as_raw(), 2);
        table.destroy(first).unwrap();
        assert_eq!(table.register(Arc::new(Channel::default())), first);
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let mut table = HandleTable::new();
        assert_eq!(table.find(HandleId::NULL).err(), Some(HandleError::InvalidHandle));
        assert_eq!(table.destroy(HandleId::from_raw(7)).err(), Some(HandleError::InvalidHandle));
        let id = table.register(Arc::new(Channel::default()));
        table.destroy(id).unwrap();
        assert_eq!(table.destroy(id).err(), Some(HandleError::Closed));
        assert!(table.is_empty());
    }

    #[test]
    fn destroy_all_notifies_objects() {
        let mut table = HandleTable::new();
        let channel = Arc::new(Channel::default());
        let id = table.register(channel.clone());
        assert_eq!(table.find(id).unwrap().object_type(), ObjectType::Channel);
        table.destroy_all();
        assert!(channel.0.load(Ordering::Relaxed));
        assert_eq!(table.len(), 0);
    }
}
