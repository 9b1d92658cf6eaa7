// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the descriptor and handle tables
//! OWNERS: @kernel-task-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Descriptor allocation always picks the lowest free index
//!   - Handle ids stay unique among live handles
//!
//! TEST_SCENARIOS:
//!   - allocation_returns_lowest_free_slot(): random allocate/destroy sequences against a model
//!   - live_handle_ids_are_unique(): random register/destroy sequences never alias two objects

use alloc::{collections::BTreeSet, sync::Arc, vec::Vec};

use proptest::prelude::*;

use super::fd::{FdTable, OpenFile};
use super::handle::{HandleTable, KernelObject, ObjectType};
use crate::config::RESERVED_FDS;
use crate::types::Fd;

struct File;

impl OpenFile for File {}

struct Object;

impl KernelObject for Object {
    fn object_type(&self) -> ObjectType {
        ObjectType::Other
    }
}

proptest! {
    #[test]
    fn allocation_returns_lowest_free_slot(ops in proptest::collection::vec((any::<bool>(), 0usize..16), 1..64)) {
        let mut table = FdTable::new();
        let mut open: BTreeSet<usize> = BTreeSet::new();
        for (allocate, index) in ops {
            if allocate {
                let expected = (0..).find(|slot| !open.contains(slot)).unwrap_or(0);
                let fd = table.allocate(Arc::new(File));
                prop_assert_eq!(fd.as_index(), expected);
                open.insert(expected);
            } else {
                let result = table.destroy(Fd::from_raw(index as u32));
                prop_assert_eq!(result.is_ok(), open.remove(&index));
            }
            prop_assert!(table.len() >= RESERVED_FDS);
            prop_assert_eq!(table.open_count(), open.len());
        }
    }

    #[test]
    fn live_handle_ids_are_unique(ops in proptest::collection::vec(any::<Option<u8>>(), 1..64)) {
        let mut table = HandleTable::new();
        let mut live = Vec::new();
        for op in ops {
            match op {
                None => live.push(table.register(Arc::new(Object))),
                Some(pick) if !live.is_empty() => {
                    let id = live.swap_remove(pick as usize % live.len());
                    prop_assert!(table.destroy(id).is_ok());
                }
                Some(_) => {}
            }
            let distinct: BTreeSet<u64> = live.iter().map(|id| id.as_raw()).collect();
            prop_assert_eq!(distinct.len(), live.len());
            prop_assert_eq!(table.len(), live.len());
        }
    }
}
