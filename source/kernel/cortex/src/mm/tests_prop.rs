// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the address-space region allocator
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic. Ensures the region list stays sorted and disjoint.
//!
//! TEST_SCOPE:
//!   - Region list ordering and disjointness under random map/unmap sequences
//!   - Fixed mappings never mutate the list when they collide
//!   - Frames are returned once every region and address space is gone
//!
//! TEST_SCENARIOS:
//!   - random_ops_keep_regions_sorted(): any op sequence leaves a well-formed list
//!   - colliding_fixed_map_is_side_effect_free(): collision returns RegionInUse, list unchanged
//!   - dropping_space_releases_frames(): all frames return to the pool after teardown

use alloc::{boxed::Box, sync::Arc, vec::Vec};

use proptest::prelude::*;

use super::address_space::{AddressSpace, AddressSpaceError};
use super::fault::FaultAccess;
use super::frame::{FrameAllocator, FramePool};
use super::page_map::SoftPageMap;
use crate::config::PAGE_SIZE;

#[derive(Clone, Debug)]
enum Op {
    Map { pages: usize, hint_page: usize, fixed: bool },
    Unmap { page: usize, pages: usize },
    Touch { page: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..8, 0usize..64, any::<bool>()).prop_map(|(pages, hint_page, fixed)| Op::Map { pages, hint_page, fixed }),
        (0usize..64, 1usize..16).prop_map(|(page, pages)| Op::Unmap { page, pages }),
        (0usize..64).prop_map(|page| Op::Touch { page }),
    ]
}

fn space(frames: Arc<FramePool>) -> AddressSpace {
    AddressSpace::new(Box::new(SoftPageMap::new()), frames)
}

fn apply(space: &AddressSpace, op: &Op) {
    match *op {
        Op::Map { pages, hint_page, fixed } => {
            let _ = space.allocate_anonymous(pages * PAGE_SIZE, hint_page * PAGE_SIZE, fixed);
        }
        Op::Unmap { page, pages } => {
            let _ = space.unmap(page * PAGE_SIZE, pages * PAGE_SIZE);
        }
        Op::Touch { page } => {
            let _ = space.handle_fault(page * PAGE_SIZE, FaultAccess::Write);
        }
    }
}

proptest! {
    #[test]
    fn random_ops_keep_regions_sorted(ops in proptest::collection::vec(arb_op(), 1..40)) {
        let space = space(Arc::new(FramePool::with_capacity(512)));
        for op in &ops {
            apply(&space, op);
            prop_assert!(space.regions_well_formed());
        }
        let regions = space.regions();
        for pair in regions.windows(2) {
            prop_assert!(pair[0].end() <= pair[1].base);
        }
    }

    #[test]
    fn colliding_fixed_map_is_side_effect_free(
        base_page in 1usize..32,
        pages in 1usize..8,
        offset in 0usize..8,
        request in 1usize..8,
    ) {
        let space = space(Arc::new(FramePool::with_capacity(8)));
        space.allocate_anonymous(pages * PAGE_SIZE, base_page * PAGE_SIZE, true).unwrap();
        let hint = (base_page + offset.min(pages - 1)) * PAGE_SIZE;
        let before = space.regions();
        prop_assert_eq!(space.allocate_anonymous(request * PAGE_SIZE, hint, true).err(), Some(AddressSpaceError::RegionInUse));
        prop_assert_eq!(space.regions(), before);
    }

    #[test]
    fn dropping_space_releases_frames(ops in proptest::collection::vec(arb_op(), 1..30)) {
        let frames = Arc::new(FramePool::with_capacity(512));
        let space = space(frames.clone());
        for op in &ops {
            apply(&space, op);
        }
        let child = space.fork().unwrap();
        let touched: Vec<usize> = space.regions().iter().map(|info| info.base).collect();
        for base in touched {
            let _ = child.write_user(base, b"x");
        }
        drop(child);
        drop(space);
        prop_assert_eq!(frames.allocated(), 0);
    }
}
