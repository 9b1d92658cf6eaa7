// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host integration tests for fork and copy-on-write isolation
//! OWNERS: @kernel-mm-team
//!
//! TEST_SCENARIOS:
//!   - writes after fork stay private to the writer, in both directions
//!   - shared objects stay shared across fork
//!   - parent and child writing concurrently from different host threads

use std::sync::Arc;
use std::thread;

use cortex::config::{SchedulerConfig, PAGE_SIZE};
use cortex::mm::{AddressSpace, FrameAllocator, FramePool, PageFlags, SoftPageMap, VmFlags, VmObject};
use cortex::sched::Scheduler;

const DATA: usize = 0x10_000;

fn space(pool: &Arc<FramePool>) -> AddressSpace {
    AddressSpace::new(Box::new(SoftPageMap::new()), pool.clone())
}

fn read(space: &AddressSpace, addr: usize, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    space.read_user(addr, &mut buf).unwrap();
    buf
}

#[test]
fn child_write_does_not_leak_into_parent() {
    let pool = Arc::new(FramePool::with_capacity(16));
    let parent = space(&pool);
    parent.allocate_anonymous(2 * PAGE_SIZE, DATA, true).unwrap();
    parent.write_user(DATA, b"parent").unwrap();

    let child = parent.fork().unwrap();
    assert!(!parent.translate(DATA).unwrap().flags.contains(PageFlags::WRITABLE));
    assert!(!child.translate(DATA).unwrap().flags.contains(PageFlags::WRITABLE));
    assert_eq!(pool.allocated(), 1);

    child.write_user(DATA, b"child!").unwrap();
    assert_eq!(read(&parent, DATA, 6), b"parent");
    assert_eq!(read(&child, DATA, 6), b"child!");
    assert_eq!(pool.allocated(), 2);
}

#[test]
fn parent_write_does_not_leak_into_child() {
    let pool = Arc::new(FramePool::with_capacity(16));
    let parent = space(&pool);
    parent.allocate_anonymous(PAGE_SIZE, DATA, true).unwrap();
    parent.write_user(DATA, b"before").unwrap();

    let child = parent.fork().unwrap();
    parent.write_user(DATA, b"after!").unwrap();
    assert_eq!(read(&child, DATA, 6), b"before");
    assert_eq!(read(&parent, DATA, 6), b"after!");

    // The child now holds the last mapping of the original object.
    let before = pool.allocated();
    child.write_user(DATA, b"mine").unwrap();
    assert_eq!(pool.allocated(), before);
    assert!(!child.regions()[0].flags.contains(VmFlags::COPY_ON_WRITE));
}

#[test]
fn shared_objects_stay_shared() {
    let pool = Arc::new(FramePool::with_capacity(16));
    let parent = space(&pool);
    let shared = VmObject::physical(pool.clone(), PAGE_SIZE, false, true);
    parent.map_vm_object(shared.clone(), DATA, true).unwrap();

    let child = parent.fork().unwrap();
    assert_eq!(shared.reference_count(), 2);
    assert!(!shared.is_copy_on_write());
    child.write_user(DATA, b"seen by both").unwrap();
    assert_eq!(read(&parent, DATA, 12), b"seen by both");
}

#[test]
fn untouched_pages_are_zero_in_both() {
    let pool = Arc::new(FramePool::with_capacity(16));
    let parent = space(&pool);
    parent.allocate_anonymous(2 * PAGE_SIZE, DATA, true).unwrap();
    let child = parent.fork().unwrap();
    child.write_user(DATA + PAGE_SIZE, b"x").unwrap();
    assert_eq!(read(&parent, DATA + PAGE_SIZE, 1), [0u8]);
    assert_eq!(read(&child, DATA + PAGE_SIZE, 1), b"x");
}

#[test]
fn concurrent_writers_after_process_fork() {
    let pool = Arc::new(FramePool::with_capacity(64));
    let sched = Scheduler::new(SchedulerConfig::with_cpus(2));
    let parent_space = Arc::new(space(&pool));
    parent_space.allocate_anonymous(4 * PAGE_SIZE, DATA, true).unwrap();
    for page in 0..4 {
        parent_space.write_user(DATA + page * PAGE_SIZE, &[0xaa; 16]).unwrap();
    }
    let parent = sched.spawn("init", parent_space.clone(), None, 0x1000, 0x7000..0x8000);
    let main = parent.main_thread().unwrap();
    let child = sched.fork(&parent, &main).unwrap();
    let child_space = child.address_space().unwrap();

    let writers: Vec<_> = [(parent_space.clone(), 0x11u8), (child_space.clone(), 0x22u8)]
        .into_iter()
        .map(|(space, byte)| {
            thread::spawn(move || {
                for round in 0..32 {
                    let page = round % 4;
                    space.write_user(DATA + page * PAGE_SIZE, &[byte; 16]).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    for page in 0..4 {
        assert_eq!(read(&parent_space, DATA + page * PAGE_SIZE, 16), [0x11u8; 16]);
        assert_eq!(read(&child_space, DATA + page * PAGE_SIZE, 16), [0x22u8; 16]);
    }
    assert!(parent_space.regions_well_formed());
    assert_eq!(child.parent().unwrap().pid(), parent.pid());
}
