// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-fault resolution, copy-on-write and user-memory copies
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FaultAccess, FaultError, AddressSpace::{handle_fault, write_user, read_user}
//! DEPENDS_ON: mm::address_space, mm::vm_object, mm::page_map
//! INVARIANTS:
//!   - the covering region is read-locked for the whole resolution
//!   - a copy-on-write object is swapped for a private clone only under the region write lock
//!   - user copies touch a frame only while the page is mapped with the needed permission
//!
//! A write fault on a copy-on-write object either takes ownership (no other
//! mapping left: flag cleared, pages remapped writable) or clones the object
//! and rebinds the region to the clone. Clones are per object, lazily, never
//! for the whole address space.

use core::fmt;

use super::address_space::{lookup, AddressSpace};
use super::frame::FrameNumber;
use super::page_map::PageFlags;
use super::region::ObjectRef;
use super::vm_object::VmError;
use crate::config::PAGE_SIZE;
use crate::sync::RwUpgradeableGuard;

/// Kind of access that faulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
    Execute,
}

/// Fault outcomes that are fatal for the faulting process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultError {
    /// No region covers the address.
    NoRegion,
    /// Non-anonymous object without a frame for the page.
    Unbacked,
    /// Write to a read-only mapping.
    AccessViolation,
    /// Any other VM-object failure.
    Vm(VmError),
}

impl From<VmError> for FaultError {
    fn from(value: VmError) -> Self {
        match value {
            VmError::Unbacked => Self::Unbacked,
            other => Self::Vm(other),
        }
    }
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRegion => f.write_str("no region covers the address"),
            Self::Unbacked => f.write_str("unbacked page in non-anonymous object"),
            Self::AccessViolation => f.write_str("write to read-only mapping"),
            Self::Vm(err) => write!(f, "vm object: {}", err),
        }
    }
}

impl AddressSpace {
    /// Resolves a fault at `addr`, returning the frame now mapped there.
    pub fn handle_fault(&self, addr: usize, access: FaultAccess) -> Result<FrameNumber, FaultError> {
        let regions = self.regions.lock();
        let region = lookup(&regions, addr).ok_or(FaultError::NoRegion)?.clone();
        let page = addr & !(PAGE_SIZE - 1);
        let base = region.base();
        let offset = page - base;

        if access != FaultAccess::Write {
            let binding = region.read();
            drop(regions);
            let mut page_map = self.page_map.lock();
            return Ok(binding.hit(base, offset, &mut **page_map)?);
        }

        let binding = region.lock().upgradeable_read();
        drop(regions);
        if !binding.is_writable() {
            return Err(FaultError::AccessViolation);
        }
        let was_shared = binding.is_copy_on_write();
        if was_shared && !binding.try_take_ownership() {
            return self.copy_on_write(binding, base, offset);
        }
        let mut page_map = self.page_map.lock();
        if was_shared {
            // Last mapping: pages mapped read-only after the fork become writable again.
            binding.map_allocated_blocks(base, &mut **page_map)?;
        }
        Ok(binding.hit(base, offset, &mut **page_map)?)
    }

    fn copy_on_write(
        &self,
        binding: RwUpgradeableGuard<'_, ObjectRef>,
        base: usize,
        offset: usize,
    ) -> Result<FrameNumber, FaultError> {
        let private = binding.clone_object();
        let mut binding = binding.upgrade();
        log_debug!(
            target: "mm",
            "copy-on-write at {:#x}: cloned {:#x} bytes, {} mappings left on the original",
            base + offset,
            private.size(),
            binding.reference_count().saturating_sub(1)
        );
        *binding = ObjectRef::new(private);
        let binding = binding.downgrade();
        let mut page_map = self.page_map.lock();
        binding.map_allocated_blocks(base, &mut **page_map)?;
        Ok(binding.hit(base, offset, &mut **page_map)?)
    }

    /// Copies `data` to user address `addr`, faulting pages in and breaking copy-on-write as needed.
    pub fn write_user(&self, addr: usize, data: &[u8]) -> Result<(), FaultError> {
        let mut done = 0;
        while done < data.len() {
            let va = addr.checked_add(done).ok_or(FaultError::NoRegion)?;
            let in_page = va & (PAGE_SIZE - 1);
            let chunk = (PAGE_SIZE - in_page).min(data.len() - done);
            let bytes = &data[done..done + chunk];
            loop {
                let written = self
                    .region_read(va, |_, _| {
                        let page_map = self.page_map.lock();
                        match page_map.translate(va) {
                            Some(entry) if entry.flags.contains(PageFlags::WRITABLE) => {
                                self.frames.write(entry.frame, in_page, bytes);
                                true
                            }
                            _ => false,
                        }
                    })
                    .ok_or(FaultError::NoRegion)?;
                if written {
                    break;
                }
                self.handle_fault(va, FaultAccess::Write)?;
            }
            done += chunk;
        }
        Ok(())
    }

    /// Copies user memory at `addr` into `buf`, faulting pages in as needed.
    pub fn read_user(&self, addr: usize, buf: &mut [u8]) -> Result<(), FaultError> {
        let mut done = 0;
        while done < buf.len() {
            let va = addr.checked_add(done).ok_or(FaultError::NoRegion)?;
            let in_page = va & (PAGE_SIZE - 1);
            let chunk = (PAGE_SIZE - in_page).min(buf.len() - done);
            loop {
                let out = &mut buf[done..done + chunk];
                let read = self
                    .region_read(va, |_, _| match self.page_map.lock().translate(va) {
                        Some(entry) => {
                            self.frames.read(entry.frame, in_page, out);
                            true
                        }
                        None => false,
                    })
                    .ok_or(FaultError::NoRegion)?;
                if read {
                    break;
                }
                self.handle_fault(va, FaultAccess::Read)?;
            }
            done += chunk;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::{boxed::Box, sync::Arc};

    use super::*;
    use crate::mm::frame::FramePool;
    use crate::mm::page_map::SoftPageMap;
    use crate::mm::vm_object::VmObject;

    fn space(frames: usize) -> AddressSpace {
        AddressSpace::new(Box::new(SoftPageMap::new()), Arc::new(FramePool::with_capacity(frames)))
    }

    #[test]
    fn read_fault_backs_anonymous_page() {
        let space = space(4);
        space.allocate_anonymous(2 * PAGE_SIZE, 0x1000, true).unwrap();
        let frame = space.handle_fault(0x1abc, FaultAccess::Read).unwrap();
        assert_eq!(space.translate(0x1000).unwrap().frame, frame);
        assert_eq!(space.handle_fault(0x1000, FaultAccess::Read).unwrap(), frame);
        assert_eq!(space.frames().allocated(), 1);
    }

    #[test]
    fn fault_outside_regions_is_fatal() {
        let space = space(1);
        assert_eq!(space.handle_fault(0x9000, FaultAccess::Read), Err(FaultError::NoRegion));
    }

    #[test]
    fn write_to_read_only_image_is_a_violation() {
        let space = space(4);
        let image = VmObject::process_image(space.frames().clone(), 0x40_0000, PAGE_SIZE, false);
        space.map_vm_object(image, 0x40_0000, true).unwrap();
        assert_eq!(space.handle_fault(0x40_0010, FaultAccess::Write), Err(FaultError::AccessViolation));
        assert!(space.handle_fault(0x40_0010, FaultAccess::Execute).is_ok());
    }

    #[test]
    fn user_copies_round_trip_across_pages() {
        let space = space(4);
        space.allocate_anonymous(2 * PAGE_SIZE, 0x1000, true).unwrap();
        let data = [0x5au8; 64];
        space.write_user(0x1000 + PAGE_SIZE - 32, &data).unwrap();
        let mut back = [0u8; 64];
        space.read_user(0x1000 + PAGE_SIZE - 32, &mut back).unwrap();
        assert_eq!(back, data);
        assert_eq!(space.used_physical_memory(), 2 * PAGE_SIZE);
    }

    #[test]
    fn last_mapping_takes_ownership_without_copy() {
        let space = space(4);
        space.allocate_anonymous(PAGE_SIZE, 0x1000, true).unwrap();
        space.write_user(0x1000, b"parent").unwrap();
        let child = space.fork().unwrap();
        drop(child);
        let before = space.frames().allocated();
        space.write_user(0x1000, b"again!").unwrap();
        assert_eq!(space.frames().allocated(), before);
        assert!(!space.regions()[0].flags.contains(crate::mm::vm_object::VmFlags::COPY_ON_WRITE));
    }
}
