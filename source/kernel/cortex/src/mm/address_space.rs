// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process address space: sorted region list plus the page map
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below, proptest in tests_prop.rs, tests/address_space.rs
//! PUBLIC API: AddressSpace, AddressSpaceError, RegionInfo
//! DEPENDS_ON: mm::region, mm::vm_object, mm::page_map, mm::frame
//! INVARIANTS:
//!   - regions sorted by base, pairwise disjoint, inside [start, end)
//!   - lock order: region list -> region rw lock -> page map -> VM object
//!   - no lock is held while the caller could fault or block
//!
//! Free ranges are found by a first-fit scan of the sorted list starting at
//! the low guard page. Fixed mappings never replace existing regions.

extern crate alloc;

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::fmt;

use super::frame::FrameAllocator;
use super::page_map::{PageMap, Translation};
use super::region::{MappedRegion, ObjectRef};
use super::vm_object::{VmError, VmFlags, VmObject};
use crate::config::{is_page_aligned, PAGE_SIZE, USER_SPACE_END, USER_SPACE_START};
use crate::sync::SpinLock;

/// Errors reported while managing an address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceError {
    /// Base or size not page aligned.
    Unaligned,
    /// Zero-sized request or range wrapping the address space.
    InvalidSize,
    /// A fixed mapping collides with an existing region.
    RegionInUse,
    /// No free range large enough below the kernel half.
    NoSpace,
    /// No region starts at or covers the given address.
    NoRegion,
    /// VM-object level failure.
    Vm(VmError),
}

impl From<VmError> for AddressSpaceError {
    fn from(value: VmError) -> Self {
        Self::Vm(value)
    }
}

impl fmt::Display for AddressSpaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unaligned => f.write_str("unaligned base or size"),
            Self::InvalidSize => f.write_str("invalid size"),
            Self::RegionInUse => f.write_str("fixed range already mapped"),
            Self::NoSpace => f.write_str("address space exhausted"),
            Self::NoRegion => f.write_str("no such region"),
            Self::Vm(err) => write!(f, "vm object: {}", err),
        }
    }
}

/// Snapshot of one region for diagnostics and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    pub base: usize,
    pub size: usize,
    pub flags: VmFlags,
    pub references: usize,
}

impl RegionInfo {
    pub fn end(&self) -> usize {
        self.base + self.size
    }
}

/// Region list and page map of one process.
pub struct AddressSpace {
    pub(super) regions: SpinLock<Vec<Arc<MappedRegion>>>,
    pub(super) page_map: SpinLock<Box<dyn PageMap>>,
    pub(super) frames: Arc<dyn FrameAllocator>,
    start: usize,
    end: usize,
}

impl AddressSpace {
    /// Address space spanning the default user window.
    pub fn new(page_map: Box<dyn PageMap>, frames: Arc<dyn FrameAllocator>) -> Self {
        Self::with_window(page_map, frames, USER_SPACE_START, USER_SPACE_END)
    }

    /// Address space whose free-range search is confined to `[start, end)`.
    pub fn with_window(page_map: Box<dyn PageMap>, frames: Arc<dyn FrameAllocator>, start: usize, end: usize) -> Self {
        debug_assert!(is_page_aligned(start) && is_page_aligned(end) && start < end);
        Self { regions: SpinLock::new(Vec::new()), page_map: SpinLock::new(page_map), frames, start, end }
    }

    /// Frame allocator backing this address space's objects.
    pub fn frames(&self) -> &Arc<dyn FrameAllocator> {
        &self.frames
    }

    /// First free base of `size` bytes at or above the guard page, without reserving it.
    pub fn find_available_region(&self, size: usize) -> Option<usize> {
        let regions = self.regions.lock();
        self.first_fit(&regions, size).map(|(base, _)| base)
    }

    /// Binds `object` at exactly `base` if that range is free, without mapping any page.
    pub fn allocate_region_at(&self, base: usize, object: Arc<VmObject>) -> Result<Arc<MappedRegion>, AddressSpaceError> {
        let size = object.size();
        Self::validate(base, size)?;
        let mut regions = self.regions.lock();
        let index = self.slot_at(&regions, base, size).ok_or(AddressSpaceError::RegionInUse)?;
        let region = Arc::new(MappedRegion::new(base, size, ObjectRef::new(object)));
        regions.insert(index, region.clone());
        check_invariants(&regions);
        Ok(region)
    }

    /// Maps `object` at `base_hint` if free, else anywhere free unless `fixed`.
    ///
    /// A fixed request over an existing region fails and leaves the list untouched.
    /// Process images default to their own base when no hint is given.
    pub fn map_vm_object(
        &self,
        object: Arc<VmObject>,
        base_hint: usize,
        fixed: bool,
    ) -> Result<Arc<MappedRegion>, AddressSpaceError> {
        let base_hint = match (base_hint, object.image_base()) {
            (0, Some(image_base)) => image_base,
            _ => base_hint,
        };
        let size = object.size();
        Self::validate(base_hint, size)?;
        let mut regions = self.regions.lock();

        let placement = match base_hint {
            0 => None,
            base => self.slot_at(&regions, base, size).map(|index| (base, index)),
        };
        let (base, index) = match placement {
            Some(found) => found,
            None if fixed => {
                log_warn!(
                    target: "mm",
                    "fixed region {:#x}-{:#x} already in use, not overwriting",
                    base_hint,
                    base_hint.wrapping_add(size)
                );
                return Err(AddressSpaceError::RegionInUse);
            }
            None => match self.first_fit(&regions, size) {
                Some(found) => found,
                None => {
                    log_warn!(target: "mm", "no free range for {:#x} bytes", size);
                    return Err(AddressSpaceError::NoSpace);
                }
            },
        };
        if let Some(image_base) = object.image_base() {
            if image_base != base {
                return Err(AddressSpaceError::Vm(VmError::BaseMismatch));
            }
        }

        let region = Arc::new(MappedRegion::new(base, size, ObjectRef::new(object)));
        {
            let binding = region.read();
            let mut page_map = self.page_map.lock();
            binding.map_allocated_blocks(base, &mut **page_map)?;
        }
        regions.insert(index, region.clone());
        check_invariants(&regions);
        Ok(region)
    }

    /// Maps a fresh anonymous object of `size` bytes.
    pub fn allocate_anonymous(
        &self,
        size: usize,
        base_hint: usize,
        fixed: bool,
    ) -> Result<Arc<MappedRegion>, AddressSpaceError> {
        Self::validate(base_hint, size)?;
        let object = VmObject::anonymous(self.frames.clone(), size);
        self.map_vm_object(object, base_hint, fixed)
    }

    /// Child address space sharing every object; private objects turn copy-on-write in both.
    pub fn fork(&self) -> Result<AddressSpace, AddressSpaceError> {
        let regions = self.regions.lock();
        let mut child_map = self.page_map.lock().clone_map();
        let mut child_regions = Vec::with_capacity(regions.len());

        for region in regions.iter() {
            // Write lock keeps faults in this space out while the object flips to copy-on-write.
            let binding = region.write();
            let reference = binding.object().fork_reference();
            if !reference.is_shared() {
                let mut page_map = self.page_map.lock();
                reference.map_allocated_blocks(region.base(), &mut **page_map)?;
            }
            reference.map_allocated_blocks(region.base(), &mut *child_map)?;
            child_regions.push(Arc::new(MappedRegion::new(region.base(), region.size(), reference)));
        }
        log_debug!(target: "mm", "forked address space with {} regions", child_regions.len());

        Ok(Self {
            regions: SpinLock::new(child_regions),
            page_map: SpinLock::new(child_map),
            frames: self.frames.clone(),
            start: self.start,
            end: self.end,
        })
    }

    /// Drops every user-unmappable region lying fully inside `[base, base + size)`.
    ///
    /// Regions only partially covered stay mapped in full; they are not split.
    /// Returns the number of regions removed.
    pub fn unmap(&self, base: usize, size: usize) -> Result<usize, AddressSpaceError> {
        Self::validate(base, size)?;
        let end = base.checked_add(size).ok_or(AddressSpaceError::InvalidSize)?;
        let mut regions = self.regions.lock();
        let mut removed = Vec::new();
        regions.retain(|region| {
            if region.base() < base || region.end() > end {
                return true;
            }
            let binding = region.write();
            if !binding.can_unmap() {
                return true;
            }
            drop(binding);
            removed.push(region.clone());
            false
        });
        self.clear_pages(&removed);
        check_invariants(&regions);
        Ok(removed.len())
    }

    /// Removes the region starting at `base` regardless of its object type.
    pub fn unmap_region(&self, base: usize) -> Result<(), AddressSpaceError> {
        let mut regions = self.regions.lock();
        let index = regions.iter().position(|region| region.base() == base).ok_or(AddressSpaceError::NoRegion)?;
        let region = regions.remove(index);
        drop(region.write());
        self.clear_pages(core::slice::from_ref(&region));
        Ok(())
    }

    /// Removes every region, leaving the page map empty.
    pub fn unmap_all(&self) {
        let removed: Vec<_> = self.regions.lock().drain(..).collect();
        for region in &removed {
            drop(region.write());
        }
        self.clear_pages(&removed);
    }

    fn clear_pages(&self, removed: &[Arc<MappedRegion>]) {
        if removed.is_empty() {
            return;
        }
        let mut page_map = self.page_map.lock();
        for region in removed {
            for va in (region.base()..region.end()).step_by(PAGE_SIZE) {
                page_map.unmap(va);
            }
        }
    }

    /// Physical memory held by the objects mapped here.
    pub fn used_physical_memory(&self) -> usize {
        self.regions.lock().iter().map(|region| region.object().used_physical_memory()).sum()
    }

    /// Finds the region covering `addr` and runs `f` under its read lock.
    pub fn region_read<R>(&self, addr: usize, f: impl FnOnce(&MappedRegion, &ObjectRef) -> R) -> Option<R> {
        let regions = self.regions.lock();
        let region = lookup(&regions, addr)?.clone();
        let binding = region.read();
        drop(regions);
        Some(f(&region, &binding))
    }

    /// Finds the region covering `addr` and runs `f` under its write lock.
    pub fn region_write<R>(&self, addr: usize, f: impl FnOnce(&MappedRegion, &mut ObjectRef) -> R) -> Option<R> {
        let regions = self.regions.lock();
        let region = lookup(&regions, addr)?.clone();
        let mut binding = region.write();
        drop(regions);
        Some(f(&region, &mut binding))
    }

    /// True if every byte of `[base, base + size)` lies inside some region.
    pub fn range_in_region(&self, base: usize, size: usize) -> bool {
        let Some(end) = base.checked_add(size) else {
            return false;
        };
        let mut cursor = base;
        for region in self.regions.lock().iter() {
            if cursor >= end {
                break;
            }
            if cursor < region.base() {
                return false;
            }
            if region.contains(cursor) {
                cursor = region.end();
            }
        }
        cursor >= end
    }

    /// Sorted snapshot of the region list.
    pub fn regions(&self) -> Vec<RegionInfo> {
        self.regions
            .lock()
            .iter()
            .map(|region| {
                let binding = region.read();
                RegionInfo {
                    base: region.base(),
                    size: region.size(),
                    flags: binding.flags(),
                    references: binding.reference_count(),
                }
            })
            .collect()
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    /// Logs every region at info level.
    pub fn dump_regions(&self) {
        for info in self.regions() {
            log_info!(
                target: "mm",
                "region {:#x}-{:#x} anon={} shared={} cow={} refs={}",
                info.base,
                info.end(),
                info.flags.contains(VmFlags::ANONYMOUS),
                info.flags.contains(VmFlags::SHARED),
                info.flags.contains(VmFlags::COPY_ON_WRITE),
                info.references
            );
        }
    }

    /// Page-map lookup for `va`.
    pub fn translate(&self, va: usize) -> Option<Translation> {
        self.page_map.lock().translate(va)
    }

    /// Checks the sorted, disjoint, in-window property of the region list.
    pub fn regions_well_formed(&self) -> bool {
        let regions = self.regions.lock();
        well_formed(&regions) && regions.iter().all(|region| region.base() >= self.start && region.end() <= self.end)
    }

    fn validate(base: usize, size: usize) -> Result<(), AddressSpaceError> {
        if size == 0 {
            return Err(AddressSpaceError::InvalidSize);
        }
        if !is_page_aligned(base) || !is_page_aligned(size) {
            return Err(AddressSpaceError::Unaligned);
        }
        Ok(())
    }

    /// Insertion index for `[base, base + size)` if the range is free and inside the window.
    fn slot_at(&self, regions: &[Arc<MappedRegion>], base: usize, size: usize) -> Option<usize> {
        let end = base.checked_add(size)?;
        if base < self.start || end > self.end {
            return None;
        }
        for (index, region) in regions.iter().enumerate() {
            if region.end() <= base {
                continue;
            }
            return (region.base() >= end).then_some(index);
        }
        Some(regions.len())
    }

    /// First free `(base, insertion index)` for `size` bytes, scanning upward from the window start.
    fn first_fit(&self, regions: &[Arc<MappedRegion>], size: usize) -> Option<(usize, usize)> {
        let mut base = self.start;
        for (index, region) in regions.iter().enumerate() {
            let end = base.checked_add(size)?;
            if end > self.end {
                return None;
            }
            if region.base() >= end {
                return Some((base, index));
            }
            if region.end() > base {
                base = region.end();
            }
        }
        let end = base.checked_add(size)?;
        (end <= self.end).then_some((base, regions.len()))
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        log_trace!(target: "mm", "destroying address space with {} regions", self.regions.get_mut().len());
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace").field("regions", &self.regions()).finish()
    }
}

pub(super) fn lookup(regions: &[Arc<MappedRegion>], addr: usize) -> Option<&Arc<MappedRegion>> {
    let index = regions.partition_point(|region| region.end() <= addr);
    regions.get(index).filter(|region| region.contains(addr))
}

fn well_formed(regions: &[Arc<MappedRegion>]) -> bool {
    regions.windows(2).all(|pair| pair[0].end() <= pair[1].base())
}

#[inline]
fn check_invariants(regions: &[Arc<MappedRegion>]) {
    if cfg!(any(debug_assertions, feature = "strict_invariants")) {
        assert!(well_formed(regions), "region list unsorted or overlapping");
    }
}
