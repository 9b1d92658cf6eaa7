// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Mapped regions: `[base, base + size)` of an address space bound to one VM object.
//!
//! The region's reader/writer lock guards its object binding. Faults and
//! lookups hold it for read; removal, and the copy-on-write swap to a private
//! clone, hold it for write.

extern crate alloc;

use alloc::sync::Arc;
use core::fmt;
use core::ops::Deref;

use super::vm_object::VmObject;
use crate::sync::{RwReadGuard, RwSpinLock, RwWriteGuard};

/// Counted binding of a region to its VM object.
///
/// Creating one bumps the object's mapping count, dropping one lowers it, so
/// [`VmObject::reference_count`] always equals the number of regions using it.
pub struct ObjectRef(Arc<VmObject>);

impl ObjectRef {
    pub fn new(object: Arc<VmObject>) -> Self {
        object.attach();
        Self(object)
    }

    pub fn object(&self) -> &Arc<VmObject> {
        &self.0
    }
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        Self::new(self.0.clone())
    }
}

impl Deref for ObjectRef {
    type Target = VmObject;

    fn deref(&self) -> &VmObject {
        &self.0
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        self.0.detach();
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

/// One entry of an address space's sorted region list.
pub struct MappedRegion {
    base: usize,
    size: usize,
    object: RwSpinLock<ObjectRef>,
}

impl MappedRegion {
    pub fn new(base: usize, size: usize, object: ObjectRef) -> Self {
        Self { base, size, object: RwSpinLock::new(object) }
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Exclusive end address.
    #[inline]
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// True if `[base, base + size)` intersects this region.
    #[inline]
    pub fn overlaps(&self, base: usize, size: usize) -> bool {
        base < self.end() && self.base < base.saturating_add(size)
    }

    /// Takes the region lock for read: the object cannot be swapped or torn down meanwhile.
    pub fn read(&self) -> RwReadGuard<'_, ObjectRef> {
        self.object.read()
    }

    /// Takes the region lock for write.
    pub fn write(&self) -> RwWriteGuard<'_, ObjectRef> {
        self.object.write()
    }

    pub(super) fn lock(&self) -> &RwSpinLock<ObjectRef> {
        &self.object
    }

    /// Current object, cloned out from under the read lock.
    pub fn object(&self) -> Arc<VmObject> {
        self.object.read().object().clone()
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("base", &format_args!("{:#x}", self.base))
            .field("end", &format_args!("{:#x}", self.end()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::mm::frame::FramePool;

    #[test]
    fn object_refs_track_mappings() {
        let object = VmObject::anonymous(Arc::new(FramePool::with_capacity(1)), PAGE_SIZE);
        let a = ObjectRef::new(object.clone());
        let b = a.clone();
        assert_eq!(object.reference_count(), 2);
        drop(a);
        assert_eq!(object.reference_count(), 1);
        drop(b);
        assert_eq!(object.reference_count(), 0);
    }

    #[test]
    fn overlap_and_containment() {
        let object = VmObject::anonymous(Arc::new(FramePool::with_capacity(1)), 3 * PAGE_SIZE);
        let region = MappedRegion::new(0x1000, 0x3000, ObjectRef::new(object));
        assert!(region.contains(0x1000));
        assert!(!region.contains(0x4000));
        assert!(region.overlaps(0x3000, 0x2000));
        assert!(!region.overlaps(0x4000, 0x2000));
        assert!(!region.overlaps(0, 0x1000));
    }
}
