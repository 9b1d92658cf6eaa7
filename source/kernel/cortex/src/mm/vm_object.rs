// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: VM objects: how a range of virtual memory is backed by physical frames
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below; COW and split scenarios in tests/fork_cow.rs
//! PUBLIC API: VmObject, VmFlags, VmError, Backing
//! DEPENDS_ON: mm::frame (FrameAllocator), mm::page_map (PageMap), sync::SpinLock
//! INVARIANTS:
//!   - size is a non-zero multiple of PAGE_SIZE and block count == size / PAGE_SIZE
//!   - a copy-on-write object is never mapped writable
//!   - non-anonymous objects are fully backed from creation
//!   - `mappings` equals the number of live `ObjectRef`s (regions) pointing at the object
//!
//! The three variants share one frame table type. Only [`AnonymousPages`]
//! implements `split_off`, so a split of an image or shared object cannot be
//! written, only refused through [`VmError::SplitUnsupported`].

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;

use super::frame::{allocate_or_halt, FrameAllocator, FrameNumber};
use super::page_map::{MapError, PageFlags, PageMap};
use super::region::ObjectRef;
use crate::config::{is_page_aligned, PAGE_SHIFT};
use crate::sync::SpinLock;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Behavioural attributes of a VM object.
    pub struct VmFlags: u8 {
        /// Pages are allocated lazily on first touch and zero filled.
        const ANONYMOUS = 1 << 0;
        /// Mapped into several address spaces on purpose; never copy-on-write.
        const SHARED = 1 << 1;
        /// Writes must first produce a private copy.
        const COPY_ON_WRITE = 1 << 2;
        /// Contents may be discarded under memory pressure.
        const RECLAIMABLE = 1 << 3;
    }
}

/// Errors reported by VM-object operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmError {
    /// Offset or split point lies outside the object.
    OutOfBounds,
    /// Offset or split point is not page aligned.
    Unaligned,
    /// Fault on a page that has no frame and cannot get one (non-anonymous object).
    Unbacked,
    /// Only anonymous objects can be split.
    SplitUnsupported,
    /// Object is copy-on-write and still referenced by another mapping.
    SplitShared,
    /// Process image mapped somewhere other than its fixed base.
    BaseMismatch,
    /// Page-map update failed.
    Map(MapError),
}

impl From<MapError> for VmError {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfBounds => f.write_str("offset outside object"),
            Self::Unaligned => f.write_str("offset not page aligned"),
            Self::Unbacked => f.write_str("no backing frame for non-anonymous object"),
            Self::SplitUnsupported => f.write_str("object variant cannot be split"),
            Self::SplitShared => f.write_str("copy-on-write object still shared"),
            Self::BaseMismatch => f.write_str("process image mapped away from its base"),
            Self::Map(err) => write!(f, "page map: {}", err),
        }
    }
}

/// Per-page frame table; `None` means not yet backed.
#[derive(Debug, Default)]
pub struct PhysicalPages {
    blocks: Vec<Option<FrameNumber>>,
}

impl PhysicalPages {
    fn unbacked(count: usize) -> Self {
        let mut blocks = Vec::with_capacity(count);
        blocks.resize(count, None);
        Self { blocks }
    }

    fn zeroed(count: usize, frames: &dyn FrameAllocator) -> Self {
        let blocks = (0..count)
            .map(|_| {
                let frame = allocate_or_halt(frames);
                frames.zero(frame);
                Some(frame)
            })
            .collect();
        Self { blocks }
    }

    fn deep_copy(&self, frames: &dyn FrameAllocator) -> Self {
        let blocks = self
            .blocks
            .iter()
            .map(|block| {
                block.map(|src| {
                    let dst = allocate_or_halt(frames);
                    frames.copy(src, dst);
                    dst
                })
            })
            .collect();
        Self { blocks }
    }

    fn backed(&self) -> usize {
        self.blocks.iter().filter(|block| block.is_some()).count()
    }

    fn release(&mut self, frames: &dyn FrameAllocator) {
        for frame in self.blocks.drain(..).flatten() {
            frames.free(frame);
        }
    }
}

/// Frame table of an anonymous object, the only variant that supports splitting.
#[derive(Debug, Default)]
pub struct AnonymousPages(PhysicalPages);

impl AnonymousPages {
    /// Keeps pages `[0, at)` and returns pages `[at, len)`.
    fn split_off(&mut self, at: usize) -> AnonymousPages {
        AnonymousPages(PhysicalPages { blocks: self.0.blocks.split_off(at) })
    }
}

/// Backing variant of a VM object.
#[derive(Debug)]
pub enum Backing {
    /// Plain physical pages, lazily backed when anonymous, eagerly otherwise.
    Physical(PhysicalPages),
    /// Private lazily-backed memory that user code may unmap and split.
    Anonymous(AnonymousPages),
    /// Loaded executable segment fixed at `base`.
    ProcessImage { pages: PhysicalPages, base: usize, writable: bool },
}

impl Backing {
    fn pages(&self) -> &PhysicalPages {
        match self {
            Backing::Physical(pages) | Backing::ProcessImage { pages, .. } => pages,
            Backing::Anonymous(anon) => &anon.0,
        }
    }

    fn pages_mut(&mut self) -> &mut PhysicalPages {
        match self {
            Backing::Physical(pages) | Backing::ProcessImage { pages, .. } => pages,
            Backing::Anonymous(anon) => &mut anon.0,
        }
    }
}

struct VmState {
    size: usize,
    flags: VmFlags,
    backing: Backing,
}

impl VmState {
    fn page_flags(&self) -> PageFlags {
        let image_writable = match self.backing {
            Backing::ProcessImage { writable, .. } => writable,
            _ => true,
        };
        PageFlags::user(image_writable && !self.flags.contains(VmFlags::COPY_ON_WRITE))
    }
}

/// A page-backing object, shared between the regions that map it.
pub struct VmObject {
    state: SpinLock<VmState>,
    mappings: AtomicUsize,
    frames: Arc<dyn FrameAllocator>,
}

impl VmObject {
    fn with_backing(frames: Arc<dyn FrameAllocator>, size: usize, flags: VmFlags, backing: Backing) -> Arc<Self> {
        Arc::new(Self { state: SpinLock::new(VmState { size, flags, backing }), mappings: AtomicUsize::new(0), frames })
    }

    fn page_count(size: usize) -> usize {
        assert!(size != 0 && is_page_aligned(size), "VM object size {:#x} not page aligned", size);
        size >> PAGE_SHIFT
    }

    /// Physical-pages object. Non-anonymous objects are backed with zeroed frames up front.
    pub fn physical(frames: Arc<dyn FrameAllocator>, size: usize, anonymous: bool, shared: bool) -> Arc<Self> {
        let count = Self::page_count(size);
        let mut flags = VmFlags::empty();
        flags.set(VmFlags::ANONYMOUS, anonymous);
        flags.set(VmFlags::SHARED, shared);
        let pages = if anonymous { PhysicalPages::unbacked(count) } else { PhysicalPages::zeroed(count, &*frames) };
        Self::with_backing(frames, size, flags, Backing::Physical(pages))
    }

    /// Private, lazily zero-filled memory.
    pub fn anonymous(frames: Arc<dyn FrameAllocator>, size: usize) -> Arc<Self> {
        let count = Self::page_count(size);
        Self::with_backing(
            frames,
            size,
            VmFlags::ANONYMOUS,
            Backing::Anonymous(AnonymousPages(PhysicalPages::unbacked(count))),
        )
    }

    /// Executable segment that must be mapped at `base`.
    pub fn process_image(frames: Arc<dyn FrameAllocator>, base: usize, size: usize, writable: bool) -> Arc<Self> {
        let count = Self::page_count(size);
        let pages = PhysicalPages::zeroed(count, &*frames);
        Self::with_backing(frames, size, VmFlags::empty(), Backing::ProcessImage { pages, base, writable })
    }

    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    pub fn flags(&self) -> VmFlags {
        self.state.lock().flags
    }

    pub fn is_anonymous(&self) -> bool {
        self.flags().contains(VmFlags::ANONYMOUS)
    }

    pub fn is_shared(&self) -> bool {
        self.flags().contains(VmFlags::SHARED)
    }

    pub fn is_copy_on_write(&self) -> bool {
        self.flags().contains(VmFlags::COPY_ON_WRITE)
    }

    pub fn is_reclaimable(&self) -> bool {
        self.flags().contains(VmFlags::RECLAIMABLE)
    }

    pub fn set_reclaimable(&self, reclaimable: bool) {
        self.state.lock().flags.set(VmFlags::RECLAIMABLE, reclaimable);
    }

    /// False only for read-only process images.
    pub fn is_writable(&self) -> bool {
        !matches!(self.state.lock().backing, Backing::ProcessImage { writable: false, .. })
    }

    /// User code may only unmap anonymous objects.
    pub fn can_unmap(&self) -> bool {
        matches!(self.state.lock().backing, Backing::Anonymous(_))
    }

    /// Number of regions currently mapping this object.
    pub fn reference_count(&self) -> usize {
        self.mappings.load(Ordering::Acquire)
    }

    pub(super) fn attach(&self) {
        self.mappings.fetch_add(1, Ordering::AcqRel);
    }

    pub(super) fn detach(&self) {
        let previous = self.mappings.fetch_sub(1, Ordering::AcqRel);
        assert!(previous != 0, "VM object mapping count underflow");
    }

    /// Fixed base of a process image.
    pub fn image_base(&self) -> Option<usize> {
        match self.state.lock().backing {
            Backing::ProcessImage { base, .. } => Some(base),
            _ => None,
        }
    }

    /// Frame backing the page at `offset`, if any.
    pub fn frame_at(&self, offset: usize) -> Option<FrameNumber> {
        let state = self.state.lock();
        state.backing.pages().blocks.get(offset >> PAGE_SHIFT).copied().flatten()
    }

    /// Bytes of physical memory held: backed pages for anonymous objects, the whole size otherwise.
    pub fn used_physical_memory(&self) -> usize {
        let state = self.state.lock();
        if !state.flags.contains(VmFlags::ANONYMOUS) {
            return state.size;
        }
        state.backing.pages().backed() << PAGE_SHIFT
    }

    /// Resolves a fault on the page at `offset` for a mapping starting at `base`.
    ///
    /// Maps the existing frame if another mapping already backed the page. An
    /// anonymous object gets a fresh zeroed frame; any other object reports
    /// [`VmError::Unbacked`], which is fatal for the faulting process.
    pub fn hit(&self, base: usize, offset: usize, page_map: &mut dyn PageMap) -> Result<FrameNumber, VmError> {
        let mut state = self.state.lock();
        if offset >= state.size {
            return Err(VmError::OutOfBounds);
        }
        let flags = state.page_flags();
        let anonymous = state.flags.contains(VmFlags::ANONYMOUS);
        let page = offset >> PAGE_SHIFT;
        let va = base + (page << PAGE_SHIFT);
        let block = &mut state.backing.pages_mut().blocks[page];
        let existing = *block;
        let frame = match existing {
            Some(frame) => frame,
            None if anonymous => {
                let frame = allocate_or_halt(&*self.frames);
                self.frames.zero(frame);
                *block = Some(frame);
                frame
            }
            None => return Err(VmError::Unbacked),
        };
        page_map.map(va, frame, flags)?;
        Ok(frame)
    }

    /// Maps every backed page at `base`; unbacked pages are left not-present.
    pub fn map_allocated_blocks(&self, base: usize, page_map: &mut dyn PageMap) -> Result<(), VmError> {
        let state = self.state.lock();
        if let Backing::ProcessImage { base: image_base, .. } = state.backing {
            if image_base != base {
                return Err(VmError::BaseMismatch);
            }
        }
        let flags = state.page_flags();
        for (page, block) in state.backing.pages().blocks.iter().enumerate() {
            let va = base + (page << PAGE_SHIFT);
            match block {
                Some(frame) => page_map.map(va, *frame, flags)?,
                None => {
                    page_map.unmap(va);
                }
            }
        }
        Ok(())
    }

    /// Backs every page now.
    pub fn force_allocate(&self) {
        let mut state = self.state.lock();
        for block in state.backing.pages_mut().blocks.iter_mut().filter(|block| block.is_none()) {
            let frame = allocate_or_halt(&*self.frames);
            self.frames.zero(frame);
            *block = Some(frame);
        }
    }

    /// Private deep copy of the backed frames. The copy is not copy-on-write.
    pub fn clone_object(&self) -> Arc<VmObject> {
        let state = self.state.lock();
        debug_assert!(!state.flags.contains(VmFlags::SHARED), "cloning a shared VM object");
        let backing = match &state.backing {
            Backing::Physical(pages) => Backing::Physical(pages.deep_copy(&*self.frames)),
            Backing::Anonymous(anon) => Backing::Anonymous(AnonymousPages(anon.0.deep_copy(&*self.frames))),
            Backing::ProcessImage { pages, base, writable } => {
                Backing::ProcessImage { pages: pages.deep_copy(&*self.frames), base: *base, writable: *writable }
            }
        };
        let flags = state.flags.difference(VmFlags::COPY_ON_WRITE);
        Self::with_backing(self.frames.clone(), state.size, flags, backing)
    }

    /// Cuts the object at `offset`: this object keeps `[0, offset)`, the returned one holds the rest.
    pub fn split(&self, offset: usize) -> Result<Arc<VmObject>, VmError> {
        let mut state = self.state.lock();
        if !is_page_aligned(offset) {
            return Err(VmError::Unaligned);
        }
        if offset == 0 || offset >= state.size {
            return Err(VmError::OutOfBounds);
        }
        if state.flags.contains(VmFlags::COPY_ON_WRITE) && self.reference_count() > 1 {
            return Err(VmError::SplitShared);
        }
        let tail = match &mut state.backing {
            Backing::Anonymous(anon) => anon.split_off(offset >> PAGE_SHIFT),
            Backing::Physical(_) | Backing::ProcessImage { .. } => return Err(VmError::SplitUnsupported),
        };
        let tail_size = state.size - offset;
        state.size = offset;
        let flags = state.flags.difference(VmFlags::COPY_ON_WRITE);
        Ok(Self::with_backing(self.frames.clone(), tail_size, flags, Backing::Anonymous(tail)))
    }

    /// Adds a mapping for a forked address space, flagging private objects copy-on-write.
    ///
    /// The count increment and the flag change happen under the object lock so a
    /// concurrent fault in another address space sees both or neither.
    pub(super) fn fork_reference(self: &Arc<Self>) -> ObjectRef {
        let mut state = self.state.lock();
        let reference = ObjectRef::new(self.clone());
        if !state.flags.contains(VmFlags::SHARED) {
            state.flags.insert(VmFlags::COPY_ON_WRITE);
        }
        reference
    }

    /// Drops copy-on-write if at most one mapping remains. Returns whether the caller now owns the object.
    pub(super) fn try_take_ownership(&self) -> bool {
        let mut state = self.state.lock();
        if !state.flags.contains(VmFlags::COPY_ON_WRITE) {
            return true;
        }
        if self.reference_count() <= 1 {
            state.flags.remove(VmFlags::COPY_ON_WRITE);
            return true;
        }
        false
    }
}

impl fmt::Debug for VmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let kind = match state.backing {
            Backing::Physical(_) => "physical",
            Backing::Anonymous(_) => "anonymous",
            Backing::ProcessImage { .. } => "image",
        };
        f.debug_struct("VmObject")
            .field("kind", &kind)
            .field("size", &state.size)
            .field("flags", &state.flags)
            .field("mappings", &self.reference_count())
            .finish()
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let frames = self.frames.clone();
        self.state.get_mut().backing.pages_mut().release(&*frames);
    }
}
