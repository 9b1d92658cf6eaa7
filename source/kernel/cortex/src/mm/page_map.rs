// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-map abstraction driven by the VM layer, plus a software implementation.
//!
//! The hardware encoding (Sv39, x86-64 4-level, ...) lives behind [`PageMap`].
//! [`SoftPageMap`] keeps one entry per mapped page in an ordered map; it backs
//! host tests and bring-up before the MMU is enabled.

extern crate alloc;

use alloc::{boxed::Box, collections::BTreeMap};
use core::fmt;

use bitflags::bitflags;

use super::frame::FrameNumber;
use crate::config::{is_page_aligned, USER_SPACE_END};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Protection bits of a leaf mapping.
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const EXECUTE = 1 << 3;
    }
}

impl PageFlags {
    /// Flags for a user page, writable or read-only.
    pub const fn user(writable: bool) -> Self {
        if writable {
            Self::PRESENT.union(Self::USER).union(Self::WRITABLE)
        } else {
            Self::PRESENT.union(Self::USER)
        }
    }
}

/// Error returned when manipulating page maps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual address was not page aligned.
    Unaligned,
    /// Address lies outside the user half.
    OutOfRange,
    /// Flags do not describe a present leaf entry.
    InvalidFlags,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unaligned => f.write_str("unaligned address"),
            Self::OutOfRange => f.write_str("address out of range"),
            Self::InvalidFlags => f.write_str("invalid page flags"),
        }
    }
}

/// Result of a virtual-to-physical lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    pub frame: FrameNumber,
    pub flags: PageFlags,
}

/// Architecture page map: one per address space. Dropping it destroys the mapping structure.
pub trait PageMap: Send {
    /// Installs or replaces the leaf entry for `va`.
    fn map(&mut self, va: usize, frame: FrameNumber, flags: PageFlags) -> Result<(), MapError>;
    /// Removes the leaf entry for `va`, returning the frame it pointed to.
    fn unmap(&mut self, va: usize) -> Option<FrameNumber>;
    /// Looks up the entry covering `va` (need not be aligned).
    fn translate(&self, va: usize) -> Option<Translation>;
    /// Creates a fresh page map for a child address space.
    ///
    /// Kernel mappings are shared; user entries are not copied, the fork path
    /// re-establishes them from the region list.
    fn clone_map(&self) -> Box<dyn PageMap>;
    /// Number of present leaf entries.
    fn mapped_pages(&self) -> usize;
}

/// Ordered-map page map for the user half of an address space.
#[derive(Debug, Default)]
pub struct SoftPageMap {
    entries: BTreeMap<usize, Translation>,
}

impl SoftPageMap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PageMap for SoftPageMap {
    fn map(&mut self, va: usize, frame: FrameNumber, flags: PageFlags) -> Result<(), MapError> {
        if !is_page_aligned(va) {
            return Err(MapError::Unaligned);
        }
        if va >= USER_SPACE_END {
            return Err(MapError::OutOfRange);
        }
        if !flags.contains(PageFlags::PRESENT) {
            return Err(MapError::InvalidFlags);
        }
        self.entries.insert(va, Translation { frame, flags });
        Ok(())
    }

    fn unmap(&mut self, va: usize) -> Option<FrameNumber> {
        self.entries.remove(&va).map(|entry| entry.frame)
    }

    fn translate(&self, va: usize) -> Option<Translation> {
        self.entries.get(&(va & !(crate::config::PAGE_SIZE - 1))).copied()
    }

    fn clone_map(&self) -> Box<dyn PageMap> {
        Box::new(SoftPageMap::new())
    }

    fn mapped_pages(&self) -> usize {
        self.entries.len()
    }
}
