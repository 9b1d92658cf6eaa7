// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory: frames, page maps, VM objects, regions and address spaces.

pub mod address_space;
pub mod fault;
pub mod frame;
pub mod page_map;
pub mod region;
pub mod vm_object;

pub use address_space::{AddressSpace, AddressSpaceError, RegionInfo};
pub use fault::{FaultAccess, FaultError};
pub use frame::{FrameAllocator, FrameNumber, FramePool};
pub use page_map::{MapError, PageFlags, PageMap, SoftPageMap, Translation};
pub use region::{MappedRegion, ObjectRef};
pub use vm_object::{Backing, VmError, VmFlags, VmObject};

#[cfg(test)]
mod tests_prop;
