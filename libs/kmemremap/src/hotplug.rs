// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Memory hotplug hooks used by the [`PageMapRegistry`][crate::PageMapRegistry].

use core::fmt;
use core::ops::Range;

use crate::{PhysicalAddress, VmemAltmap};

/// Identifier of a NUMA node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// The reason a range could not be brought online.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugError {
    /// Allocating the page metadata for the range failed.
    NoMemory,
    /// The range is not addressable by the direct map.
    OutOfRange,
    /// The range is already online.
    Busy,
}

impl fmt::Display for HotplugError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HotplugError::NoMemory => f.write_str("out of memory for page metadata"),
            HotplugError::OutOfRange => f.write_str("range is outside the direct map"),
            HotplugError::Busy => f.write_str("range is already online"),
        }
    }
}

impl core::error::Error for HotplugError {}

/// Adds and removes physical memory from the pool handed out by the system allocator.
///
/// Ranges passed to these methods are always aligned to the registry's section size.
pub trait MemoryHotplug {
    /// The node to use when the owning device has no affinity.
    fn default_node(&self) -> NodeId;

    /// Brings `range` online on `node`.
    ///
    /// When `altmap` is provided, the page metadata for `range` should be carved out of it rather
    /// than allocated from general-purpose memory.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the range could not be brought online. The range must be left offline in
    /// that case.
    fn add_memory(
        &self,
        node: NodeId,
        range: Range<PhysicalAddress>,
        altmap: Option<&VmemAltmap>,
    ) -> Result<(), HotplugError>;

    /// Takes a range previously brought online by [`add_memory`][MemoryHotplug::add_memory] offline.
    fn remove_memory(&self, range: Range<PhysicalAddress>);
}
