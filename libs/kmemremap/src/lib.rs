// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg_attr(not(any(test, feature = "test_utils")), no_std)]

//! Exposing physical memory as cacheable memory.
//!
//! This crate has two halves:
//!
//! - [`memremap`] picks a mapping strategy for a range of physical memory that is known to have no
//!   I/O side effects. Write-back requests over general-purpose memory are served straight from the
//!   direct map, everything else goes through the architecture's remap primitives. New mappings are
//!   never established over general-purpose memory since that would create two independently cached
//!   views of the same frames.
//! - [`PageMapRegistry`] tracks ranges of device memory that have been donated to the general
//!   allocator. Ownership is recorded at section granularity so that any physical address can be
//!   resolved back to its owning [`PageMap`], overlapping donations are rejected, and everything is
//!   torn down when the owning [`Device`] goes away.
//!
//! Neither half talks to hardware directly. Classification of physical ranges, the mapping
//! primitives and memory hotplug are provided by the embedder through the traits in [`arch`] and
//! [`hotplug`].

extern crate alloc;

mod address;
mod address_range;
mod altmap;
pub mod arch;
mod config;
mod device;
mod error;
pub mod hotplug;
mod loom;
mod pagemap;
mod physmap;
pub mod reclaim;
mod remap;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use address::{PhysicalAddress, VirtualAddress};
pub use address_range::AddressRangeExt;
pub use altmap::VmemAltmap;
pub use arch::{RegionClassifier, RegionKind, Remap};
pub use config::Config;
pub use device::{Device, Devres, ResourceId};
pub use error::Error;
pub use hotplug::{HotplugError, MemoryHotplug, NodeId};
pub use pagemap::{PageMap, PageMapParams, PageMapReadGuard, PageMapRegistry, PageRef, Pages};
pub use physmap::PhysMap;
pub use reclaim::{GracePeriod, Reclaim};
pub use remap::{
    Mapping, MappingFlags, MappingKind, devm_memremap, devm_memunmap, memremap, memunmap,
};

pub type Result<T> = core::result::Result<T, Error>;

pub const KIB: usize = 1024;
pub const MIB: usize = KIB * 1024;
pub const GIB: usize = MIB * 1024;
