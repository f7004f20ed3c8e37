// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Architecture hooks consumed by [`memremap`][crate::memremap] and the
//! [`PageMapRegistry`][crate::PageMapRegistry].

use core::ops::Range;

use crate::{PhysicalAddress, VirtualAddress};

/// How a range of physical memory relates to general-purpose memory ("System RAM").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Every byte of the range is general-purpose memory owned by the system allocator.
    Inside,
    /// No byte of the range is general-purpose memory.
    Outside,
    /// The range straddles general-purpose memory and something else.
    Mixed,
}

impl RegionKind {
    pub const fn is_ram(self) -> bool {
        matches!(self, RegionKind::Inside)
    }
}

/// Reports whether physical memory belongs to the system allocator.
pub trait RegionClassifier {
    fn classify(&self, range: Range<PhysicalAddress>) -> RegionKind;
}

/// The virtual memory primitives [`memremap`][crate::memremap] chooses between.
///
/// The remap methods return `None` when the architecture cannot provide the requested mapping, the
/// caller will then try the next strategy or fail.
///
/// # Safety
///
/// Implementors must ensure that:
///
/// - [`phys_to_virt`][Remap::phys_to_virt] is the translation of the kernel's direct map, and
///   [`identity_map`][Remap::identity_map] only ever returns that translation.
/// - addresses returned from [`remap_cache`][Remap::remap_cache] and [`remap_wt`][Remap::remap_wt]
///   stay valid until passed to [`unmap`][Remap::unmap].
pub unsafe trait Remap {
    /// Translates a physical address through the direct map.
    fn phys_to_virt(&self, phys: PhysicalAddress) -> VirtualAddress;

    /// Returns the direct map address of `range` if every page in it is linearly mapped.
    fn identity_map(&self, range: Range<PhysicalAddress>) -> Option<VirtualAddress>;

    /// Establishes a new write-back cached mapping of `range`.
    fn remap_cache(&self, range: Range<PhysicalAddress>) -> Option<VirtualAddress>;

    /// Establishes a new write-through mapping of `range`.
    fn remap_wt(&self, range: Range<PhysicalAddress>) -> Option<VirtualAddress>;

    /// Tears down a mapping established by [`remap_cache`][Remap::remap_cache] or
    /// [`remap_wt`][Remap::remap_wt].
    ///
    /// # Safety
    ///
    /// `virt` must have been returned by one of the remap methods of this instance and must not be
    /// accessed after this call.
    unsafe fn unmap(&self, virt: VirtualAddress);
}
