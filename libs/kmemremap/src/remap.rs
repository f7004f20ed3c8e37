// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use core::ops::Range;

use crate::{
    AddressRangeExt, Device, Devres, Error, PhysicalAddress, RegionClassifier, RegionKind, Remap,
    VirtualAddress,
};

bitflags::bitflags! {
    /// The caching behaviour requested from [`memremap`].
    ///
    /// When multiple flags are given they are tried in order until one of them can be satisfied.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MappingFlags: u8 {
        /// Matches the default mapping for general-purpose memory, usually a read-allocate
        /// write-back cache. Requests over general-purpose memory are served from the direct map.
        const WRITE_BACK = 1 << 0;
        /// Writes either bypass the cache or are written through to memory, and never exist in a
        /// cache-dirty state with respect to program visibility. General-purpose memory can never
        /// be mapped this way.
        const WRITE_THROUGH = 1 << 1;
    }
}

/// How a [`Mapping`] was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    /// A view into the direct map, there is nothing to tear down.
    Direct,
    /// A new write-back cached mapping.
    Cached,
    /// A new write-through mapping.
    WriteThrough,
}

/// A physical range made accessible as memory by [`memremap`].
#[derive(Debug, PartialEq, Eq)]
pub struct Mapping {
    phys: Range<PhysicalAddress>,
    virt: VirtualAddress,
    kind: MappingKind,
}

impl Mapping {
    pub fn phys(&self) -> Range<PhysicalAddress> {
        self.phys.clone()
    }

    pub const fn virt(&self) -> VirtualAddress {
        self.virt
    }

    pub fn virt_range(&self) -> Range<VirtualAddress> {
        Range::from_start_len(self.virt, self.phys.len())
    }

    pub const fn kind(&self) -> MappingKind {
        self.kind
    }

    pub fn as_ptr(&self) -> *const u8 {
        core::ptr::with_exposed_provenance(self.virt.get())
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        core::ptr::with_exposed_provenance_mut(self.virt.get())
    }
}

pub(crate) fn checked_range(
    start: PhysicalAddress,
    len: usize,
) -> crate::Result<Range<PhysicalAddress>> {
    match Range::checked_from_start_len(start, len) {
        Some(range) if len > 0 => Ok(range),
        _ => Err(Error::InvalidRange { start, len }),
    }
}

/// Makes `len` bytes of physical memory at `start` accessible as cacheable memory.
///
/// This is "ioremap" for ranges that are known to have no I/O side effects. The strategies implied
/// by `flags` are tried in order:
///
/// 1. [`WRITE_BACK`][MappingFlags::WRITE_BACK] over general-purpose memory returns the direct map
///    address when every page of the range is linearly mapped. Otherwise, or when the range is not
///    general-purpose memory, a new cached mapping is established through
///    [`Remap::remap_cache`].
/// 2. [`WRITE_THROUGH`][MappingFlags::WRITE_THROUGH] establishes a write-through mapping through
///    [`Remap::remap_wt`].
///
/// A request that asked only for write-back and could not be satisfied fails rather than falling
/// back to write-through.
///
/// # Errors
///
/// - [`Error::InvalidRange`] if the range is empty or overflows.
/// - [`Error::AmbiguousRegion`] if the range is partially general-purpose memory.
/// - [`Error::AliasingForbidden`] if a strategy other than the direct map would be needed to map
///   general-purpose memory.
/// - [`Error::Unsatisfiable`] if all requested strategies failed.
pub fn memremap<A>(
    arch: &A,
    start: PhysicalAddress,
    len: usize,
    flags: MappingFlags,
) -> crate::Result<Mapping>
where
    A: RegionClassifier + Remap + ?Sized,
{
    let range = checked_range(start, len)?;
    let region = arch.classify(range.clone());

    if region == RegionKind::Mixed {
        log::warn!("memremap attempted on mixed range {start} size: {len:#x}");
        return Err(Error::AmbiguousRegion { range });
    }

    let mut pending = flags;
    let mut mapping = None;

    if pending.contains(MappingFlags::WRITE_BACK) {
        pending.remove(MappingFlags::WRITE_BACK);

        // write-back can be satisfied from the direct map, some architectures rely on this to
        // autodetect ranges that are potentially general-purpose memory
        if region.is_ram() {
            mapping = arch
                .identity_map(range.clone())
                .map(|virt| (virt, MappingKind::Direct));
        }

        if mapping.is_none() {
            mapping = arch
                .remap_cache(range.clone())
                .map(|virt| (virt, MappingKind::Cached));
        }
    }

    // if we don't have a mapping yet and more flags are pending we would have to establish a new
    // virtual mapping, which must never alias general-purpose memory
    if mapping.is_none() && region.is_ram() && !pending.is_empty() {
        log::warn!("memremap attempted on ram {start} size: {len:#x}");
        return Err(Error::AliasingForbidden { range, flags });
    }

    if mapping.is_none() && pending.contains(MappingFlags::WRITE_THROUGH) {
        pending.remove(MappingFlags::WRITE_THROUGH);

        mapping = arch
            .remap_wt(range.clone())
            .map(|virt| (virt, MappingKind::WriteThrough));
    }

    let Some((virt, kind)) = mapping else {
        log::debug!("memremap: no strategy could map {start} size: {len:#x} as {flags:?}");
        return Err(Error::Unsatisfiable { range, flags });
    };

    log::trace!("memremap {range:?} => {virt} ({kind:?})");

    Ok(Mapping {
        phys: range,
        virt,
        kind,
    })
}

/// Releases a mapping returned by [`memremap`].
///
/// Direct map views are not separate mappings and need no teardown.
pub fn memunmap<A>(arch: &A, mapping: Mapping)
where
    A: Remap + ?Sized,
{
    // Safety: `Mapping`s are only constructed by `memremap` and cannot be cloned, consuming
    // `mapping` ensures this happens at most once
    unsafe { unmap(arch, &mapping) }
}

/// # Safety
///
/// Must be called at most once per `Mapping`, and the mapping must not be accessed afterwards.
unsafe fn unmap<A>(arch: &A, mapping: &Mapping)
where
    A: Remap + ?Sized,
{
    match mapping.kind {
        MappingKind::Direct => {}
        MappingKind::Cached | MappingKind::WriteThrough => {
            log::trace!("memunmap {} ({:?})", mapping.virt, mapping.kind);

            // Safety: `virt` was returned by a remap method of `arch`, ensured by the caller
            unsafe {
                arch.unmap(mapping.virt);
            }
        }
    }
}

/// Device managed [`memremap`].
///
/// The mapping is torn down when `device` is detached, or earlier through [`devm_memunmap`].
///
/// # Errors
///
/// Returns the errors of [`memremap`], or [`Error::ResourceExhausted`] if the device could not
/// track another resource.
pub fn devm_memremap<A, R>(
    device: &Arc<Device<R>>,
    arch: &Arc<A>,
    start: PhysicalAddress,
    len: usize,
    flags: MappingFlags,
) -> crate::Result<Devres<R, Mapping>>
where
    A: RegionClassifier + Remap + Send + Sync + 'static,
    R: lock_api::RawMutex + Send + Sync + 'static,
{
    let arch_ = Arc::clone(arch);

    device.bind(
        "memremap",
        || memremap(arch.as_ref(), start, len, flags).map(Arc::new),
        // Safety: release actions run exactly once and `Devres` never gives up its share of the
        // mapping, so nothing can unmap it a second time
        move |mapping| unsafe { unmap(arch_.as_ref(), &mapping) },
    )
}

/// Releases a mapping returned by [`devm_memremap`] before the device is detached.
///
/// # Errors
///
/// Returns [`Error::NotBound`] if the mapping was already released.
pub fn devm_memunmap<R, T>(mapping: &Devres<R, T>) -> crate::Result<()>
where
    R: lock_api::RawMutex,
{
    mapping.release()
}
