// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Device memory donated to the system allocator.
//!
//! A [`PageMapRegistry`] records which device owns which part of physical memory at section
//! granularity: every section key (`phys >> section_shift`) covered by a registration maps to the
//! same [`PageMap`]. The table is published through an atomic pointer and replaced wholesale on
//! every mutation. Mutators serialize on the registry lock, readers never lock and instead pin the
//! current table with a [`Reclaim`] guard, old tables are retired through the same scheme.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::collections::btree_map::Entry;
use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;
use core::fmt;
use core::ops::Range;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::remap::checked_range;
use crate::{
    AddressRangeExt, Config, Device, Devres, Error, GracePeriod, MemoryHotplug, NodeId,
    PhysicalAddress, Reclaim, RegionClassifier, RegionKind, Remap, VirtualAddress, VmemAltmap,
};

type SectionMap = BTreeMap<usize, Arc<PageMap>>;

/// An opaque reference count handle owned by the caller.
pub type PageRef = Arc<dyn Any + Send + Sync>;

/// A range of device memory that has been brought online.
pub struct PageMap {
    phys: Range<PhysicalAddress>,
    aligned: Range<PhysicalAddress>,
    virt: VirtualAddress,
    device: String,
    node: NodeId,
    page_ref: Option<PageRef>,
    altmap: Option<VmemAltmap>,
    released: AtomicBool,
}

impl fmt::Debug for PageMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageMap")
            .field("phys", &self.phys)
            .field("aligned", &self.aligned)
            .field("virt", &self.virt)
            .field("device", &self.device)
            .field("node", &self.node)
            .field("page_ref", &self.page_ref.is_some())
            .field("altmap", &self.altmap)
            .field("released", &self.released)
            .finish()
    }
}

impl PageMap {
    /// The physical range as requested by the owner.
    pub fn phys(&self) -> Range<PhysicalAddress> {
        self.phys.clone()
    }

    /// The physical range rounded out to section granularity, this is what was brought online.
    pub fn aligned(&self) -> Range<PhysicalAddress> {
        self.aligned.clone()
    }

    /// The direct map address of the start of [`phys`][PageMap::phys].
    pub const fn virt(&self) -> VirtualAddress {
        self.virt
    }

    /// The name of the owning device.
    pub fn device(&self) -> &str {
        &self.device
    }

    pub const fn node(&self) -> NodeId {
        self.node
    }

    pub fn page_ref(&self) -> Option<&PageRef> {
        self.page_ref.as_ref()
    }

    pub fn altmap(&self) -> Option<&VmemAltmap> {
        self.altmap.as_ref()
    }

    /// Whether the owning device released this range.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// Optional parameters of [`PageMapRegistry::register`].
#[derive(Default)]
pub struct PageMapParams {
    altmap: Option<VmemAltmap>,
    page_ref: Option<PageRef>,
}

impl fmt::Debug for PageMapParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageMapParams")
            .field("altmap", &self.altmap)
            .field("page_ref", &self.page_ref.is_some())
            .finish()
    }
}

impl PageMapParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Carve the page metadata out of the donated range as described by `altmap`.
    #[must_use]
    pub fn with_altmap(mut self, altmap: VmemAltmap) -> Self {
        self.altmap = Some(altmap);
        self
    }

    /// Attach a reference count handle to the registration, it is never looked at by the registry.
    #[must_use]
    pub fn with_page_ref(mut self, page_ref: PageRef) -> Self {
        self.page_ref = Some(page_ref);
        self
    }
}

/// The outcome of [`PageMapRegistry::register`].
pub enum Pages<R: lock_api::RawMutex> {
    /// The range already is general-purpose memory and is accessible through the direct map.
    /// Nothing was registered.
    Direct {
        phys: Range<PhysicalAddress>,
        virt: VirtualAddress,
    },
    /// The range was brought online and is owned by the device until it is detached.
    Managed(Devres<R, PageMap>),
}

impl<R: lock_api::RawMutex> fmt::Debug for Pages<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pages::Direct { phys, virt } => f
                .debug_struct("Direct")
                .field("phys", phys)
                .field("virt", virt)
                .finish(),
            Pages::Managed(page_map) => f.debug_tuple("Managed").field(page_map).finish(),
        }
    }
}

impl<R: lock_api::RawMutex> Pages<R> {
    /// # Errors
    ///
    /// Returns [`Error::NotBound`] if the registration was released.
    pub fn virt(&self) -> crate::Result<VirtualAddress> {
        match self {
            Pages::Direct { virt, .. } => Ok(*virt),
            Pages::Managed(page_map) => Ok(page_map.get()?.virt()),
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::NotBound`] if the registration was released.
    pub fn phys(&self) -> crate::Result<Range<PhysicalAddress>> {
        match self {
            Pages::Direct { phys, .. } => Ok(phys.clone()),
            Pages::Managed(page_map) => Ok(page_map.get()?.phys()),
        }
    }

    /// The registration record, `None` for ranges served by the direct map.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotBound`] if the registration was released.
    pub fn page_map(&self) -> crate::Result<Option<&PageMap>> {
        match self {
            Pages::Direct { .. } => Ok(None),
            Pages::Managed(page_map) => page_map.get().map(Some),
        }
    }
}

/// Section-granular ownership table of donated device memory.
pub struct PageMapRegistry<A, R, G = GracePeriod<R>>
where
    R: lock_api::RawMutex,
{
    arch: A,
    config: Config,
    sections: AtomicPtr<SectionMap>,
    lock: lock_api::Mutex<R, ()>,
    reclaim: G,
}

// Safety: the raw table pointer is only dereferenced under the reclamation protocol, and the table
// itself is `Send + Sync` because `PageMap` is
unsafe impl<A: Send, R: lock_api::RawMutex + Send, G: Send> Send for PageMapRegistry<A, R, G> {}
// Safety: see above
unsafe impl<A: Sync, R: lock_api::RawMutex + Sync, G: Sync> Sync for PageMapRegistry<A, R, G> {}

impl<A, R, G> fmt::Debug for PageMapRegistry<A, R, G>
where
    A: fmt::Debug,
    R: lock_api::RawMutex,
    G: Reclaim + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageMapRegistry")
            .field("arch", &self.arch)
            .field("config", &self.config)
            .field("sections", &self.read().len())
            .field("reclaim", &self.reclaim)
            .finish_non_exhaustive()
    }
}

impl<A, R> PageMapRegistry<A, R, GracePeriod<R>>
where
    A: RegionClassifier + Remap + MemoryHotplug + Send + Sync + 'static,
    R: lock_api::RawMutex + Send + Sync + 'static,
{
    /// Creates an empty registry.
    ///
    /// # Panics
    ///
    /// Panics if `config` describes sections smaller than a page.
    pub fn new(arch: A, config: Config) -> Arc<Self> {
        Self::with_reclaim(arch, config, GracePeriod::new())
    }
}

impl<A, R, G> PageMapRegistry<A, R, G>
where
    A: RegionClassifier + Remap + MemoryHotplug + Send + Sync + 'static,
    R: lock_api::RawMutex + Send + Sync + 'static,
    G: Reclaim + 'static,
{
    /// Creates an empty registry that retires old tables through `reclaim`.
    ///
    /// # Panics
    ///
    /// Panics if `config` describes sections smaller than a page.
    pub fn with_reclaim(arch: A, config: Config, reclaim: G) -> Arc<Self> {
        config.assert_valid();

        Arc::new(Self {
            arch,
            config,
            sections: AtomicPtr::new(Box::into_raw(Box::new(SectionMap::new()))),
            lock: lock_api::Mutex::new(()),
            reclaim,
        })
    }

    /// Donates `len` bytes of device memory at `start` to the system allocator on behalf of
    /// `device`.
    ///
    /// Ranges that already are general-purpose memory are returned as [`Pages::Direct`] without any
    /// further action. Anything else is rounded out to section granularity, claimed in the registry
    /// and brought online through [`MemoryHotplug::add_memory`] on the device's NUMA node. The
    /// registration is released, and the range taken offline, when `device` is detached.
    ///
    /// Must not be called while holding a [`PageMapReadGuard`] of this registry.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRange`] if the range is empty or overflows.
    /// - [`Error::AmbiguousRegion`] if the range is partially general-purpose memory.
    /// - [`Error::InvalidAltmap`] if the altmap does not start at the first page of the range or
    ///   reserves more than the range holds.
    /// - [`Error::RangeCollision`] if any section of the range is owned by another registration.
    /// - [`Error::Hotplug`] if the range could not be brought online.
    /// - [`Error::ResourceExhausted`] if the device could not track another resource.
    ///
    /// In all cases the registry is left as it was before the call.
    pub fn register(
        self: &Arc<Self>,
        device: &Arc<Device<R>>,
        start: PhysicalAddress,
        len: usize,
        params: PageMapParams,
    ) -> crate::Result<Pages<R>> {
        let phys = checked_range(start, len)?;

        match self.arch.classify(phys.clone()) {
            RegionKind::Mixed => {
                log::warn!(
                    "{}: memremap_pages attempted on mixed region {start} size: {len:#x}",
                    device.name()
                );
                Err(Error::AmbiguousRegion { range: phys })
            }
            RegionKind::Inside => Ok(Pages::Direct {
                virt: self.arch.phys_to_virt(start),
                phys,
            }),
            RegionKind::Outside => {
                if let Some(altmap) = &params.altmap {
                    self.check_altmap(device, &phys, altmap)?;
                }

                let aligned = phys
                    .clone()
                    .checked_align_out(self.config.section_size())
                    .ok_or(Error::InvalidRange { start, len })?;

                let this = Arc::clone(self);
                device
                    .bind(
                        "memremap_pages",
                        || self.add(device, phys, aligned, params),
                        move |page_map| this.remove(&page_map),
                    )
                    .map(Pages::Managed)
            }
        }
    }

    fn check_altmap(
        &self,
        device: &Device<R>,
        phys: &Range<PhysicalAddress>,
        altmap: &VmemAltmap,
    ) -> crate::Result<()> {
        let page_shift = self.config.page_shift();
        let start_pfn = phys.start.pfn(page_shift);
        let end_pfn = phys.end.pfn(page_shift);

        let fits = altmap
            .base_pfn()
            .checked_add(altmap.offset())
            .is_some_and(|altmap_end| altmap_end <= end_pfn);

        if altmap.base_pfn() != start_pfn || !fits {
            log::warn!(
                "{}: memremap_pages: altmap {altmap:?} does not fit {:#x}..{:#x}",
                device.name(),
                phys.start,
                phys.end
            );
            return Err(Error::InvalidAltmap {
                base_pfn: altmap.base_pfn(),
                range: phys.clone(),
            });
        }

        Ok(())
    }

    fn add(
        &self,
        device: &Device<R>,
        phys: Range<PhysicalAddress>,
        aligned: Range<PhysicalAddress>,
        params: PageMapParams,
    ) -> crate::Result<Arc<PageMap>> {
        let node = device.node().unwrap_or_else(|| self.arch.default_node());

        let page_map = Arc::new(PageMap {
            virt: self.arch.phys_to_virt(phys.start),
            phys,
            aligned,
            device: String::from(device.name()),
            node,
            page_ref: params.page_ref,
            altmap: params.altmap,
            released: AtomicBool::new(false),
        });

        self.insert(&page_map)?;

        if let Err(err) =
            self.arch
                .add_memory(node, page_map.aligned(), page_map.altmap())
        {
            log::error!(
                "{}: memremap_pages: failed to add {:#x}..{:#x}: {err}",
                device.name(),
                page_map.aligned.start,
                page_map.aligned.end
            );
            self.delete(&page_map);
            return Err(Error::Hotplug(err));
        }

        log::debug!(
            "{}: memremap_pages {:#x}..{:#x} online on {node}",
            device.name(),
            page_map.aligned.start,
            page_map.aligned.end
        );

        Ok(page_map)
    }

    fn remove(&self, page_map: &Arc<PageMap>) {
        let was_released = page_map.released.swap(true, Ordering::AcqRel);
        debug_assert!(!was_released, "page map released twice");

        self.delete(page_map);
        self.arch.remove_memory(page_map.aligned());

        log::debug!(
            "{}: memremap_pages {:#x}..{:#x} offline",
            page_map.device,
            page_map.aligned.start,
            page_map.aligned.end
        );
    }

    /// Claims every section of `page_map`, or none of them.
    fn insert(&self, page_map: &Arc<PageMap>) -> crate::Result<()> {
        let retired = {
            let _lock = self.lock.lock();

            let mut next = self.current().clone();
            for key in self.section_keys(&page_map.aligned) {
                match next.entry(key) {
                    Entry::Occupied(entry) => {
                        let owner = entry.get();
                        log::error!(
                            "{}: memremap_pages: {:#x}..{:#x} collides with mapping for {}",
                            page_map.device,
                            page_map.phys.start,
                            page_map.phys.end,
                            owner.device
                        );

                        // nothing was published yet, dropping `next` rolls back the keys claimed so far
                        return Err(Error::RangeCollision {
                            range: page_map.phys(),
                            owner: owner.device.clone(),
                        });
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(Arc::clone(page_map));
                    }
                }
            }

            self.publish(next)
        };

        self.reclaim.retire(retired);
        Ok(())
    }

    /// Removes every section claimed by `page_map`.
    fn delete(&self, page_map: &Arc<PageMap>) {
        let retired = {
            let _lock = self.lock.lock();

            let mut next = self.current().clone();
            for key in self.section_keys(&page_map.aligned) {
                if next
                    .get(&key)
                    .is_some_and(|owner| Arc::ptr_eq(owner, page_map))
                {
                    next.remove(&key);
                }
            }

            self.publish(next)
        };

        self.reclaim.retire(retired);
    }

    /// Returns the current table.
    ///
    /// Must only be called with the registry lock held.
    fn current(&self) -> &SectionMap {
        debug_assert!(self.lock.is_locked());

        // Safety: the table is only replaced while holding the registry lock, which the caller holds,
        // so it cannot be retired while we look at it
        unsafe { &*self.sections.load(Ordering::Acquire) }
    }

    /// Replaces the current table with `next`, returning the previous one which must be retired.
    fn publish(&self, next: SectionMap) -> Box<SectionMap> {
        debug_assert!(self.lock.is_locked());

        let prev = self
            .sections
            .swap(Box::into_raw(Box::new(next)), Ordering::SeqCst);

        // Safety: every table is allocated through `Box::into_raw` and is unpublished exactly once,
        // right here
        unsafe { Box::from_raw(prev) }
    }

    fn section_keys(&self, aligned: &Range<PhysicalAddress>) -> Range<usize> {
        let shift = self.config.section_shift();
        (aligned.start.get() >> shift)..(aligned.end.get() >> shift)
    }
}

impl<A, R, G> PageMapRegistry<A, R, G>
where
    R: lock_api::RawMutex,
    G: Reclaim,
{
    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn arch(&self) -> &A {
        &self.arch
    }

    /// Enters a read-side critical section.
    ///
    /// Records returned from the guard stay valid until it is dropped, even if their owner is
    /// detached concurrently. Detaching blocks until all guards that might still observe the
    /// registration are gone.
    pub fn read(&self) -> PageMapReadGuard<'_, G> {
        let guard = self.reclaim.read_lock();
        // Safety: the table pointer always comes from `Box::into_raw` and is never null
        let sections = unsafe { NonNull::new_unchecked(self.sections.load(Ordering::SeqCst)) };

        PageMapReadGuard {
            _guard: guard,
            sections,
            section_shift: self.config.section_shift(),
        }
    }

    /// Returns the registration owning `phys`.
    ///
    /// This is a shorthand for [`read`][PageMapRegistry::read] followed by
    /// [`lookup`][PageMapReadGuard::lookup] that keeps the record alive past the read-side critical
    /// section.
    pub fn find(&self, phys: PhysicalAddress) -> Option<Arc<PageMap>> {
        self.read().lookup_arc(phys).cloned()
    }
}

impl<A, R, G> Drop for PageMapRegistry<A, R, G>
where
    R: lock_api::RawMutex,
{
    fn drop(&mut self) {
        let sections = *self.sections.get_mut();

        // Safety: we have exclusive access, so there are neither readers nor mutators left
        drop(unsafe { Box::from_raw(sections) });
    }
}

/// A read-side critical section of a [`PageMapRegistry`].
pub struct PageMapReadGuard<'a, G: Reclaim + 'a> {
    _guard: G::Guard<'a>,
    sections: NonNull<SectionMap>,
    section_shift: u32,
}

impl<G: Reclaim> fmt::Debug for PageMapReadGuard<'_, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageMapReadGuard")
            .field("sections", &self.len())
            .field("section_shift", &self.section_shift)
            .finish_non_exhaustive()
    }
}

impl<G: Reclaim> PageMapReadGuard<'_, G> {
    fn sections(&self) -> &SectionMap {
        // Safety: the table was loaded after entering the read-side critical section and is only
        // retired after every critical section that could have observed it has ended
        unsafe { self.sections.as_ref() }
    }

    fn lookup_arc(&self, phys: PhysicalAddress) -> Option<&Arc<PageMap>> {
        self.sections().get(&(phys.get() >> self.section_shift))
    }

    /// Returns the registration owning the section of `phys`.
    pub fn lookup(&self, phys: PhysicalAddress) -> Option<&PageMap> {
        self.lookup_arc(phys).map(AsRef::as_ref)
    }

    /// Returns the altmap of the registration owning `phys`, if it has one.
    pub fn find_altmap(&self, phys: PhysicalAddress) -> Option<&VmemAltmap> {
        self.lookup(phys)?.altmap()
    }

    /// The number of claimed sections.
    pub fn len(&self) -> usize {
        self.sections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections().is_empty()
    }
}
