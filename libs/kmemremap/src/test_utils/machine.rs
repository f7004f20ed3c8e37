// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard};
use std::vec::Vec;

use crate::{
    AddressRangeExt, HotplugError, MemoryHotplug, NodeId, PhysMap, PhysicalAddress,
    RegionClassifier, RegionKind, Remap, VirtualAddress, VmemAltmap,
};

/// Counts of calls into the emulated machine, failed calls included.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub identity_map: usize,
    pub remap_cache: usize,
    pub remap_wt: usize,
    pub unmap: usize,
    pub add_memory: usize,
    pub remove_memory: usize,
}

impl Stats {
    /// The number of attempts to establish a new mapping.
    pub fn total_remaps(&self) -> usize {
        self.remap_cache + self.remap_wt
    }
}

/// A "virtual machine" for tests. It models:
///
/// - general-purpose memory regions, some of which may be highmem i.e. not linearly mapped
/// - a direct map covering the rest of general-purpose memory
/// - a remap window handing out fresh virtual addresses
/// - memory hotplug with a record of which ranges are online on which node
///
/// Each primitive can be made to fail on demand.
#[derive(Debug)]
pub struct Machine {
    ram: Vec<Range<PhysicalAddress>>,
    highmem: Vec<Range<PhysicalAddress>>,
    physmap: PhysMap,
    default_node: NodeId,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    stats: Stats,
    next_remap: VirtualAddress,
    remapped: BTreeMap<VirtualAddress, Range<PhysicalAddress>>,
    online: Vec<(NodeId, Range<PhysicalAddress>)>,
    fail_remap_cache: bool,
    fail_remap_wt: bool,
    fail_hotplug: Option<HotplugError>,
}

#[derive(Debug)]
pub struct MachineBuilder {
    ram: Vec<Range<PhysicalAddress>>,
    highmem: Vec<Range<PhysicalAddress>>,
    physmap_start: VirtualAddress,
    remap_start: VirtualAddress,
    default_node: NodeId,
}

impl MachineBuilder {
    /// Adds a region of general-purpose memory.
    pub fn with_ram(mut self, range: Range<PhysicalAddress>) -> Self {
        self.ram.push(range);
        self
    }

    /// Marks part of general-purpose memory as not being covered by the direct map.
    pub fn with_highmem(mut self, range: Range<PhysicalAddress>) -> Self {
        self.highmem.push(range);
        self
    }

    pub fn with_physmap_start(mut self, physmap_start: VirtualAddress) -> Self {
        self.physmap_start = physmap_start;
        self
    }

    pub fn with_default_node(mut self, node: NodeId) -> Self {
        self.default_node = node;
        self
    }

    /// # Panics
    ///
    /// Panics if no general-purpose memory was configured or a highmem region is not part of
    /// general-purpose memory.
    pub fn finish(self) -> Machine {
        for highmem in &self.highmem {
            assert!(
                self.ram.iter().any(|ram| ram.covers(highmem)),
                "highmem {highmem:?} is not general-purpose memory"
            );
        }

        let physmap = PhysMap::new(self.physmap_start, self.ram.iter().cloned());

        Machine {
            ram: self.ram,
            highmem: self.highmem,
            physmap,
            default_node: self.default_node,
            state: Mutex::new(State {
                stats: Stats::default(),
                next_remap: self.remap_start,
                remapped: BTreeMap::new(),
                online: Vec::new(),
                fail_remap_cache: false,
                fail_remap_wt: false,
                fail_hotplug: None,
            }),
        }
    }
}

impl Machine {
    pub fn builder() -> MachineBuilder {
        MachineBuilder {
            ram: Vec::new(),
            highmem: Vec::new(),
            physmap_start: VirtualAddress::new(0xffff_ffc0_0000_0000),
            remap_start: VirtualAddress::new(0xffff_ffe0_0000_0000),
            default_node: NodeId(0),
        }
    }

    pub fn stats(&self) -> Stats {
        self.state().stats
    }

    pub fn fail_remap_cache(&self, fail: bool) {
        self.state().fail_remap_cache = fail;
    }

    pub fn fail_remap_wt(&self, fail: bool) {
        self.state().fail_remap_wt = fail;
    }

    /// Makes every following [`add_memory`][MemoryHotplug::add_memory] call fail with `err`.
    pub fn fail_hotplug(&self, err: Option<HotplugError>) {
        self.state().fail_hotplug = err;
    }

    /// Whether `virt` is the start of a live mapping established through the remap primitives.
    pub fn is_remapped(&self, virt: VirtualAddress) -> bool {
        self.state().remapped.contains_key(&virt)
    }

    /// The ranges currently online, in the order they were added.
    pub fn online(&self) -> Vec<(NodeId, Range<PhysicalAddress>)> {
        self.state().online.clone()
    }

    pub fn is_online(&self, phys: PhysicalAddress) -> bool {
        self.state()
            .online
            .iter()
            .any(|(_, range)| range.contains(&phys))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn is_highmem(&self, range: &Range<PhysicalAddress>) -> bool {
        self.highmem.iter().any(|highmem| highmem.overlaps(range))
    }

    fn remap(&self, range: Range<PhysicalAddress>) -> VirtualAddress {
        let mut state = self.state();

        let virt = state.next_remap;
        // keep a guard page between mappings
        state.next_remap = virt.add(range.len().next_multiple_of(4096) + 4096);
        state.remapped.insert(virt, range);

        virt
    }
}

impl RegionClassifier for Machine {
    fn classify(&self, range: Range<PhysicalAddress>) -> RegionKind {
        if self.ram.iter().any(|ram| ram.covers(&range)) {
            RegionKind::Inside
        } else if self.ram.iter().any(|ram| ram.overlaps(&range)) {
            RegionKind::Mixed
        } else {
            RegionKind::Outside
        }
    }
}

// Safety: the emulated remap window never hands out the same address twice
unsafe impl Remap for Machine {
    fn phys_to_virt(&self, phys: PhysicalAddress) -> VirtualAddress {
        self.physmap.phys_to_virt(phys)
    }

    fn identity_map(&self, range: Range<PhysicalAddress>) -> Option<VirtualAddress> {
        self.state().stats.identity_map += 1;

        if self.is_highmem(&range) {
            return None;
        }

        self.physmap.translate(range)
    }

    fn remap_cache(&self, range: Range<PhysicalAddress>) -> Option<VirtualAddress> {
        let fail = {
            let mut state = self.state();
            state.stats.remap_cache += 1;
            state.fail_remap_cache
        };

        (!fail).then(|| self.remap(range))
    }

    fn remap_wt(&self, range: Range<PhysicalAddress>) -> Option<VirtualAddress> {
        let fail = {
            let mut state = self.state();
            state.stats.remap_wt += 1;
            state.fail_remap_wt
        };

        (!fail).then(|| self.remap(range))
    }

    unsafe fn unmap(&self, virt: VirtualAddress) {
        let mut state = self.state();
        state.stats.unmap += 1;

        assert!(
            state.remapped.remove(&virt).is_some(),
            "unmap: {virt} is not mapped"
        );
    }
}

impl MemoryHotplug for Machine {
    fn default_node(&self) -> NodeId {
        self.default_node
    }

    fn add_memory(
        &self,
        node: NodeId,
        range: Range<PhysicalAddress>,
        _altmap: Option<&VmemAltmap>,
    ) -> Result<(), HotplugError> {
        let mut state = self.state();
        state.stats.add_memory += 1;

        if let Some(err) = state.fail_hotplug {
            return Err(err);
        }

        if state
            .online
            .iter()
            .any(|(_, online)| online.overlaps(&range))
        {
            return Err(HotplugError::Busy);
        }

        state.online.push((node, range));
        Ok(())
    }

    fn remove_memory(&self, range: Range<PhysicalAddress>) {
        let mut state = self.state();
        state.stats.remove_memory += 1;

        let pos = state
            .online
            .iter()
            .position(|(_, online)| *online == range)
            .unwrap_or_else(|| panic!("remove_memory: {range:?} is not online"));
        state.online.remove(pos);
    }
}
