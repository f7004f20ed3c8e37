// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg(not(loom))]

mod common;

use std::sync::Arc;

use common::{DEVICE, RAM, machine, phys};
use kmemremap::test_utils::{TestDevice, TestRegistry};
use kmemremap::{
    Config, Error, MappingFlags, MappingKind, NodeId, PageMapParams, Pages, Remap, VmemAltmap,
    devm_memremap, devm_memunmap,
};

const SECTION: usize = 1 << Config::DEFAULT_SECTION_SHIFT;

#[test_log::test]
fn device_lifecycle() {
    let registry = TestRegistry::new(machine(), Config::default());
    let arch = Arc::new(machine());
    let device = TestDevice::with_node("pmem0", NodeId(2));

    // a control block mapped for the lifetime of the driver
    let regs = devm_memremap(
        &device,
        &arch,
        phys(DEVICE + 4 * SECTION),
        0x1000,
        MappingFlags::WRITE_BACK,
    )
    .unwrap();
    let regs_virt = regs.get().unwrap().virt();
    assert_eq!(regs.get().unwrap().kind(), MappingKind::Cached);
    assert!(arch.is_remapped(regs_virt));

    // and the bulk of the device donated to the allocator
    let base_pfn = DEVICE >> 12;
    let pages = registry
        .register(
            &device,
            phys(DEVICE),
            2 * SECTION,
            PageMapParams::new().with_altmap(VmemAltmap::new(base_pfn, 16, 1024)),
        )
        .unwrap();
    assert!(matches!(pages, Pages::Managed(_)));
    assert_eq!(device.resources(), 2);

    {
        let guard = registry.read();
        let page_map = guard.lookup(phys(DEVICE + SECTION + 0x1000)).unwrap();
        assert_eq!(page_map.device(), "pmem0");
        assert_eq!(page_map.node(), NodeId(2));

        let altmap = guard.find_altmap(phys(DEVICE)).unwrap();
        assert_eq!(altmap.offset(), 16 + 1024);
    }
    assert!(registry.arch().is_online(phys(DEVICE + SECTION)));

    device.detach();

    assert_eq!(device.resources(), 0);
    assert!(registry.read().is_empty());
    assert!(!registry.arch().is_online(phys(DEVICE)));
    assert!(!arch.is_remapped(regs_virt));
    assert!(regs.get().is_err());
    assert!(pages.page_map().is_err());

    // everything was released exactly once
    assert_eq!(arch.stats().unmap, 1);
    assert_eq!(registry.arch().stats().remove_memory, 1);
    assert!(matches!(devm_memunmap(&regs), Err(Error::NotBound { .. })));
}

#[test_log::test]
fn ram_is_never_registered() {
    let registry = TestRegistry::new(machine(), Config::default());
    let device = TestDevice::new("pmem0");

    let pages = registry
        .register(&device, phys(RAM), SECTION, PageMapParams::new())
        .unwrap();

    let Pages::Direct { phys: range, virt } = pages else {
        panic!("general-purpose memory must not be registered");
    };
    assert_eq!(range, phys(RAM)..phys(RAM + SECTION));
    assert_eq!(virt, registry.arch().phys_to_virt(phys(RAM)));
    assert!(registry.read().is_empty());
}

#[test_log::test]
fn two_devices_share_nothing() {
    let registry = TestRegistry::new(machine(), Config::default());
    let a = TestDevice::new("pmem0");
    let b = TestDevice::new("pmem1");

    registry
        .register(&a, phys(DEVICE), SECTION, PageMapParams::new())
        .unwrap();

    let err = registry
        .register(&b, phys(DEVICE + SECTION / 2), SECTION, PageMapParams::new())
        .unwrap_err();
    assert!(matches!(err, Error::RangeCollision { ref owner, .. } if owner == "pmem0"));

    // once the first owner is gone the range is up for grabs
    a.detach();
    registry
        .register(&b, phys(DEVICE + SECTION / 2), SECTION, PageMapParams::new())
        .unwrap();

    let owner = registry.find(phys(DEVICE + SECTION)).unwrap();
    assert_eq!(owner.device(), "pmem1");
    assert_eq!(owner.aligned(), phys(DEVICE)..phys(DEVICE + 2 * SECTION));
}
