// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg(not(loom))]

mod common;

use std::collections::BTreeMap;
use std::ops::Range;

use common::{DEVICE, HIGHMEM_SIZE, RAM, RAM_SIZE, machine, phys};
use kmemremap::test_utils::proptest::ranges;
use kmemremap::test_utils::{TestDevice, TestRegistry};
use kmemremap::{
    AddressRangeExt, Config, Error, MIB, MappingFlags, MappingKind, PageMapParams, PhysicalAddress,
    RegionClassifier, RegionKind, memremap, memunmap,
};
use proptest::prelude::*;

const SECTION_SHIFT: u32 = 24;
const SECTION: usize = 1 << SECTION_SHIFT;

fn flags() -> impl Strategy<Value = MappingFlags> {
    (0u8..4).prop_map(MappingFlags::from_bits_truncate)
}

fn is_highmem(range: &Range<PhysicalAddress>) -> bool {
    range.overlaps(&(phys(RAM + RAM_SIZE - HIGHMEM_SIZE)..phys(RAM + RAM_SIZE)))
}

proptest! {
    #[test]
    fn memremap_never_aliases_ram(range in ranges(RAM - 64 * MIB, RAM + RAM_SIZE + 64 * MIB, 128 * MIB), flags in flags()) {
        let machine = machine();
        let kind = machine.classify(range.clone());

        match memremap(&machine, range.start, range.len(), flags) {
            Ok(mapping) => {
                prop_assert_eq!(mapping.phys(), range.clone());
                match mapping.kind() {
                    MappingKind::Direct => {
                        prop_assert!(flags.contains(MappingFlags::WRITE_BACK));
                        prop_assert_eq!(kind, RegionKind::Inside);
                        prop_assert!(!is_highmem(&range));
                    }
                    MappingKind::Cached => {
                        prop_assert!(flags.contains(MappingFlags::WRITE_BACK));
                        prop_assert!(kind == RegionKind::Outside || is_highmem(&range));
                    }
                    MappingKind::WriteThrough => {
                        prop_assert!(flags.contains(MappingFlags::WRITE_THROUGH));
                        prop_assert_eq!(kind, RegionKind::Outside);
                    }
                }
                memunmap(&machine, mapping);
            }
            Err(Error::AmbiguousRegion { .. }) => prop_assert_eq!(kind, RegionKind::Mixed),
            Err(Error::AliasingForbidden { .. }) => prop_assert_eq!(kind, RegionKind::Inside),
            Err(Error::Unsatisfiable { .. }) => prop_assert!(flags.is_empty()),
            Err(err) => prop_assert!(false, "unexpected error {err}"),
        }

        prop_assert_eq!(machine.stats().unmap, machine.stats().total_remaps());
    }

    #[test]
    fn sections_have_at_most_one_owner(requests in proptest::collection::vec(ranges(DEVICE, DEVICE + 16 * SECTION, 3 * SECTION), 1..16)) {
        let registry = TestRegistry::new(machine(), Config::new().with_section_shift(SECTION_SHIFT));
        let mut owners: BTreeMap<usize, String> = BTreeMap::new();
        let mut devices = Vec::new();

        for (i, range) in requests.into_iter().enumerate() {
            let device = TestDevice::new(format!("pmem{i}"));
            let keys = (range.start.get() >> SECTION_SHIFT)..=((range.end.get() - 1) >> SECTION_SHIFT);
            let taken = keys.clone().find_map(|key| owners.get(&key).cloned());

            match registry.register(&device, range.start, range.len(), PageMapParams::new()) {
                Ok(_) => {
                    prop_assert!(taken.is_none());
                    for key in keys {
                        owners.insert(key, device.name().into());
                    }
                }
                Err(Error::RangeCollision { owner, .. }) => {
                    prop_assert!(taken.is_some());
                    prop_assert!(owners.values().any(|name| *name == owner));
                }
                Err(err) => prop_assert!(false, "unexpected error {err}"),
            }

            devices.push(device);
        }

        {
            let guard = registry.read();
            prop_assert_eq!(guard.len(), owners.len());
            for (key, owner) in &owners {
                let page_map = guard.lookup(PhysicalAddress::new(key << SECTION_SHIFT)).unwrap();
                prop_assert_eq!(page_map.device(), owner.as_str());
            }
        }

        for device in devices.iter().rev() {
            device.detach();
        }

        prop_assert!(registry.read().is_empty());
        prop_assert!(registry.arch().online().is_empty());
    }
}
