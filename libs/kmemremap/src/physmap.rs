// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cmp;
use core::ops::Range;

use crate::{AddressRangeExt, PhysicalAddress, VirtualAddress};

/// Describes the region of virtual memory that linearly maps physical memory, i.e. the direct map.
///
/// [`Remap`][crate::Remap] implementations can use this to implement
/// [`phys_to_virt`][crate::Remap::phys_to_virt] and the direct map shortcut of
/// [`identity_map`][crate::Remap::identity_map].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysMap {
    translation_offset: isize,
    /// The physical addresses that have a linear translation.
    linear: Range<PhysicalAddress>,
}

impl PhysMap {
    /// Construct a new `PhysMap` from a chosen base address and the physical memory regions that
    /// should be linearly addressable. The iterator over the memory regions must not be empty.
    ///
    /// # Panics
    ///
    /// Panics if the iterator is empty.
    pub fn new(
        physmap_start: VirtualAddress,
        regions: impl IntoIterator<Item = Range<PhysicalAddress>>,
    ) -> Self {
        let mut min_addr = PhysicalAddress::MAX;
        let mut max_addr = PhysicalAddress::MIN;

        for region in regions {
            min_addr = cmp::min(min_addr, region.start);
            max_addr = cmp::max(max_addr, region.end);
        }

        assert!(min_addr <= max_addr, "regions must not be empty");

        #[expect(
            clippy::cast_possible_wrap,
            reason = "this is expected to wrap when the physmap_start is lower than the lowest physical address (e.g. when it is in upper half of memory)"
        )]
        let translation_offset = physmap_start.get().wrapping_sub(min_addr.get()) as isize;

        Self {
            translation_offset,
            linear: min_addr..max_addr,
        }
    }

    /// Translates a `PhysicalAddress` to a `VirtualAddress` through this `PhysMap`.
    ///
    /// The translation is purely arithmetic, use [`translate`][PhysMap::translate] to check whether
    /// the address is actually covered.
    #[inline]
    pub fn phys_to_virt(&self, phys: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(phys.wrapping_offset(self.translation_offset).get())
    }

    /// Returns the direct map address of `range` if the entire range is linearly mapped.
    pub fn translate(&self, range: Range<PhysicalAddress>) -> Option<VirtualAddress> {
        if range.is_empty() || !self.linear.covers(&range) {
            return None;
        }

        Some(self.phys_to_virt(range.start))
    }

    /// The physical addresses covered by the direct map.
    pub fn linear_range(&self) -> Range<PhysicalAddress> {
        self.linear.clone()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::test_utils::proptest::{
        aligned_phys, aligned_virt, phys, pick_address_in_regions, regions, virt,
    };
    use crate::{GIB, KIB};

    proptest! {
        #[test]
        fn single_region(base in aligned_virt(virt(0..usize::MAX), GIB), region_start in aligned_phys(phys(0..usize::MAX), 4*KIB), region_size in 4*KIB..256*GIB) {
            prop_assume!(region_start.checked_add(region_size).is_some());
            let map = PhysMap::new(
                base,
                [Range::from_start_len(region_start, region_size)],
            );

            prop_assert_eq!(map.translation_offset, base.get().wrapping_sub(region_start.get()) as isize);
            prop_assert_eq!(map.translate(Range::from_start_len(region_start, region_size)), Some(base));
        }

        #[test]
        fn phys_to_virt(base in aligned_virt(virt(0..usize::MAX), GIB), (ram, addr) in pick_address_in_regions(regions(1..10, 4*KIB, 256*GIB, 256*GIB))) {
            let ram_start = ram[0].start;

            let map = PhysMap::new(
                base,
                ram
            );

            let virt = map.phys_to_virt(addr);

            prop_assert_eq!(virt.get(), base.get().wrapping_add(addr.get() - ram_start.get()));
        }
    }

    #[test]
    #[should_panic]
    fn construct_no_regions() {
        let _map = PhysMap::new(VirtualAddress::new(0xffffffc000000000), []);
    }

    #[test]
    fn translate_outside() {
        let map = PhysMap::new(
            VirtualAddress::new(0xffffffc000000000),
            [PhysicalAddress::new(0x8000_0000)..PhysicalAddress::new(0x9000_0000)],
        );

        assert_eq!(
            map.translate(PhysicalAddress::new(0x8000_0000)..PhysicalAddress::new(0x8000_1000)),
            Some(VirtualAddress::new(0xffffffc000000000))
        );
        assert_eq!(
            map.translate(PhysicalAddress::new(0x8fff_f000)..PhysicalAddress::new(0x9000_1000)),
            None
        );
        assert_eq!(
            map.translate(PhysicalAddress::new(0x1000)..PhysicalAddress::new(0x2000)),
            None
        );
    }

    #[test]
    fn phys_to_virt_upper_half() {
        let map = PhysMap::new(
            VirtualAddress::new(0xffffffc000000000),
            [PhysicalAddress::new(0x00007f87024d9000)..PhysicalAddress::new(0x00007fc200e17000)],
        );

        let virt = map.phys_to_virt(PhysicalAddress::new(0x00007f87024d9000));
        assert_eq!(virt, VirtualAddress::new(0xffffffc000000000));
    }
}
