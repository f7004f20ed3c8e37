// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `proptest` strategies for remapping and page map tests

use std::ops::Range;
use std::vec::Vec;

use proptest::prelude::{Just, Strategy};

use crate::{AddressRangeExt, PhysicalAddress, VirtualAddress};

/// Produces `VirtualAddress`s in the given range
pub fn virt(range: Range<usize>) -> impl Strategy<Value = VirtualAddress> {
    range.prop_map(VirtualAddress::new)
}

/// Produces `VirtualAddress`s aligned to the given `alignment`
pub fn aligned_virt(
    addr: impl Strategy<Value = VirtualAddress>,
    alignment: usize,
) -> impl Strategy<Value = VirtualAddress> {
    addr.prop_map(move |value| value.align_down(alignment))
}

/// Produces `PhysicalAddress`s in the given range
pub fn phys(range: Range<usize>) -> impl Strategy<Value = PhysicalAddress> {
    range.prop_map(PhysicalAddress::new)
}

/// Produces `PhysicalAddress`s aligned to the given `alignment`
pub fn aligned_phys(
    addr: impl Strategy<Value = PhysicalAddress>,
    alignment: usize,
) -> impl Strategy<Value = PhysicalAddress> {
    addr.prop_map(move |value| value.align_down(alignment))
}

/// Produces a set of *sorted*, *non-overlapping* regions of physical memory aligned to `alignment`.
/// Most useful for initializing an emulated machine.
pub fn regions(
    num_regions: Range<usize>,
    alignment: usize,
    max_region_size: usize,
    max_gap_size: usize,
) -> impl Strategy<Value = Vec<Range<PhysicalAddress>>> {
    proptest::collection::vec(
        (
            // Size of the region (will be aligned)
            alignment..=max_region_size,
            // Gap after this region (will be aligned)
            alignment..=max_gap_size,
        ),
        num_regions,
    )
    .prop_flat_map(move |size_gap_pairs| {
        let size_gap_pairs: Vec<_> = size_gap_pairs
            .into_iter()
            .map(|(size, gap)| (size.next_multiple_of(alignment), gap.next_multiple_of(alignment)))
            .collect();

        // leave enough headroom that the last region cannot overflow
        let max_start = {
            let total_space_needed: usize =
                size_gap_pairs.iter().map(|(size, gap)| size + gap).sum();

            usize::MAX
                .saturating_sub(total_space_needed)
                .saturating_sub(alignment)
        };

        (0..=max_start).prop_map(move |start_raw| {
            let mut regions = Vec::with_capacity(size_gap_pairs.len());
            let mut current = PhysicalAddress::new(start_raw).align_down(alignment);

            for (size, gap) in &size_gap_pairs {
                let range = Range::from_start_len(current, *size);
                assert!(!range.is_empty());

                regions.push(range);

                current = current.add(size + gap);
            }

            regions
        })
    })
}

/// Picks an arbitrary `PhysicalAddress` from a strategy that produces physical memory regions such
/// as [`regions`].
pub fn pick_address_in_regions(
    regions: impl Strategy<Value = Vec<Range<PhysicalAddress>>>,
) -> impl Strategy<Value = (Vec<Range<PhysicalAddress>>, PhysicalAddress)> {
    regions.prop_flat_map(|regions| {
        let r = regions.clone();
        let address = (0..regions.len()).prop_flat_map(move |chosen_region| {
            let range = r[chosen_region].clone();

            (range.start.get()..range.end.get()).prop_map(PhysicalAddress::new)
        });

        (Just(regions), address)
    })
}

/// Produces non-empty ranges starting in `min_start..max_start` that are at most `max_len` bytes long.
pub fn ranges(
    min_start: usize,
    max_start: usize,
    max_len: usize,
) -> impl Strategy<Value = Range<PhysicalAddress>> {
    (min_start..max_start, 1..=max_len)
        .prop_map(|(start, len)| Range::from_start_len(PhysicalAddress::new(start), len))
}
