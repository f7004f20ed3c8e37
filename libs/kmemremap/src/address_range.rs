// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{PhysicalAddress, VirtualAddress};

pub trait AddressRangeExt {
    type Address;

    fn from_start_len(start: Self::Address, len: usize) -> Self;

    /// Like [`from_start_len`][AddressRangeExt::from_start_len] but returns `None` if the end of the
    /// range would overflow the address type.
    fn checked_from_start_len(start: Self::Address, len: usize) -> Option<Self>
    where
        Self: Sized;

    /// Returns `true` if the range contains no addresses.
    fn is_empty(&self) -> bool;

    /// Returns the length of the address range, in bytes.
    fn len(&self) -> usize;

    /// Returns `true` if `address` is contained in the range.
    fn contains(&self, address: &Self::Address) -> bool;

    /// Returns `true` if there exists an address present in both ranges.
    fn overlaps(&self, other: &Self) -> bool;

    /// Returns `true` if every address of `other` is also contained in `self`.
    fn covers(&self, other: &Self) -> bool;

    /// Grows the range so that both ends are aligned to `align`, returning `None` if rounding the end
    /// up overflows.
    fn checked_align_out(self, align: usize) -> Option<Self>
    where
        Self: Sized;
}

macro_rules! impl_address_range {
    ($address_ty:ident) => {
        impl AddressRangeExt for ::core::ops::Range<$address_ty> {
            type Address = $address_ty;

            fn from_start_len(start: Self::Address, len: usize) -> Self {
                let end = start.add(len);

                Self { start, end }
            }

            fn checked_from_start_len(start: Self::Address, len: usize) -> Option<Self> {
                let end = start.checked_add(len)?;

                Some(Self { start, end })
            }

            fn is_empty(&self) -> bool {
                self.start >= self.end
            }

            fn len(&self) -> usize {
                self.end.offset_from_unsigned(self.start)
            }

            fn contains(&self, address: &Self::Address) -> bool {
                <Self as ::core::ops::RangeBounds<$address_ty>>::contains(self, address)
            }

            fn overlaps(&self, other: &Self) -> bool {
                self.start < other.end && other.start < self.end
            }

            fn covers(&self, other: &Self) -> bool {
                self.start <= other.start && other.end <= self.end
            }

            fn checked_align_out(self, align: usize) -> Option<Self> {
                Some(self.start.align_down(align)..self.end.checked_align_up(align)?)
            }
        }
    };
}

impl_address_range!(VirtualAddress);
impl_address_range!(PhysicalAddress);

#[cfg(test)]
mod test {
    use core::ops::Range;

    use proptest::{prop_assert, prop_assert_eq, proptest};

    use super::{AddressRangeExt, *};

    proptest! {
        #[test]
        fn len(len: usize) {
            let r: Range<VirtualAddress> = Range::from_start_len(VirtualAddress::new(0), len);

            prop_assert_eq!(len, AddressRangeExt::len(&r));
        }

        #[test]
        fn align_out_covers(start in 0usize..1 << 40, len in 1usize..1 << 30, shift in 0u32..28) {
            let align = 1usize << shift;
            let r: Range<PhysicalAddress> = Range::from_start_len(PhysicalAddress::new(start), len);
            let aligned = r.clone().checked_align_out(align).unwrap();

            prop_assert!(aligned.covers(&r));
            prop_assert!(aligned.start.is_aligned_to(align));
            prop_assert!(aligned.end.is_aligned_to(align));
            prop_assert!(aligned.len() - r.len() < 2 * align);
        }
    }

    #[test]
    fn checked_from_start_len_overflow() {
        assert!(
            Range::<PhysicalAddress>::checked_from_start_len(PhysicalAddress::MAX, 1).is_none()
        );
        assert!(
            Range::<PhysicalAddress>::checked_from_start_len(PhysicalAddress::new(0x1000), 0x1000)
                .is_some()
        );
    }

    #[test]
    fn overlaps() {
        let a = PhysicalAddress::new(0x1000)..PhysicalAddress::new(0x3000);
        let b = PhysicalAddress::new(0x2000)..PhysicalAddress::new(0x4000);
        let c = PhysicalAddress::new(0x3000)..PhysicalAddress::new(0x4000);

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(b.covers(&c));
        assert!(!a.covers(&b));
    }
}
