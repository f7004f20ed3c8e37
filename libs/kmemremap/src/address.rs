// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

macro_rules! impl_address_from {
    ($address_ty:ident, $int_ty:ident) => {
        impl From<$int_ty> for $address_ty {
            fn from(value: $int_ty) -> Self {
                $address_ty(usize::from(value))
            }
        }
    };
}

macro_rules! impl_address_try_from {
    ($address_ty:ident, $int_ty:ident) => {
        impl TryFrom<$int_ty> for $address_ty {
            type Error = <usize as TryFrom<$int_ty>>::Error;

            fn try_from(value: $int_ty) -> Result<Self, Self::Error> {
                usize::try_from(value).map($address_ty)
            }
        }
    };
}

macro_rules! impl_address {
    ($address_ty:ident) => {
        impl $address_ty {
            pub const MAX: Self = Self(usize::MAX);
            pub const MIN: Self = Self(usize::MIN);

            #[must_use]
            pub const fn new(n: usize) -> Self {
                Self(n)
            }

            #[inline]
            pub const fn get(&self) -> usize {
                self.0
            }

            /// Adds an unsigned offset to this address, panicking if overflow occurred.
            #[must_use]
            #[inline]
            pub const fn add(self, offset: usize) -> Self {
                Self(self.0 + offset)
            }

            /// Subtracts an unsigned offset from this address, panicking if overflow occurred.
            #[must_use]
            #[inline]
            pub const fn sub(self, offset: usize) -> Self {
                Self(self.0 - offset)
            }

            /// Adds an unsigned offset to this address, returning `None` if overflow occurred.
            #[must_use]
            #[inline]
            pub const fn checked_add(self, offset: usize) -> Option<Self> {
                if let Some(n) = self.0.checked_add(offset) {
                    Some(Self(n))
                } else {
                    None
                }
            }

            /// Adds a signed offset in bytes to this address, wrapping around at the boundary of the type.
            #[must_use]
            #[inline]
            pub const fn wrapping_offset(self, offset: isize) -> Self {
                Self(self.0.wrapping_add_signed(offset))
            }

            /// Calculates the distance between two addresses in bytes, _where it's known that `self`
            /// is equal to or greater than `origin`_.
            ///
            /// # Panics
            ///
            /// Panics if `self` is less than `origin`.
            #[must_use]
            #[inline]
            pub const fn offset_from_unsigned(self, origin: Self) -> usize {
                let (a, b) = self.0.overflowing_sub(origin.0);
                if b {
                    panic!("attempt to subtract with overflow")
                } else {
                    a
                }
            }

            #[must_use]
            #[inline]
            pub const fn is_aligned_to(&self, align: usize) -> bool {
                assert!(
                    align.is_power_of_two(),
                    "is_aligned_to: align is not a power-of-two"
                );

                self.0 & (align - 1) == 0
            }

            /// Rounds this address up to `align`, returning `None` if that would overflow.
            #[must_use]
            #[inline]
            pub const fn checked_align_up(self, align: usize) -> Option<Self> {
                assert!(
                    align.is_power_of_two(),
                    "checked_align_up: align is not a power-of-two"
                );

                if let Some(n) = self.0.checked_add(align - 1) {
                    Some(Self(n & 0usize.wrapping_sub(align)))
                } else {
                    None
                }
            }

            /// # Panics
            ///
            /// Panics if `align` is not a power of two or rounding up overflows.
            #[must_use]
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                if let Some(aligned) = self.checked_align_up(align) {
                    aligned
                } else {
                    panic!("align_up: attempt to align with overflow")
                }
            }

            #[must_use]
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(
                    align.is_power_of_two(),
                    "align_down: align is not a power-of-two"
                );

                Self(self.0 & 0usize.wrapping_sub(align))
            }
        }

        impl_address_from!($address_ty, usize);
        impl_address_from!($address_ty, u8);
        impl_address_from!($address_ty, u16);
        impl_address_try_from!($address_ty, u32);
        impl_address_try_from!($address_ty, u64);

        impl ::core::fmt::Display for $address_ty {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.write_fmt(format_args!("{:#018x}", self.0)) // 18 digits to account for the leading 0x
            }
        }

        impl ::core::fmt::Debug for $address_ty {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.debug_tuple(stringify!($address_ty))
                    .field(&format_args!("{:#018x}", self.0)) // 18 digits to account for the leading 0x
                    .finish()
            }
        }

        impl ::core::fmt::LowerHex for $address_ty {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                ::core::fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

#[repr(transparent)]
#[derive(Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(usize);
impl_address!(VirtualAddress);

#[repr(transparent)]
#[derive(Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(usize);
impl_address!(PhysicalAddress);

impl PhysicalAddress {
    /// Returns the page frame number of this address.
    #[must_use]
    #[inline]
    pub const fn pfn(self, page_shift: u32) -> usize {
        self.0 >> page_shift
    }
}

#[cfg(test)]
mod tests {
    use proptest::{prop_assert, prop_assert_eq, proptest};

    use super::*;

    proptest! {
        #[test]
        fn align_down_is_aligned(raw: usize, shift in 0u32..32) {
            let align = 1usize << shift;
            let addr = PhysicalAddress::new(raw).align_down(align);

            prop_assert!(addr.is_aligned_to(align));
            prop_assert!(addr.get() <= raw);
            prop_assert!(raw - addr.get() < align);
        }

        #[test]
        fn checked_align_up(raw: usize, shift in 0u32..32) {
            let align = 1usize << shift;

            match PhysicalAddress::new(raw).checked_align_up(align) {
                Some(addr) => {
                    prop_assert!(addr.is_aligned_to(align));
                    prop_assert!(addr.get() >= raw);
                    prop_assert!(addr.get() - raw < align);
                }
                None => prop_assert!(raw > usize::MAX - (align - 1)),
            }
        }

        #[test]
        fn pfn(raw: usize, shift in 0u32..32) {
            let addr = PhysicalAddress::new(raw);

            prop_assert_eq!(addr.pfn(shift), raw >> shift);
            prop_assert_eq!(addr.align_down(1 << shift).pfn(shift), addr.pfn(shift));
        }
    }

    #[test]
    fn display() {
        assert_eq!(
            format!("{}", PhysicalAddress::new(0x1000)),
            "0x0000000000001000"
        );
        assert_eq!(
            format!("{:?}", VirtualAddress::new(0x1000)),
            "VirtualAddress(0x0000000000001000)"
        );
    }

    #[test]
    #[should_panic]
    fn align_up_overflow() {
        let _addr = PhysicalAddress::MAX.align_up(4096);
    }
}
