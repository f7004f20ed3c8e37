// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::loom::sync::atomic::{AtomicUsize, Ordering};

/// Pre-allocated storage for the page metadata of a donated range.
///
/// Device memory that is brought online needs page metadata, and allocating that from
/// general-purpose memory can be prohibitively expensive for large devices. An altmap describes a
/// part of the donated range itself that holds the metadata instead:
///
/// ```text
/// base_pfn
/// |-- reserve --|------------ free ------------|---- usable by the driver ----
///               |- alloc -|- align -|- unused -|
/// ```
///
/// `reserve` pfns are set aside by the driver, `free` pfns are available for metadata and are
/// handed out in aligned chunks by [`alloc`][VmemAltmap::alloc].
pub struct VmemAltmap {
    base_pfn: usize,
    reserve: usize,
    free: usize,
    /// pfns consumed from `free`, including alignment padding
    used: AtomicUsize,
    /// the alignment padding part of `used`
    align: AtomicUsize,
}

impl fmt::Debug for VmemAltmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmemAltmap")
            .field("base_pfn", &format_args!("{:#x}", self.base_pfn))
            .field("reserve", &self.reserve)
            .field("free", &self.free)
            .field("used", &self.used.load(Ordering::Relaxed))
            .field("align", &self.align.load(Ordering::Relaxed))
            .finish()
    }
}

impl Clone for VmemAltmap {
    fn clone(&self) -> Self {
        Self {
            base_pfn: self.base_pfn,
            reserve: self.reserve,
            free: self.free,
            used: AtomicUsize::new(self.used.load(Ordering::Acquire)),
            align: AtomicUsize::new(self.align.load(Ordering::Acquire)),
        }
    }
}

impl VmemAltmap {
    pub fn new(base_pfn: usize, reserve: usize, free: usize) -> Self {
        Self {
            base_pfn,
            reserve,
            free,
            used: AtomicUsize::new(0),
            align: AtomicUsize::new(0),
        }
    }

    pub const fn base_pfn(&self) -> usize {
        self.base_pfn
    }

    pub const fn reserve(&self) -> usize {
        self.reserve
    }

    pub const fn free_pfns(&self) -> usize {
        self.free
    }

    /// The number of pfns handed out by [`alloc`][VmemAltmap::alloc], not counting alignment.
    pub fn allocated(&self) -> usize {
        self.used.load(Ordering::Acquire) - self.align.load(Ordering::Acquire)
    }

    /// The number of pfns at the start of the range the driver must not use for data.
    pub const fn offset(&self) -> usize {
        self.reserve + self.free
    }

    /// The pfn the next allocation would start at, before alignment.
    pub fn next_pfn(&self) -> usize {
        self.base_pfn + self.reserve + self.used.load(Ordering::Acquire)
    }

    /// The number of pfns still available for allocation.
    pub fn nr_free(&self) -> usize {
        self.free.saturating_sub(self.used.load(Ordering::Acquire))
    }

    /// Allocates `nr_pfns` pfns, naturally aligned to the largest power of two dividing `nr_pfns`.
    ///
    /// Returns the first allocated pfn or `None` if the free area is exhausted.
    pub fn alloc(&self, nr_pfns: usize) -> Option<usize> {
        if nr_pfns == 0 {
            return None;
        }

        let natural = 1usize << nr_pfns.trailing_zeros();
        let mut used = self.used.load(Ordering::Acquire);

        loop {
            let pfn = self.base_pfn + self.reserve + used;
            let nr_align = pfn.checked_next_multiple_of(natural)? - pfn;
            let nr_free = self.free.saturating_sub(used);

            if nr_pfns + nr_align > nr_free {
                log::trace!("altmap exhausted: want {nr_pfns} + {nr_align} have {nr_free}");
                return None;
            }

            match self.used.compare_exchange_weak(
                used,
                used + nr_pfns + nr_align,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.align.fetch_add(nr_align, Ordering::AcqRel);
                    return Some(pfn + nr_align);
                }
                Err(actual) => used = actual,
            }
        }
    }

    /// Returns the `nr_pfns` most recently allocated pfns.
    ///
    /// The allocation cursor moves back by `nr_pfns`, so the freed pfns are handed out again by
    /// later allocations. Alignment padding is never given back.
    ///
    /// # Panics
    ///
    /// Panics if more pfns are freed than are allocated. The altmap is left unchanged in that case.
    pub fn free(&self, nr_pfns: usize) {
        let mut used = self.used.load(Ordering::Acquire);

        loop {
            let allocated = used - self.align.load(Ordering::Acquire);
            assert!(
                allocated >= nr_pfns,
                "freeing {nr_pfns} pfns but only {allocated} are allocated"
            );

            match self.used.compare_exchange_weak(
                used,
                used - nr_pfns,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => used = actual,
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use proptest::{prop_assert, prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn offset() {
        let altmap = VmemAltmap::new(0x100, 2, 30);

        assert_eq!(altmap.offset(), 32);
        assert_eq!(altmap.next_pfn(), 0x102);
        assert_eq!(altmap.nr_free(), 30);
    }

    #[test]
    fn alloc_aligns_naturally() {
        let altmap = VmemAltmap::new(0x100, 1, 64);

        // 0x101 rounded up to a multiple of 4
        assert_eq!(altmap.alloc(4), Some(0x104));
        assert_eq!(altmap.allocated(), 4);
        assert_eq!(altmap.align.load(Ordering::Relaxed), 3);
        assert_eq!(altmap.nr_free(), 64 - 7);

        // odd sizes need no alignment
        assert_eq!(altmap.alloc(3), Some(0x108));
        assert_eq!(altmap.allocated(), 7);
    }

    #[test]
    fn alloc_exhausted() {
        let altmap = VmemAltmap::new(0, 0, 8);

        assert_eq!(altmap.alloc(8), Some(0));
        assert_eq!(altmap.alloc(1), None);
        assert_eq!(altmap.alloc(0), None);
    }

    #[test]
    fn free() {
        let altmap = VmemAltmap::new(0, 0, 8);

        altmap.alloc(4).unwrap();
        altmap.free(4);

        assert_eq!(altmap.allocated(), 0);
    }

    #[test]
    #[should_panic]
    fn free_too_much() {
        let altmap = VmemAltmap::new(0, 0, 8);

        altmap.alloc(2).unwrap();
        altmap.free(4);
    }

    #[test]
    fn free_too_much_leaves_altmap_unchanged() {
        let altmap = VmemAltmap::new(0x100, 1, 16);
        altmap.alloc(2).unwrap();

        let res = std::panic::catch_unwind(|| altmap.free(4));

        assert!(res.is_err());
        assert_eq!(altmap.allocated(), 2);
        assert_eq!(altmap.nr_free(), 16 - 3);
        assert_eq!(altmap.next_pfn(), 0x104);
    }

    #[test]
    fn freed_pfns_are_reused() {
        let altmap = VmemAltmap::new(0, 0, 8);

        assert_eq!(altmap.alloc(1), Some(0));
        assert_eq!(altmap.alloc(2), Some(2));

        altmap.free(2);
        assert_eq!(altmap.next_pfn(), 2);
        assert_eq!(altmap.alloc(2), Some(2));
        assert_eq!(altmap.allocated(), 3);
    }

    proptest! {
        #[test]
        fn allocations_stay_in_free_area(base in 0usize..1 << 20, reserve in 0usize..64, free in 0usize..512, sizes in proptest::collection::vec(1usize..32, 0..32)) {
            let altmap = VmemAltmap::new(base, reserve, free);
            let start = base + reserve;
            let end = start + free;

            let mut last_end = start;
            for nr in sizes {
                if let Some(pfn) = altmap.alloc(nr) {
                    prop_assert!(pfn >= last_end);
                    prop_assert!(pfn + nr <= end);
                    prop_assert_eq!(pfn % (1 << nr.trailing_zeros()), 0);
                    last_end = pfn + nr;
                }
            }
        }
    }
}
