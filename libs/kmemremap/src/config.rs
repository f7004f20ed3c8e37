// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// Granularity settings of a [`PageMapRegistry`][crate::PageMapRegistry].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    section_shift: u32,
    page_shift: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// 128 MiB sections.
    pub const DEFAULT_SECTION_SHIFT: u32 = 27;
    /// 4 KiB pages.
    pub const DEFAULT_PAGE_SHIFT: u32 = 12;

    pub const fn new() -> Self {
        Self {
            section_shift: Self::DEFAULT_SECTION_SHIFT,
            page_shift: Self::DEFAULT_PAGE_SHIFT,
        }
    }

    #[must_use]
    pub const fn with_section_shift(mut self, section_shift: u32) -> Self {
        self.section_shift = section_shift;
        self
    }

    #[must_use]
    pub const fn with_page_shift(mut self, page_shift: u32) -> Self {
        self.page_shift = page_shift;
        self
    }

    pub const fn section_shift(self) -> u32 {
        self.section_shift
    }

    pub const fn section_size(self) -> usize {
        1 << self.section_shift
    }

    pub const fn page_shift(self) -> u32 {
        self.page_shift
    }

    /// # Panics
    ///
    /// Panics if a section is smaller than a page or either does not fit the address width.
    pub(crate) const fn assert_valid(self) {
        assert!(
            self.section_shift < usize::BITS,
            "section size must fit the address width"
        );
        assert!(
            self.page_shift <= self.section_shift,
            "sections must be at least one page"
        );
    }
}
