// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::string::String;
use core::fmt::{Display, Formatter};
use core::ops::Range;

use crate::{HotplugError, MappingFlags, PhysicalAddress, ResourceId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The range is empty or its end overflows the physical address space.
    InvalidRange {
        start: PhysicalAddress,
        len: usize,
    },
    /// The range straddles general-purpose memory and non general-purpose memory.
    AmbiguousRegion { range: Range<PhysicalAddress> },
    /// Satisfying the request would establish a second cached view of general-purpose memory.
    AliasingForbidden {
        range: Range<PhysicalAddress>,
        flags: MappingFlags,
    },
    /// Every attempted mapping strategy failed.
    Unsatisfiable {
        range: Range<PhysicalAddress>,
        flags: MappingFlags,
    },
    /// The range overlaps a range already registered by `owner`.
    RangeCollision {
        range: Range<PhysicalAddress>,
        owner: String,
    },
    /// The altmap does not describe the start of the donated range.
    InvalidAltmap {
        base_pfn: usize,
        range: Range<PhysicalAddress>,
    },
    /// Bringing the range online failed.
    Hotplug(HotplugError),
    /// Tracking storage for a device-managed resource could not be allocated.
    ResourceExhausted,
    /// The resource is not bound to the device, most likely because it was already released.
    NotBound { device: String, id: ResourceId },
}

impl From<HotplugError> for Error {
    fn from(err: HotplugError) -> Self {
        Self::Hotplug(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvalidRange { start, len } => {
                write!(f, "invalid physical range {start} size {len:#x}")
            }
            Error::AmbiguousRegion { range } => write!(
                f,
                "physical range {:#x}..{:#x} mixes general-purpose memory with other memory",
                range.start, range.end
            ),
            Error::AliasingForbidden { range, flags } => write!(
                f,
                "refusing to map general-purpose memory {:#x}..{:#x} as {flags:?}",
                range.start, range.end
            ),
            Error::Unsatisfiable { range, flags } => write!(
                f,
                "no mapping strategy could map {:#x}..{:#x} as {flags:?}",
                range.start, range.end
            ),
            Error::RangeCollision { range, owner } => write!(
                f,
                "physical range {:#x}..{:#x} collides with mapping for {owner}",
                range.start, range.end
            ),
            Error::InvalidAltmap { base_pfn, range } => write!(
                f,
                "altmap at pfn {base_pfn:#x} does not fit physical range {:#x}..{:#x}",
                range.start, range.end
            ),
            Error::Hotplug(err) => write!(f, "failed to bring memory online: {err}"),
            Error::ResourceExhausted => {
                f.write_str("failed to allocate tracking storage for device resource")
            }
            Error::NotBound { device, id } => {
                write!(f, "resource {id} is not bound to device {device}")
            }
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Error::Hotplug(err) => Some(err),
            _ => None,
        }
    }
}
