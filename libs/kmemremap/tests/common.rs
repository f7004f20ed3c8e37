#![allow(unused, reason = "not used by all tests")]

use kmemremap::test_utils::Machine;
use kmemremap::{GIB, MIB, PhysicalAddress};

pub const RAM: usize = 0x8000_0000;
pub const RAM_SIZE: usize = GIB;
pub const HIGHMEM_SIZE: usize = 64 * MIB;
pub const DEVICE: usize = 0x10_0000_0000;

/// 1 GiB of general-purpose memory at 2 GiB, the last 64 MiB of which are highmem.
pub fn machine() -> Machine {
    Machine::builder()
        .with_ram(phys(RAM)..phys(RAM + RAM_SIZE))
        .with_highmem(phys(RAM + RAM_SIZE - HIGHMEM_SIZE)..phys(RAM + RAM_SIZE))
        .finish()
}

pub fn phys(addr: usize) -> PhysicalAddress {
    PhysicalAddress::new(addr)
}
