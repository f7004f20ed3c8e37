// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

extern crate std;

mod machine;
pub mod proptest;

pub use machine::{Machine, MachineBuilder, Stats};

use crate::{Device, PageMapRegistry};

pub type TestDevice = Device<parking_lot::RawMutex>;
pub type TestRegistry = PageMapRegistry<Machine, parking_lot::RawMutex>;
