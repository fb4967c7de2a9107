// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Peripheral implementations for the TI TMS320C55x DSP family.
//!
//! Only the MMC/SD host controllers are provided. Both instances share the
//! register layout in [`mmcsd::MmcsdRegisters`].

#![crate_name = "c55xx"]
#![crate_type = "rlib"]
#![no_std]

pub mod mmcsd;

// This is used to run the tests on a host
#[cfg(test)]
#[macro_use]
extern crate std;
