// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Core kernel crate for the MMC/SD storage stack.
//!
//! The kernel crate holds the code that chips and capsules share: the
//! standard [`ErrorCode`], debug output, compile-time configuration, the
//! `StaticRef` used to address memory-mapped peripherals, and the Hardware
//! Interface Layer (HIL) traits that chip drivers implement.
//!
//! Most `unsafe` code lives in this crate.

#![warn(unreachable_pub)]
#![no_std]

pub mod config;
pub mod debug;
pub mod errorcode;
pub mod hil;
pub mod utilities;

pub use crate::errorcode::ErrorCode;

// This is used to run the tests on a host
#[cfg(test)]
#[macro_use]
extern crate std;
