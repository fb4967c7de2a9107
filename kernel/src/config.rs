// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Data structure for storing compile-time configuration options.
//!
//! Configuration lives in a typed `const` object rather than behind
//! `#[cfg(..)]` attributes so that every code path is type-checked, even the
//! disabled ones. After type-checking the compiler folds the constants, so a
//! disabled option costs nothing in the resulting binary.

/// Data structure holding compile-time configuration options.
///
/// To change the configuration, enable the matching cargo feature of the
/// kernel crate from the board crate.
pub struct Config {
    /// Whether storage capsules should print a line for every sector transfer
    /// they hand to the media driver.
    pub trace_sector_io: bool,

    /// Whether the write-sector cache should report when it accepts, merges
    /// and flushes sectors.
    pub debug_write_cache: bool,
}

/// The unique instance of `Config`. This is the only location in the kernel
/// crate where `cfg!` is used to read cargo features.
pub const CONFIG: Config = Config {
    trace_sector_io: cfg!(feature = "trace_sector_io"),
    debug_write_cache: cfg!(feature = "debug_write_cache"),
};
