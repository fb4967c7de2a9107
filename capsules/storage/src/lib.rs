// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Block storage capsules that adapt MMC/SD cards to an ATA/FAT filesystem.
//!
//! The filesystem talks to an [`ata::AtaMedia`] backend. For MMC/SD cards
//! that backend is [`ata_mmcsd::AtaMmcState`], which streams reads word by
//! word and coalesces contiguous sector writes in a
//! [`sector_write_cache::SectorWriteCache`] before handing them to a
//! [`sector_transport::SectorTransport`].

#![forbid(unsafe_code)]
#![no_std]

pub mod ata;
pub mod ata_mmcsd;
pub mod sector_transport;
pub mod sector_write_cache;

// This is used to run the tests on a host
#[cfg(test)]
#[macro_use]
extern crate std;
