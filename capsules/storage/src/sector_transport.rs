// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Sector level access to an MMC/SD card.
//!
//! [`SectorTransport`] is what the write cache and the ATA session use to
//! move whole sectors. [`MmcsdTransport`] implements it on top of any
//! `hil::mmcsd::Mmcsd` controller:
//!
//! - sector numbers are checked against the card size,
//! - sector numbers become card addresses (block numbers on high capacity
//!   cards, byte addresses otherwise),
//! - the controller endian mode is set from the caller's [`SwapMode`] for
//!   the duration of one transfer and then put back.
//!
//! Usage
//! -----
//!
//! ```rust,ignore
//! let transport = MmcsdTransport::new(mmcsd);
//! transport.write_n_sectors(10, 4, &buf, SwapMode::NoSwap)?;
//! ```

use kernel::debug;
use kernel::hil::mmcsd::{EndianMode, Mmcsd};
use kernel::ErrorCode;

use crate::ata::{AtaError, SwapMode, SECTOR_WORDS};

/// Whole sector transfers to and from a medium.
///
/// Buffers hold `count * SECTOR_WORDS` words, longer buffers are only used
/// up to that length.
pub trait SectorTransport {
    /// Number of sectors on the medium, 0 if there is none.
    fn total_sectors(&self) -> u32;

    /// Card identification register, most significant word first.
    fn card_id(&self) -> Result<[u16; 8], AtaError>;

    /// Card specific data register, most significant word first.
    fn card_specific_data(&self) -> Result<[u16; 8], AtaError>;

    fn write_sector(&self, sector: u32, buf: &[u16], swap: SwapMode) -> Result<(), AtaError>;

    fn write_n_sectors(
        &self,
        start: u32,
        count: u32,
        buf: &[u16],
        swap: SwapMode,
    ) -> Result<(), AtaError>;

    fn read_sector(&self, sector: u32, buf: &mut [u16], swap: SwapMode) -> Result<(), AtaError>;

    fn read_n_sectors(
        &self,
        start: u32,
        count: u32,
        buf: &mut [u16],
        swap: SwapMode,
    ) -> Result<(), AtaError>;
}

pub struct MmcsdTransport<'a, M: Mmcsd> {
    mmcsd: &'a M,
}

impl<'a, M: Mmcsd> MmcsdTransport<'a, M> {
    pub fn new(mmcsd: &'a M) -> MmcsdTransport<'a, M> {
        MmcsdTransport { mmcsd }
    }

    /// Validate a run of `count` sectors at `start` and return its card
    /// address and the number of words to transfer.
    fn locate(&self, start: u32, count: u32, buf_len: usize) -> Result<(u32, usize), AtaError> {
        let card = self.mmcsd.card().ok_or(AtaError::InvalidParam)?;
        if count == 0 || start >= card.total_sectors || count > card.total_sectors - start {
            return Err(AtaError::InvalidParam);
        }
        let words = (count as usize)
            .checked_mul(SECTOR_WORDS)
            .ok_or(AtaError::InvalidParam)?;
        if buf_len < words {
            return Err(AtaError::InvalidParam);
        }
        Ok((card.sector_address(start), words))
    }

    fn with_write_endian(
        &self,
        mode: EndianMode,
        transfer: impl FnOnce() -> Result<(), ErrorCode>,
    ) -> Result<(), AtaError> {
        let saved = self.mmcsd.write_endian_mode();
        self.mmcsd.set_write_endian_mode(mode);
        let result = transfer();
        self.mmcsd.set_write_endian_mode(saved);
        result.map_err(AtaError::from)
    }

    fn with_read_endian(
        &self,
        mode: EndianMode,
        transfer: impl FnOnce() -> Result<(), ErrorCode>,
    ) -> Result<(), AtaError> {
        let saved = self.mmcsd.read_endian_mode();
        self.mmcsd.set_read_endian_mode(mode);
        let result = transfer();
        self.mmcsd.set_read_endian_mode(saved);
        result.map_err(AtaError::from)
    }

    /// The response words come least significant first.
    fn register_words(words: [u16; 8]) -> [u16; 8] {
        let mut out = words;
        out.reverse();
        out
    }
}

impl<M: Mmcsd> SectorTransport for MmcsdTransport<'_, M> {
    fn total_sectors(&self) -> u32 {
        self.mmcsd.card().map_or(0, |card| card.total_sectors)
    }

    fn card_id(&self) -> Result<[u16; 8], AtaError> {
        let card = self.mmcsd.card().ok_or(AtaError::InvalidParam)?;
        Ok(Self::register_words(card.cid))
    }

    fn card_specific_data(&self) -> Result<[u16; 8], AtaError> {
        let card = self.mmcsd.card().ok_or(AtaError::InvalidParam)?;
        Ok(Self::register_words(card.csd))
    }

    fn write_sector(&self, sector: u32, buf: &[u16], swap: SwapMode) -> Result<(), AtaError> {
        self.write_n_sectors(sector, 1, buf, swap)
    }

    fn write_n_sectors(
        &self,
        start: u32,
        count: u32,
        buf: &[u16],
        swap: SwapMode,
    ) -> Result<(), AtaError> {
        let (card_addr, words) = self.locate(start, count, buf.len())?;
        if kernel::config::CONFIG.trace_sector_io {
            debug!("mmcsd: write {} sectors at {} ({:?})", count, start, swap);
        }
        self.with_write_endian(swap.endian(), || self.mmcsd.write(card_addr, &buf[..words]))
    }

    fn read_sector(&self, sector: u32, buf: &mut [u16], swap: SwapMode) -> Result<(), AtaError> {
        self.read_n_sectors(sector, 1, buf, swap)
    }

    fn read_n_sectors(
        &self,
        start: u32,
        count: u32,
        buf: &mut [u16],
        swap: SwapMode,
    ) -> Result<(), AtaError> {
        let (card_addr, words) = self.locate(start, count, buf.len())?;
        if kernel::config::CONFIG.trace_sector_io {
            debug!("mmcsd: read {} sectors at {} ({:?})", count, start, swap);
        }
        self.with_read_endian(swap.endian(), || {
            self.mmcsd.read(card_addr, &mut buf[..words])
        })
    }
}
