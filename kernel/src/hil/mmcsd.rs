// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Interface for MMC/SD card host controllers.
//!
//! A controller driver identifies the inserted card and moves whole blocks
//! between a word buffer and the card. Transfers are synchronous: the call
//! returns once the controller reports the data phase complete or the
//! driver's polling budget runs out.
//!
//! Buffers are slices of 16-bit words because that is the width of the
//! controller FIFO. How the two bytes of each word map onto the card byte
//! stream is selected by the controller's endian mode, separately for reads
//! and writes.

use crate::ErrorCode;

/// Length of one card block in bytes.
pub const BLOCK_LENGTH: usize = 512;

/// Length of one card block in FIFO words.
pub const WORDS_PER_BLOCK: usize = BLOCK_LENGTH / 2;

/// Byte order the controller uses when packing card bytes into FIFO words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndianMode {
    /// First card byte in the low half of the word.
    Little,
    /// First card byte in the high half of the word.
    Big,
}

/// Card family as found during identification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CardKind {
    /// Standard capacity SD card, byte addressed.
    Sd,
    /// High capacity SD card, block addressed.
    Sdhc,
    /// MultiMediaCard, byte addressed.
    Mmc,
}

/// What the controller learned about the card while identifying it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CardInfo {
    /// Relative card address used to select the card.
    pub rca: u16,
    pub kind: CardKind,
    /// Number of 512-byte sectors on the card.
    pub total_sectors: u32,
    /// Card identification register, as the 8 response words of CMD2.
    pub cid: [u16; 8],
    /// Card specific data register, as the 8 response words of CMD9.
    pub csd: [u16; 8],
}

impl CardInfo {
    /// High capacity cards take block numbers instead of byte addresses.
    pub fn is_high_capacity(&self) -> bool {
        self.kind == CardKind::Sdhc
    }

    /// Card address of `sector` for data transfer commands.
    pub fn sector_address(&self, sector: u32) -> u32 {
        if self.is_high_capacity() {
            sector
        } else {
            sector.wrapping_mul(BLOCK_LENGTH as u32)
        }
    }
}

/// Synchronous MMC/SD host controller.
pub trait Mmcsd {
    /// The identified card, or `None` if no card has been identified.
    fn card(&self) -> Option<CardInfo>;

    /// Read `buf.len() / WORDS_PER_BLOCK` blocks starting at `card_addr`.
    ///
    /// `buf` must be non-empty and hold a whole number of blocks. Returns
    /// `NODEVICE` if no card is identified, `INVAL` for a bad buffer, `BUSY`
    /// if the controller did not answer within the polling budget, and
    /// `FAIL` if the transfer kept failing its checks.
    fn read(&self, card_addr: u32, buf: &mut [u16]) -> Result<(), ErrorCode>;

    /// Write `buf.len() / WORDS_PER_BLOCK` blocks starting at `card_addr`.
    ///
    /// Same buffer rules and errors as [`Mmcsd::read`].
    fn write(&self, card_addr: u32, buf: &[u16]) -> Result<(), ErrorCode>;

    fn read_endian_mode(&self) -> EndianMode;
    fn set_read_endian_mode(&self, mode: EndianMode);
    fn write_endian_mode(&self) -> EndianMode;
    fn set_write_endian_mode(&self, mode: EndianMode);
}
