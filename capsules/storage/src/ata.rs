// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Interface between an ATA/FAT filesystem and the media it runs on.
//!
//! The filesystem reads sectors as a stream of 16-bit words and writes them
//! one 512-byte sector at a time. Each media backend implements
//! [`AtaMedia`]; errors travel as the 16-bit ATA error codes in
//! [`AtaError`].

use kernel::hil::mmcsd::{EndianMode, WORDS_PER_BLOCK};
use kernel::ErrorCode;

/// Words in one ATA sector.
pub const SECTOR_WORDS: usize = WORDS_PER_BLOCK;

/// Words in a media serial number.
pub const ATA_MEDIA_ID_WORDS: usize = 16;

/// Media serial number as reported to the filesystem.
pub type AtaSerialId = [u16; ATA_MEDIA_ID_WORDS];

/// Status value the filesystem uses for success.
pub const ATA_ERROR_NONE: u16 = 0;

/// Errors reported to the ATA/FAT layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum AtaError {
    Unsupported = 0x0001,
    /// An operation was started while another one was running.
    Nested = 0x0002,
    Timeout = 0x0004,
    BadMedia = 0x0008,
    Eof = 0x0010,
    FileNotFound = 0x0020,
    IdNotFound = 0x0040,
    MediaNotFound = 0x0080,
    MediaRemoved = 0x0100,
    DiskFull = 0x0200,
    InvalidParam = 0x0300,
    InvalidMode = 0x0301,
}

impl From<AtaError> for u16 {
    fn from(err: AtaError) -> u16 {
        err as u16
    }
}

impl TryFrom<u16> for AtaError {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(AtaError::Unsupported),
            0x0002 => Ok(AtaError::Nested),
            0x0004 => Ok(AtaError::Timeout),
            0x0008 => Ok(AtaError::BadMedia),
            0x0010 => Ok(AtaError::Eof),
            0x0020 => Ok(AtaError::FileNotFound),
            0x0040 => Ok(AtaError::IdNotFound),
            0x0080 => Ok(AtaError::MediaNotFound),
            0x0100 => Ok(AtaError::MediaRemoved),
            0x0200 => Ok(AtaError::DiskFull),
            0x0300 => Ok(AtaError::InvalidParam),
            0x0301 => Ok(AtaError::InvalidMode),
            _ => Err(()),
        }
    }
}

/// Translate a controller driver error.
///
/// A spent polling budget is a timeout, an argument the driver rejected or a
/// missing card is an invalid parameter, everything else is unsupported.
impl From<ErrorCode> for AtaError {
    fn from(err: ErrorCode) -> AtaError {
        match err {
            ErrorCode::BUSY => AtaError::Timeout,
            ErrorCode::INVAL | ErrorCode::NODEVICE => AtaError::InvalidParam,
            _ => AtaError::Unsupported,
        }
    }
}

/// Convert a result to the status word the filesystem expects.
pub fn into_ata_status(r: Result<(), AtaError>) -> u16 {
    match r {
        Ok(()) => ATA_ERROR_NONE,
        Err(e) => e.into(),
    }
}

/// Whether sector data is byte swapped on its way to and from the card.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapMode {
    /// Swap the two bytes of each word; the controller runs little endian.
    Swap,
    /// Keep the card byte order; the controller runs big endian.
    NoSwap,
}

impl SwapMode {
    /// Controller endian mode that implements this swap mode.
    pub fn endian(self) -> EndianMode {
        match self {
            SwapMode::Swap => EndianMode::Little,
            SwapMode::NoSwap => EndianMode::Big,
        }
    }
}

/// Receives every error a media backend returns to the filesystem.
pub trait AtaErrorClient {
    fn ata_error(&self, error: AtaError);
}

/// Source of FAT timestamps.
///
/// Both values use the FAT directory entry encoding.
pub trait FatClock {
    /// Hours in bits 15:11, minutes in 10:5, seconds / 2 in 4:0.
    fn time(&self) -> u16;
    /// Years since 1980 in bits 15:9, month in 8:5, day in 4:0.
    fn date(&self) -> u16;
}

/// A storage medium as seen by the ATA/FAT filesystem.
///
/// Reads are streamed: `issue_read_command` positions the medium at a
/// sector, then the `read_*word*` calls return consecutive words and cross
/// into the following sectors as needed. Writes go one sector at a time and
/// may be held back until `last` is set or `write_sector_flush` is called.
pub trait AtaMedia {
    fn reset(&mut self) -> Result<(), AtaError>;
    fn command_ready_status_check(&mut self) -> Result<(), AtaError>;
    fn busy_status_check(&mut self) -> Result<(), AtaError>;
    fn data_ready_status_check(&mut self) -> Result<(), AtaError>;

    fn serial_id(&mut self, id: &mut AtaSerialId) -> Result<(), AtaError>;

    /// Start reading at `sector`. `count` is a hint of how many sectors the
    /// filesystem is going to consume.
    fn issue_read_command(&mut self, sector: u32, count: u16) -> Result<(), AtaError>;

    /// Return the next word of the stream.
    fn read_next_word(&mut self) -> Result<u16, AtaError>;

    /// Return the word `offset` words past the start of the current sector,
    /// moving into the next sector if `offset` lies beyond this one. The
    /// stream continues after the returned word.
    fn read_word_at(&mut self, offset: u16) -> Result<u16, AtaError>;

    /// Fill `buf` from the stream.
    fn read_next_n_words(&mut self, buf: &mut [u16]) -> Result<(), AtaError>;

    /// Write one sector of [`SECTOR_WORDS`] words. `last` marks the end of a
    /// run of writes; everything held back is on the media when it returns.
    fn write_sector(&mut self, sector: u32, data: &[u16], last: bool) -> Result<(), AtaError>;

    /// Put every held back sector on the media.
    fn write_sector_flush(&mut self) -> Result<(), AtaError>;

    fn flush_fat(&mut self) -> Result<(), AtaError>;

    /// Filesystem layout hint; 0 lets the filesystem detect it from the media.
    fn file_system_type(&mut self) -> u16;

    fn get_time(&self) -> u16;
    fn get_date(&self) -> u16;
    fn get_mod_time(&self) -> u16;
    fn get_mod_date(&self) -> u16;
}
