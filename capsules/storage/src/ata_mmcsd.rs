// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! ATA media backend for MMC/SD cards.
//!
//! `AtaMmcState` is the state of one mounted card: the transport that
//! reaches it, a one-sector read buffer with a word cursor for streamed
//! reads, the write cache, and the swap mode used for every transfer.
//!
//! Usage
//! -----
//!
//! ```rust,ignore
//! let transport = MmcsdTransport::new(mmcsd);
//! let mut read_buf = [0; SECTOR_WORDS];
//! let mut cache_buf = [0; WRITE_CACHE_WORDS];
//! let mut media = AtaMmcState::new(
//!     &transport,
//!     &mut read_buf,
//!     &mut cache_buf,
//!     SwapMode::NoSwap,
//! );
//! media.set_error_client(&fs_errors);
//!
//! media.issue_read_command(boot_sector, 1)?;
//! let signature = media.read_word_at(255)?;
//! ```
//!
//! Reads always see earlier writes: a read that touches a sector still held
//! by the write cache flushes the cache first, and a write to the sector in
//! the read buffer makes the stream load it again. Reads of other sectors
//! leave the cache alone, so a run that can no longer be written (the card
//! shrank or was swapped) does not block reads. `discard_pending_writes`
//! drops such a run.

use kernel::debug;

use crate::ata::{
    AtaError, AtaErrorClient, AtaMedia, AtaSerialId, FatClock, SwapMode, SECTOR_WORDS,
};
use crate::sector_transport::SectorTransport;
use crate::sector_write_cache::SectorWriteCache;

pub struct AtaMmcState<'a, T: SectorTransport> {
    transport: &'a T,
    read_buf: &'a mut [u16; SECTOR_WORDS],
    /// Sector the stream is in.
    sector: u32,
    /// `read_buf` holds `sector`.
    loaded: bool,
    /// Next word of `sector` to return; `SECTOR_WORDS` once it is used up.
    cursor: usize,
    cache: SectorWriteCache<'a>,
    swap: SwapMode,
    error_client: Option<&'a dyn AtaErrorClient>,
    clock: Option<&'a dyn FatClock>,
}

impl<'a, T: SectorTransport> AtaMmcState<'a, T> {
    pub fn new(
        transport: &'a T,
        read_buf: &'a mut [u16; SECTOR_WORDS],
        cache_buf: &'a mut [u16],
        swap: SwapMode,
    ) -> AtaMmcState<'a, T> {
        AtaMmcState {
            transport,
            read_buf,
            sector: 0,
            loaded: false,
            cursor: 0,
            cache: SectorWriteCache::new(cache_buf),
            swap,
            error_client: None,
            clock: None,
        }
    }

    pub fn set_error_client(&mut self, client: &'a dyn AtaErrorClient) {
        self.error_client = Some(client);
    }

    pub fn set_clock(&mut self, clock: &'a dyn FatClock) {
        self.clock = Some(clock);
    }

    pub fn swap_mode(&self) -> SwapMode {
        self.swap
    }

    /// Change the swap mode of later transfers. Sectors already in the write
    /// cache are written with the mode they were given.
    pub fn set_swap_mode(&mut self, swap: SwapMode) -> Result<(), AtaError> {
        if swap != self.swap {
            let result = self.cache.flush(self.transport);
            self.report(result)?;
            self.swap = swap;
            // The buffered sector was read with the old mode.
            self.loaded = false;
        }
        Ok(())
    }

    /// Sectors waiting in the write cache.
    pub fn pending_writes(&self) -> usize {
        self.cache.pending()
    }

    /// Drop every sector waiting in the write cache without writing it.
    /// Returns how many were dropped.
    pub fn discard_pending_writes(&mut self) -> usize {
        let dropped = self.cache.discard();
        if dropped > 0 && kernel::config::CONFIG.debug_write_cache {
            debug!("ata mmcsd: dropped {} pending sectors", dropped);
        }
        dropped
    }

    fn report<R>(&self, result: Result<R, AtaError>) -> Result<R, AtaError> {
        if let Err(e) = result {
            if let Some(client) = self.error_client {
                client.ata_error(e);
            }
        }
        result
    }

    /// Flush the write cache if it holds any of `count` sectors at `start`.
    fn flush_overlapping(&mut self, start: u32, count: u32) -> Result<(), AtaError> {
        let overlaps = match self.cache.first_pending() {
            None => false,
            Some(first) => {
                let end = first as u64 + self.cache.pending() as u64;
                (start as u64) < end && (first as u64) < start as u64 + count as u64
            }
        };
        if overlaps {
            self.cache.flush(self.transport)?;
        }
        Ok(())
    }

    /// Stop trusting the read buffer if it holds one of `count` sectors at
    /// `start`.
    fn invalidate_overlapping(&mut self, start: u32, count: u32) {
        let sector = self.sector as u64;
        if (start as u64) <= sector && sector < start as u64 + count as u64 {
            self.loaded = false;
        }
    }

    /// Load `sector` into the read buffer and make it the sector the stream
    /// is in. On error the stream stays where it was and the next read
    /// loads again.
    fn load_sector(&mut self, sector: u32) -> Result<(), AtaError> {
        self.flush_overlapping(sector, 1)?;
        self.loaded = false;
        self.transport
            .read_sector(sector, &mut self.read_buf[..], self.swap)?;
        self.sector = sector;
        self.loaded = true;
        Ok(())
    }

    fn start_read(&mut self, sector: u32, count: u16) -> Result<(), AtaError> {
        if count == 0 || sector >= self.transport.total_sectors() {
            return Err(AtaError::InvalidParam);
        }
        self.sector = sector;
        self.loaded = false;
        self.cursor = 0;
        self.load_sector(sector)
    }

    fn next_word(&mut self) -> Result<u16, AtaError> {
        if self.cursor >= SECTOR_WORDS {
            self.load_sector(self.sector.wrapping_add(1))?;
            self.cursor = 0;
        } else if !self.loaded {
            self.load_sector(self.sector)?;
        }
        let word = self.read_buf[self.cursor];
        self.cursor += 1;
        Ok(word)
    }

    fn word_at(&mut self, offset: u16) -> Result<u16, AtaError> {
        let offset = offset as usize;
        if offset >= 2 * SECTOR_WORDS {
            return Err(AtaError::InvalidParam);
        }
        let (target, cursor) = if offset >= SECTOR_WORDS {
            (self.sector.wrapping_add(1), offset - SECTOR_WORDS)
        } else {
            (self.sector, offset)
        };
        if target != self.sector || !self.loaded {
            self.load_sector(target)?;
        }
        self.cursor = cursor;
        self.next_word()
    }

    fn next_n_words(&mut self, buf: &mut [u16]) -> Result<(), AtaError> {
        if buf.is_empty() {
            return Err(AtaError::InvalidParam);
        }
        for word in buf.iter_mut() {
            *word = self.next_word()?;
        }
        Ok(())
    }

    /// Read `count` whole sectors at `start` into `buf`, bypassing the
    /// streamed read buffer.
    pub fn read_n_sectors(
        &mut self,
        start: u32,
        count: u32,
        buf: &mut [u16],
    ) -> Result<(), AtaError> {
        let result = self
            .flush_overlapping(start, count)
            .and_then(|()| self.transport.read_n_sectors(start, count, buf, self.swap));
        self.report(result)
    }

    /// Write `count` whole sectors at `start` from `buf` in one transfer.
    ///
    /// Sectors held by the write cache go out first so that the card sees
    /// the writes in the order they were made.
    pub fn write_n_sectors(&mut self, start: u32, count: u32, buf: &[u16]) -> Result<(), AtaError> {
        self.invalidate_overlapping(start, count);
        let result = self
            .cache
            .flush(self.transport)
            .and_then(|()| self.transport.write_n_sectors(start, count, buf, self.swap));
        self.report(result)
    }

    /// Card identification register, most significant word first.
    pub fn read_cid(&self) -> Result<[u16; 8], AtaError> {
        self.report(self.transport.card_id())
    }

    /// Card specific data register, most significant word first.
    pub fn read_csd(&self) -> Result<[u16; 8], AtaError> {
        self.report(self.transport.card_specific_data())
    }

    /// Write back everything held in the write cache and end the read
    /// stream. The session stays usable.
    pub fn close(&mut self) -> Result<(), AtaError> {
        let result = self.cache.flush(self.transport);
        self.loaded = false;
        self.cursor = SECTOR_WORDS;
        if result.is_ok() && kernel::config::CONFIG.trace_sector_io {
            debug!("ata mmcsd: session closed");
        }
        self.report(result)
    }
}

impl<T: SectorTransport> AtaMedia for AtaMmcState<'_, T> {
    /// Card resets happen during identification; this only ends the read
    /// stream.
    fn reset(&mut self) -> Result<(), AtaError> {
        self.loaded = false;
        self.cursor = SECTOR_WORDS;
        Ok(())
    }

    // The controller is polled to completion on every call, so it is never
    // left busy or with data waiting between calls.

    fn command_ready_status_check(&mut self) -> Result<(), AtaError> {
        Ok(())
    }

    fn busy_status_check(&mut self) -> Result<(), AtaError> {
        Ok(())
    }

    fn data_ready_status_check(&mut self) -> Result<(), AtaError> {
        Ok(())
    }

    /// The CID words followed by zeros.
    fn serial_id(&mut self, id: &mut AtaSerialId) -> Result<(), AtaError> {
        let cid = self.read_cid()?;
        id.fill(0);
        id[..cid.len()].copy_from_slice(&cid);
        Ok(())
    }

    fn issue_read_command(&mut self, sector: u32, count: u16) -> Result<(), AtaError> {
        let result = self.start_read(sector, count);
        self.report(result)
    }

    fn read_next_word(&mut self) -> Result<u16, AtaError> {
        let result = self.next_word();
        self.report(result)
    }

    fn read_word_at(&mut self, offset: u16) -> Result<u16, AtaError> {
        let result = self.word_at(offset);
        self.report(result)
    }

    fn read_next_n_words(&mut self, buf: &mut [u16]) -> Result<(), AtaError> {
        let result = self.next_n_words(buf);
        self.report(result)
    }

    fn write_sector(&mut self, sector: u32, data: &[u16], last: bool) -> Result<(), AtaError> {
        self.invalidate_overlapping(sector, 1);
        let result = self
            .cache
            .write(self.transport, sector, data, last, self.swap);
        self.report(result)
    }

    fn write_sector_flush(&mut self) -> Result<(), AtaError> {
        let result = self.cache.flush(self.transport);
        self.report(result)
    }

    fn flush_fat(&mut self) -> Result<(), AtaError> {
        Ok(())
    }

    fn file_system_type(&mut self) -> u16 {
        0
    }

    fn get_time(&self) -> u16 {
        self.clock.map_or(0, |clock| clock.time())
    }

    fn get_date(&self) -> u16 {
        self.clock.map_or(0, |clock| clock.date())
    }

    fn get_mod_time(&self) -> u16 {
        self.get_time()
    }

    fn get_mod_date(&self) -> u16 {
        self.get_date()
    }
}
