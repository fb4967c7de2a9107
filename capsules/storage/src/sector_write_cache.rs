// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Coalesce contiguous sector writes into multi-sector transfers.
//!
//! A FAT filesystem writes a file one sector at a time, almost always to
//! ascending sector numbers. The cache keeps such a run in a caller provided
//! buffer and hands it to the transport as one `write_n_sectors` transfer
//! when the run ends: the next sector does not follow the run, the caller
//! marks a sector as the last one, or the buffer is full.
//!
//! ```text
//!   write(10) write(11) write(12) write(13, last)
//!   |-- held --|-- held --|-- held --|--> write_n_sectors(10, 4)
//!
//!   write(10) write(50)
//!   |-- held --|--> write_sector(10), 50 held
//! ```
//!
//! The buffer length decides the number of slots: one slot per
//! [`SECTOR_WORDS`] words. A buffer shorter than one sector turns the cache
//! into a pass-through.
//!
//! Failed transfers
//! ----------------
//!
//! Errors from the transport are returned unchanged. The sector passed to a
//! call that fails is never part of the cache afterwards, so the caller may
//! retry it. A run whose flush failed stays pending: `flush()` retries it and
//! `discard()` drops it.

use kernel::debug;

use crate::ata::{AtaError, SwapMode, SECTOR_WORDS};
use crate::sector_transport::SectorTransport;

/// Slots in the cache the MMC/SD session uses.
pub const WRITE_CACHE_SLOTS: usize = 4;

/// Buffer length for a cache of [`WRITE_CACHE_SLOTS`] slots.
pub const WRITE_CACHE_WORDS: usize = WRITE_CACHE_SLOTS * SECTOR_WORDS;

pub struct SectorWriteCache<'a> {
    buffer: &'a mut [u16],
    /// Sector held in slot 0.
    first: u32,
    /// Slots in use; slot `i` holds sector `first + i`.
    pending: usize,
    /// Swap mode every pending sector was written with.
    swap: SwapMode,
}

impl<'a> SectorWriteCache<'a> {
    pub fn new(buffer: &'a mut [u16]) -> SectorWriteCache<'a> {
        SectorWriteCache {
            buffer,
            first: 0,
            pending: 0,
            swap: SwapMode::NoSwap,
        }
    }

    /// Number of sectors the cache can hold.
    pub fn capacity(&self) -> usize {
        self.buffer.len() / SECTOR_WORDS
    }

    /// Number of sectors waiting to be written.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// First sector of the pending run.
    pub fn first_pending(&self) -> Option<u32> {
        if self.pending == 0 {
            None
        } else {
            Some(self.first)
        }
    }

    /// Whether `sector` is waiting in the cache.
    pub fn contains(&self, sector: u32) -> bool {
        self.pending > 0 && sector >= self.first && ((sector - self.first) as usize) < self.pending
    }

    /// Whether `sector` written with `swap` extends the pending run.
    fn extends_run(&self, sector: u32, swap: SwapMode) -> bool {
        swap == self.swap && self.first.checked_add(self.pending as u32) == Some(sector)
    }

    /// Write `data` to `sector`, holding it back if it may be followed by
    /// the next sector.
    ///
    /// `data` must be exactly one sector. With `last` set the cache is empty
    /// when this returns `Ok`.
    pub fn write<T: SectorTransport + ?Sized>(
        &mut self,
        transport: &T,
        sector: u32,
        data: &[u16],
        last: bool,
        swap: SwapMode,
    ) -> Result<(), AtaError> {
        if data.len() != SECTOR_WORDS {
            return Err(AtaError::InvalidParam);
        }

        if self.pending > 0 && !self.extends_run(sector, swap) {
            self.flush(transport)?;
        }

        if self.pending == 0 && (last || self.capacity() == 0) {
            return transport.write_sector(sector, data, swap);
        }

        if self.pending == 0 {
            self.first = sector;
            self.swap = swap;
        }
        let slot = self.pending * SECTOR_WORDS;
        self.buffer[slot..slot + SECTOR_WORDS].copy_from_slice(data);
        self.pending += 1;

        if kernel::config::CONFIG.debug_write_cache {
            debug!(
                "write cache: sector {} in slot {} of run at {}",
                sector,
                self.pending - 1,
                self.first
            );
        }

        if last || self.pending == self.capacity() {
            if let Err(e) = self.flush(transport) {
                // The run stays pending without the sector of this call.
                self.pending -= 1;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Write the pending run to the transport as one transfer.
    pub fn flush<T: SectorTransport + ?Sized>(&mut self, transport: &T) -> Result<(), AtaError> {
        let result = match self.pending {
            0 => return Ok(()),
            1 => transport.write_sector(self.first, &self.buffer[..SECTOR_WORDS], self.swap),
            n => transport.write_n_sectors(
                self.first,
                n as u32,
                &self.buffer[..n * SECTOR_WORDS],
                self.swap,
            ),
        };

        match result {
            Ok(()) => {
                if kernel::config::CONFIG.debug_write_cache {
                    debug!("write cache: flushed {} sectors at {}", self.pending, self.first);
                }
                self.pending = 0;
                Ok(())
            }
            Err(e) => {
                debug!(
                    "write cache: flushing {} sectors at {} failed: {:?}",
                    self.pending, self.first, e
                );
                Err(e)
            }
        }
    }

    /// Drop the pending run without writing it. Returns the number of
    /// sectors dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending;
        self.pending = 0;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::vec::Vec;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Call {
        WriteSector(u32),
        WriteNSectors(u32, u32),
    }

    /// Records every write; words of sector `s` are expected to be `s as u16`.
    struct RecordingTransport {
        calls: RefCell<Vec<Call>>,
        swaps: RefCell<Vec<SwapMode>>,
        fail_next: Cell<Option<AtaError>>,
    }

    impl RecordingTransport {
        fn new() -> RecordingTransport {
            RecordingTransport {
                calls: RefCell::new(Vec::new()),
                swaps: RefCell::new(Vec::new()),
                fail_next: Cell::new(None),
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.borrow().clone()
        }

        fn record(&self, call: Call, swap: SwapMode) -> Result<(), AtaError> {
            self.calls.borrow_mut().push(call);
            self.swaps.borrow_mut().push(swap);
            match self.fail_next.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    impl SectorTransport for RecordingTransport {
        fn total_sectors(&self) -> u32 {
            u32::MAX
        }

        fn card_id(&self) -> Result<[u16; 8], AtaError> {
            Err(AtaError::Unsupported)
        }

        fn card_specific_data(&self) -> Result<[u16; 8], AtaError> {
            Err(AtaError::Unsupported)
        }

        fn write_sector(&self, sector: u32, buf: &[u16], swap: SwapMode) -> Result<(), AtaError> {
            assert_eq!(buf.len(), SECTOR_WORDS);
            assert!(buf.iter().all(|w| *w == sector as u16));
            self.record(Call::WriteSector(sector), swap)
        }

        fn write_n_sectors(
            &self,
            start: u32,
            count: u32,
            buf: &[u16],
            swap: SwapMode,
        ) -> Result<(), AtaError> {
            assert_eq!(buf.len(), count as usize * SECTOR_WORDS);
            for (i, sector) in buf.chunks(SECTOR_WORDS).enumerate() {
                let expected = start.wrapping_add(i as u32) as u16;
                assert!(sector.iter().all(|w| *w == expected));
            }
            self.record(Call::WriteNSectors(start, count), swap)
        }

        fn read_sector(&self, _: u32, _: &mut [u16], _: SwapMode) -> Result<(), AtaError> {
            Err(AtaError::Unsupported)
        }

        fn read_n_sectors(
            &self,
            _: u32,
            _: u32,
            _: &mut [u16],
            _: SwapMode,
        ) -> Result<(), AtaError> {
            Err(AtaError::Unsupported)
        }
    }

    fn sector(n: u32) -> [u16; SECTOR_WORDS] {
        [n as u16; SECTOR_WORDS]
    }

    fn write(
        cache: &mut SectorWriteCache,
        transport: &RecordingTransport,
        n: u32,
        last: bool,
    ) -> Result<(), AtaError> {
        cache.write(transport, n, &sector(n), last, SwapMode::NoSwap)
    }

    #[test]
    fn run_ending_with_last_is_one_transfer() {
        let transport = RecordingTransport::new();
        let mut buf = [0; WRITE_CACHE_WORDS];
        let mut cache = SectorWriteCache::new(&mut buf);

        write(&mut cache, &transport, 10, false).unwrap();
        write(&mut cache, &transport, 11, false).unwrap();
        write(&mut cache, &transport, 12, false).unwrap();
        assert!(transport.calls().is_empty());
        assert_eq!(cache.pending(), 3);

        write(&mut cache, &transport, 13, true).unwrap();
        assert_eq!(transport.calls(), [Call::WriteNSectors(10, 4)]);
        assert!(cache.is_empty());
    }

    #[test]
    fn gap_flushes_single_sector_and_starts_new_run() {
        let transport = RecordingTransport::new();
        let mut buf = [0; WRITE_CACHE_WORDS];
        let mut cache = SectorWriteCache::new(&mut buf);

        write(&mut cache, &transport, 10, false).unwrap();
        write(&mut cache, &transport, 50, false).unwrap();

        assert_eq!(transport.calls(), [Call::WriteSector(10)]);
        assert_eq!(cache.pending(), 1);
        assert_eq!(cache.first_pending(), Some(50));
    }

    #[test]
    fn failed_flush_surfaces_error_and_keeps_run() {
        let transport = RecordingTransport::new();
        let mut buf = [0; WRITE_CACHE_WORDS];
        let mut cache = SectorWriteCache::new(&mut buf);

        write(&mut cache, &transport, 10, false).unwrap();
        write(&mut cache, &transport, 11, false).unwrap();
        transport.fail_next.set(Some(AtaError::Timeout));

        assert_eq!(cache.flush(&transport), Err(AtaError::Timeout));
        assert_eq!(transport.calls(), [Call::WriteNSectors(10, 2)]);
        assert_eq!(cache.pending(), 2);
        assert_eq!(cache.first_pending(), Some(10));

        cache.flush(&transport).unwrap();
        assert_eq!(
            transport.calls(),
            [Call::WriteNSectors(10, 2), Call::WriteNSectors(10, 2)]
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn failed_flush_on_last_does_not_accept_new_sector() {
        let transport = RecordingTransport::new();
        let mut buf = [0; WRITE_CACHE_WORDS];
        let mut cache = SectorWriteCache::new(&mut buf);

        write(&mut cache, &transport, 10, false).unwrap();
        write(&mut cache, &transport, 11, false).unwrap();
        transport.fail_next.set(Some(AtaError::Unsupported));

        assert_eq!(
            write(&mut cache, &transport, 12, true),
            Err(AtaError::Unsupported)
        );
        assert_eq!(transport.calls(), [Call::WriteNSectors(10, 3)]);
        assert_eq!(cache.pending(), 2);
        assert!(!cache.contains(12));

        // Retrying the same sector completes the run.
        write(&mut cache, &transport, 12, true).unwrap();
        assert_eq!(transport.calls()[1], Call::WriteNSectors(10, 3));
        assert!(cache.is_empty());
    }

    #[test]
    fn failed_flush_on_gap_leaves_new_sector_out() {
        let transport = RecordingTransport::new();
        let mut buf = [0; WRITE_CACHE_WORDS];
        let mut cache = SectorWriteCache::new(&mut buf);

        write(&mut cache, &transport, 10, false).unwrap();
        transport.fail_next.set(Some(AtaError::Timeout));

        assert_eq!(
            write(&mut cache, &transport, 20, false),
            Err(AtaError::Timeout)
        );
        assert_eq!(cache.first_pending(), Some(10));
        assert_eq!(cache.pending(), 1);

        assert_eq!(cache.discard(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.flush(&transport), Ok(()));
        assert_eq!(transport.calls().len(), 1);
    }

    #[test]
    fn contiguous_runs_are_one_transfer_each() {
        for run in 1..=WRITE_CACHE_SLOTS as u32 {
            let transport = RecordingTransport::new();
            let mut buf = [0; WRITE_CACHE_WORDS];
            let mut cache = SectorWriteCache::new(&mut buf);

            for n in 100..100 + run {
                write(&mut cache, &transport, n, false).unwrap();
            }
            // A gap ends the run.
            write(&mut cache, &transport, 7, false).unwrap();

            // A full run flushes on its own, before the gap.
            let expected = if run == 1 {
                Call::WriteSector(100)
            } else {
                Call::WriteNSectors(100, run)
            };
            assert_eq!(transport.calls(), [expected]);
            assert_eq!(cache.first_pending(), Some(7));
        }
    }

    #[test]
    fn full_cache_flushes_without_last() {
        let transport = RecordingTransport::new();
        let mut buf = [0; WRITE_CACHE_WORDS];
        let mut cache = SectorWriteCache::new(&mut buf);

        for n in 0..6 {
            write(&mut cache, &transport, n, false).unwrap();
        }
        assert_eq!(transport.calls(), [Call::WriteNSectors(0, 4)]);
        assert_eq!(cache.first_pending(), Some(4));
        assert_eq!(cache.pending(), 2);
    }

    #[test]
    fn non_adjacent_sectors_never_merge() {
        let transport = RecordingTransport::new();
        let mut buf = [0; WRITE_CACHE_WORDS];
        let mut cache = SectorWriteCache::new(&mut buf);

        for n in [5, 7, 6, 8, 9, 3] {
            write(&mut cache, &transport, n, false).unwrap();
        }
        cache.flush(&transport).unwrap();

        assert_eq!(
            transport.calls(),
            [
                Call::WriteSector(5),
                Call::WriteSector(7),
                Call::WriteSector(6),
                Call::WriteNSectors(8, 2),
                Call::WriteSector(3),
            ]
        );
    }

    #[test]
    fn last_on_empty_cache_writes_through() {
        let transport = RecordingTransport::new();
        let mut buf = [0; WRITE_CACHE_WORDS];
        let mut cache = SectorWriteCache::new(&mut buf);

        write(&mut cache, &transport, 42, true).unwrap();
        assert_eq!(transport.calls(), [Call::WriteSector(42)]);
        assert!(cache.is_empty());

        // A last sector after a gap: old run and new sector go separately.
        write(&mut cache, &transport, 1, false).unwrap();
        write(&mut cache, &transport, 9, true).unwrap();
        assert_eq!(
            transport.calls()[1..],
            [Call::WriteSector(1), Call::WriteSector(9)]
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_follows_buffer_length() {
        let transport = RecordingTransport::new();
        let mut buf = [0; 2 * SECTOR_WORDS + 17];
        let mut cache = SectorWriteCache::new(&mut buf);
        assert_eq!(cache.capacity(), 2);

        for n in 0..3 {
            write(&mut cache, &transport, n, false).unwrap();
        }
        assert_eq!(transport.calls(), [Call::WriteNSectors(0, 2)]);
        assert_eq!(cache.pending(), 1);
    }

    #[test]
    fn zero_capacity_passes_through() {
        let transport = RecordingTransport::new();
        let mut buf = [0; SECTOR_WORDS - 1];
        let mut cache = SectorWriteCache::new(&mut buf);
        assert_eq!(cache.capacity(), 0);

        write(&mut cache, &transport, 3, false).unwrap();
        write(&mut cache, &transport, 4, false).unwrap();
        assert_eq!(
            transport.calls(),
            [Call::WriteSector(3), Call::WriteSector(4)]
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn swap_mode_change_ends_run() {
        let transport = RecordingTransport::new();
        let mut buf = [0; WRITE_CACHE_WORDS];
        let mut cache = SectorWriteCache::new(&mut buf);

        cache
            .write(&transport, 1, &sector(1), false, SwapMode::NoSwap)
            .unwrap();
        cache
            .write(&transport, 2, &sector(2), false, SwapMode::NoSwap)
            .unwrap();
        cache
            .write(&transport, 3, &sector(3), true, SwapMode::Swap)
            .unwrap();

        assert_eq!(
            transport.calls(),
            [Call::WriteNSectors(1, 2), Call::WriteSector(3)]
        );
        assert_eq!(
            *transport.swaps.borrow(),
            [SwapMode::NoSwap, SwapMode::Swap]
        );
    }

    #[test]
    fn wrong_length_rejected_without_side_effects() {
        let transport = RecordingTransport::new();
        let mut buf = [0; WRITE_CACHE_WORDS];
        let mut cache = SectorWriteCache::new(&mut buf);

        write(&mut cache, &transport, 1, false).unwrap();
        assert_eq!(
            cache.write(&transport, 9, &[0; 10], true, SwapMode::NoSwap),
            Err(AtaError::InvalidParam)
        );
        assert!(transport.calls().is_empty());
        assert_eq!(cache.pending(), 1);
    }

    #[test]
    fn run_at_end_of_sector_space_does_not_wrap() {
        let transport = RecordingTransport::new();
        let mut buf = [0; WRITE_CACHE_WORDS];
        let mut cache = SectorWriteCache::new(&mut buf);

        write(&mut cache, &transport, u32::MAX, false).unwrap();
        write(&mut cache, &transport, 0, false).unwrap();

        assert_eq!(transport.calls(), [Call::WriteSector(u32::MAX)]);
        assert!(cache.contains(0));
        assert!(!cache.contains(u32::MAX));
    }
}
