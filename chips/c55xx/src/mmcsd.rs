// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! MMC/SD host controller driver for the C55x.
//!
//! The driver runs the controller in polled mode: every command and every
//! FIFO burst is waited for by reading MMCST0 until the expected event bit
//! shows up, an error bit shows up, or the polling budget is spent.
//!
//! Usage
//! -----
//!
//! ```rust,ignore
//! let mmcsd = static_init!(
//!     c55xx::mmcsd::Mmcsd,
//!     c55xx::mmcsd::Mmcsd::new(c55xx::mmcsd::MMCSD0_BASE)
//! );
//! mmcsd.init(MMCSD_CLOCK_DIVIDER);
//! let card = mmcsd.identify()?;
//! ```
//!
//! After `identify()` succeeds the controller implements
//! `kernel::hil::mmcsd::Mmcsd` for the identified card.

use core::cell::Cell;

use kernel::debug;
use kernel::hil::mmcsd::{self, CardInfo, CardKind, EndianMode, BLOCK_LENGTH, WORDS_PER_BLOCK};
use kernel::utilities::registers::interfaces::{ReadWriteable, Readable, Writeable};
use kernel::utilities::registers::{
    register_bitfields, register_structs, Field, FieldValue, LocalRegisterCopy, ReadOnly,
    ReadWrite, WriteOnly,
};
use kernel::utilities::StaticRef;
use kernel::ErrorCode;

register_structs! {
    /// MMC/SD controller
    pub MmcsdRegisters {
        /// Control register
        (0x00 => mmcctl: ReadWrite<u16, MMCCTL::Register>),
        (0x02 => _reserved0),
        /// Memory clock control register
        (0x04 => mmcclk: ReadWrite<u16, MMCCLK::Register>),
        (0x06 => _reserved1),
        /// Status register 0
        (0x08 => mmcst0: ReadOnly<u16, MMCST0::Register>),
        (0x0A => _reserved2),
        /// Status register 1
        (0x0C => mmcst1: ReadOnly<u16, MMCST1::Register>),
        (0x0E => _reserved3),
        /// Interrupt mask register
        (0x10 => mmcim: ReadWrite<u16, MMCST0::Register>),
        (0x12 => _reserved4),
        /// Response time-out register
        (0x14 => mmctor: ReadWrite<u16>),
        (0x16 => _reserved5),
        /// Data read time-out register
        (0x18 => mmctod: ReadWrite<u16>),
        (0x1A => _reserved6),
        /// Block length register
        (0x1C => mmcblen: ReadWrite<u16>),
        (0x1E => _reserved7),
        /// Number of blocks register
        (0x20 => mmcnblk: ReadWrite<u16>),
        (0x22 => _reserved8),
        /// Number of blocks counter register
        (0x24 => mmcnblc: ReadOnly<u16>),
        (0x26 => _reserved9),
        /// Data receive registers
        (0x28 => mmcdrr1: ReadOnly<u16>),
        (0x2A => mmcdrr2: ReadOnly<u16>),
        /// Data transmit registers
        (0x2C => mmcdxr1: WriteOnly<u16>),
        (0x2E => mmcdxr2: WriteOnly<u16>),
        /// Command registers
        (0x30 => mmccmd1: ReadWrite<u16, MMCCMD1::Register>),
        (0x32 => mmccmd2: ReadWrite<u16, MMCCMD2::Register>),
        /// Argument registers
        (0x34 => mmcarg1: ReadWrite<u16>),
        (0x36 => mmcarg2: ReadWrite<u16>),
        /// Response registers, RSP0 holds the least significant word
        (0x38 => mmcrsp: [ReadOnly<u16>; 8]),
        /// Data response register
        (0x48 => mmcdrsp: ReadOnly<u16>),
        (0x4A => _reserved10),
        /// Command index register
        (0x50 => mmccidx: ReadOnly<u16>),
        (0x52 => _reserved11),
        /// FIFO control register
        (0x64 => mmcfifoctl: ReadWrite<u16, MMCFIFOCTL::Register>),
        (0x66 => @END),
    }
}

register_bitfields![u16,
    MMCCTL [
        /// Data line reset
        DATRST OFFSET(0) NUMBITS(1) [],
        /// Command line reset
        CMDRST OFFSET(1) NUMBITS(1) [],
        /// Data bus width, low bit
        WIDTH0 OFFSET(2) NUMBITS(1) [],
        /// DAT3 edge detection
        DATEG OFFSET(6) NUMBITS(2) [
            Disabled = 0,
            Rising = 1,
            Falling = 2,
            Both = 3
        ],
        /// Data bus width, high bit
        WIDTH1 OFFSET(8) NUMBITS(1) [],
        /// Endian select for the receive FIFO
        PERMDR OFFSET(9) NUMBITS(1) [
            Little = 0,
            Big = 1
        ],
        /// Endian select for the transmit FIFO
        PERMDX OFFSET(10) NUMBITS(1) [
            Little = 0,
            Big = 1
        ]
    ],
    MMCCLK [
        /// Clock divider
        CLKRT OFFSET(0) NUMBITS(8) [],
        /// Clock enable
        CLKEN OFFSET(8) NUMBITS(1) [],
        /// Divide by 4 instead of by 2
        DIV4 OFFSET(9) NUMBITS(1) []
    ],
    MMCST0 [
        /// Data transfer done
        DATDNE OFFSET(0) NUMBITS(1) [],
        /// Busy done
        BSYDNE OFFSET(1) NUMBITS(1) [],
        /// Command or response done
        RSPDNE OFFSET(2) NUMBITS(1) [],
        /// Read data time-out
        TOUTRD OFFSET(3) NUMBITS(1) [],
        /// Response time-out
        TOUTRS OFFSET(4) NUMBITS(1) [],
        /// Write data CRC error
        CRCWR OFFSET(5) NUMBITS(1) [],
        /// Read data CRC error
        CRCRD OFFSET(6) NUMBITS(1) [],
        /// Response CRC error
        CRCRS OFFSET(7) NUMBITS(1) [],
        /// Data transmit ready
        DXRDY OFFSET(9) NUMBITS(1) [],
        /// Data receive ready
        DRRDY OFFSET(10) NUMBITS(1) [],
        /// DAT3 edge detected
        DATED OFFSET(11) NUMBITS(1) [],
        /// Transfer done
        TRNDNE OFFSET(12) NUMBITS(1) []
    ],
    MMCST1 [
        /// Card busy
        BUSY OFFSET(0) NUMBITS(1) [],
        /// Clock stopped
        CLKSTP OFFSET(1) NUMBITS(1) [],
        /// Transmit register empty
        DXEMP OFFSET(2) NUMBITS(1) [],
        /// Receive register full
        DRFUL OFFSET(3) NUMBITS(1) [],
        /// DAT3 status
        DAT3ST OFFSET(4) NUMBITS(1) [],
        /// FIFO empty
        FIFOEMP OFFSET(5) NUMBITS(1) [],
        /// FIFO full
        FIFOFUL OFFSET(6) NUMBITS(1) []
    ],
    MMCCMD1 [
        /// Command index
        CMD OFFSET(0) NUMBITS(6) [],
        /// Push pull enable
        PPLEN OFFSET(7) NUMBITS(1) [],
        /// Busy expected
        BSYEXP OFFSET(8) NUMBITS(1) [],
        /// Response format
        RSPFMT OFFSET(9) NUMBITS(2) [
            NoResponse = 0,
            R1 = 1,
            R2 = 2,
            R3 = 3
        ],
        /// Data transfer direction, set for writes
        DTRW OFFSET(11) NUMBITS(1) [],
        /// Stream mode
        STRMTP OFFSET(12) NUMBITS(1) [],
        /// Data transfer command
        WDATX OFFSET(13) NUMBITS(1) [],
        /// Send initialization clocks first
        INITCK OFFSET(14) NUMBITS(1) [],
        /// Clear the receive FIFO
        DCLR OFFSET(15) NUMBITS(1) []
    ],
    MMCCMD2 [
        /// Start the data transfer
        DMATRIG OFFSET(0) NUMBITS(1) []
    ],
    MMCFIFOCTL [
        /// FIFO reset
        FIFORST OFFSET(0) NUMBITS(1) [],
        /// FIFO direction
        FIFODIR OFFSET(1) NUMBITS(1) [
            Read = 0,
            Write = 1
        ],
        /// FIFO level that raises a ready event
        FIFOLEV OFFSET(2) NUMBITS(1) [
            Bits128 = 0,
            Bits256 = 1
        ],
        /// FIFO access width
        ACCWD OFFSET(3) NUMBITS(2) [
            FourBytes = 0,
            ThreeBytes = 1,
            TwoBytes = 2,
            OneByte = 3
        ]
    ]
];

pub const MMCSD0_BASE: StaticRef<MmcsdRegisters> =
    unsafe { StaticRef::new(0x3A00 as *const MmcsdRegisters) };

pub const MMCSD1_BASE: StaticRef<MmcsdRegisters> =
    unsafe { StaticRef::new(0x3B00 as *const MmcsdRegisters) };

/// Reads of MMCST0 spent waiting for a command response.
const RESPONSE_POLL_BUDGET: u32 = 0xFFFF;
/// Reads of MMCST0 or MMCST1 spent waiting for one data event.
const DATA_POLL_BUDGET: u32 = 0xFFFF;
/// Times a read or write is re-issued after a data error.
const READ_WRITE_RETRY_COUNT: u16 = 1000;
const ACMD41_RETRY_COUNT: u16 = 1000;
const CMD1_RETRY_COUNT: u16 = 1000;

/// Words moved per FIFO ready event with a 256-bit FIFO level.
const FIFO_WORDS: usize = 16;

const CMD8_ARG: u32 = 0x1AA;
const ACMD41_ARG_HCS: u32 = 0x40FF_8000;
const ACMD41_ARG_NOHCS: u32 = 0x00FF_8000;
const CMD1_ARG: u32 = 0x00FF_8000;
/// OCR bit set once the card finished powering up.
const OCR_POWER_UP_DONE: u32 = 0x8000_0000;
/// OCR card capacity status, set by high capacity cards.
const OCR_CCS: u32 = 0x4000_0000;
/// MMC cards get their address assigned by the host.
const MMC_RCA: u16 = 1;

/// Response format of a command, as the card sends it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseFormat {
    None,
    R1,
    /// R1 followed by busy signalling on DAT0
    R1b,
    /// 136-bit CID or CSD
    R2,
    /// OCR
    R3,
    /// Published RCA
    R6,
    /// Card interface condition
    R7,
}

/// Data phase that follows a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataPhase {
    None,
    Read,
    Write,
}

/// One entry of the MMC/SD command table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Command {
    pub index: u8,
    /// Application specific, must follow CMD55.
    pub app: bool,
    pub response: ResponseFormat,
    pub data: DataPhase,
    /// Send the 80 initialization clocks before the command.
    pub init_clocks: bool,
    /// Drive CMD in push-pull instead of open-drain mode.
    pub push_pull: bool,
}

impl Command {
    const fn new(index: u8, response: ResponseFormat) -> Command {
        Command {
            index,
            app: false,
            response,
            data: DataPhase::None,
            init_clocks: false,
            push_pull: false,
        }
    }

    const fn app(index: u8, response: ResponseFormat) -> Command {
        Command {
            app: true,
            ..Command::new(index, response)
        }
    }

    const fn data(index: u8, data: DataPhase) -> Command {
        Command {
            data,
            ..Command::new(index, ResponseFormat::R1)
        }
    }

    /// The MMCCMD1 word that issues this command.
    pub fn encode(&self) -> u16 {
        let mut cmd: LocalRegisterCopy<u16, MMCCMD1::Register> = LocalRegisterCopy::new(0);
        cmd.modify(MMCCMD1::CMD.val(self.index as u16));
        cmd.modify(match self.response {
            ResponseFormat::None => MMCCMD1::RSPFMT::NoResponse,
            ResponseFormat::R1
            | ResponseFormat::R1b
            | ResponseFormat::R6
            | ResponseFormat::R7 => MMCCMD1::RSPFMT::R1,
            ResponseFormat::R2 => MMCCMD1::RSPFMT::R2,
            ResponseFormat::R3 => MMCCMD1::RSPFMT::R3,
        });
        if self.response == ResponseFormat::R1b {
            cmd.modify(MMCCMD1::BSYEXP::SET);
        }
        match self.data {
            DataPhase::None => {}
            DataPhase::Read => cmd.modify(MMCCMD1::WDATX::SET + MMCCMD1::DCLR::SET),
            DataPhase::Write => cmd.modify(MMCCMD1::WDATX::SET + MMCCMD1::DTRW::SET),
        }
        if self.init_clocks {
            cmd.modify(MMCCMD1::INITCK::SET);
        }
        if self.push_pull {
            cmd.modify(MMCCMD1::PPLEN::SET);
        }
        cmd.get()
    }
}

/// CMD0, reset all cards to idle.
pub const GO_IDLE_STATE: Command = Command {
    init_clocks: true,
    ..Command::new(0, ResponseFormat::None)
};
/// CMD1, MMC operating conditions.
pub const SEND_OP_COND: Command = Command::new(1, ResponseFormat::R3);
/// CMD2, ask every card for its CID.
pub const ALL_SEND_CID: Command = Command::new(2, ResponseFormat::R2);
/// CMD3, SD cards publish an RCA, MMC cards are assigned one.
pub const SEND_RELATIVE_ADDR: Command = Command::new(3, ResponseFormat::R6);
/// CMD6 on MMC cards, switch a field of EXT_CSD.
pub const SWITCH: Command = Command::new(6, ResponseFormat::R1b);
/// CMD7, select the card with the given RCA.
pub const SELECT_CARD: Command = Command::new(7, ResponseFormat::R1b);
/// CMD8, interface condition; only v2 SD cards answer.
pub const SEND_IF_COND: Command = Command::new(8, ResponseFormat::R7);
/// CMD9, card specific data.
pub const SEND_CSD: Command = Command::new(9, ResponseFormat::R2);
/// CMD10, card identification.
pub const SEND_CID: Command = Command::new(10, ResponseFormat::R2);
/// CMD12, end a multiple block transfer.
pub const STOP_TRANSMISSION: Command = Command {
    push_pull: true,
    ..Command::new(12, ResponseFormat::R1b)
};
/// CMD13, card status.
pub const SEND_STATUS: Command = Command::new(13, ResponseFormat::R1);
/// CMD16, block length of byte addressed cards.
pub const SET_BLOCKLEN: Command = Command::new(16, ResponseFormat::R1);
/// CMD17
pub const READ_SINGLE_BLOCK: Command = Command::data(17, DataPhase::Read);
/// CMD18
pub const READ_MULTIPLE_BLOCK: Command = Command::data(18, DataPhase::Read);
/// CMD24
pub const WRITE_BLOCK: Command = Command::data(24, DataPhase::Write);
/// CMD25
pub const WRITE_MULTIPLE_BLOCK: Command = Command::data(25, DataPhase::Write);
/// CMD55, next command is application specific.
pub const APP_CMD: Command = Command::new(55, ResponseFormat::R1);
/// CMD58, read OCR. SPI mode only.
pub const READ_OCR: Command = Command::new(58, ResponseFormat::R3);
/// ACMD6, data bus width.
pub const SET_BUS_WIDTH: Command = Command::app(6, ResponseFormat::R1);
/// ACMD23, blocks to pre-erase before a multiple block write.
pub const SET_WR_BLK_ERASE_COUNT: Command = Command::app(23, ResponseFormat::R1);
/// ACMD41, SD operating conditions.
pub const SD_SEND_OP_COND: Command = Command::app(41, ResponseFormat::R3);

/// The response registers after a command completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandResponse {
    pub words: [u16; 8],
}

impl CommandResponse {
    /// 32-bit response of every format except R2.
    pub fn short(&self) -> u32 {
        ((self.words[7] as u32) << 16) | self.words[6] as u32
    }
}

/// Number of 512-byte sectors described by a CSD register.
///
/// `csd` holds the 8 response words of CMD9, least significant word first.
pub fn csd_total_sectors(csd: &[u16; 8], kind: CardKind) -> u32 {
    let mut raw: u128 = 0;
    for (i, word) in csd.iter().enumerate() {
        raw |= (*word as u128) << (16 * i);
    }
    let bits = |hi: u32, lo: u32| -> u32 {
        let mask = (1u128 << (hi - lo + 1)) - 1;
        ((raw >> lo) & mask) as u32
    };

    let structure = bits(127, 126);
    if kind != CardKind::Mmc && structure != 0 {
        // CSD version 2.0
        let c_size = bits(69, 48);
        (c_size + 1).saturating_mul(1024)
    } else {
        // CSD version 1.0 and MMC
        let read_bl_len = bits(83, 80);
        let c_size = bits(73, 62);
        let c_size_mult = bits(49, 47);
        let blocks = (c_size as u64 + 1) << (c_size_mult + 2);
        let bytes = blocks << read_bl_len;
        (bytes / BLOCK_LENGTH as u64).min(u32::MAX as u64) as u32
    }
}

pub struct Mmcsd {
    registers: StaticRef<MmcsdRegisters>,
    card: Cell<Option<CardInfo>>,
    read_endian: Cell<EndianMode>,
    write_endian: Cell<EndianMode>,
}

impl Mmcsd {
    pub const fn new(base: StaticRef<MmcsdRegisters>) -> Mmcsd {
        Mmcsd {
            registers: base,
            card: Cell::new(None),
            read_endian: Cell::new(EndianMode::Little),
            write_endian: Cell::new(EndianMode::Little),
        }
    }

    /// Reset the command and data lines and start the memory clock.
    ///
    /// Forgets any previously identified card.
    pub fn init(&self, clock_divider: u8) {
        let regs = self.registers;
        self.card.set(None);

        regs.mmcctl.write(MMCCTL::CMDRST::SET + MMCCTL::DATRST::SET);
        regs.mmcclk
            .write(MMCCLK::CLKRT.val(clock_divider as u16) + MMCCLK::CLKEN::SET);
        regs.mmctor.set(0x00FF);
        regs.mmctod.set(0xFFFF);
        // Polled mode, no interrupts.
        regs.mmcim.set(0);
        regs.mmcctl.write(
            MMCCTL::CMDRST::CLEAR
                + MMCCTL::DATRST::CLEAR
                + MMCCTL::DATEG::Disabled
                + Self::permdr(self.read_endian.get())
                + Self::permdx(self.write_endian.get()),
        );
    }

    fn permdr(mode: EndianMode) -> FieldValue<u16, MMCCTL::Register> {
        match mode {
            EndianMode::Little => MMCCTL::PERMDR::Little,
            EndianMode::Big => MMCCTL::PERMDR::Big,
        }
    }

    fn permdx(mode: EndianMode) -> FieldValue<u16, MMCCTL::Register> {
        match mode {
            EndianMode::Little => MMCCTL::PERMDX::Little,
            EndianMode::Big => MMCCTL::PERMDX::Big,
        }
    }

    /// Read MMCST0 until `event` is set.
    ///
    /// Any time-out or CRC bit ends the wait with `FAIL`; running out of
    /// polls ends it with `BUSY`.
    fn wait_for(&self, event: Field<u16, MMCST0::Register>, budget: u32) -> Result<(), ErrorCode> {
        for _ in 0..budget {
            let status = self.registers.mmcst0.extract();
            if status.is_set(MMCST0::TOUTRS)
                || status.is_set(MMCST0::CRCRS)
                || status.is_set(MMCST0::TOUTRD)
                || status.is_set(MMCST0::CRCRD)
                || status.is_set(MMCST0::CRCWR)
            {
                return Err(ErrorCode::FAIL);
            }
            if status.is_set(event) {
                return Ok(());
            }
        }
        Err(ErrorCode::BUSY)
    }

    /// Wait for the card to release DAT0 after a write.
    fn wait_not_busy(&self) -> Result<(), ErrorCode> {
        for _ in 0..DATA_POLL_BUDGET {
            if !self.registers.mmcst1.is_set(MMCST1::BUSY) {
                return Ok(());
            }
        }
        Err(ErrorCode::BUSY)
    }

    /// Issue `cmd` with `arg` and wait for its response.
    pub fn send_command(&self, cmd: Command, arg: u32) -> Result<CommandResponse, ErrorCode> {
        let regs = self.registers;

        regs.mmcarg1.set(arg as u16);
        regs.mmcarg2.set((arg >> 16) as u16);
        regs.mmccmd1.set(cmd.encode());

        self.wait_for(MMCST0::RSPDNE, RESPONSE_POLL_BUDGET)?;
        if cmd.response == ResponseFormat::R1b {
            self.wait_for(MMCST0::BSYDNE, RESPONSE_POLL_BUDGET)?;
        }

        let mut words = [0; 8];
        for (word, rsp) in words.iter_mut().zip(regs.mmcrsp.iter()) {
            *word = rsp.get();
        }
        Ok(CommandResponse { words })
    }

    fn send_app_command(
        &self,
        cmd: Command,
        rca: u16,
        arg: u32,
    ) -> Result<CommandResponse, ErrorCode> {
        self.send_command(APP_CMD, (rca as u32) << 16)?;
        self.send_command(cmd, arg)
    }

    /// Run the SD power up loop. Returns the OCR once the card is ready.
    fn sd_power_up(&self, v2_card: bool) -> Result<u32, ErrorCode> {
        let arg = if v2_card {
            ACMD41_ARG_HCS
        } else {
            ACMD41_ARG_NOHCS
        };
        for _ in 0..ACMD41_RETRY_COUNT {
            let ocr = self.send_app_command(SD_SEND_OP_COND, 0, arg)?.short();
            if ocr & OCR_POWER_UP_DONE != 0 {
                return Ok(ocr);
            }
        }
        Err(ErrorCode::BUSY)
    }

    fn mmc_power_up(&self) -> Result<u32, ErrorCode> {
        for _ in 0..CMD1_RETRY_COUNT {
            let ocr = self.send_command(SEND_OP_COND, CMD1_ARG)?.short();
            if ocr & OCR_POWER_UP_DONE != 0 {
                return Ok(ocr);
            }
        }
        Err(ErrorCode::BUSY)
    }

    /// Identify the card in the slot and select it for data transfers.
    pub fn identify(&self) -> Result<CardInfo, ErrorCode> {
        self.card.set(None);

        self.send_command(GO_IDLE_STATE, 0)?;
        let v2_card = match self.send_command(SEND_IF_COND, CMD8_ARG) {
            Ok(response) => response.short() & 0xFFF == CMD8_ARG,
            // Version 1 cards do not answer CMD8.
            Err(ErrorCode::FAIL) => false,
            Err(e) => return Err(e),
        };

        let kind = match self.sd_power_up(v2_card) {
            Ok(ocr) if ocr & OCR_CCS != 0 => CardKind::Sdhc,
            Ok(_) => CardKind::Sd,
            Err(_) => {
                // Not an SD card, try the MMC power up sequence.
                self.send_command(GO_IDLE_STATE, 0)?;
                self.mmc_power_up()?;
                CardKind::Mmc
            }
        };

        let cid = self.send_command(ALL_SEND_CID, 0)?.words;
        let rca = if kind == CardKind::Mmc {
            self.send_command(SEND_RELATIVE_ADDR, (MMC_RCA as u32) << 16)?;
            MMC_RCA
        } else {
            (self.send_command(SEND_RELATIVE_ADDR, 0)?.short() >> 16) as u16
        };
        let csd = self.send_command(SEND_CSD, (rca as u32) << 16)?.words;
        self.send_command(SELECT_CARD, (rca as u32) << 16)?;
        if kind != CardKind::Sdhc {
            self.send_command(SET_BLOCKLEN, BLOCK_LENGTH as u32)?;
        }

        let info = CardInfo {
            rca,
            kind,
            total_sectors: csd_total_sectors(&csd, kind),
            cid,
            csd,
        };
        debug!(
            "mmcsd: {:?} card rca {:#x}, {} sectors",
            info.kind, info.rca, info.total_sectors
        );
        self.card.set(Some(info));
        Ok(info)
    }

    fn block_count(len: usize) -> Result<u16, ErrorCode> {
        if len == 0 || !len.is_multiple_of(WORDS_PER_BLOCK) {
            return Err(ErrorCode::INVAL);
        }
        u16::try_from(len / WORDS_PER_BLOCK).map_err(|_| ErrorCode::SIZE)
    }

    /// End a multiple block transfer that failed part way. The retry that
    /// follows starts with a fresh command either way.
    fn stop_after_failure(&self, card_addr: u32) {
        if let Err(e) = self.send_command(STOP_TRANSMISSION, 0) {
            debug!("mmcsd: stop after failed transfer at {:#x}: {:?}", card_addr, e);
        }
    }

    fn start_transfer(&self, cmd: Command, card_addr: u32, blocks: u16, direction: DataPhase) {
        let regs = self.registers;

        regs.mmcblen.set(BLOCK_LENGTH as u16);
        regs.mmcnblk.set(blocks);

        let fifo_direction = match direction {
            DataPhase::Write => MMCFIFOCTL::FIFODIR::Write,
            _ => MMCFIFOCTL::FIFODIR::Read,
        };
        regs.mmcfifoctl.write(MMCFIFOCTL::FIFORST::SET);
        regs.mmcfifoctl
            .write(fifo_direction + MMCFIFOCTL::ACCWD::TwoBytes + MMCFIFOCTL::FIFOLEV::Bits256);

        regs.mmcarg1.set(card_addr as u16);
        regs.mmcarg2.set((card_addr >> 16) as u16);
        regs.mmccmd1.set(cmd.encode());
        regs.mmccmd2.write(MMCCMD2::DMATRIG::SET);
    }

    fn read_attempt(
        &self,
        cmd: Command,
        card_addr: u32,
        blocks: u16,
        buf: &mut [u16],
    ) -> Result<(), ErrorCode> {
        let regs = self.registers;
        let big = self.read_endian.get() == EndianMode::Big;

        regs.mmcctl.modify(Self::permdr(self.read_endian.get()));
        self.start_transfer(cmd, card_addr, blocks, DataPhase::Read);

        for chunk in buf.chunks_mut(FIFO_WORDS) {
            self.wait_for(MMCST0::DRRDY, DATA_POLL_BUDGET)?;
            for word in chunk {
                *word = if big {
                    regs.mmcdrr2.get()
                } else {
                    regs.mmcdrr1.get()
                };
            }
        }
        self.wait_for(MMCST0::DATDNE, DATA_POLL_BUDGET)?;

        if blocks > 1 {
            self.send_command(STOP_TRANSMISSION, 0)?;
        }
        Ok(())
    }

    fn write_attempt(
        &self,
        cmd: Command,
        card_addr: u32,
        blocks: u16,
        buf: &[u16],
    ) -> Result<(), ErrorCode> {
        let regs = self.registers;
        let big = self.write_endian.get() == EndianMode::Big;

        self.wait_not_busy()?;
        regs.mmcctl.modify(Self::permdx(self.write_endian.get()));
        self.start_transfer(cmd, card_addr, blocks, DataPhase::Write);

        for chunk in buf.chunks(FIFO_WORDS) {
            self.wait_for(MMCST0::DXRDY, DATA_POLL_BUDGET)?;
            for word in chunk {
                if big {
                    regs.mmcdxr2.set(*word);
                } else {
                    regs.mmcdxr1.set(*word);
                }
            }
        }
        self.wait_for(MMCST0::DATDNE, DATA_POLL_BUDGET)?;

        if blocks > 1 {
            self.send_command(STOP_TRANSMISSION, 0)?;
        }
        self.wait_not_busy()
    }
}

impl mmcsd::Mmcsd for Mmcsd {
    fn card(&self) -> Option<CardInfo> {
        self.card.get()
    }

    fn read(&self, card_addr: u32, buf: &mut [u16]) -> Result<(), ErrorCode> {
        self.card.get().ok_or(ErrorCode::NODEVICE)?;
        let blocks = Self::block_count(buf.len())?;
        let cmd = if blocks > 1 {
            READ_MULTIPLE_BLOCK
        } else {
            READ_SINGLE_BLOCK
        };

        for _ in 0..READ_WRITE_RETRY_COUNT {
            match self.read_attempt(cmd, card_addr, blocks, buf) {
                Err(ErrorCode::FAIL) => {
                    if blocks > 1 {
                        self.stop_after_failure(card_addr);
                    }
                }
                result => return result,
            }
        }
        debug!("mmcsd: read at {:#x} kept failing", card_addr);
        Err(ErrorCode::FAIL)
    }

    fn write(&self, card_addr: u32, buf: &[u16]) -> Result<(), ErrorCode> {
        self.card.get().ok_or(ErrorCode::NODEVICE)?;
        let blocks = Self::block_count(buf.len())?;
        let cmd = if blocks > 1 {
            WRITE_MULTIPLE_BLOCK
        } else {
            WRITE_BLOCK
        };

        for _ in 0..READ_WRITE_RETRY_COUNT {
            match self.write_attempt(cmd, card_addr, blocks, buf) {
                Err(ErrorCode::FAIL) => {
                    if blocks > 1 {
                        self.stop_after_failure(card_addr);
                    }
                }
                result => return result,
            }
        }
        debug!("mmcsd: write at {:#x} kept failing", card_addr);
        Err(ErrorCode::FAIL)
    }

    fn read_endian_mode(&self) -> EndianMode {
        self.read_endian.get()
    }

    fn set_read_endian_mode(&self, mode: EndianMode) {
        self.read_endian.set(mode);
        self.registers.mmcctl.modify(Self::permdr(mode));
    }

    fn write_endian_mode(&self) -> EndianMode {
        self.write_endian.get()
    }

    fn set_write_endian_mode(&self, mode: EndianMode) {
        self.write_endian.set(mode);
        self.registers.mmcctl.modify(Self::permdx(mode));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel::hil::mmcsd::Mmcsd as _;
    use std::boxed::Box;

    const MMCCTL_OFFSET: usize = 0x00;
    const MMCST0_OFFSET: usize = 0x08;
    const MMCNBLK_OFFSET: usize = 0x20;
    const MMCDRR1_OFFSET: usize = 0x28;
    const MMCDRR2_OFFSET: usize = 0x2A;
    const MMCDXR1_OFFSET: usize = 0x2C;
    const MMCDXR2_OFFSET: usize = 0x2E;
    const MMCCMD1_OFFSET: usize = 0x30;
    const MMCARG1_OFFSET: usize = 0x34;
    const MMCARG2_OFFSET: usize = 0x36;
    const MMCRSP6_OFFSET: usize = 0x44;
    const MMCRSP7_OFFSET: usize = 0x46;

    /// Register window backed by host RAM. Status bits written here stay set,
    /// so every wait on them succeeds at once.
    struct FakeWindow {
        base: *mut u16,
    }

    impl FakeWindow {
        fn new() -> (FakeWindow, Mmcsd) {
            let mem: &'static mut [u16; 0x33] = Box::leak(Box::new([0u16; 0x33]));
            let base = mem.as_mut_ptr();
            let mmcsd = Mmcsd::new(unsafe { StaticRef::new(base as *const MmcsdRegisters) });
            (FakeWindow { base }, mmcsd)
        }

        fn poke(&self, offset: usize, value: u16) {
            unsafe { self.base.add(offset / 2).write_volatile(value) }
        }

        fn peek(&self, offset: usize) -> u16 {
            unsafe { self.base.add(offset / 2).read_volatile() }
        }

        /// Every event a transfer waits on, no error bits.
        fn all_done(&self) {
            let status = MMCST0::DATDNE::SET
                + MMCST0::BSYDNE::SET
                + MMCST0::RSPDNE::SET
                + MMCST0::DXRDY::SET
                + MMCST0::DRRDY::SET;
            self.poke(MMCST0_OFFSET, status.value);
        }
    }

    fn sd_card() -> CardInfo {
        CardInfo {
            rca: 0xB368,
            kind: CardKind::Sd,
            total_sectors: 1 << 16,
            cid: [0; 8],
            csd: [0; 8],
        }
    }

    #[test]
    fn command_table_matches_controller_encodings() {
        assert_eq!(GO_IDLE_STATE.encode(), 0x4000);
        assert_eq!(SEND_OP_COND.encode(), 0x0601);
        assert_eq!(ALL_SEND_CID.encode(), 0x0402);
        assert_eq!(SEND_RELATIVE_ADDR.encode(), 0x0203);
        assert_eq!(SELECT_CARD.encode(), 0x0307);
        assert_eq!(SEND_IF_COND.encode(), 0x0208);
        assert_eq!(SEND_CSD.encode(), 0x0409);
        assert_eq!(STOP_TRANSMISSION.encode(), 0x038C);
        assert_eq!(SEND_STATUS.encode(), 0x020D);
        assert_eq!(SET_BLOCKLEN.encode(), 0x0210);
        assert_eq!(READ_SINGLE_BLOCK.encode(), 0xA211);
        assert_eq!(READ_MULTIPLE_BLOCK.encode(), 0xA212);
        assert_eq!(WRITE_BLOCK.encode(), 0x2A18);
        assert_eq!(WRITE_MULTIPLE_BLOCK.encode(), 0x2A19);
        assert_eq!(SET_WR_BLK_ERASE_COUNT.encode(), 0x0217);
        assert_eq!(SD_SEND_OP_COND.encode(), 0x0629);
        assert_eq!(APP_CMD.encode(), 0x0237);

        let app_commands = [SET_BUS_WIDTH, SET_WR_BLK_ERASE_COUNT, SD_SEND_OP_COND];
        assert!(app_commands.iter().all(|cmd| cmd.app));
        assert!([APP_CMD, SEND_OP_COND, SWITCH].iter().all(|cmd| !cmd.app));
    }

    #[test]
    fn csd_v2_capacity() {
        // CSD_STRUCTURE = 1, C_SIZE = 7515
        let mut csd = [0u16; 8];
        csd[7] = 0x4000;
        // C_SIZE occupies bits 69:48, i.e. word 3 and the low bits of word 4.
        csd[3] = 7515;
        assert_eq!(csd_total_sectors(&csd, CardKind::Sdhc), 7516 * 1024);
    }

    #[test]
    fn csd_v1_capacity() {
        // READ_BL_LEN = 10, C_SIZE = 4095, C_SIZE_MULT = 7: a 2 GB card.
        let raw: u128 = (10u128 << 80) | (4095u128 << 62) | (7u128 << 47);
        let mut csd = [0u16; 8];
        for (i, word) in csd.iter_mut().enumerate() {
            *word = (raw >> (16 * i)) as u16;
        }
        assert_eq!(csd_total_sectors(&csd, CardKind::Sd), 4096 * 1024);
        assert_eq!(csd_total_sectors(&csd, CardKind::Mmc), 4096 * 1024);
    }

    #[test]
    fn command_response_and_argument_split() {
        let (window, mmcsd) = FakeWindow::new();
        window.poke(MMCST0_OFFSET, MMCST0::RSPDNE::SET.value);
        window.poke(MMCRSP6_OFFSET, 0x01AA);
        window.poke(MMCRSP7_OFFSET, 0x0000);

        let response = mmcsd.send_command(SEND_IF_COND, 0x0012_01AA).unwrap();
        assert_eq!(response.short(), 0x1AA);
        assert_eq!(window.peek(MMCARG1_OFFSET), 0x01AA);
        assert_eq!(window.peek(MMCARG2_OFFSET), 0x0012);
        assert_eq!(window.peek(MMCCMD1_OFFSET), 0x0208);
    }

    #[test]
    fn silent_controller_times_out_busy() {
        let (_window, mmcsd) = FakeWindow::new();
        assert_eq!(mmcsd.send_command(SEND_STATUS, 0), Err(ErrorCode::BUSY));
    }

    #[test]
    fn response_timeout_fails() {
        let (window, mmcsd) = FakeWindow::new();
        window.poke(MMCST0_OFFSET, MMCST0::TOUTRS::SET.value);
        assert_eq!(
            mmcsd.send_command(SEND_IF_COND, CMD8_ARG),
            Err(ErrorCode::FAIL)
        );
    }

    #[test]
    fn identify_standard_capacity_card() {
        let (window, mmcsd) = FakeWindow::new();
        window.all_done();
        // Power up done, no CCS. Every response reads back this word.
        window.poke(MMCRSP6_OFFSET, 0x8000);
        window.poke(MMCRSP7_OFFSET, 0x80FF);

        let info = mmcsd.identify().unwrap();
        assert_eq!(info.kind, CardKind::Sd);
        assert_eq!(info.rca, 0x80FF);
        assert_eq!(mmcsd.card(), Some(info));
        // Byte addressed cards finish with SET_BLOCKLEN 512.
        assert_eq!(window.peek(MMCCMD1_OFFSET), SET_BLOCKLEN.encode());
        assert_eq!(window.peek(MMCARG1_OFFSET), 512);
    }

    #[test]
    fn transfers_need_identified_card() {
        let (window, mmcsd) = FakeWindow::new();
        window.all_done();
        let mut buf = [0u16; WORDS_PER_BLOCK];
        assert_eq!(mmcsd.read(0, &mut buf), Err(ErrorCode::NODEVICE));
        assert_eq!(mmcsd.write(0, &buf), Err(ErrorCode::NODEVICE));
    }

    #[test]
    fn partial_block_buffers_rejected() {
        let (window, mmcsd) = FakeWindow::new();
        window.all_done();
        mmcsd.card.set(Some(sd_card()));
        let mut buf = [0u16; WORDS_PER_BLOCK + 3];
        assert_eq!(mmcsd.read(0, &mut buf), Err(ErrorCode::INVAL));
        assert_eq!(mmcsd.write(0, &buf[..0]), Err(ErrorCode::INVAL));
    }

    #[test]
    fn single_block_read_little_endian() {
        let (window, mmcsd) = FakeWindow::new();
        window.all_done();
        window.poke(MMCDRR1_OFFSET, 0x3412);
        window.poke(MMCDRR2_OFFSET, 0x1234);
        mmcsd.card.set(Some(sd_card()));

        let mut buf = [0u16; WORDS_PER_BLOCK];
        mmcsd.read(129 * 512, &mut buf).unwrap();

        assert!(buf.iter().all(|w| *w == 0x3412));
        assert_eq!(window.peek(MMCCMD1_OFFSET), 0xA211);
        assert_eq!(window.peek(MMCARG1_OFFSET), 0x0200);
        assert_eq!(window.peek(MMCARG2_OFFSET), 0x0001);
        assert_eq!(window.peek(MMCNBLK_OFFSET), 1);
    }

    #[test]
    fn multi_block_read_big_endian_sends_stop() {
        let (window, mmcsd) = FakeWindow::new();
        window.all_done();
        window.poke(MMCDRR1_OFFSET, 0x3412);
        window.poke(MMCDRR2_OFFSET, 0x1234);
        mmcsd.card.set(Some(sd_card()));
        mmcsd.set_read_endian_mode(EndianMode::Big);

        let mut buf = [0u16; 2 * WORDS_PER_BLOCK];
        mmcsd.read(0, &mut buf).unwrap();

        assert!(buf.iter().all(|w| *w == 0x1234));
        assert_eq!(window.peek(MMCNBLK_OFFSET), 2);
        assert_eq!(window.peek(MMCCMD1_OFFSET), STOP_TRANSMISSION.encode());
        let ctl = window.peek(MMCCTL_OFFSET);
        assert_ne!(ctl & MMCCTL::PERMDR::Big.value, 0);
    }

    #[test]
    fn write_uses_endian_selected_transmit_register() {
        let (window, mmcsd) = FakeWindow::new();
        window.all_done();
        mmcsd.card.set(Some(sd_card()));
        mmcsd.set_write_endian_mode(EndianMode::Big);

        let mut buf = [0u16; WORDS_PER_BLOCK];
        buf[WORDS_PER_BLOCK - 1] = 0xBEEF;
        mmcsd.write(1024, &buf).unwrap();

        assert_eq!(window.peek(MMCDXR2_OFFSET), 0xBEEF);
        assert_eq!(window.peek(MMCDXR1_OFFSET), 0);
        assert_eq!(window.peek(MMCCMD1_OFFSET), 0x2A18);
        assert_eq!(window.peek(MMCARG1_OFFSET), 1024);
        let ctl = window.peek(MMCCTL_OFFSET);
        assert_ne!(ctl & MMCCTL::PERMDX::Big.value, 0);
        assert_eq!(mmcsd.write_endian_mode(), EndianMode::Big);
        assert_eq!(mmcsd.read_endian_mode(), EndianMode::Little);
    }

    #[test]
    fn crc_errors_exhaust_retries() {
        let (window, mmcsd) = FakeWindow::new();
        let status = MMCST0::CRCRD::SET + MMCST0::DRRDY::SET;
        window.poke(MMCST0_OFFSET, status.value);
        mmcsd.card.set(Some(sd_card()));

        let mut buf = [0u16; WORDS_PER_BLOCK];
        assert_eq!(mmcsd.read(0, &mut buf), Err(ErrorCode::FAIL));
    }

    #[test]
    fn failed_multi_block_transfer_is_stopped() {
        let (window, mmcsd) = FakeWindow::new();
        let status = MMCST0::CRCWR::SET + MMCST0::DXRDY::SET;
        window.poke(MMCST0_OFFSET, status.value);
        mmcsd.card.set(Some(sd_card()));

        // The STOP fails on the same error bit; the retries go on regardless.
        let buf = [0u16; 3 * WORDS_PER_BLOCK];
        assert_eq!(mmcsd.write(0, &buf), Err(ErrorCode::FAIL));
        assert_eq!(window.peek(MMCNBLK_OFFSET), 3);
        assert_eq!(window.peek(MMCCMD1_OFFSET), STOP_TRANSMISSION.encode());
    }
}
