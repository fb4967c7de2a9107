// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Support for in-kernel debugging.
//!
//! For printing, this module provides `debug!`. Output goes to a sink the
//! board registers once at startup with [`set_debug_writer`]; until a sink
//! exists the messages are dropped, so drivers and capsules may print
//! unconditionally.
//!
//! Usage
//! -----
//!
//! ```rust,ignore
//! debug!("Yes the code gets here with value {}", i);
//! ```
//!
//! ```text
//! Yes the code gets here with value 42
//! ```

use core::fmt::{write, Arguments, Result, Write};
use core::ptr::addr_of_mut;

/// Byte sink for debug output, usually a polled UART.
pub trait IoWrite {
    /// Write `buf` and return the number of bytes accepted.
    fn write(&self, buf: &[u8]) -> usize;
}

static mut DEBUG_WRITER: Option<&'static dyn IoWrite> = None;

/// Register the sink used by `debug!`.
///
/// # Safety
///
/// Must be called from the single kernel thread before any concurrent use of
/// `debug!`, typically once during board setup.
pub unsafe fn set_debug_writer(writer: &'static dyn IoWrite) {
    *addr_of_mut!(DEBUG_WRITER) = Some(writer);
}

fn debug_writer() -> Option<&'static dyn IoWrite> {
    // SAFETY: the sink is only replaced during board setup, see
    // `set_debug_writer`.
    unsafe { *addr_of_mut!(DEBUG_WRITER) }
}

struct DebugWriterWrapper {
    writer: &'static dyn IoWrite,
}

impl Write for DebugWriterWrapper {
    fn write_str(&mut self, s: &str) -> Result {
        let mut bytes = s.as_bytes();
        while !bytes.is_empty() {
            let written = self.writer.write(bytes);
            if written == 0 {
                // Sink is full, drop the rest of the message.
                break;
            }
            bytes = &bytes[written.min(bytes.len())..];
        }
        Ok(())
    }
}

/// Write a debug message followed by a newline.
pub fn debug_println(args: Arguments) {
    if let Some(writer) = debug_writer() {
        let mut wrapper = DebugWriterWrapper { writer };
        let _ = write(&mut wrapper, args);
        let _ = wrapper.write_str("\r\n");
    }
}

/// In-kernel `println()` debugging.
#[macro_export]
macro_rules! debug {
    () => ({
        // An empty debug!() prints an empty line.
        $crate::debug!("")
    });
    ($msg:expr $(,)?) => ({
        $crate::debug::debug_println(format_args!($msg));
    });
    ($fmt:expr, $($arg:tt)+) => ({
        $crate::debug::debug_println(format_args!($fmt, $($arg)+));
    });
}
