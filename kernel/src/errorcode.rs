// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Standard error enum for invoking operations

/// Standard errors returned by drivers and HIL implementations.
///
/// Success is expressed with `Ok(..)`; this enum only carries the failure
/// cases so that `Result<T, ErrorCode>` can be used throughout. The values
/// keep their Tock numbering, so the gaps are intentional.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum ErrorCode {
    /// Generic failure condition
    FAIL = 1,
    /// Underlying system is busy; retry
    BUSY = 2,
    /// An invalid parameter was passed
    INVAL = 6,
    /// Parameter passed was too large
    SIZE = 7,
    /// Device does not exist
    NODEVICE = 11,
}

impl From<ErrorCode> for usize {
    fn from(err: ErrorCode) -> usize {
        err as usize
    }
}

impl TryFrom<usize> for ErrorCode {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ErrorCode::FAIL),
            2 => Ok(ErrorCode::BUSY),
            6 => Ok(ErrorCode::INVAL),
            7 => Ok(ErrorCode::SIZE),
            11 => Ok(ErrorCode::NODEVICE),
            _ => Err(()),
        }
    }
}
