//! Error types for dotboot-core
//!
//! This module provides a no_std compatible error type that can be used
//! throughout the crate.

use core::fmt;

/// Core error type - no_std compatible, Copy for efficiency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    // Frame errors
    /// A wire character inside a frame body was not an ASCII hex digit
    BadHexDigit(u8),
    /// The decoder latched a failure and must be reset before reuse
    DecoderNotReset,
    /// A response line ended in the middle of a hex pair or had no marker
    TruncatedFrame,
    /// A response line started with an unknown marker character
    UnexpectedMarker(u8),
    /// A request payload does not fit the one-byte length field
    PayloadTooLong(usize),

    // Flash errors
    /// The flash never cleared the write-in-progress bit within the poll bound
    FlashBusyTimeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadHexDigit(c) => write!(f, "invalid hex character 0x{:02X} in frame", c),
            Self::DecoderNotReset => write!(f, "frame decoder failed and was not reset"),
            Self::TruncatedFrame => write!(f, "truncated frame"),
            Self::UnexpectedMarker(c) => write!(f, "unexpected frame marker 0x{:02X}", c),
            Self::PayloadTooLong(n) => write!(f, "payload of {} bytes exceeds frame limit", n),
            Self::FlashBusyTimeout => write!(f, "flash stayed busy beyond the poll limit"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;
