//! dotboot-core - Protocol core for the dotboot serial flash bootloader
//!
//! This crate implements the device side of a minimal bootloader that
//! reprograms an SPI NOR flash chip over a byte-oriented serial link, plus
//! the pieces of the wire protocol shared with the host client. It is
//! `no_std` compatible for use on the bootloader target itself.
//!
//! The protocol tunnels binary commands over a text-safe link: a request is
//! a `.`-prefixed ASCII-hex frame carrying a payload length, an expected
//! response length, the payload, and an additive checksum. The device
//! executes the payload as a raw SPI flash command and answers with an
//! acknowledgment, a data frame, or a diagnostic frame.
//!
//! # Features
//!
//! - `std` - Enable standard library support (includes `alloc`)
//! - `alloc` - Enable the host-side frame helpers that allocate
//!
//! # Example
//!
//! ```ignore
//! use dotboot_core::bootloader::Bootloader;
//!
//! let mut boot = Bootloader::new(bus);
//! let mut tx = Vec::new();
//! for byte in serial_rx {
//!     boot.handle_byte(byte, &mut tx)?;
//!     serial_tx.write_all(&tx)?;
//!     tx.clear();
//! }
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod bootloader;
pub mod error;
pub mod frame;
pub mod spi;

pub use error::{Error, Result};
