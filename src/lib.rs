//! dotboot - host-side client for the serial SPI flash bootloader
//!
//! The device end is a tiny bootloader that tunnels raw SPI flash
//! commands over an ASCII-hex serial protocol (see `dotboot-core` for the
//! frame format and the device state machine). This crate is the host
//! half: transports for reaching a bootloader over a serial port, TCP, or
//! an in-process simulator, and a [`programmer::Programmer`] that builds
//! erase/program/read command frames on top of them.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod programmer;
pub mod transport;

pub use error::{HostError, Result};
