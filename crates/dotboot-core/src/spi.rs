//! SPI master driver
//!
//! The bootloader talks to the flash chip through the [`SpiTransfer`]
//! trait: one full-duplex 8-bit exchange per call, with chip-select
//! bracketing controlled by the caller. Chip-select is asserted on the
//! transfer marked `first` and released on the transfer marked `last`,
//! never in between; a burst of N chained transfers therefore holds the
//! chip selected for its entire window. That hand-off rule is the only
//! mutual-exclusion discipline on the bus.
//!
//! [`BitBangSpi`] implements the trait over raw GPIO for targets without
//! an SPI peripheral. Targets that have one only need to preserve the
//! transfer-level contract, not the bit mechanics.

/// Standard JEDEC SPI flash opcodes used by the bootloader
pub mod opcodes {
    /// Write Enable - required before any write/erase operation
    pub const WREN: u8 = 0x06;
    /// Page Program (up to 256 bytes; the host caps pages at 128)
    pub const PAGE_PROGRAM: u8 = 0x02;
    /// Read Data
    pub const READ: u8 = 0x03;
    /// Read Status Register 1
    pub const RDSR: u8 = 0x05;
    /// 4 KiB Sector Erase
    pub const SECTOR_ERASE: u8 = 0x20;
    /// Read JEDEC ID (manufacturer + device ID), diagnostic use only
    pub const RDID: u8 = 0x9F;

    /// Write-in-progress bit in status register 1
    pub const SR1_WIP: u8 = 0x01;
    /// Write-enable-latch bit in status register 1
    pub const SR1_WEL: u8 = 0x02;
}

/// One 8-bit full-duplex SPI exchange with caller-controlled chip-select
/// bracketing.
///
/// SPI is a dumb byte shuttle: no failure is observable at this layer, so
/// `transfer` is infallible. All protocol-level failure is judged by the
/// caller from the returned data.
pub trait SpiTransfer {
    /// Shift `out` to the chip and return the byte shifted in.
    ///
    /// `first` asserts chip-select before the exchange if it is not already
    /// active; `last` releases it afterwards.
    fn transfer(&mut self, out: u8, first: bool, last: bool) -> u8;

    /// Whether chip-select is currently asserted
    fn cs_active(&self) -> bool;
}

/// Raw pin access for the bit-banged driver.
///
/// `set_cs(true)` means "chip selected"; implementations own any physical
/// inversion of the CS line.
pub trait SpiPins {
    /// Drive the clock line
    fn set_clk(&mut self, high: bool);
    /// Drive the controller-out line
    fn set_copi(&mut self, high: bool);
    /// Select or deselect the chip
    fn set_cs(&mut self, active: bool);
    /// Sample the controller-in line
    fn cipo(&self) -> bool;
}

/// Mode-0 bit-banged SPI master.
///
/// Per bit: present the output on COPI, sample CIPO, then pulse the clock
/// high and low. Bytes are shifted MSB first. The clock idles low.
pub struct BitBangSpi<P: SpiPins> {
    pins: P,
    cs: bool,
}

impl<P: SpiPins> BitBangSpi<P> {
    /// Wrap a pin set with the bus in the idle state (clock low, chip
    /// deselected)
    pub fn new(mut pins: P) -> Self {
        pins.set_clk(false);
        pins.set_cs(false);
        Self { pins, cs: false }
    }

    /// Consume the driver and return the pins
    pub fn into_pins(self) -> P {
        self.pins
    }
}

impl<P: SpiPins> SpiTransfer for BitBangSpi<P> {
    fn transfer(&mut self, out: u8, first: bool, last: bool) -> u8 {
        if first && !self.cs {
            self.pins.set_cs(true);
            self.cs = true;
        }

        let mut dout = out;
        let mut din = 0u8;
        for _ in 0..8 {
            self.pins.set_copi(dout & 0x80 != 0);
            din = (din << 1) | self.pins.cipo() as u8;
            self.pins.set_clk(true);
            self.pins.set_clk(false);
            dout <<= 1;
        }

        if last && self.cs {
            self.pins.set_cs(false);
            self.cs = false;
        }
        din
    }

    fn cs_active(&self) -> bool {
        self.cs
    }
}
