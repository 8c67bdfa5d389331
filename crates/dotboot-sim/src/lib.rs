//! dotboot-sim - In-memory SPI NOR flash emulator for testing
//!
//! This crate emulates a flash chip in memory so the bootloader stack can
//! be exercised without hardware. Unlike a command-level mock it models
//! the chip at the SPI burst level: a burst starts at chip-select assert,
//! bytes are exchanged full duplex, and erase/program side effects commit
//! at deselect, which is exactly the contract the orchestrator and the
//! bit-banged driver depend on.
//!
//! Three views of the same chip are provided:
//! - [`SimFlash`] - the byte-level slave model (`select`/`exchange`/
//!   `deselect`)
//! - [`SimBus`] - an `SpiTransfer` implementation for driving a
//!   `Bootloader` directly
//! - [`SimPins`] - an `SpiPins` implementation for driving `BitBangSpi`
//!   through individual clock edges

use dotboot_core::spi::{opcodes, SpiPins, SpiTransfer};

/// Configuration for the simulated flash
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// JEDEC ID bytes returned for RDID
    pub jedec_id: [u8; 3],
    /// Flash size in bytes
    pub size: usize,
    /// Program page size (wrap boundary for page program)
    pub page_size: usize,
    /// Smallest erase unit
    pub sector_size: usize,
    /// Status polls a sector erase stays busy for
    pub erase_busy_polls: u32,
    /// Status polls a page program stays busy for
    pub program_busy_polls: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            jedec_id: [0xEF, 0x40, 0x18], // W25Q128FV
            size: 16 * 1024 * 1024,
            page_size: 256,
            sector_size: 4096,
            erase_busy_polls: 4,
            program_busy_polls: 2,
        }
    }
}

/// Per-burst command decode state
#[derive(Debug, Clone, PartialEq, Eq)]
enum Burst {
    /// Deselected
    Idle,
    /// Selected, opcode not yet seen
    AwaitOpcode,
    /// Streaming status register bytes
    ReadStatus,
    /// Streaming JEDEC ID bytes
    ReadId { index: usize },
    /// Collecting the 3-byte big-endian address for `op`
    Address { op: u8, addr: u32, got: u8 },
    /// Streaming array data
    Read { addr: usize },
    /// Programming into the page containing `base`
    Program { base: usize, offset: usize },
    /// Sector erase armed, committed at deselect
    Erase { addr: u32 },
    /// WREN seen; latched at deselect
    WriteEnable,
    /// Unknown or rejected command; bytes are swallowed
    Ignored,
}

/// Byte-level SPI NOR flash slave model.
///
/// Output bytes are full duplex: [`SimFlash::exchange`] returns the byte
/// the chip was presenting during the same eight clocks that shifted the
/// argument in, so a read command observes its data starting with the
/// first transfer after the address, matching a real chip.
pub struct SimFlash {
    config: SimConfig,
    data: Vec<u8>,
    burst: Burst,
    write_enabled: bool,
    busy_polls: u32,
}

impl SimFlash {
    /// Create a blank (all `0xFF`) flash
    pub fn new(config: SimConfig) -> Self {
        let data = vec![0xFF; config.size];
        Self {
            config,
            data,
            burst: Burst::Idle,
            write_enabled: false,
            busy_polls: 0,
        }
    }

    /// Create a blank flash with the default configuration
    pub fn new_default() -> Self {
        Self::new(SimConfig::default())
    }

    /// Create a flash pre-filled with `initial_data` at offset 0
    pub fn with_data(config: SimConfig, initial_data: &[u8]) -> Self {
        let mut flash = Self::new(config);
        let len = initial_data.len().min(flash.data.len());
        flash.data[..len].copy_from_slice(&initial_data[..len]);
        flash
    }

    /// The array contents
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable array contents (test setup)
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The configuration
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Whether the write-enable latch is set
    pub fn write_enabled(&self) -> bool {
        self.write_enabled
    }

    /// Assert chip-select: a new burst begins
    pub fn select(&mut self) {
        self.burst = Burst::AwaitOpcode;
    }

    /// Release chip-select: deselect-committed commands take effect
    pub fn deselect(&mut self) {
        match self.burst {
            Burst::WriteEnable => self.write_enabled = true,
            Burst::Erase { addr } => {
                if self.write_enabled {
                    let base = addr as usize & !(self.config.sector_size - 1);
                    if base + self.config.sector_size <= self.data.len() {
                        self.data[base..base + self.config.sector_size].fill(0xFF);
                        self.busy_polls = self.config.erase_busy_polls;
                    } else {
                        log::warn!("sim: erase at 0x{:06X} out of range", addr);
                    }
                    self.write_enabled = false;
                } else {
                    log::warn!("sim: erase at 0x{:06X} without WREN, ignored", addr);
                }
            }
            Burst::Program { .. } => {
                self.busy_polls = self.config.program_busy_polls;
                self.write_enabled = false;
            }
            _ => {}
        }
        self.burst = Burst::Idle;
    }

    /// The byte the chip is presenting for the next exchange
    pub fn peek(&self) -> u8 {
        match &self.burst {
            Burst::ReadStatus => self.status(),
            Burst::ReadId { index } => self.config.jedec_id[index % 3],
            Burst::Read { addr } => self.data[addr % self.data.len()],
            _ => 0,
        }
    }

    /// Consume one incoming byte and advance the burst state
    pub fn absorb(&mut self, byte: u8) {
        self.burst = match core::mem::replace(&mut self.burst, Burst::Ignored) {
            Burst::Idle => Burst::Idle, // clocks without chip-select go nowhere
            Burst::AwaitOpcode => match byte {
                opcodes::RDSR => Burst::ReadStatus,
                opcodes::RDID => Burst::ReadId { index: 0 },
                opcodes::WREN => Burst::WriteEnable,
                opcodes::READ | opcodes::PAGE_PROGRAM | opcodes::SECTOR_ERASE => Burst::Address {
                    op: byte,
                    addr: 0,
                    got: 0,
                },
                other => {
                    log::debug!("sim: unsupported opcode 0x{:02X}", other);
                    Burst::Ignored
                }
            },
            Burst::ReadStatus => {
                // Each status byte clocked out counts as one poll.
                self.busy_polls = self.busy_polls.saturating_sub(1);
                Burst::ReadStatus
            }
            Burst::ReadId { index } => Burst::ReadId { index: index + 1 },
            Burst::Address { op, addr, got } => {
                let addr = addr << 8 | byte as u32;
                if got + 1 < 3 {
                    Burst::Address {
                        op,
                        addr,
                        got: got + 1,
                    }
                } else {
                    match op {
                        opcodes::READ => Burst::Read {
                            addr: addr as usize,
                        },
                        opcodes::SECTOR_ERASE => Burst::Erase { addr },
                        _ if !self.write_enabled => {
                            log::warn!("sim: program at 0x{:06X} without WREN, ignored", addr);
                            Burst::Ignored
                        }
                        _ => Burst::Program {
                            base: addr as usize & !(self.config.page_size - 1),
                            offset: addr as usize & (self.config.page_size - 1),
                        },
                    }
                }
            }
            Burst::Read { addr } => Burst::Read { addr: addr + 1 },
            Burst::Program { base, offset } => {
                let index = base + offset;
                if index < self.data.len() {
                    // Programming only clears bits.
                    self.data[index] &= byte;
                }
                Burst::Program {
                    base,
                    // Address wraps within the page, like a real chip.
                    offset: (offset + 1) % self.config.page_size,
                }
            }
            other => other,
        };
    }

    /// One full-duplex byte exchange
    pub fn exchange(&mut self, byte: u8) -> u8 {
        let out = self.peek();
        self.absorb(byte);
        out
    }

    fn status(&self) -> u8 {
        let mut status = 0;
        if self.busy_polls > 0 {
            status |= opcodes::SR1_WIP;
        }
        if self.write_enabled {
            status |= opcodes::SR1_WEL;
        }
        status
    }
}

/// Transfer-level bus over a [`SimFlash`]
pub struct SimBus {
    flash: SimFlash,
    cs: bool,
}

impl SimBus {
    /// Wrap a flash model
    pub fn new(flash: SimFlash) -> Self {
        Self { flash, cs: false }
    }

    /// Borrow the flash
    pub fn flash(&self) -> &SimFlash {
        &self.flash
    }

    /// Mutably borrow the flash
    pub fn flash_mut(&mut self) -> &mut SimFlash {
        &mut self.flash
    }
}

impl SpiTransfer for SimBus {
    fn transfer(&mut self, out: u8, first: bool, last: bool) -> u8 {
        if first && !self.cs {
            self.flash.select();
            self.cs = true;
        }
        // A transfer with chip-select released clocks into nothing.
        let input = if self.cs { self.flash.exchange(out) } else { 0 };
        if last && self.cs {
            self.flash.deselect();
            self.cs = false;
        }
        input
    }

    fn cs_active(&self) -> bool {
        self.cs
    }
}

/// Pin-level view of a [`SimFlash`] for exercising `BitBangSpi`.
///
/// Mode 0: the slave samples COPI on the rising clock edge and shifts its
/// output on the falling edge; a fresh output byte is latched at select
/// and after every completed input byte.
pub struct SimPins {
    flash: SimFlash,
    clk: bool,
    copi: bool,
    selected: bool,
    bit: u8,
    shift_in: u8,
    shift_out: u8,
}

impl SimPins {
    /// Wrap a flash model
    pub fn new(flash: SimFlash) -> Self {
        Self {
            flash,
            clk: false,
            copi: false,
            selected: false,
            bit: 0,
            shift_in: 0,
            shift_out: 0,
        }
    }

    /// Borrow the flash
    pub fn flash(&self) -> &SimFlash {
        &self.flash
    }

    /// Consume the pins and return the flash
    pub fn into_flash(self) -> SimFlash {
        self.flash
    }
}

impl SpiPins for SimPins {
    fn set_clk(&mut self, high: bool) {
        let rising = high && !self.clk;
        let falling = !high && self.clk;
        self.clk = high;
        if !self.selected {
            return;
        }

        if rising {
            self.shift_in = (self.shift_in << 1) | self.copi as u8;
            self.bit += 1;
            if self.bit == 8 {
                self.flash.absorb(self.shift_in);
                self.shift_out = self.flash.peek();
                self.bit = 0;
            }
        } else if falling && self.bit != 0 {
            self.shift_out <<= 1;
        }
    }

    fn set_copi(&mut self, high: bool) {
        self.copi = high;
    }

    fn set_cs(&mut self, active: bool) {
        if active && !self.selected {
            self.flash.select();
            self.shift_out = self.flash.peek();
            self.bit = 0;
            self.shift_in = 0;
        } else if !active && self.selected {
            self.flash.deselect();
        }
        self.selected = active;
    }

    fn cipo(&self) -> bool {
        self.shift_out & 0x80 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotboot_core::spi::BitBangSpi;

    fn small_flash() -> SimFlash {
        SimFlash::new(SimConfig {
            size: 64 * 1024,
            ..SimConfig::default()
        })
    }

    /// Run one bracketed burst at the transfer level
    fn burst(bus: &mut SimBus, out: &[u8], read_back: usize) -> Vec<u8> {
        let total = out.len() + read_back;
        let mut input = Vec::new();
        for i in 0..total {
            let byte = out.get(i).copied().unwrap_or(0);
            input.push(bus.transfer(byte, i == 0, i + 1 == total));
        }
        input.split_off(out.len())
    }

    #[test]
    fn jedec_id_streams_after_the_opcode() {
        let mut bus = SimBus::new(small_flash());
        let id = burst(&mut bus, &[opcodes::RDID], 3);
        assert_eq!(id, [0xEF, 0x40, 0x18]);
    }

    #[test]
    fn program_requires_write_enable() {
        let mut bus = SimBus::new(small_flash());
        burst(&mut bus, &[opcodes::PAGE_PROGRAM, 0, 0x10, 0, 0x00], 0);
        assert_eq!(bus.flash().data()[0x1000], 0xFF);

        burst(&mut bus, &[opcodes::WREN], 0);
        assert!(bus.flash().write_enabled());
        burst(&mut bus, &[opcodes::PAGE_PROGRAM, 0, 0x10, 0, 0x42], 0);
        assert_eq!(bus.flash().data()[0x1000], 0x42);
        // The latch clears once the program completes.
        assert!(!bus.flash().write_enabled());
    }

    #[test]
    fn programming_only_clears_bits() {
        let mut bus = SimBus::new(small_flash());
        burst(&mut bus, &[opcodes::WREN], 0);
        burst(&mut bus, &[opcodes::PAGE_PROGRAM, 0, 0, 0, 0x0F], 0);
        burst(&mut bus, &[opcodes::WREN], 0);
        burst(&mut bus, &[opcodes::PAGE_PROGRAM, 0, 0, 0, 0xF3], 0);
        assert_eq!(bus.flash().data()[0], 0x03);
    }

    #[test]
    fn program_wraps_within_the_page() {
        let mut bus = SimBus::new(small_flash());
        burst(&mut bus, &[opcodes::WREN], 0);
        // Start at the last byte of page 0: the second byte wraps to 0.
        burst(&mut bus, &[opcodes::PAGE_PROGRAM, 0, 0, 0xFF, 0x11, 0x22], 0);
        assert_eq!(bus.flash().data()[0xFF], 0x11);
        assert_eq!(bus.flash().data()[0x00], 0x22);
        assert_eq!(bus.flash().data()[0x100], 0xFF);
    }

    #[test]
    fn erase_fills_the_sector_and_sets_busy() {
        let mut flash = small_flash();
        flash.data_mut()[0x1000..0x2000].fill(0x00);
        let mut bus = SimBus::new(flash);

        burst(&mut bus, &[opcodes::WREN], 0);
        burst(&mut bus, &[opcodes::SECTOR_ERASE, 0, 0x10, 0x80], 0);
        assert!(bus.flash().data()[0x1000..0x2000].iter().all(|&b| b == 0xFF));

        // Busy for the configured number of polls, then idle.
        let polls = bus.flash().config().erase_busy_polls as usize;
        let status = burst(&mut bus, &[opcodes::RDSR], polls + 1);
        assert!(status[..polls].iter().all(|&s| s & opcodes::SR1_WIP != 0));
        assert_eq!(status[polls] & opcodes::SR1_WIP, 0);
    }

    #[test]
    fn read_streams_consecutive_bytes() {
        let mut flash = small_flash();
        flash.data_mut()[0x20..0x24].copy_from_slice(&[1, 2, 3, 4]);
        let mut bus = SimBus::new(flash);

        let data = burst(&mut bus, &[opcodes::READ, 0, 0, 0x20], 4);
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    fn bitbang_driver_reads_jedec_id_through_the_pins() {
        let mut spi = BitBangSpi::new(SimPins::new(small_flash()));
        spi.transfer(opcodes::RDID, true, false);
        let mut id = [0u8; 3];
        for (i, byte) in id.iter_mut().enumerate() {
            *byte = spi.transfer(0, false, i == 2);
        }
        assert_eq!(id, [0xEF, 0x40, 0x18]);
    }

    #[test]
    fn bitbang_driver_program_and_read_back() {
        let mut spi = BitBangSpi::new(SimPins::new(small_flash()));
        spi.transfer(opcodes::WREN, true, true);
        for (i, &b) in [opcodes::PAGE_PROGRAM, 0, 0, 0x40, 0xA5, 0x5A]
            .iter()
            .enumerate()
        {
            spi.transfer(b, i == 0, i == 5);
        }

        spi.transfer(opcodes::READ, true, false);
        for b in [0u8, 0, 0x40] {
            spi.transfer(b, false, false);
        }
        let first = spi.transfer(0, false, false);
        let second = spi.transfer(0, false, true);
        assert_eq!((first, second), (0xA5, 0x5A));
    }
}
