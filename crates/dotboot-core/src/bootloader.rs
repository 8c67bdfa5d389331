//! Bootloader command orchestrator
//!
//! [`Bootloader`] sequences flash unlock, erase, program and read
//! operations against incoming wire frames. It is an explicit state
//! machine driven one received byte at a time: the only genuine
//! suspension point is "need the next received byte", so SPI transfers
//! and response emission run to completion inside
//! [`Bootloader::handle_byte`] instead of busy-waiting on handshakes.
//!
//! A command frame carries a payload length, an expected response length,
//! the payload (the raw flash command, opcode first) and a checksum.
//! Before each command the orchestrator releases any chip-select still
//! held from the previous command and polls the flash status register
//! until the write-in-progress bit clears, so a host can always recover
//! the bus by sending a fresh frame.

use crate::error::{Error, Result};
use crate::frame::{
    self, FrameDecoder, CHECKSUM_MARKER, ERROR_MARKER, FRAME_MARKER,
};
use crate::spi::{opcodes, SpiTransfer};
use embedded_io::Write;
use heapless::Vec;

/// Maximum command payload, fixed by the one-byte `in_bytes` field
pub const MAX_PAYLOAD: usize = 255;

/// Orchestrator states.
///
/// `Start` through `Checksum` follow the frame; `Run` through `SpiRead`
/// execute the command against the flash chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Between commands; release a held chip-select when a frame starts
    Start,
    /// Poll the status register until the flash reports idle
    PollReady,
    /// Decode the payload length
    CountBytes,
    /// Decode the expected response length
    ReturnBytes,
    /// Decode the payload into the working buffer
    ReadData,
    /// Decode the trailing checksum byte
    Checksum,
    /// Check the accumulated checksum and start execution
    Run,
    /// Stream the working buffer to the flash
    SpiWrite,
    /// Prime the read pipeline with one extra transfer
    SpiStall,
    /// Clock response bytes in and stream them out as a data frame
    SpiRead,
    /// Emit one error frame and resynchronize
    Err,
}

/// Tunables for the orchestrator
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Upper bound on status-register polls per command.
    ///
    /// The original design polled forever; a chip that never reports idle
    /// would wedge the bootloader, so the poll is bounded here and the
    /// command fails with an error frame instead.
    pub max_status_polls: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_status_polls: 100_000,
        }
    }
}

/// The bootloader state machine.
///
/// Generic over the SPI master so it runs unchanged against real pins
/// (`BitBangSpi`), a hardware SPI peripheral, or the test simulator.
pub struct Bootloader<S: SpiTransfer> {
    spi: S,
    config: Config,
    decoder: FrameDecoder,
    state: State,
    /// Working buffer: payload staged from the frame before it is
    /// streamed to the flash. Owned by the orchestrator for the lifetime
    /// of one command.
    buf: Vec<u8, MAX_PAYLOAD>,
    byte_count: u8,
    return_bytes: u8,
}

impl<S: SpiTransfer> Bootloader<S> {
    /// Create a bootloader with the default configuration
    pub fn new(spi: S) -> Self {
        Self::with_config(spi, Config::default())
    }

    /// Create a bootloader with an explicit configuration
    pub fn with_config(spi: S, config: Config) -> Self {
        Self {
            spi,
            config,
            decoder: FrameDecoder::new(),
            state: State::Start,
            buf: Vec::new(),
            byte_count: 0,
            return_bytes: 0,
        }
    }

    /// Current state, for diagnostics
    pub fn state(&self) -> State {
        self.state
    }

    /// Borrow the SPI master
    pub fn bus(&self) -> &S {
        &self.spi
    }

    /// Mutably borrow the SPI master
    pub fn bus_mut(&mut self) -> &mut S {
        &mut self.spi
    }

    /// Feed one received wire byte; response bytes are written to `tx`.
    ///
    /// Only transport write errors propagate. Frame-level failures are
    /// answered on the wire (`e` or `c` frame) and leave the machine ready
    /// for the next command.
    pub fn handle_byte<W: Write>(
        &mut self,
        raw: u8,
        tx: &mut W,
    ) -> core::result::Result<(), W::Error> {
        let decoded = self.decoder.push(raw);

        // A new frame just started: take over the bus before decoding the
        // header. The prior command may have left chip-select asserted for
        // this command to continue the burst; a fresh frame always forces
        // a release.
        if self.state == State::Start && self.decoder.in_frame() {
            match self.acquire_flash() {
                Ok(()) => self.set_state(State::CountBytes),
                Err(e) => {
                    log::warn!("bootloader: {}", e);
                    return self.emit_error(tx);
                }
            }
        }

        match decoded {
            Ok(Some(byte)) => self.consume(byte, tx),
            Ok(None) => Ok(()),
            Err(e) => {
                log::warn!("bootloader: frame decode failed: {}", e);
                self.emit_error(tx)
            }
        }
    }

    fn set_state(&mut self, state: State) {
        log::trace!("bootloader: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// One decoded frame byte, dispatched to the current header/payload
    /// stage
    fn consume<W: Write>(
        &mut self,
        byte: u8,
        tx: &mut W,
    ) -> core::result::Result<(), W::Error> {
        match self.state {
            State::CountBytes => {
                self.byte_count = byte;
                self.set_state(State::ReturnBytes);
                Ok(())
            }
            State::ReturnBytes => {
                self.return_bytes = byte;
                if self.byte_count == 0 {
                    self.set_state(State::Checksum);
                } else {
                    self.set_state(State::ReadData);
                }
                Ok(())
            }
            State::ReadData => {
                if self.buf.push(byte).is_err() {
                    // Unreachable: capacity equals the maximum byte_count.
                    return self.emit_error(tx);
                }
                if self.buf.len() >= self.byte_count as usize {
                    self.set_state(State::Checksum);
                }
                Ok(())
            }
            State::Checksum => {
                // The checksum byte has been folded into the accumulator;
                // the frame is complete.
                self.set_state(State::Run);
                self.execute(tx)
            }
            // A decoded byte outside a frame stage: stale input after a
            // completed command. Ignore it; the decoder resynchronizes on
            // the next start marker.
            _ => Ok(()),
        }
    }

    /// Start + PollReady: release a leftover burst, then hold the status
    /// register until the flash is idle
    fn acquire_flash(&mut self) -> Result<()> {
        self.buf.clear();
        self.byte_count = 0;
        self.return_bytes = 0;

        if self.spi.cs_active() {
            self.spi.transfer(0, false, true);
        }

        self.set_state(State::PollReady);
        self.spi.transfer(opcodes::RDSR, true, false);
        for _ in 0..self.config.max_status_polls {
            let status = self.spi.transfer(0, false, false);
            if status & opcodes::SR1_WIP == 0 {
                self.spi.transfer(0, false, true);
                return Ok(());
            }
        }
        // Close the burst before giving up so the bus is left safe.
        self.spi.transfer(0, false, true);
        Err(Error::FlashBusyTimeout)
    }

    /// Run + SpiWrite + SpiStall + SpiRead
    fn execute<W: Write>(&mut self, tx: &mut W) -> core::result::Result<(), W::Error> {
        let sum = self.decoder.checksum();
        self.decoder.reset();

        if sum != 0 {
            // Checksum diagnostic frame: reports the nonzero accumulator
            // so the host can tell corruption from a decode failure.
            log::warn!("bootloader: checksum residue 0x{:02X}, dropping frame", sum);
            frame::encode_response_byte(tx, CHECKSUM_MARKER, sum, true, true, false)?;
            self.set_state(State::Start);
            return Ok(());
        }

        self.set_state(State::SpiWrite);
        let count = self.buf.len();
        for i in 0..count {
            let first = !self.spi.cs_active();
            let last = self.return_bytes == 0 && i + 1 == count;
            self.spi.transfer(self.buf[i], first, last);
        }

        if self.return_bytes == 0 {
            frame::encode_response_byte(tx, FRAME_MARKER, 0, true, true, true)?;
            self.set_state(State::Start);
            return Ok(());
        }

        // One pipelining transfer paces the bus between the command bytes
        // and the read-back; its input byte is the first response byte.
        self.set_state(State::SpiStall);
        let total = self.return_bytes as usize;
        let mut pending = self.spi.transfer(0, false, total == 1);

        self.set_state(State::SpiRead);
        for i in 1..=total {
            frame::encode_response_byte(tx, FRAME_MARKER, pending, i == 1, i == total, false)?;
            if i < total {
                pending = self.spi.transfer(0, false, i + 1 == total);
            }
        }

        self.set_state(State::Start);
        Ok(())
    }

    /// Err: answer with one error frame and resynchronize
    fn emit_error<W: Write>(&mut self, tx: &mut W) -> core::result::Result<(), W::Error> {
        self.set_state(State::Err);
        // Sent in empty style: only "e\n" reaches the wire.
        frame::encode_response_byte(tx, ERROR_MARKER, 0xFF, true, true, true)?;
        self.decoder.reset();
        self.set_state(State::Start);
        Ok(())
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::vec::Vec;

    /// Scripted SPI bus: records every transfer, replays queued input
    /// bytes (default 0x00 once the script runs out)
    struct MockBus {
        transfers: Vec<(u8, bool, bool)>,
        responses: VecDeque<u8>,
        cs: bool,
    }

    impl MockBus {
        fn new() -> Self {
            Self {
                transfers: Vec::new(),
                responses: VecDeque::new(),
                cs: false,
            }
        }

        fn with_responses(responses: &[u8]) -> Self {
            let mut bus = Self::new();
            bus.responses = responses.iter().copied().collect();
            bus
        }
    }

    impl SpiTransfer for MockBus {
        fn transfer(&mut self, out: u8, first: bool, last: bool) -> u8 {
            if first {
                self.cs = true;
            }
            self.transfers.push((out, first, last));
            let input = self.responses.pop_front().unwrap_or(0);
            if last {
                self.cs = false;
            }
            input
        }

        fn cs_active(&self) -> bool {
            self.cs
        }
    }

    fn run(boot: &mut Bootloader<MockBus>, wire: &[u8]) -> Vec<u8> {
        let mut tx: Vec<u8> = Vec::new();
        for &b in wire {
            boot.handle_byte(b, &mut tx).unwrap();
        }
        tx
    }

    /// Idle status poll: RDSR with first, one status read, one closing
    /// transfer with last
    const POLL: [(u8, bool, bool); 3] = [
        (opcodes::RDSR, true, false),
        (0, false, false),
        (0, false, true),
    ];

    #[test]
    fn empty_command_acks_without_spi_traffic() {
        let mut boot = Bootloader::new(MockBus::new());
        let tx = run(&mut boot, b".000000\r\n");

        assert_eq!(tx, b".\n");
        assert_eq!(boot.state(), State::Start);
        // Nothing on the bus beyond the mandatory status poll.
        assert_eq!(boot.bus().transfers, POLL);
    }

    #[test]
    fn write_enable_command_is_a_single_bracketed_transfer() {
        let mut boot = Bootloader::new(MockBus::new());
        let tx = run(&mut boot, b".010006F9\r\n");

        assert_eq!(tx, b".\n");
        assert_eq!(boot.bus().transfers[..3], POLL);
        assert_eq!(boot.bus().transfers[3..], [(0x06, true, true)]);
    }

    #[test]
    fn program_burst_holds_chip_select_to_the_last_byte() {
        // 0x02 + address + two data bytes, no read-back.
        let mut boot = Bootloader::new(MockBus::new());
        let tx = run(&mut boot, b".060002001000AA55E9\r\n");

        assert_eq!(tx, b".\n");
        let burst = &boot.bus().transfers[3..];
        assert_eq!(
            burst,
            [
                (0x02, true, false),
                (0x00, false, false),
                (0x10, false, false),
                (0x00, false, false),
                (0xAA, false, false),
                (0x55, false, true),
            ]
        );
    }

    #[test]
    fn read_command_streams_data_frame() {
        // 0x03 + address, expecting two bytes back. The stall transfer
        // fetches the first byte, the next transfer carries `last`.
        let bus = MockBus::with_responses(&[0, 0, 0, 0, 0, 0, 0, 0xAB, 0xCD]);
        let mut boot = Bootloader::new(bus);
        let tx = run(&mut boot, b".040203001000E7\r\n");

        assert_eq!(tx, b".ABCD\n");
        let burst = &boot.bus().transfers[3..];
        assert_eq!(
            burst,
            [
                (0x03, true, false),
                (0x00, false, false),
                (0x10, false, false),
                (0x00, false, false),
                (0x00, false, false), // stall
                (0x00, false, true),  // fetches the final byte
            ]
        );
        assert!(!boot.bus().cs_active());
    }

    #[test]
    fn corrupted_checksum_yields_diagnostic_and_no_write() {
        // Correct checksum would be F9; FA leaves a residue of 1.
        let mut boot = Bootloader::new(MockBus::new());
        let tx = run(&mut boot, b".010006FA\r\n");

        assert_eq!(tx, b"c01\n");
        // Status poll only; the WREN never reached the bus.
        assert_eq!(boot.bus().transfers, POLL);
        assert_eq!(boot.state(), State::Start);
    }

    #[test]
    fn decode_error_answers_once_and_resynchronizes() {
        let mut boot = Bootloader::new(MockBus::new());
        let tx = run(&mut boot, b".01G0");
        assert_eq!(tx, b"e\n");

        // The next well-formed frame is processed normally.
        let tx = run(&mut boot, b".000000\r\n");
        assert_eq!(tx, b".\n");
    }

    #[test]
    fn leftover_chip_select_is_released_before_the_poll() {
        let mut bus = MockBus::new();
        bus.cs = true; // prior command left the bus held
        let mut boot = Bootloader::new(bus);
        let tx = run(&mut boot, b".000000\r\n");

        assert_eq!(tx, b".\n");
        assert_eq!(boot.bus().transfers[0], (0, false, true));
        assert_eq!(boot.bus().transfers[1..], POLL);
    }

    #[test]
    fn busy_flash_waits_through_the_poll_loop() {
        // Two busy reads before the chip reports idle.
        let mut boot =
            Bootloader::new(MockBus::with_responses(&[0, 0x01, 0x01, 0x00]));
        let tx = run(&mut boot, b".000000\r\n");

        assert_eq!(tx, b".\n");
        assert_eq!(
            boot.bus().transfers,
            [
                (opcodes::RDSR, true, false),
                (0, false, false),
                (0, false, false),
                (0, false, false),
                (0, false, true),
            ]
        );
    }

    #[test]
    fn poll_bound_exhaustion_fails_the_command() {
        let config = Config {
            max_status_polls: 4,
        };
        let mut boot = Bootloader::with_config(
            MockBus::with_responses(&[0, 0x01, 0x01, 0x01, 0x01, 0x01]),
            config,
        );
        let tx = run(&mut boot, b".000000\r\n");

        // One error frame, burst closed, machine back at Start.
        assert_eq!(tx, b"e\n");
        assert_eq!(boot.state(), State::Start);
        assert!(!boot.bus().cs_active());
        let last = boot.bus().transfers.last().copied().unwrap();
        assert_eq!(last, (0, false, true));
    }
}
