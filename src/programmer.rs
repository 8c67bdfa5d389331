//! Flash programming over the bootloader protocol
//!
//! [`Programmer`] wraps a transport and turns flash operations into
//! request frames. The bootloader itself knows nothing about flash
//! commands; every payload here is the raw SPI command the device streams
//! to the chip verbatim, and the expected-response length tells it how
//! many bytes to clock back.

use crate::error::{HostError, Result};
use crate::transport::Transport;
use dotboot_core::frame::{self, Response};
use dotboot_core::spi::opcodes;

/// Erase granularity of the sector-erase opcode
pub const SECTOR_SIZE: usize = 4096;

/// Bytes programmed per page command.
///
/// Half the usual 256-byte flash page: the conservative size keeps each
/// frame short and comfortably inside the device's payload limit once the
/// opcode and address are added.
pub const PAGE_SIZE: usize = 128;

/// A page whose read-back did not match what was programmed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyMismatch {
    /// Flash address of the page
    pub address: u32,
    /// Bytes that were programmed
    pub expected: Vec<u8>,
    /// Bytes read back
    pub actual: Vec<u8>,
}

/// Progress callbacks for a flash run.
///
/// Default implementations are no-ops so reporters only implement what
/// they display.
pub trait FlashProgress {
    /// A flash run over `total_bytes` is starting
    fn begin(&mut self, total_bytes: usize) {
        let _ = total_bytes;
    }

    /// The sector at `address` was erased
    fn sector_erased(&mut self, address: u32) {
        let _ = address;
    }

    /// A page was programmed and verified; `bytes_done` counts from the
    /// start of the image
    fn page_programmed(&mut self, bytes_done: usize) {
        let _ = bytes_done;
    }

    /// The run finished
    fn finish(&mut self) {}
}

/// Progress reporter that reports nothing
pub struct NullProgress;

impl FlashProgress for NullProgress {}

/// Convert an address to the 3-byte big-endian wire format
fn addr_bytes(address: u32) -> Result<[u8; 3]> {
    if address > 0x00FF_FFFF {
        return Err(HostError::AddressOutOfRange(address));
    }
    Ok([(address >> 16) as u8, (address >> 8) as u8, address as u8])
}

/// Host-side flash programmer
pub struct Programmer<T: Transport> {
    transport: T,
}

impl<T: Transport> Programmer<T> {
    /// Wrap a transport
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Borrow the transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send one command frame and return the decoded response bytes.
    ///
    /// `payload` is the raw SPI command, opcode first; `out_bytes` is how
    /// many bytes the device should clock back after sending it.
    pub fn run_command(&mut self, out_bytes: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let request = frame::encode_request(out_bytes, payload)?;
        log::trace!(
            "request: {}",
            String::from_utf8_lossy(&request).trim_end()
        );
        self.transport.send(&request)?;

        let line = self.transport.recv_line()?;
        log::trace!("response: {}", String::from_utf8_lossy(&line).trim_end());

        match frame::parse_response(&line)? {
            Response::Ack if out_bytes == 0 => Ok(Vec::new()),
            Response::Data(data) if data.len() == out_bytes as usize => Ok(data),
            Response::Checksum(residue) => Err(HostError::ChecksumRejected(residue)),
            Response::Error => Err(HostError::DeviceError),
            other => Err(HostError::UnexpectedResponse(format!(
                "{:?} to a command expecting {} bytes",
                other, out_bytes
            ))),
        }
    }

    /// Empty command: proves the link is up and the bootloader is at its
    /// start state (it also forces a status poll on the device side)
    pub fn ping(&mut self) -> Result<()> {
        self.run_command(0, &[])?;
        Ok(())
    }

    /// Read the 3-byte JEDEC manufacturer/device ID
    pub fn read_jedec_id(&mut self) -> Result<[u8; 3]> {
        let id = self.run_command(3, &[opcodes::RDID])?;
        Ok([id[0], id[1], id[2]])
    }

    /// Set the write-enable latch; required immediately before every
    /// erase or program command
    pub fn write_enable(&mut self) -> Result<()> {
        self.run_command(0, &[opcodes::WREN])?;
        Ok(())
    }

    /// Erase the 4 KiB sector containing `address`
    pub fn erase_sector(&mut self, address: u32) -> Result<()> {
        let addr = addr_bytes(address)?;
        self.run_command(0, &[opcodes::SECTOR_ERASE, addr[0], addr[1], addr[2]])?;
        Ok(())
    }

    /// Program up to [`PAGE_SIZE`] bytes starting at `address`
    pub fn program_page(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.len() > PAGE_SIZE {
            return Err(HostError::PageTooLarge(data.len()));
        }
        let addr = addr_bytes(address)?;
        let mut payload = Vec::with_capacity(4 + data.len());
        payload.extend_from_slice(&[opcodes::PAGE_PROGRAM, addr[0], addr[1], addr[2]]);
        payload.extend_from_slice(data);
        self.run_command(0, &payload)?;
        Ok(())
    }

    /// Read `len` bytes starting at `address`
    pub fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        if len > u8::MAX as usize {
            return Err(HostError::ReadTooLong(len));
        }
        let addr = addr_bytes(address)?;
        self.run_command(len as u8, &[opcodes::READ, addr[0], addr[1], addr[2]])
    }

    /// Erase, program and verify `image` starting at `base`.
    ///
    /// The image is erased in sectors and programmed in pages, each page
    /// read back immediately. Mismatches are collected rather than
    /// aborting the run: on flaky links a rerun usually heals them, and a
    /// partial flash plus a mismatch list beats stopping at the first bad
    /// page.
    pub fn flash_image(
        &mut self,
        image: &[u8],
        base: u32,
        progress: &mut dyn FlashProgress,
    ) -> Result<Vec<VerifyMismatch>> {
        if base as usize % SECTOR_SIZE != 0 {
            log::warn!(
                "base address 0x{:06X} is not sector aligned; the erase will \
                 clobber the rest of the first sector",
                base
            );
        }

        progress.begin(image.len());
        let mut mismatches = Vec::new();
        let mut done = 0usize;

        for (sector_index, sector) in image.chunks(SECTOR_SIZE).enumerate() {
            let sector_addr = base
                .checked_add((sector_index * SECTOR_SIZE) as u32)
                .ok_or(HostError::AddressOutOfRange(base))?;

            self.write_enable()?;
            self.erase_sector(sector_addr)?;
            progress.sector_erased(sector_addr);

            for (page_index, page) in sector.chunks(PAGE_SIZE).enumerate() {
                let page_addr = sector_addr + (page_index * PAGE_SIZE) as u32;

                self.write_enable()?;
                self.program_page(page_addr, page)?;

                let actual = self.read(page_addr, page.len())?;
                if actual != page {
                    log::warn!("verify mismatch in page at 0x{:06X}", page_addr);
                    mismatches.push(VerifyMismatch {
                        address: page_addr,
                        expected: page.to_vec(),
                        actual,
                    });
                }

                done += page.len();
                progress.page_programmed(done);
            }
        }

        progress.finish();
        Ok(mismatches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimTransport;
    use dotboot_sim::{SimConfig, SimFlash};

    fn small_sim() -> SimTransport {
        SimTransport::with_flash(SimFlash::new(SimConfig {
            size: 256 * 1024,
            ..SimConfig::default()
        }))
    }

    #[test]
    fn ping_and_jedec_id() {
        let mut prog = Programmer::new(small_sim());
        prog.ping().unwrap();
        assert_eq!(prog.read_jedec_id().unwrap(), [0xEF, 0x40, 0x18]);
    }

    #[test]
    fn read_returns_flash_contents() {
        let mut flash = SimFlash::new(SimConfig {
            size: 64 * 1024,
            ..SimConfig::default()
        });
        flash.data_mut()[0x100..0x104].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let mut prog = Programmer::new(SimTransport::with_flash(flash));

        assert_eq!(prog.read(0x100, 4).unwrap(), [0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn flash_image_programs_and_verifies() {
        let mut prog = Programmer::new(small_sim());
        let image: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let mismatches = prog
            .flash_image(&image, 0x1000, &mut NullProgress)
            .unwrap();
        assert!(mismatches.is_empty());
        assert_eq!(
            &prog.transport().flash().data()[0x1000..0x1000 + image.len()],
            &image[..]
        );
    }

    #[test]
    fn flash_image_reports_progress() {
        struct Counting {
            begun: usize,
            sectors: u32,
            last_done: usize,
            finished: bool,
        }
        impl FlashProgress for Counting {
            fn begin(&mut self, total: usize) {
                self.begun = total;
            }
            fn sector_erased(&mut self, _address: u32) {
                self.sectors += 1;
            }
            fn page_programmed(&mut self, done: usize) {
                self.last_done = done;
            }
            fn finish(&mut self) {
                self.finished = true;
            }
        }

        let mut prog = Programmer::new(small_sim());
        let image = vec![0x5A; SECTOR_SIZE + 1];
        let mut progress = Counting {
            begun: 0,
            sectors: 0,
            last_done: 0,
            finished: false,
        };
        prog.flash_image(&image, 0, &mut progress).unwrap();

        assert_eq!(progress.begun, image.len());
        assert_eq!(progress.sectors, 2);
        assert_eq!(progress.last_done, image.len());
        assert!(progress.finished);
    }

    #[test]
    fn address_must_fit_three_bytes() {
        let mut prog = Programmer::new(small_sim());
        assert!(matches!(
            prog.erase_sector(0x0100_0000),
            Err(HostError::AddressOutOfRange(_))
        ));
        assert!(matches!(
            prog.program_page(0, &[0u8; PAGE_SIZE + 1]),
            Err(HostError::PageTooLarge(_))
        ));
        assert!(matches!(
            prog.read(0, 256),
            Err(HostError::ReadTooLong(256))
        ));
    }
}
