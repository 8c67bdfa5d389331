//! Transports for reaching the bootloader
//!
//! The wire protocol is line oriented: the host writes one `\r\n`-terminated
//! request frame and reads back exactly one `\n`-terminated response line
//! per command, so the transport surface is just [`Transport::send`] and
//! [`Transport::recv_line`]. Three implementations are provided: a serial
//! port (the normal case), a TCP socket (for a bootloader behind a serial
//! mux), and an in-process simulator for tests and dry runs.

use crate::error::{HostError, Result};
use dotboot_core::bootloader::Bootloader;
use dotboot_sim::{SimBus, SimFlash};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Default serial baud rate
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default response timeout
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A byte pipe to the bootloader
pub trait Transport {
    /// Write one complete request frame
    fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Read one `\n`-terminated response line, terminator included
    fn recv_line(&mut self) -> Result<Vec<u8>>;
}

impl Transport for Box<dyn Transport> {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        (**self).send(frame)
    }

    fn recv_line(&mut self) -> Result<Vec<u8>> {
        (**self).recv_line()
    }
}

/// Read bytes until `\n`, mapping timeouts and EOF to transport errors
fn read_line<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Err(HostError::Disconnected),
            Ok(_) => {
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    return Ok(line);
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                return Err(HostError::Timeout)
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Serial port transport, 8N1 with no flow control
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open a serial port at the given baud rate
    pub fn open(device: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(device, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(RESPONSE_TIMEOUT)
            .open()?;

        log::info!("Opened serial port {} at {} baud", device, baud);
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.port.write_all(frame)?;
        self.port.flush()?;
        Ok(())
    }

    fn recv_line(&mut self) -> Result<Vec<u8>> {
        read_line(&mut self.port)
    }
}

/// TCP socket transport for a bootloader behind a serial-over-network
/// bridge
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Connect to `host:port`
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let stream = TcpStream::connect(&addr)?;
        // Each command is a tiny frame; don't let Nagle sit on it.
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(RESPONSE_TIMEOUT))?;
        stream.set_write_timeout(Some(RESPONSE_TIMEOUT))?;

        log::info!("Connected to {}", addr);
        Ok(Self { stream })
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.stream.write_all(frame)?;
        self.stream.flush()?;
        Ok(())
    }

    fn recv_line(&mut self) -> Result<Vec<u8>> {
        read_line(&mut self.stream)
    }
}

/// In-process transport: frames are fed straight into a simulated
/// bootloader with a [`SimFlash`] behind it.
///
/// The device responds synchronously, so every response line is already
/// queued when [`Transport::recv_line`] is called.
pub struct SimTransport {
    boot: Bootloader<SimBus>,
    rx: VecDeque<u8>,
}

impl SimTransport {
    /// Simulated bootloader over a blank default flash
    pub fn new() -> Self {
        Self::with_flash(SimFlash::new_default())
    }

    /// Simulated bootloader over the given flash
    pub fn with_flash(flash: SimFlash) -> Self {
        Self {
            boot: Bootloader::new(SimBus::new(flash)),
            rx: VecDeque::new(),
        }
    }

    /// Inspect the simulated flash contents
    pub fn flash(&self) -> &SimFlash {
        self.boot.bus().flash()
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimTransport {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        let mut tx: Vec<u8> = Vec::new();
        for &b in frame {
            if let Err(e) = self.boot.handle_byte(b, &mut tx) {
                match e {}
            }
        }
        self.rx.extend(tx);
        Ok(())
    }

    fn recv_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        while let Some(b) = self.rx.pop_front() {
            line.push(b);
            if b == b'\n' {
                return Ok(line);
            }
        }
        // The simulator answers within send(); an empty queue means the
        // command produced no response line.
        Err(HostError::Timeout)
    }
}

/// A parsed connection string.
///
/// Accepted forms:
/// - `/dev/ttyACM0` or `dev=/dev/ttyACM0,baud=1000000` - serial port
/// - `ip=host:port` - TCP
/// - `sim:` - in-process simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    /// Serial port
    Serial {
        /// Device path
        path: String,
        /// Baud rate
        baud: u32,
    },
    /// TCP socket
    Tcp {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
    /// In-process simulator
    Sim,
}

impl Connection {
    /// Parse a connection string
    pub fn parse(spec: &str) -> Result<Self> {
        if let Some(addr) = spec.strip_prefix("ip=") {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| HostError::BadConnection(spec.to_string()))?;
            let port = port
                .parse()
                .map_err(|_| HostError::BadConnection(spec.to_string()))?;
            return Ok(Self::Tcp {
                host: host.to_string(),
                port,
            });
        }

        if spec == "sim" || spec == "sim:" {
            return Ok(Self::Sim);
        }

        let mut path = None;
        let mut baud = DEFAULT_BAUD;
        for part in spec.split(',') {
            if let Some(dev) = part.strip_prefix("dev=") {
                path = Some(dev.to_string());
            } else if let Some(rate) = part.strip_prefix("baud=") {
                baud = rate
                    .parse()
                    .map_err(|_| HostError::BadConnection(spec.to_string()))?;
            } else if path.is_none() && !part.is_empty() {
                // A bare token is the device path.
                path = Some(part.to_string());
            } else {
                return Err(HostError::BadConnection(spec.to_string()));
            }
        }

        match path {
            Some(path) => Ok(Self::Serial { path, baud }),
            None => Err(HostError::BadConnection(spec.to_string())),
        }
    }

    /// Open the transport this connection describes
    pub fn open(&self) -> Result<Box<dyn Transport>> {
        match self {
            Self::Serial { path, baud } => Ok(Box::new(SerialTransport::open(path, *baud)?)),
            Self::Tcp { host, port } => Ok(Box::new(TcpTransport::connect(host, *port)?)),
            Self::Sim => Ok(Box::new(SimTransport::new())),
        }
    }
}
