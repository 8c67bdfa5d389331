//! Host-side error type

/// Errors raised by the host client
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// I/O error on the transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port error
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Frame encode/parse error
    #[error("frame error: {0}")]
    Frame(#[from] dotboot_core::Error),

    /// Malformed connection string
    #[error("invalid connection string {0:?} (expected a serial path, dev=PATH[,baud=N], ip=HOST:PORT, or sim:)")]
    BadConnection(String),

    /// The device rejected the request frame as corrupted
    #[error("device rejected the frame, checksum residue 0x{0:02X}")]
    ChecksumRejected(u8),

    /// The device failed to decode the request frame
    #[error("device reported a frame decode error")]
    DeviceError,

    /// A response line that parsed but does not fit the command
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// No response line arrived in time
    #[error("timed out waiting for a response")]
    Timeout,

    /// The transport closed mid-response
    #[error("connection closed by the device")]
    Disconnected,

    /// An address that does not fit the 3-byte wire format
    #[error("address 0x{0:X} does not fit a 3-byte flash address")]
    AddressOutOfRange(u32),

    /// A read longer than one response frame can carry
    #[error("read of {0} bytes exceeds the single-frame limit")]
    ReadTooLong(usize),

    /// A page write longer than the program limit
    #[error("page of {0} bytes exceeds the program limit")]
    PageTooLarge(usize),
}

/// Result type alias for host operations
pub type Result<T> = std::result::Result<T, HostError>;
