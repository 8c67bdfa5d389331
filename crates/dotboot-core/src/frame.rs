//! ASCII-hex frame codec
//!
//! Binary commands are tunneled over a text-safe serial link. A request
//! frame looks like
//!
//! ```text
//! '.' hex2(in_bytes) hex2(out_bytes) hex(payload) hex2(checksum) "\r\n"
//! ```
//!
//! and satisfies `(in_bytes + out_bytes + sum(payload) + checksum) % 256 ==
//! 0`; the checksum byte is the two's complement of everything before it.
//! Responses use the same hex encoding but are terminated by a bare `\n`
//! (the asymmetry is part of the protocol). The decoder keeps the running
//! additive checksum so the consumer only has to check it against zero
//! after the trailing checksum byte.

use crate::error::{Error, Result};
use embedded_io::Write;

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

/// Start marker for request frames, empty acknowledgments and data frames
pub const FRAME_MARKER: u8 = b'.';
/// Marker for the checksum diagnostic frame (nonzero accumulated checksum)
pub const CHECKSUM_MARKER: u8 = b'c';
/// Marker for the frame-error response
pub const ERROR_MARKER: u8 = b'e';

/// Uppercase nibble-to-ASCII lookup
const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// ASCII-to-nibble conversion; accepts both cases
fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for the start marker; all other bytes are ignored
    Idle,
    /// Expecting the high nibble of the next byte
    High,
    /// Expecting the low nibble
    Low,
    /// A non-hex byte was seen; latched until `reset`
    Failed,
}

/// Push-style frame decoder with a running additive checksum.
///
/// Feed raw wire bytes with [`FrameDecoder::push`]; every completed hex
/// pair is returned as one decoded byte and added to the checksum
/// accumulator. The accumulator is zeroed when a new frame starts on the
/// `.` marker, so after the trailing checksum byte of a well-formed frame
/// it reads zero.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    high: u8,
    checksum: u8,
}

impl FrameDecoder {
    /// Create a decoder waiting for a start marker
    pub fn new() -> Self {
        Self {
            state: DecodeState::Idle,
            high: 0,
            checksum: 0,
        }
    }

    /// Drop any in-progress frame or latched failure and resynchronize
    /// on the next start marker
    pub fn reset(&mut self) {
        self.state = DecodeState::Idle;
        self.high = 0;
    }

    /// Feed one raw wire byte.
    ///
    /// Returns `Ok(Some(byte))` when a hex pair completes, `Ok(None)` while
    /// more input is needed, and an error on the first non-hex character
    /// inside a frame body. After an error the decoder stays latched until
    /// [`FrameDecoder::reset`].
    pub fn push(&mut self, raw: u8) -> Result<Option<u8>> {
        match self.state {
            DecodeState::Idle => {
                if raw == FRAME_MARKER {
                    self.checksum = 0;
                    self.state = DecodeState::High;
                }
                Ok(None)
            }
            DecodeState::High => match hex_val(raw) {
                Some(v) => {
                    self.high = v << 4;
                    self.state = DecodeState::Low;
                    Ok(None)
                }
                None => {
                    self.state = DecodeState::Failed;
                    Err(Error::BadHexDigit(raw))
                }
            },
            DecodeState::Low => match hex_val(raw) {
                Some(v) => {
                    let byte = self.high | v;
                    self.checksum = self.checksum.wrapping_add(byte);
                    self.state = DecodeState::High;
                    Ok(Some(byte))
                }
                None => {
                    self.state = DecodeState::Failed;
                    Err(Error::BadHexDigit(raw))
                }
            },
            DecodeState::Failed => Err(Error::DecoderNotReset),
        }
    }

    /// Whether a frame decode is in progress
    pub fn in_frame(&self) -> bool {
        matches!(self.state, DecodeState::High | DecodeState::Low)
    }

    /// Whether the last decode failed and a reset is required
    pub fn failed(&self) -> bool {
        self.state == DecodeState::Failed
    }

    /// Current running checksum accumulator
    pub fn checksum(&self) -> u8 {
        self.checksum
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode one response byte into `tx`.
///
/// `first` emits the marker character before anything else, `last`
/// terminates the frame with `\n`. `empty` suppresses the hex digits and
/// closes the frame right after the marker; it is used for the zero-payload
/// acknowledgment and the error frame, where only the marker and terminator
/// are meaningful. Response frames deliberately end in a bare `\n`, unlike
/// the `\r\n` on the request side.
pub fn encode_response_byte<W: Write>(
    tx: &mut W,
    marker: u8,
    data: u8,
    first: bool,
    last: bool,
    empty: bool,
) -> core::result::Result<(), W::Error> {
    if first {
        tx.write_all(&[marker])?;
    }
    if empty {
        return tx.write_all(b"\n");
    }
    tx.write_all(&[
        HEX_DIGITS[(data >> 4) as usize],
        HEX_DIGITS[(data & 0x0F) as usize],
    ])?;
    if last {
        tx.write_all(b"\n")?;
    }
    Ok(())
}

/// Two's-complement checksum for a request frame
pub fn request_checksum(out_bytes: u8, payload: &[u8]) -> u8 {
    let mut sum = (payload.len() as u8).wrapping_add(out_bytes);
    for &b in payload {
        sum = sum.wrapping_add(b);
    }
    sum.wrapping_neg()
}

/// Build a complete request frame for `payload`, expecting `out_bytes`
/// response bytes.
///
/// The payload length must fit the one-byte `in_bytes` field.
#[cfg(feature = "alloc")]
pub fn encode_request(out_bytes: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > u8::MAX as usize {
        return Err(Error::PayloadTooLong(payload.len()));
    }

    let mut frame = Vec::with_capacity(2 * payload.len() + 9);
    frame.push(FRAME_MARKER);
    push_hex(&mut frame, payload.len() as u8);
    push_hex(&mut frame, out_bytes);
    for &b in payload {
        push_hex(&mut frame, b);
    }
    push_hex(&mut frame, request_checksum(out_bytes, payload));
    frame.extend_from_slice(b"\r\n");
    Ok(frame)
}

#[cfg(feature = "alloc")]
fn push_hex(out: &mut Vec<u8>, byte: u8) {
    out.push(HEX_DIGITS[(byte >> 4) as usize]);
    out.push(HEX_DIGITS[(byte & 0x0F) as usize]);
}

/// A parsed device response
#[cfg(feature = "alloc")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Empty `.` acknowledgment: the command ran and returned no data
    Ack,
    /// Data frame: decoded read-back bytes
    Data(Vec<u8>),
    /// Checksum diagnostic: the device rejected the frame and reports the
    /// nonzero accumulated checksum
    Checksum(u8),
    /// Frame error: the device failed to decode the request
    Error,
}

/// Parse one `\n`-terminated response line.
///
/// Trailing `\r`/`\n` bytes are stripped before classification.
#[cfg(feature = "alloc")]
pub fn parse_response(line: &[u8]) -> Result<Response> {
    let mut body = line;
    while let Some((&last, rest)) = body.split_last() {
        if last == b'\r' || last == b'\n' {
            body = rest;
        } else {
            break;
        }
    }

    let (&marker, hex) = body.split_first().ok_or(Error::TruncatedFrame)?;
    match marker {
        FRAME_MARKER => {
            if hex.is_empty() {
                return Ok(Response::Ack);
            }
            Ok(Response::Data(decode_hex(hex)?))
        }
        CHECKSUM_MARKER => {
            let bytes = decode_hex(hex)?;
            match bytes.as_slice() {
                [value] => Ok(Response::Checksum(*value)),
                _ => Err(Error::TruncatedFrame),
            }
        }
        // The error frame is sent in empty style; tolerate a hex body anyway.
        ERROR_MARKER => Ok(Response::Error),
        other => Err(Error::UnexpectedMarker(other)),
    }
}

#[cfg(feature = "alloc")]
fn decode_hex(hex: &[u8]) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(Error::TruncatedFrame);
    }
    hex.chunks_exact(2)
        .map(|pair| {
            let hi = hex_val(pair[0]).ok_or(Error::BadHexDigit(pair[0]))?;
            let lo = hex_val(pair[1]).ok_or(Error::BadHexDigit(pair[1]))?;
            Ok(hi << 4 | lo)
        })
        .collect()
}
