//! Boot-mode command frames.
//!
//! The boot ROM speaks a byte-oriented command/response protocol. Requests
//! come in three shapes:
//!
//! ```text
//! Bare:     +-----+
//!           | CMD |
//!           +-----+
//!
//! Sized:    +-----+------+---------------+-----+
//!           | CMD | SIZE |    PAYLOAD    | SUM |
//!           +-----+------+---------------+-----+
//!           |  1  |  1   |     SIZE      |  1  |
//!           +-----+------+---------------+-----+
//!
//! Program:  +------+-------------+----------------+-----+
//!           | 0x50 | ADDRESS(BE) |  DATA (1024)   | SUM |
//!           +------+-------------+----------------+-----+
//!           |  1   |      4      |  1024 or none  |  1  |
//!           +------+-------------+----------------+-----+
//! ```
//!
//! `SUM` is the two's-complement negation of the sum of every preceding byte
//! (see [`checksum`]). All multi-byte fields are big-endian.

use crate::error::{Error, Result};
use crate::protocol::checksum::{checksum, verify};
use byteorder::{BigEndian, WriteBytesExt};

/// Generic acknowledgment byte.
pub const ACK: u8 = 0x06;

/// Negative acknowledgment byte.
pub const NAK: u8 = 0x15;

/// Response to a successful handshake (not the generic ACK).
pub const HANDSHAKE_ACK: u8 = 0xE6;

/// Response code of the supported device inquiry.
pub const DEVICE_INQUIRY_RESPONSE: u8 = 0x30;

/// Response code of the clock mode inquiry.
pub const CLOCK_MODE_RESPONSE: u8 = 0x31;

/// Response code of the programming unit inquiry.
pub const PROG_UNIT_RESPONSE: u8 = 0x37;

/// Response code of the User MAT sum check.
pub const SUM_CHECK_RESPONSE: u8 = 0x5B;

/// Size of one programming block.
pub const BLOCK_SIZE: usize = 1024;

/// Address that terminates programming.
pub const STOP_ADDRESS: u32 = 0xFFFF_FFFF;

/// Length of the device code returned by the device inquiry.
pub const DEVICE_CODE_LEN: usize = 4;

/// Length of a block programming frame: command, address, data, checksum.
pub const PROGRAM_FRAME_LEN: usize = 1 + 4 + BLOCK_SIZE + 1;

/// Boot-mode command bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Begin the inquiry/selection state (0x55).
    Handshake = 0x55,
    /// Supported device inquiry (0x20).
    DeviceInquiry = 0x20,
    /// Device selection (0x10).
    DeviceSelect = 0x10,
    /// Clock mode inquiry (0x21).
    ClockInquiry = 0x21,
    /// Clock mode selection (0x11).
    ClockSelect = 0x11,
    /// Programming unit inquiry (0x27).
    ProgUnitInquiry = 0x27,
    /// New bit-rate selection (0x3F).
    BitRateSelect = 0x3F,
    /// Bit-rate confirmation (0x06, same value as ACK).
    BitRateConfirm = 0x06,
    /// Transition to the programming/erasing state (0x40).
    EnterProgramming = 0x40,
    /// User MAT programming selection (0x43).
    UserMatSelect = 0x43,
    /// 1024-byte programming (0x50).
    Program = 0x50,
    /// User MAT sum check (0x4B).
    UserMatSumCheck = 0x4B,
}

impl Command {
    /// Raw command byte.
    pub fn byte(self) -> u8 {
        self as u8
    }
}

/// Parameters of the new bit-rate selection command.
///
/// The defaults describe 115200 bps with a 16 MHz input clock and a
/// multiplication ratio of 1 for both the system and peripheral clocks.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BitRateParams {
    /// Bit rate in units of 100 bps.
    pub bit_rate: u16,
    /// Input clock frequency in units of 0.01 MHz.
    pub input_frequency: u16,
    /// Clock multiplication ratios, one per clock.
    pub multipliers: Vec<u8>,
}

impl Default for BitRateParams {
    fn default() -> Self {
        Self {
            bit_rate: 1152,
            input_frequency: 1600,
            multipliers: vec![0x01, 0x01],
        }
    }
}

impl BitRateParams {
    /// Bit rate in bits per second.
    pub fn bps(&self) -> u32 {
        u32::from(self.bit_rate) * 100
    }

    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.multipliers.len());
        buf.write_u16::<BigEndian>(self.bit_rate).unwrap();
        buf.write_u16::<BigEndian>(self.input_frequency).unwrap();
        // Number of ratios is bounded by the one-byte size field
        buf.push(self.multipliers.len() as u8);
        buf.extend_from_slice(&self.multipliers);
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Bare,
    Sized,
    Program,
}

/// Request frame builder.
#[derive(Debug)]
pub struct CommandFrame {
    command: Command,
    layout: Layout,
    data: Vec<u8>,
}

impl CommandFrame {
    fn new(command: Command, layout: Layout) -> Self {
        Self {
            command,
            layout,
            data: Vec::new(),
        }
    }

    /// A single command byte with no payload and no checksum.
    pub fn bare(command: Command) -> Self {
        Self::new(command, Layout::Bare)
    }

    /// Handshake request (`0x55`).
    pub fn handshake() -> Self {
        Self::bare(Command::Handshake)
    }

    /// Device selection for the 4-character device code.
    ///
    /// Frame structure (7 bytes): `0x10`, size `0x04`, code, checksum.
    pub fn device_select(code: &[u8; DEVICE_CODE_LEN]) -> Self {
        let mut frame = Self::new(Command::DeviceSelect, Layout::Sized);
        frame.data.extend_from_slice(code);
        frame
    }

    /// Clock mode selection.
    ///
    /// Frame structure (4 bytes): `0x11`, size `0x01`, mode, checksum.
    pub fn clock_select(mode: u8) -> Self {
        let mut frame = Self::new(Command::ClockSelect, Layout::Sized);
        frame.data.push(mode);
        frame
    }

    /// New bit-rate selection.
    pub fn bit_rate_select(params: &BitRateParams) -> Self {
        let mut frame = Self::new(Command::BitRateSelect, Layout::Sized);
        frame.data = params.encode();
        frame
    }

    /// Programming of one 1024-byte block at `address`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn program_block(address: u32, block: &[u8; BLOCK_SIZE]) -> Self {
        let mut frame = Self::new(Command::Program, Layout::Program);
        frame.data.reserve(4 + BLOCK_SIZE);
        frame.data.write_u32::<BigEndian>(address).unwrap();
        frame.data.extend_from_slice(block);
        frame
    }

    /// Programming stop: the programming command with address `0xFFFFFFFF`
    /// and no data.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn program_stop() -> Self {
        let mut frame = Self::new(Command::Program, Layout::Program);
        frame.data.write_u32::<BigEndian>(STOP_ADDRESS).unwrap();
        frame
    }

    /// Build the complete frame data.
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.data.len() + 3);
        buf.push(self.command.byte());

        match self.layout {
            Layout::Bare => return buf,
            // Sized payloads are built by this module and never exceed 255 bytes
            Layout::Sized => buf.push(self.data.len() as u8),
            Layout::Program => {},
        }

        buf.extend_from_slice(&self.data);
        let sum = checksum(&buf);
        buf.push(sum);
        buf
    }

    /// Get the command.
    pub fn command(&self) -> Command {
        self.command
    }
}

/// A sized frame: `[CMD][SIZE][PAYLOAD][SUM]`.
///
/// Sized responses (sum check) and most sized requests share this layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command or response code.
    pub command: u8,
    /// Payload, `SIZE` bytes long.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Smallest possible sized frame (empty payload).
    pub const MIN_LEN: usize = 3;

    /// Create a frame.
    pub fn new(command: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    /// Encode the frame, appending its checksum.
    ///
    /// Returns an error if the payload does not fit the one-byte size field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let size = u8::try_from(self.payload.len()).map_err(|_| Error::SizeMismatch {
            expected: usize::from(u8::MAX),
            actual: self.payload.len(),
        })?;

        let mut buf = Vec::with_capacity(self.payload.len() + Self::MIN_LEN);
        buf.push(self.command);
        buf.push(size);
        buf.extend_from_slice(&self.payload);
        let sum = checksum(&buf);
        buf.push(sum);
        Ok(buf)
    }

    /// Decode a sized frame from the start of `data`.
    ///
    /// The declared size determines where the checksum sits; bytes after the
    /// checksum are ignored. The checksum must be valid.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_LEN {
            return Err(Error::ShortFrame {
                expected: Self::MIN_LEN,
                actual: data.len(),
            });
        }

        let size = usize::from(data[1]);
        let total = size + Self::MIN_LEN;
        if data.len() < total {
            return Err(Error::ShortFrame {
                expected: total,
                actual: data.len(),
            });
        }

        let frame = &data[..total];
        if !verify(frame) {
            return Err(Error::ChecksumMismatch {
                expected: checksum(&frame[..total - 1]),
                actual: frame[total - 1],
            });
        }

        Ok(Self {
            command: frame[0],
            payload: frame[2..total - 1].to_vec(),
        })
    }
}
