//! Boot-mode response decoding.
//!
//! Variable-length inquiry responses arrive in two bulk transfers: the body
//! first, then a single checksum byte. The decoders here take both parts
//! separately; [`DeviceInquiry::body_len`] and [`InquiryList::body_len`]
//! tell the caller whether the checksum already arrived with the body.
//!
//! Every multi-field response starts with its own response code. A frame
//! led by anything else is rejected with [`Error::Nak`] or
//! [`Error::UnexpectedResponse`] before any other field is looked at.

use crate::error::{Error, Result};
use crate::protocol::checksum::checksum;
use crate::protocol::frame::{
    DEVICE_CODE_LEN, DEVICE_INQUIRY_RESPONSE, Frame, NAK, SUM_CHECK_RESPONSE,
};
use byteorder::{BigEndian, ByteOrder};
use std::fmt;

/// Check that a response starts with `expected`.
pub fn expect_byte(response: &[u8], expected: u8) -> Result<()> {
    match response.first() {
        None => Err(Error::ShortFrame {
            expected: 1,
            actual: 0,
        }),
        Some(&actual) if actual == expected => Ok(()),
        Some(&NAK) => Err(Error::Nak {
            expected,
            code: NAK,
        }),
        Some(&actual) => Err(Error::UnexpectedResponse { expected, actual }),
    }
}

/// Identity of the device that answered the supported device inquiry.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceIdentity {
    /// Four-character device code, echoed back in the device selection.
    pub code: [u8; DEVICE_CODE_LEN],
    /// Product name.
    pub name: String,
}

impl DeviceIdentity {
    /// Device code as text.
    pub fn code_str(&self) -> String {
        String::from_utf8_lossy(&self.code).into_owned()
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.code_str(), self.name)
    }
}

/// Supported device inquiry response.
///
/// ```text
/// +-----+------+------+-------+-----------+-------------+-----+
/// | CMD | SIZE | NDEV | NCHAR | CODE (4)  | NAME(NCHAR) | SUM |
/// +-----+------+------+-------+-----------+-------------+-----+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInquiry {
    /// Response code.
    pub command: u8,
    /// Declared size.
    pub size: u8,
    /// Number of devices the boot ROM supports.
    pub device_count: u8,
    /// Identity of the first device.
    pub identity: DeviceIdentity,
}

impl DeviceInquiry {
    /// Length of the fixed header, up to and including the device code.
    pub const HEADER_LEN: usize = 4 + DEVICE_CODE_LEN;

    /// Length of the body (everything except the checksum) announced by the
    /// header in `data`.
    pub fn body_len(data: &[u8]) -> Result<usize> {
        if data.len() < Self::HEADER_LEN {
            return Err(Error::ShortFrame {
                expected: Self::HEADER_LEN,
                actual: data.len(),
            });
        }
        Ok(Self::HEADER_LEN + usize::from(data[3]))
    }

    /// Decode the response body and verify it against the separately
    /// received checksum byte.
    pub fn parse(body: &[u8], sum: u8) -> Result<Self> {
        expect_byte(body, DEVICE_INQUIRY_RESPONSE)?;
        let len = Self::body_len(body)?;
        if body.len() < len {
            return Err(Error::ShortFrame {
                expected: len,
                actual: body.len(),
            });
        }

        let body = &body[..len];
        let computed = checksum(body);
        if computed != sum {
            return Err(Error::ChecksumMismatch {
                expected: computed,
                actual: sum,
            });
        }

        let mut code = [0u8; DEVICE_CODE_LEN];
        code.copy_from_slice(&body[4..Self::HEADER_LEN]);
        let name = String::from_utf8_lossy(&body[Self::HEADER_LEN..])
            .trim_end_matches('\0')
            .to_string();

        Ok(Self {
            command: body[0],
            size: body[1],
            device_count: body[2],
            identity: DeviceIdentity { code, name },
        })
    }
}

/// Clock mode or programming unit inquiry response.
///
/// ```text
/// +-----+------+-------+-------------+-----+
/// | CMD | SIZE | COUNT | ENTRIES ... | SUM |
/// +-----+------+-------+-------------+-----+
/// ```
///
/// The checksum of these responses is informational only; a mismatch is
/// recorded in [`InquiryList::checksum_ok`] but never rejected.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InquiryList {
    /// Response code.
    pub command: u8,
    /// Declared size.
    pub size: u8,
    /// Mode or unit codes.
    pub entries: Vec<u8>,
    /// Raw body as received.
    pub raw: Vec<u8>,
    /// Trailing checksum byte.
    pub checksum: u8,
    /// Whether the checksum matched the body.
    pub checksum_ok: bool,
}

impl InquiryList {
    /// Length of the body announced by the size field, if present.
    pub fn body_len(data: &[u8]) -> Option<usize> {
        data.get(1)
            .map(|&size| 2 + usize::from(size))
    }

    /// Decode a list answering with `response_code`. Truncated bodies
    /// yield as many entries as were received.
    pub fn parse(body: &[u8], sum: u8, response_code: u8) -> Result<Self> {
        expect_byte(body, response_code)?;
        let command = body[0];
        let size = body
            .get(1)
            .copied()
            .unwrap_or_default();

        let payload_end = (2 + usize::from(size)).min(body.len());
        let payload = body.get(2..payload_end).unwrap_or_default();
        let entries = match payload.split_first() {
            Some((&count, rest)) => rest[..usize::from(count).min(rest.len())].to_vec(),
            None => Vec::new(),
        };

        Ok(Self {
            command,
            size,
            entries,
            raw: body.to_vec(),
            checksum: sum,
            checksum_ok: checksum(body) == sum,
        })
    }
}

impl fmt::Display for InquiryList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for entry in &self.entries {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "0x{entry:02X}")?;
            first = false;
        }
        Ok(())
    }
}

/// User MAT sum check response.
///
/// ```text
/// +-----+------+--------------+-----+
/// | CMD | SIZE | SUM (4, BE)  | SUM |
/// +-----+------+--------------+-----+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SumCheckResult {
    /// Response code.
    pub command: u8,
    /// Sum of the written memory as computed by the device.
    pub sum: u32,
    /// Frame checksum byte.
    pub frame_checksum: u8,
}

impl SumCheckResult {
    /// Size of the payload.
    pub const PAYLOAD_LEN: usize = 4;

    /// Full frame length.
    pub const LEN: usize = Self::PAYLOAD_LEN + Frame::MIN_LEN;

    /// Decode and verify the response.
    pub fn parse(data: &[u8]) -> Result<Self> {
        expect_byte(data, SUM_CHECK_RESPONSE)?;
        if data.len() < Frame::MIN_LEN {
            return Err(Error::ShortFrame {
                expected: Self::LEN,
                actual: data.len(),
            });
        }
        if usize::from(data[1]) != Self::PAYLOAD_LEN {
            return Err(Error::SizeMismatch {
                expected: Self::PAYLOAD_LEN,
                actual: usize::from(data[1]),
            });
        }

        let frame = Frame::decode(data)?;
        Ok(Self {
            command: frame.command,
            sum: BigEndian::read_u32(&frame.payload),
            frame_checksum: data[Self::LEN - 1],
        })
    }
}
