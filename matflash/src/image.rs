//! Firmware images and their split into programming blocks.
//!
//! The User MAT is programmed in 1024-byte blocks, starting at address 0.
//! An image whose size is not a multiple of the block size either gets its
//! last block padded ([`PaddingPolicy::Pad`], the default, with the erased
//! flash value `0xFF`) or is rejected ([`PaddingPolicy::Strict`]).

use crate::error::{Error, Result};
use crate::protocol::checksum::checksum;
use crate::protocol::frame::{BLOCK_SIZE, CommandFrame, STOP_ADDRESS};
use log::debug;
use std::path::Path;

/// Value of erased flash memory.
pub const ERASED_BYTE: u8 = 0xFF;

/// How to handle a final block shorter than [`BLOCK_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PaddingPolicy {
    /// Pad the final block with the given fill byte.
    Pad(u8),
    /// Reject images that are not a whole number of blocks.
    Strict,
}

impl Default for PaddingPolicy {
    fn default() -> Self {
        Self::Pad(ERASED_BYTE)
    }
}

/// One block of firmware, ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgrammingChunk {
    /// Zero-based block index.
    pub index: usize,
    /// Target address (`index * 1024`).
    pub address: u32,
    /// Block data.
    pub data: Box<[u8; BLOCK_SIZE]>,
}

impl ProgrammingChunk {
    /// The programming frame for this block.
    pub fn frame(&self) -> CommandFrame {
        CommandFrame::program_block(self.address, &self.data)
    }

    /// Checksum byte of this block's programming frame.
    pub fn checksum(&self) -> u8 {
        let mut header = [0u8; 5];
        header[0] = crate::protocol::frame::Command::Program.byte();
        header[1..].copy_from_slice(&self.address.to_be_bytes());
        let head = checksum(&header);
        let body = checksum(&self.data[..]);
        // Negated sums add up: -(a + b) = -a + -b
        head.wrapping_add(body)
    }
}

/// A firmware image destined for the User MAT.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
    policy: PaddingPolicy,
}

impl FirmwareImage {
    /// Load an image from a raw binary file.
    pub fn from_file<P: AsRef<Path>>(path: P, policy: PaddingPolicy) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        debug!("Loaded {} ({} bytes)", path.display(), data.len());
        Self::from_bytes(data, policy)
    }

    /// Wrap raw image bytes.
    pub fn from_bytes(data: Vec<u8>, policy: PaddingPolicy) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidImage("image is empty".into()));
        }

        let remainder = data.len() % BLOCK_SIZE;
        if remainder != 0 && policy == PaddingPolicy::Strict {
            return Err(Error::InvalidImage(format!(
                "image size {} is not a multiple of {BLOCK_SIZE} bytes ({} bytes in the last block)",
                data.len(),
                remainder
            )));
        }

        let image = Self { data, policy };
        let last_end = image.chunk_count() as u64 * BLOCK_SIZE as u64;
        if last_end > u64::from(STOP_ADDRESS) {
            return Err(Error::InvalidImage(format!(
                "image size {} exceeds the addressable range",
                image.len()
            )));
        }

        Ok(image)
    }

    /// Raw image size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image is empty. Loaded images never are.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Padding policy in effect.
    pub fn policy(&self) -> PaddingPolicy {
        self.policy
    }

    /// Raw image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of blocks the image is sent as.
    pub fn chunk_count(&self) -> usize {
        self.data.len().div_ceil(BLOCK_SIZE)
    }

    /// Bytes added to the final block.
    pub fn padding(&self) -> usize {
        self.chunk_count() * BLOCK_SIZE - self.data.len()
    }

    /// Blocks in increasing address order.
    #[allow(clippy::cast_possible_truncation)]
    pub fn chunks(&self) -> impl Iterator<Item = ProgrammingChunk> + '_ {
        let fill = match self.policy {
            PaddingPolicy::Pad(fill) => fill,
            PaddingPolicy::Strict => ERASED_BYTE,
        };

        self.data
            .chunks(BLOCK_SIZE)
            .enumerate()
            .map(move |(index, slice)| {
                let mut data = Box::new([fill; BLOCK_SIZE]);
                data[..slice.len()].copy_from_slice(slice);
                ProgrammingChunk {
                    index,
                    // Bounded by the range check in from_bytes
                    address: (index * BLOCK_SIZE) as u32,
                    data,
                }
            })
    }

    /// Sum the device should report after programming this image.
    pub fn expected_sum(&self) -> u32 {
        self.chunks()
            .fold(0u32, |acc, chunk| acc.wrapping_add(u32::from(chunk.checksum())))
    }
}
