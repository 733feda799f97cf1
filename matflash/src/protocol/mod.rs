//! Boot-mode protocol: checksums, command frames and response parsing.

pub mod checksum;
pub mod frame;
pub mod response;

// Re-export common types
pub use frame::{ACK, BLOCK_SIZE, BitRateParams, Command, CommandFrame, Frame, NAK};
pub use response::{DeviceIdentity, DeviceInquiry, InquiryList, SumCheckResult};
