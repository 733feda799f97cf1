//! Flash session state.
//!
//! A [`FlashSession`] lives for exactly one run of the flasher. It records
//! which phase the run is in, the device identity learned during inquiry and
//! the running checksum of every programmed block.

use crate::protocol::response::DeviceIdentity;
use std::fmt;

/// Protocol phases, in the order they are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Phase {
    /// Nothing sent yet.
    Idle,
    /// Boot-mode handshake (`0x55` / `0xE6`).
    Handshake,
    /// Supported device inquiry (`0x20`).
    DeviceInquiry,
    /// Device selection (`0x10`).
    DeviceSelect,
    /// Clock mode inquiry (`0x21`).
    ClockInquiry,
    /// Clock mode selection (`0x11`).
    ClockSelect,
    /// Programming unit inquiry (`0x27`).
    ProgUnitInquiry,
    /// New bit-rate selection (`0x3F`).
    BitRateSelect,
    /// Bit-rate confirmation (`0x06`).
    BitRateConfirm,
    /// Transition to the programming/erasing state (`0x40`).
    ModeTransition,
    /// User MAT programming selection (`0x43`).
    MatSelect,
    /// 1024-byte block programming (`0x50`).
    Programming,
    /// Programming stop (`0x50` with address `0xFFFFFFFF`).
    ProgrammingStop,
    /// User MAT sum check (`0x4B`).
    SumCheck,
    /// Run finished successfully.
    Done,
    /// Run aborted.
    Failed,
}

impl Phase {
    /// All phases that exchange frames with the device, in order.
    pub const SEQUENCE: [Phase; 13] = [
        Phase::Handshake,
        Phase::DeviceInquiry,
        Phase::DeviceSelect,
        Phase::ClockInquiry,
        Phase::ClockSelect,
        Phase::ProgUnitInquiry,
        Phase::BitRateSelect,
        Phase::BitRateConfirm,
        Phase::ModeTransition,
        Phase::MatSelect,
        Phase::Programming,
        Phase::ProgrammingStop,
        Phase::SumCheck,
    ];

    /// The phase that follows this one in a successful run.
    ///
    /// Terminal phases return themselves.
    pub fn next(self) -> Phase {
        match self {
            Self::Idle => Self::Handshake,
            Self::Handshake => Self::DeviceInquiry,
            Self::DeviceInquiry => Self::DeviceSelect,
            Self::DeviceSelect => Self::ClockInquiry,
            Self::ClockInquiry => Self::ClockSelect,
            Self::ClockSelect => Self::ProgUnitInquiry,
            Self::ProgUnitInquiry => Self::BitRateSelect,
            Self::BitRateSelect => Self::BitRateConfirm,
            Self::BitRateConfirm => Self::ModeTransition,
            Self::ModeTransition => Self::MatSelect,
            Self::MatSelect => Self::Programming,
            Self::Programming => Self::ProgrammingStop,
            Self::ProgrammingStop => Self::SumCheck,
            Self::SumCheck | Self::Done => Self::Done,
            Self::Failed => Self::Failed,
        }
    }

    /// Whether the run can no longer advance.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Human-readable phase name used in diagnostics.
    pub fn description(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Handshake => "handshake",
            Self::DeviceInquiry => "device inquiry",
            Self::DeviceSelect => "device selection",
            Self::ClockInquiry => "clock mode inquiry",
            Self::ClockSelect => "clock mode selection",
            Self::ProgUnitInquiry => "programming unit inquiry",
            Self::BitRateSelect => "bit rate selection",
            Self::BitRateConfirm => "bit rate confirmation",
            Self::ModeTransition => "transition to programming state",
            Self::MatSelect => "user MAT programming selection",
            Self::Programming => "programming",
            Self::ProgrammingStop => "programming stop",
            Self::SumCheck => "user MAT sum check",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Run-time state of a single flashing run.
#[derive(Debug, Clone)]
pub struct FlashSession {
    phase: Phase,
    device: Option<DeviceIdentity>,
    running_sum: u32,
    blocks_written: usize,
}

impl Default for FlashSession {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashSession {
    /// Create a fresh session in [`Phase::Idle`].
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            device: None,
            running_sum: 0,
            blocks_written: 0,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move to the next phase in the sequence.
    ///
    /// Returns the phase that was entered. A terminal session does not move.
    pub fn advance(&mut self) -> Phase {
        self.phase = self.phase.next();
        self.phase
    }

    /// Mark the session as failed.
    pub fn fail(&mut self) {
        self.phase = Phase::Failed;
    }

    /// Device identity recorded during inquiry.
    pub fn device(&self) -> Option<&DeviceIdentity> {
        self.device.as_ref()
    }

    /// Record the identity returned by the device inquiry.
    pub fn set_device(&mut self, device: DeviceIdentity) {
        self.device = Some(device);
    }

    /// Add one programmed block's checksum to the running sum.
    pub fn record_block(&mut self, block_checksum: u8) {
        self.running_sum = self
            .running_sum
            .wrapping_add(u32::from(block_checksum));
        self.blocks_written += 1;
    }

    /// Sum of all programmed blocks' checksums.
    pub fn running_sum(&self) -> u32 {
        self.running_sum
    }

    /// Number of blocks acknowledged so far.
    pub fn blocks_written(&self) -> usize {
        self.blocks_written
    }
}
