//! User MAT flasher.
//!
//! Drives one complete boot-mode session over a [`Transport`]: handshake,
//! device and clock negotiation, block programming and the final sum check.
//! The run is strictly sequential. The first error aborts it; there are no
//! retries and no way to resume.
//!
//! ## Example
//!
//! ```rust,no_run
//! use matflash::{FirmwareImage, Flasher, PaddingPolicy, UsbConfig, UsbPort};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("firmware.bin", PaddingPolicy::default())?;
//!     let mut port = UsbPort::open(&UsbConfig::default())?;
//!
//!     let report = Flasher::new(&mut port).run(&image, &mut ())?;
//!     println!("Programmed {} blocks on {}", report.chunks_written, report.device);
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::image::{FirmwareImage, ProgrammingChunk};
use crate::port::{DEFAULT_TIMEOUT, MAX_TRANSFER, Transport};
use crate::protocol::frame::{
    ACK, BitRateParams, CLOCK_MODE_RESPONSE, Command, CommandFrame, DEVICE_INQUIRY_RESPONSE,
    HANDSHAKE_ACK, PROG_UNIT_RESPONSE,
};
use crate::protocol::response::{
    DeviceIdentity, DeviceInquiry, InquiryList, SumCheckResult, expect_byte,
};
use crate::session::{FlashSession, Phase};
use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;

/// Default clock mode sent in the clock mode selection.
pub const DEFAULT_CLOCK_MODE: u8 = 0x01;

/// Read size for single-byte acknowledgements and the sum check response.
const ACK_READ_LEN: usize = 64;

/// Progress sink for a flashing run.
///
/// All methods default to doing nothing; `()` is the null reporter.
pub trait Reporter {
    /// A protocol phase is about to start.
    fn phase_started(&mut self, _phase: Phase) {}

    /// The device answered the supported device inquiry.
    fn device_detected(&mut self, _device: &DeviceIdentity) {}

    /// The device listed its clock modes.
    fn clock_modes(&mut self, _modes: &InquiryList) {}

    /// The device listed its programming units.
    fn programming_units(&mut self, _units: &InquiryList) {}

    /// A block was acknowledged.
    fn chunk_written(&mut self, _written: usize, _total: usize) {}
}

impl Reporter for () {}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashReport {
    /// Device that was programmed.
    pub device: DeviceIdentity,
    /// Clock modes reported by the device.
    pub clock_modes: InquiryList,
    /// Programming units reported by the device.
    pub programming_units: InquiryList,
    /// Number of 1024-byte blocks programmed.
    pub chunks_written: usize,
    /// User MAT sum, as reported by the device and verified locally.
    pub checksum: u32,
}

type InterruptChecker = Arc<dyn Fn() -> bool + Send + Sync>;

/// Boot-mode User MAT flasher.
///
/// Generic over the transport `T`. Pass `&mut port` to keep ownership of
/// the port outside the flasher.
pub struct Flasher<T: Transport> {
    transport: T,
    timeout: Duration,
    bit_rate: BitRateParams,
    clock_mode: u8,
    interrupt_checker: Option<InterruptChecker>,
    session: FlashSession,
}

impl<T: Transport> Flasher<T> {
    /// Create a flasher with default settings.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            timeout: DEFAULT_TIMEOUT,
            bit_rate: BitRateParams::default(),
            clock_mode: DEFAULT_CLOCK_MODE,
            interrupt_checker: None,
            session: FlashSession::new(),
        }
    }

    /// Set the per-exchange timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the bit-rate selection parameters.
    #[must_use]
    pub fn with_bit_rate(mut self, params: BitRateParams) -> Self {
        self.bit_rate = params;
        self
    }

    /// Set the clock mode to select.
    #[must_use]
    pub fn with_clock_mode(mut self, mode: u8) -> Self {
        self.clock_mode = mode;
        self
    }

    /// Use `checker` instead of the process-wide interrupt checker.
    #[must_use]
    pub fn with_interrupt_checker<F>(mut self, checker: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.interrupt_checker = Some(Arc::new(checker));
        self
    }

    /// State of the current or last run.
    pub fn session(&self) -> &FlashSession {
        &self.session
    }

    /// Get a reference to the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Consume the flasher and return the underlying transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Program `image` into the User MAT.
    ///
    /// On failure the session ends in [`Phase::Failed`]. An error returned
    /// once programming has started is [`Error::ProgrammingIncomplete`] and
    /// means the User MAT holds a partial image.
    pub fn run<R>(&mut self, image: &FirmwareImage, reporter: &mut R) -> Result<FlashReport>
    where
        R: Reporter + ?Sized,
    {
        self.session = FlashSession::new();
        info!(
            "Flashing {} bytes ({} blocks) via {}",
            image.len(),
            image.chunk_count(),
            self.transport.name()
        );

        match self.run_phases(image, reporter) {
            Ok(report) => {
                info!("User MAT sum verified: 0x{:08X}", report.checksum);
                Ok(report)
            },
            Err(e) => {
                debug!("Aborting in {}: {e}", self.session.phase());
                self.session.fail();
                Err(e)
            },
        }
    }

    fn run_phases<R>(&mut self, image: &FirmwareImage, reporter: &mut R) -> Result<FlashReport>
    where
        R: Reporter + ?Sized,
    {
        self.step(reporter, |f, _| f.handshake())?;
        let device = self.step(reporter, |f, r| f.device_inquiry(r))?;
        self.step(reporter, |f, _| f.device_select(&device))?;
        let clock_modes = self.step(reporter, |f, r| {
            let modes = f.list_inquiry(Command::ClockInquiry, CLOCK_MODE_RESPONSE, "Clock modes")?;
            r.clock_modes(&modes);
            Ok(modes)
        })?;
        self.step(reporter, |f, _| {
            let frame = CommandFrame::clock_select(f.clock_mode);
            f.exchange(&frame, ACK)
        })?;
        let programming_units = self.step(reporter, |f, r| {
            let units =
                f.list_inquiry(Command::ProgUnitInquiry, PROG_UNIT_RESPONSE, "Programming units")?;
            r.programming_units(&units);
            Ok(units)
        })?;
        self.step(reporter, |f, _| {
            let frame = CommandFrame::bit_rate_select(&f.bit_rate);
            f.exchange(&frame, ACK)
        })?;
        self.step(reporter, |f, _| f.confirm_bit_rate())?;
        self.step(reporter, |f, _| {
            f.exchange(&CommandFrame::bare(Command::EnterProgramming), ACK)
        })?;
        self.step(reporter, |f, _| {
            f.exchange(&CommandFrame::bare(Command::UserMatSelect), ACK)
        })?;

        self.program(image, reporter)?;

        self.step(reporter, |f, _| f.exchange(&CommandFrame::program_stop(), ACK))?;
        let checksum = self.step(reporter, |f, _| f.sum_check())?;
        self.session.advance();

        Ok(FlashReport {
            device,
            clock_modes,
            programming_units,
            chunks_written: self.session.blocks_written(),
            checksum,
        })
    }

    /// Enter the next phase and run `body`, tagging any error with the phase.
    fn step<R, O, F>(&mut self, reporter: &mut R, body: F) -> Result<O>
    where
        R: Reporter + ?Sized,
        F: FnOnce(&mut Self, &mut R) -> Result<O>,
    {
        let phase = self.session.advance();

        // Once every block is written the run finishes so the result is verified.
        if !matches!(phase, Phase::ProgrammingStop | Phase::SumCheck) && self.is_interrupted() {
            info!("Interrupted before {phase}");
            return Err(Error::Interrupted);
        }

        debug!("Phase: {phase}");
        reporter.phase_started(phase);
        body(self, reporter).map_err(|source| Error::PhaseFailed {
            phase,
            source: Box::new(source),
        })
    }

    fn is_interrupted(&self) -> bool {
        match &self.interrupt_checker {
            Some(checker) => checker(),
            None => crate::is_interrupted_requested(),
        }
    }

    fn send_command(&mut self, frame: &CommandFrame) -> Result<()> {
        let data = frame.build();
        trace!(
            "Sending command {:?}: {} bytes",
            frame.command(),
            data.len()
        );
        self.transport.send_all(&data, self.timeout)
    }

    /// Send `frame` and expect a single `expected` byte in return.
    fn exchange(&mut self, frame: &CommandFrame, expected: u8) -> Result<()> {
        self.send_command(frame)?;
        let response = self.transport.receive(ACK_READ_LEN, self.timeout)?;
        trace!("Response: {response:02X?}");
        expect_byte(&response, expected)
    }

    /// Receive a variable-length body led by `response_code`, followed by
    /// its checksum byte.
    ///
    /// The checksum normally arrives in a transfer of its own, but is taken
    /// from the body transfer if the device sent both together. A body with
    /// the wrong leading byte is rejected before the checksum is read.
    fn receive_with_checksum<L>(&mut self, response_code: u8, body_len: L) -> Result<(Vec<u8>, u8)>
    where
        L: Fn(&[u8]) -> Result<usize>,
    {
        let mut body = self.transport.receive(MAX_TRANSFER, self.timeout)?;
        trace!("Body: {body:02X?}");
        expect_byte(&body, response_code)?;
        let len = body_len(&body)?;

        let sum = if let Some(&sum) = body.get(len) {
            sum
        } else {
            let tail = self.transport.receive(1, self.timeout)?;
            *tail.first().ok_or(Error::ShortFrame {
                expected: 1,
                actual: 0,
            })?
        };
        body.truncate(len);
        Ok((body, sum))
    }

    fn handshake(&mut self) -> Result<()> {
        self.exchange(&CommandFrame::handshake(), HANDSHAKE_ACK)?;
        info!("Boot mode handshake successful");
        Ok(())
    }

    fn device_inquiry<R>(&mut self, reporter: &mut R) -> Result<DeviceIdentity>
    where
        R: Reporter + ?Sized,
    {
        self.send_command(&CommandFrame::bare(Command::DeviceInquiry))?;
        let (body, sum) =
            self.receive_with_checksum(DEVICE_INQUIRY_RESPONSE, DeviceInquiry::body_len)?;
        let inquiry = DeviceInquiry::parse(&body, sum)?;

        let device = inquiry.identity;
        info!("Device: {device}");
        debug!("Boot ROM supports {} device(s)", inquiry.device_count);
        reporter.device_detected(&device);
        self.session.set_device(device.clone());
        Ok(device)
    }

    fn device_select(&mut self, device: &DeviceIdentity) -> Result<()> {
        self.exchange(&CommandFrame::device_select(&device.code), ACK)
    }

    fn list_inquiry(
        &mut self,
        command: Command,
        response_code: u8,
        what: &str,
    ) -> Result<InquiryList> {
        self.send_command(&CommandFrame::bare(command))?;
        let (body, sum) = self.receive_with_checksum(response_code, |data| {
            InquiryList::body_len(data).ok_or(Error::ShortFrame {
                expected: 2,
                actual: data.len(),
            })
        })?;

        let list = InquiryList::parse(&body, sum, response_code)?;
        if !list.checksum_ok {
            warn!("{what} response checksum mismatch (0x{:02X}), continuing", list.checksum);
        }
        info!("{what}: {list}");
        Ok(list)
    }

    fn confirm_bit_rate(&mut self) -> Result<()> {
        self.exchange(&CommandFrame::bare(Command::BitRateConfirm), ACK)?;
        let bps = self.bit_rate.bps();
        self.transport.set_bit_rate(bps)?;
        debug!("Bit rate changed to {bps}");
        Ok(())
    }

    fn program<R>(&mut self, image: &FirmwareImage, reporter: &mut R) -> Result<()>
    where
        R: Reporter + ?Sized,
    {
        let phase = self.session.advance();
        debug!("Phase: {phase}");
        reporter.phase_started(phase);

        let total = image.chunk_count();
        for chunk in image.chunks() {
            let outcome = if self.is_interrupted() {
                info!("Interrupted at block {} of {total}", chunk.index);
                Err(Error::Interrupted)
            } else {
                self.program_chunk(&chunk)
            };

            if let Err(source) = outcome {
                return Err(Error::ProgrammingIncomplete {
                    written: self.session.blocks_written(),
                    total,
                    source: Box::new(source),
                });
            }

            self.session.record_block(chunk.checksum());
            reporter.chunk_written(self.session.blocks_written(), total);
        }

        debug!("Programmed {total} blocks");
        Ok(())
    }

    fn program_chunk(&mut self, chunk: &ProgrammingChunk) -> Result<()> {
        trace!("Programming block {} at 0x{:08X}", chunk.index, chunk.address);
        self.exchange(&chunk.frame(), ACK)
    }

    fn sum_check(&mut self) -> Result<u32> {
        self.send_command(&CommandFrame::bare(Command::UserMatSumCheck))?;
        let response = self.transport.receive(ACK_READ_LEN, self.timeout)?;
        trace!("Response: {response:02X?}");
        let result = SumCheckResult::parse(&response)?;

        let local = self.session.running_sum();
        if result.sum != local {
            return Err(Error::SumMismatch {
                device: result.sum,
                local,
            });
        }
        Ok(result.sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::image::PaddingPolicy;
    use crate::protocol::checksum::checksum;
    use crate::protocol::frame::{Frame, NAK};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Transport that answers every receive with the next scripted transfer.
    #[derive(Default)]
    struct MockTransport {
        responses: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
        bit_rate: Option<u32>,
    }

    impl MockTransport {
        fn new(responses: Vec<Vec<u8>>) -> Self {
            Self {
                responses: responses.into(),
                ..Default::default()
            }
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
            self.sent.push(data.to_vec());
            Ok(data.len())
        }

        fn receive(&mut self, max_len: usize, _timeout: Duration) -> Result<Vec<u8>> {
            let mut response = self
                .responses
                .pop_front()
                .ok_or_else(|| Error::Timeout("no scripted response".into()))?;
            response.truncate(max_len);
            Ok(response)
        }

        fn set_bit_rate(&mut self, bps: u32) -> Result<()> {
            self.bit_rate = Some(bps);
            Ok(())
        }

        fn name(&self) -> &str {
            "mock"
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    const INQUIRY_BODY: [u8; 11] = [
        0x30, 0x09, 0x01, 0x03, b'A', b'B', b'1', b'2', b'X', b'Y', b'Z',
    ];
    const CLOCK_BODY: [u8; 4] = [0x31, 0x02, 0x01, 0x01];
    const UNIT_BODY: [u8; 4] = [0x37, 0x02, 0x01, 0x01];

    /// Responses up to and including the user MAT selection.
    fn setup_responses() -> Vec<Vec<u8>> {
        vec![
            vec![HANDSHAKE_ACK],
            INQUIRY_BODY.to_vec(),
            vec![checksum(&INQUIRY_BODY)],
            vec![ACK],
            CLOCK_BODY.to_vec(),
            vec![checksum(&CLOCK_BODY)],
            vec![ACK],
            UNIT_BODY.to_vec(),
            vec![checksum(&UNIT_BODY)],
            vec![ACK],
            vec![ACK],
            vec![ACK],
            vec![ACK],
        ]
    }

    fn sum_response(sum: u32) -> Vec<u8> {
        Frame::new(0x5B, sum.to_be_bytes()).encode().unwrap()
    }

    fn full_responses(image: &FirmwareImage) -> Vec<Vec<u8>> {
        let mut responses = setup_responses();
        responses.extend((0..image.chunk_count()).map(|_| vec![ACK]));
        responses.push(vec![ACK]);
        responses.push(sum_response(image.expected_sum()));
        responses
    }

    fn image(len: usize) -> FirmwareImage {
        let data = (0..len).map(|i| (i % 251) as u8).collect();
        FirmwareImage::from_bytes(data, PaddingPolicy::default()).unwrap()
    }

    fn flasher(mock: &mut MockTransport) -> Flasher<&mut MockTransport> {
        let _ = env_logger::builder().is_test(true).try_init();
        Flasher::new(mock).with_interrupt_checker(|| false)
    }

    #[derive(Default)]
    struct Recorder {
        phases: Vec<Phase>,
        device: Option<DeviceIdentity>,
        progress: Vec<(usize, usize)>,
        stop_after: Option<(usize, Arc<AtomicBool>)>,
        stop_on: Option<(Phase, Arc<AtomicBool>)>,
    }

    impl Reporter for Recorder {
        fn phase_started(&mut self, phase: Phase) {
            self.phases.push(phase);
            if let Some((stop, flag)) = &self.stop_on {
                if phase == *stop {
                    flag.store(true, Ordering::Relaxed);
                }
            }
        }

        fn device_detected(&mut self, device: &DeviceIdentity) {
            self.device = Some(device.clone());
        }

        fn chunk_written(&mut self, written: usize, total: usize) {
            self.progress.push((written, total));
            if let Some((limit, flag)) = &self.stop_after {
                if written >= *limit {
                    flag.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    #[test]
    fn test_full_run_sends_expected_frames() {
        let image = image(4096);
        let mut mock = MockTransport::new(full_responses(&image));
        let mut recorder = Recorder::default();

        let mut flasher = flasher(&mut mock);
        let report = flasher.run(&image, &mut recorder).unwrap();
        assert_eq!(flasher.session().phase(), Phase::Done);

        assert_eq!(report.device.code, *b"AB12");
        assert_eq!(report.device.name, "XYZ");
        assert_eq!(report.clock_modes.entries, [0x01]);
        assert_eq!(report.programming_units.entries, [0x01]);
        assert_eq!(report.chunks_written, 4);
        assert_eq!(report.checksum, image.expected_sum());

        let sent = &mock.sent;
        assert_eq!(sent.len(), 10 + 4 + 2);
        assert_eq!(sent[0], [0x55]);
        assert_eq!(sent[1], [0x20]);
        assert_eq!(sent[2][..6], [0x10, 0x04, b'A', b'B', b'1', b'2']);
        assert_eq!(sent[3], [0x21]);
        assert_eq!(sent[4], [0x11, 0x01, 0x01, 0xED]);
        assert_eq!(sent[5], [0x27]);
        assert_eq!(
            sent[6],
            [0x3F, 0x07, 0x04, 0x80, 0x06, 0x40, 0x02, 0x01, 0x01, 0xEC]
        );
        assert_eq!(sent[7], [0x06]);
        assert_eq!(sent[8], [0x40]);
        assert_eq!(sent[9], [0x43]);

        let addresses: Vec<&[u8]> = sent[10..14].iter().map(|f| &f[1..5]).collect();
        assert_eq!(
            addresses,
            [
                &[0x00, 0x00, 0x00, 0x00][..],
                &[0x00, 0x00, 0x04, 0x00][..],
                &[0x00, 0x00, 0x08, 0x00][..],
                &[0x00, 0x00, 0x0C, 0x00][..],
            ]
        );
        assert!(sent[10..14].iter().all(|f| f.len() == 1030));

        assert_eq!(sent[14], [0x50, 0xFF, 0xFF, 0xFF, 0xFF, 0xB4]);
        assert_eq!(sent[15], [0x4B]);

        assert_eq!(mock.bit_rate, Some(115_200));
        assert_eq!(recorder.phases, Phase::SEQUENCE);
        assert_eq!(recorder.device.unwrap().to_string(), "AB12-XYZ");
        assert_eq!(recorder.progress, [(1, 4), (2, 4), (3, 4), (4, 4)]);
    }

    #[test]
    fn test_padded_final_block() {
        let image = image(1500);
        let mut mock = MockTransport::new(full_responses(&image));

        let report = flasher(&mut mock).run(&image, &mut ()).unwrap();
        assert_eq!(report.chunks_written, 2);

        let last = &mock.sent[11];
        assert_eq!(last[1..5], [0x00, 0x00, 0x04, 0x00]);
        assert_eq!(last[5 + 475], (1499 % 251) as u8);
        assert!(last[5 + 476..5 + 1024].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_handshake_mismatch_aborts() {
        let mut mock = MockTransport::new(vec![vec![0x00]]);
        let mut flasher = flasher(&mut mock);

        let err = flasher.run(&image(16), &mut ()).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Handshake));
        assert!(matches!(
            err.root(),
            Error::UnexpectedResponse {
                expected: 0xE6,
                actual: 0x00
            }
        ));
        assert_eq!(flasher.session().phase(), Phase::Failed);
        assert_eq!(mock.sent.len(), 1);
    }

    #[test]
    fn test_device_inquiry_checksum_mismatch() {
        let mut mock = MockTransport::new(vec![
            vec![HANDSHAKE_ACK],
            INQUIRY_BODY.to_vec(),
            vec![checksum(&INQUIRY_BODY).wrapping_add(1)],
        ]);

        let err = flasher(&mut mock).run(&image(16), &mut ()).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::DeviceInquiry));
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(matches!(err.root(), Error::ChecksumMismatch { .. }));
        assert_eq!(mock.sent.len(), 2);
    }

    #[test]
    fn test_inquiry_checksum_in_same_transfer() {
        let image = image(1024);
        let mut responses = full_responses(&image);
        // Merge the inquiry body and its checksum into one transfer
        let sum = responses.remove(2);
        responses[1].extend_from_slice(&sum);

        let mut mock = MockTransport::new(responses);
        let report = flasher(&mut mock).run(&image, &mut ()).unwrap();
        assert_eq!(report.device.code_str(), "AB12");
    }

    #[test]
    fn test_list_checksum_is_informational() {
        let image = image(1024);
        let mut responses = full_responses(&image);
        // Clock mode checksum
        responses[5] = vec![0x00];

        let mut mock = MockTransport::new(responses);
        let report = flasher(&mut mock).run(&image, &mut ()).unwrap();
        assert!(!report.clock_modes.checksum_ok);
        assert!(report.programming_units.checksum_ok);
    }

    #[test]
    fn test_nak_during_programming_is_incomplete() {
        let image = image(4096);
        let mut responses = setup_responses();
        responses.extend([vec![ACK], vec![ACK], vec![NAK], vec![ACK]]);

        let mut mock = MockTransport::new(responses);
        let mut flasher = flasher(&mut mock);
        let err = flasher.run(&image, &mut ()).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Incomplete);
        assert!(matches!(
            err,
            Error::ProgrammingIncomplete {
                written: 2,
                total: 4,
                ..
            }
        ));
        assert!(matches!(err.root(), Error::Nak { .. }));
        assert_eq!(flasher.session().phase(), Phase::Failed);

        // No frame follows the rejected block
        assert_eq!(mock.sent.len(), 10 + 3);
    }

    #[test]
    fn test_nak_in_ack_phase() {
        let mut responses = setup_responses();
        // Device selection
        responses[3] = vec![NAK];

        let mut mock = MockTransport::new(responses);
        let err = flasher(&mut mock).run(&image(16), &mut ()).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::DeviceSelect));
        assert!(matches!(
            err.root(),
            Error::Nak {
                expected: 0x06,
                code: 0x15
            }
        ));
        assert_eq!(mock.sent.len(), 3);
    }

    #[test]
    fn test_nak_in_every_ack_phase_aborts() {
        // (response slot, failing phase, frames sent including the rejected one)
        let cases = [
            (3, Phase::DeviceSelect, 3),
            (6, Phase::ClockSelect, 5),
            (9, Phase::BitRateSelect, 7),
            (10, Phase::BitRateConfirm, 8),
            (11, Phase::ModeTransition, 9),
            (12, Phase::MatSelect, 10),
            (14, Phase::ProgrammingStop, 12),
        ];

        let image = image(1024);
        for (slot, phase, sent) in cases {
            let mut responses = full_responses(&image);
            responses[slot] = vec![NAK];

            let mut mock = MockTransport::new(responses);
            let mut flasher = flasher(&mut mock);
            let err = flasher.run(&image, &mut ()).unwrap_err();
            assert_eq!(flasher.session().phase(), Phase::Failed, "{phase}");

            assert_eq!(err.phase(), Some(phase));
            assert!(
                matches!(
                    err.root(),
                    Error::Nak {
                        expected: 0x06,
                        code: 0x15
                    }
                ),
                "{phase}: {err}"
            );
            assert_eq!(mock.sent.len(), sent, "{phase}");
            if slot <= 10 {
                assert_eq!(mock.bit_rate, None, "{phase}");
            }
        }
    }

    #[test]
    fn test_nak_led_device_inquiry_aborts() {
        let mut nak_body = INQUIRY_BODY.to_vec();
        nak_body[0] = NAK;
        let mut mock = MockTransport::new(vec![
            vec![HANDSHAKE_ACK],
            nak_body.clone(),
            vec![checksum(&nak_body)],
        ]);

        let err = flasher(&mut mock).run(&image(16), &mut ()).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::DeviceInquiry));
        assert!(matches!(
            err.root(),
            Error::Nak {
                expected: 0x30,
                code: 0x15
            }
        ));
        assert_eq!(mock.sent.len(), 2);
        // The checksum transfer is never read
        assert_eq!(mock.responses.len(), 1);
    }

    #[test]
    fn test_single_nak_byte_for_list_inquiry_aborts() {
        let mut responses = setup_responses();
        // Clock mode list replaced by a bare NAK
        responses[4] = vec![NAK];

        let mut mock = MockTransport::new(responses);
        let err = flasher(&mut mock).run(&image(16), &mut ()).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::ClockInquiry));
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(matches!(err.root(), Error::Nak { expected: 0x31, .. }));
        assert_eq!(mock.sent.len(), 4);
    }

    #[test]
    fn test_wrong_list_response_code_aborts() {
        let mut responses = setup_responses();
        // Programming unit inquiry answered with a clock mode list
        responses[7] = CLOCK_BODY.to_vec();
        responses[8] = vec![checksum(&CLOCK_BODY)];

        let mut mock = MockTransport::new(responses);
        let err = flasher(&mut mock).run(&image(16), &mut ()).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::ProgUnitInquiry));
        assert!(matches!(
            err.root(),
            Error::UnexpectedResponse {
                expected: 0x37,
                actual: 0x31
            }
        ));
        assert_eq!(mock.sent.len(), 6);
    }

    #[test]
    fn test_nak_led_sum_check_aborts() {
        let image = image(2048);
        let mut responses = full_responses(&image);
        let last = responses.len() - 1;
        // Correct sum and frame checksum, but led by NAK
        responses[last] = Frame::new(NAK, image.expected_sum().to_be_bytes())
            .encode()
            .unwrap();

        let mut mock = MockTransport::new(responses);
        let err = flasher(&mut mock).run(&image, &mut ()).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::SumCheck));
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(matches!(err.root(), Error::Nak { expected: 0x5B, .. }));
    }

    #[test]
    fn test_sum_mismatch_is_integrity_failure() {
        let image = image(2048);
        let mut responses = full_responses(&image);
        let last = responses.len() - 1;
        responses[last] = sum_response(image.expected_sum().wrapping_add(1));

        let mut mock = MockTransport::new(responses);
        let err = flasher(&mut mock).run(&image, &mut ()).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::SumCheck));
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(err.to_string().contains("firmware may be written incorrectly"));
    }

    #[test]
    fn test_sum_check_frame_checksum_verified() {
        let image = image(1024);
        let mut responses = full_responses(&image);
        let last = responses.len() - 1;
        responses[last][6] ^= 0xFF;

        let mut mock = MockTransport::new(responses);
        let err = flasher(&mut mock).run(&image, &mut ()).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::SumCheck));
        assert!(matches!(err.root(), Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_timeout_aborts_run() {
        let mut responses = setup_responses();
        responses.truncate(4);

        let mut mock = MockTransport::new(responses);
        let err = flasher(&mut mock).run(&image(16), &mut ()).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::ClockInquiry));
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_interrupt_before_start_sends_nothing() {
        let mut mock = MockTransport::new(full_responses(&image(16)));
        let err = Flasher::new(&mut mock)
            .with_interrupt_checker(|| true)
            .run(&image(16), &mut ())
            .unwrap_err();

        assert!(matches!(err, Error::Interrupted));
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(mock.sent.is_empty());
    }

    #[test]
    fn test_interrupt_between_setup_phases() {
        let flag = Arc::new(AtomicBool::new(false));
        let checker = Arc::clone(&flag);
        let mut recorder = Recorder {
            stop_on: Some((Phase::DeviceSelect, flag)),
            ..Default::default()
        };

        let mut mock = MockTransport::new(full_responses(&image(16)));
        let mut flasher = Flasher::new(&mut mock)
            .with_interrupt_checker(move || checker.load(Ordering::Relaxed));
        let err = flasher.run(&image(16), &mut recorder).unwrap_err();
        assert_eq!(flasher.session().phase(), Phase::Failed);

        // Device selection completes, clock mode inquiry is never sent
        assert!(matches!(err, Error::Interrupted));
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(
            recorder.phases,
            [Phase::Handshake, Phase::DeviceInquiry, Phase::DeviceSelect]
        );
        assert_eq!(mock.sent.len(), 3);
    }

    #[test]
    fn test_interrupt_after_last_block_still_verifies() {
        let image = image(1024);
        let flag = Arc::new(AtomicBool::new(false));
        let checker = Arc::clone(&flag);
        let mut recorder = Recorder {
            stop_after: Some((1, flag)),
            ..Default::default()
        };

        let mut mock = MockTransport::new(full_responses(&image));
        let report = Flasher::new(&mut mock)
            .with_interrupt_checker(move || checker.load(Ordering::Relaxed))
            .run(&image, &mut recorder)
            .unwrap();

        assert_eq!(report.checksum, image.expected_sum());
        assert_eq!(mock.sent.len(), 10 + 1 + 2);
    }

    #[test]
    fn test_interrupt_during_programming() {
        let image = image(4096);
        let flag = Arc::new(AtomicBool::new(false));
        let checker = Arc::clone(&flag);
        let mut recorder = Recorder {
            stop_after: Some((1, flag)),
            ..Default::default()
        };

        let mut mock = MockTransport::new(full_responses(&image));
        let err = Flasher::new(&mut mock)
            .with_interrupt_checker(move || checker.load(Ordering::Relaxed))
            .run(&image, &mut recorder)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Incomplete);
        assert!(matches!(
            err,
            Error::ProgrammingIncomplete {
                written: 1,
                total: 4,
                ..
            }
        ));
        assert!(matches!(err.root(), Error::Interrupted));
        assert_eq!(mock.sent.len(), 10 + 1);
    }

    #[test]
    fn test_custom_clock_mode_and_bit_rate() {
        let image = image(1024);
        let params = BitRateParams {
            bit_rate: 384,
            ..Default::default()
        };

        let mut mock = MockTransport::new(full_responses(&image));
        Flasher::new(&mut mock)
            .with_interrupt_checker(|| false)
            .with_clock_mode(0x02)
            .with_bit_rate(params)
            .run(&image, &mut ())
            .unwrap();

        assert_eq!(mock.sent[4][..3], [0x11, 0x01, 0x02]);
        assert_eq!(mock.sent[6][2..4], [0x01, 0x80]);
        assert_eq!(mock.bit_rate, Some(38_400));
    }
}
