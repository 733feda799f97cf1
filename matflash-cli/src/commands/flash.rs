//! Flash command implementation.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use matflash::{
    DeviceIdentity, FirmwareImage, Flasher, InquiryList, Phase, Reporter, Transport, UsbPort,
};
use std::path::Path;

use crate::config::Config;
use crate::{Cli, CliError, use_fancy_output, was_interrupted};

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted by user".into()).into())
    } else {
        Ok(())
    }
}

/// Load a raw image with the padding policy from flags and config.
pub(crate) fn load_image(cli: &Cli, config: &Config, path: &Path) -> Result<FirmwareImage> {
    FirmwareImage::from_file(path, cli.padding_policy(config))
        .with_context(|| format!("Failed to load firmware image {}", path.display()))
}

/// Progress reporting on stderr.
struct CliReporter {
    pb: ProgressBar,
    quiet: bool,
}

impl CliReporter {
    fn new(total: usize, quiet: bool) -> Self {
        let pb = if quiet || !use_fancy_output() {
            ProgressBar::hidden()
        } else {
            let pb = ProgressBar::new(total as u64);
            #[allow(clippy::unwrap_used)] // Static template string
            pb.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} blocks {msg}",
                    )
                    .unwrap()
                    .progress_chars("#>-"),
            );
            pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
            pb
        };
        Self { pb, quiet }
    }

    fn status(&self, line: &str) {
        if !self.quiet {
            self.pb.suspend(|| eprintln!("{line}"));
        }
    }
}

impl Reporter for CliReporter {
    fn phase_started(&mut self, phase: Phase) {
        self.pb.set_message(phase.description());
    }

    fn device_detected(&mut self, device: &DeviceIdentity) {
        self.status(&format!(
            "{} Device {} ({})",
            style("✓").green(),
            style(&device.name).cyan().bold(),
            device.code_str()
        ));
    }

    fn clock_modes(&mut self, modes: &InquiryList) {
        self.status(&format!("    {} Clock modes: {modes}", style("•").dim()));
    }

    fn programming_units(&mut self, units: &InquiryList) {
        self.status(&format!("    {} Programming units: {units}", style("•").dim()));
    }

    fn chunk_written(&mut self, written: usize, total: usize) {
        self.pb.set_length(total as u64);
        self.pb.set_position(written as u64);
    }
}

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &Config, firmware: &Path) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware: {}",
            style("📦").cyan(),
            firmware.display()
        );
    }

    let image = load_image(cli, config, firmware)?;
    if !cli.quiet {
        eprintln!(
            "    {} {} bytes, {} blocks of 1024 bytes",
            style("•").dim(),
            image.len(),
            image.chunk_count()
        );
        if image.padding() > 0 {
            eprintln!(
                "    {} last block padded with {} bytes",
                style("•").dim(),
                image.padding()
            );
        }
    }

    ensure_not_interrupted()?;

    let usb = cli.usb_config(config);
    if !cli.quiet {
        eprintln!(
            "{} Opening boot-mode device {:04x}:{:04x}",
            style("🔌").cyan(),
            usb.vid,
            usb.pid
        );
    }
    let mut port = UsbPort::open(&usb).with_context(|| {
        format!(
            "Failed to open boot-mode device {:04x}:{:04x}",
            usb.vid, usb.pid
        )
    })?;

    let mut reporter = CliReporter::new(image.chunk_count(), cli.quiet);
    let result = Flasher::new(&mut port)
        .with_timeout(usb.timeout)
        .run(&image, &mut reporter);

    if result.is_ok() {
        reporter.pb.finish_with_message("done");
    } else {
        reporter.pb.abandon();
    }

    // Release the interface before reporting
    if let Err(e) = port.close() {
        warn!("Failed to release {}: {e}", port.name());
    }

    let report = result?;

    if !cli.quiet {
        eprintln!(
            "\n{} Programmed {} blocks into {}, User MAT sum 0x{:08X} verified",
            style("🎉").green().bold(),
            report.chunks_written,
            report.device,
            report.checksum
        );
    }

    Ok(())
}
