//! matflash CLI - Command-line tool for programming the User MAT of
//! Hitachi/Renesas microcontrollers in USB boot mode.
//!
//! ## Features
//!
//! - Program a raw binary image into the User MAT and verify its sum
//! - Inspect how an image will be split into programming blocks
//! - List attached boot-mode USB devices
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use matflash::{ErrorKind, PaddingPolicy, UsbConfig};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// CLI-level failures that map to a dedicated exit status.
#[derive(Debug, thiserror::Error)]
enum CliError {
    /// Invalid combination of arguments.
    #[error("{0}")]
    Usage(String),
    /// Configuration file could not be used.
    #[error("{0}")]
    Config(String),
    /// Interrupted by the user before the device was modified.
    #[error("{0}")]
    Cancelled(String),
}

/// matflash - Program the User MAT of Hitachi/Renesas microcontrollers over
/// USB boot mode.
///
/// Environment variables:
///   MATFLASH_VID      - USB vendor ID of the boot-mode device (hex)
///   MATFLASH_PID      - USB product ID of the boot-mode device (hex)
///   MATFLASH_TIMEOUT  - Per-transfer timeout in milliseconds
#[derive(Parser)]
#[command(name = "matflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Raw binary image to program into the User MAT.
    firmware: Option<PathBuf>,

    /// USB vendor ID of the boot-mode device (hex).
    #[arg(long, global = true, env = "MATFLASH_VID", value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// USB product ID of the boot-mode device (hex).
    #[arg(long, global = true, env = "MATFLASH_PID", value_parser = parse_hex_u16)]
    pid: Option<u16>,

    /// Per-transfer timeout in milliseconds.
    #[arg(long, global = true, env = "MATFLASH_TIMEOUT", value_name = "MS")]
    timeout: Option<u64>,

    /// Reject images that are not a multiple of 1024 bytes instead of padding.
    #[arg(long, global = true)]
    strict_size: bool,

    /// Fill byte for padding the last block (hex, default FF).
    #[arg(long, global = true, value_parser = parse_hex_u8, value_name = "BYTE")]
    fill: Option<u8>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Show how an image will be programmed, without touching hardware.
    Info {
        /// Path to the raw binary image.
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List attached boot-mode USB devices.
    ListDevices {
        /// List every USB device, not only the configured vendor/product ID.
        #[arg(long)]
        all: bool,

        /// Output device list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// USB settings: defaults, then config file, then flags and environment.
    fn usb_config(&self, config: &Config) -> UsbConfig {
        let mut usb = config.usb_config();
        if let Some(vid) = self.vid {
            usb.vid = vid;
        }
        if let Some(pid) = self.pid {
            usb.pid = pid;
        }
        if let Some(ms) = self.timeout {
            usb.timeout = Duration::from_millis(ms);
        }
        usb
    }

    /// Short final block handling.
    fn padding_policy(&self, config: &Config) -> PaddingPolicy {
        if self.strict_size || config.image.strict_size {
            PaddingPolicy::Strict
        } else {
            self.fill
                .or(config.image.fill)
                .map_or_else(PaddingPolicy::default, PaddingPolicy::Pad)
        }
    }
}

/// Parse a hexadecimal value (supports 0x prefix and underscores).
fn parse_hex(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex value: {e}"))
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let value = parse_hex(s)?;
    u16::try_from(value).map_err(|_| format!("Value 0x{value:X} does not fit in 16 bits"))
}

fn parse_hex_u8(s: &str) -> Result<u8, String> {
    let value = parse_hex(s)?;
    u8::try_from(value).map_err(|_| format!("Value 0x{value:X} does not fit in a byte"))
}

/// Map an error to the process exit status.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
            CliError::Cancelled(_) => 130,
        };
    }

    match err
        .downcast_ref::<matflash::Error>()
        .map(matflash::Error::kind)
    {
        Some(ErrorKind::Transport) => 4,
        Some(ErrorKind::Protocol) => 5,
        Some(ErrorKind::Integrity) => 6,
        Some(ErrorKind::Incomplete) => 7,
        Some(ErrorKind::Cancelled) => 130,
        Some(ErrorKind::Image) | None => 1,
    }
}

/// Render the context chain, stopping at the first library error (its
/// message already includes its causes).
fn format_error(err: &anyhow::Error) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        parts.push(cause.to_string());
        if cause.is::<matflash::Error>() {
            break;
        }
    }
    parts.join(": ")
}

fn main() {
    // --- NO_COLOR and TTY detection (clig.dev best practice) ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "matflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    matflash::set_interrupt_checker(was_interrupted);

    if let Err(err) = run(&cli) {
        eprintln!("{} {}", style("Error:").red().bold(), format_error(&err));
        std::process::exit(exit_code(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)?
    } else {
        Config::load()
    };

    match (&cli.command, &cli.firmware) {
        (Some(_), Some(firmware)) => Err(CliError::Usage(format!(
            "unexpected firmware argument '{}' before a subcommand",
            firmware.display()
        ))
        .into()),
        (None, Some(firmware)) => commands::flash::cmd_flash(cli, &config, firmware),
        (None, None) => Err(CliError::Usage("missing firmware image".into()).into()),
        (Some(Commands::Info { firmware, json }), None) => {
            commands::info::cmd_info(cli, &config, firmware, *json)
        },
        (Some(Commands::ListDevices { all, json }), None) => {
            commands::devices::cmd_list_devices(cli, &config, *all, *json)
        },
        (Some(Commands::Completions { shell }), None) => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}
