//! Firmware image info command implementation.

use {
    crate::{Cli, commands::flash::load_image, config::Config},
    anyhow::Result,
    console::style,
    matflash::{FirmwareImage, PaddingPolicy, protocol::BLOCK_SIZE},
    std::path::Path,
};

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &Config, firmware: &Path, json: bool) -> Result<()> {
    let image = load_image(cli, config, firmware)?;

    if json {
        let info = serde_json::json!({
            "ok": true,
            "data": image_summary(firmware, &image),
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    eprintln!("{}", style("Firmware Image").bold().underlined());
    eprintln!("  Path: {}", firmware.display());
    eprintln!("  Size: {} bytes", image.len());
    eprintln!("  Blocks: {} x {BLOCK_SIZE} bytes", image.chunk_count());
    match image.policy() {
        PaddingPolicy::Pad(fill) if image.padding() > 0 => eprintln!(
            "  Padding: {} bytes of 0x{fill:02X} in the last block",
            image.padding()
        ),
        _ => eprintln!("  Padding: none"),
    }
    eprintln!(
        "  Address range: 0x00000000 - 0x{:08X}",
        image.chunk_count() * BLOCK_SIZE - 1
    );
    eprintln!(
        "  Expected User MAT sum: {}",
        style(format!("0x{:08X}", image.expected_sum())).cyan()
    );

    Ok(())
}

/// Plain values for `--json` output.
fn image_summary(path: &Path, image: &FirmwareImage) -> serde_json::Value {
    let fill = match image.policy() {
        PaddingPolicy::Pad(fill) => Some(format!("0x{fill:02X}")),
        PaddingPolicy::Strict => None,
    };
    let end = image.chunk_count() * BLOCK_SIZE;

    serde_json::json!({
        "path": path.display().to_string(),
        "size": image.len(),
        "block_size": BLOCK_SIZE,
        "chunk_count": image.chunk_count(),
        "padding": image.padding(),
        "strict": image.policy() == PaddingPolicy::Strict,
        "fill": fill,
        "last_address": format!("0x{:08X}", end - 1),
        "expected_sum": format!("0x{:08X}", image.expected_sum()),
    })
}
