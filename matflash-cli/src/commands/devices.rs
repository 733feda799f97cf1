//! USB device listing command implementation.

use {
    crate::{Cli, config::Config},
    anyhow::{Context, Result},
    console::style,
    matflash::list_devices,
};

/// List devices command implementation.
pub(crate) fn cmd_list_devices(cli: &Cli, config: &Config, all: bool, json: bool) -> Result<()> {
    let usb = cli.usb_config(config);
    let filter = (!all).then_some((usb.vid, usb.pid));
    let devices = list_devices(filter).context("Failed to enumerate USB devices")?;

    if json {
        let entries: Vec<serde_json::Value> = devices
            .iter()
            .map(|d| {
                serde_json::json!({
                    "bus": d.bus,
                    "address": d.address,
                    "vid": format!("0x{:04X}", d.vid),
                    "pid": format!("0x{:04X}", d.pid),
                })
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "devices": entries,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("USB Devices").bold().underlined());

    if devices.is_empty() {
        let hint = if all {
            "No USB devices found".to_string()
        } else {
            format!(
                "No boot-mode device {:04x}:{:04x} found (is the board in boot mode?)",
                usb.vid, usb.pid
            )
        };
        eprintln!("  {}", style(hint).dim());
    } else {
        for device in &devices {
            eprintln!(
                "  {} {} bus {:03} address {:03}",
                style("•").green(),
                style(format!("{:04x}:{:04x}", device.vid, device.pid)).cyan(),
                device.bus,
                device.address
            );
        }
    }

    Ok(())
}
