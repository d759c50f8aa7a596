//! Firmware listing, erase and flash through the external flashing tool.
//!
//! Images live in one directory per version under the firmware root:
//!
//! ```text
//! firmware/
//!   1.4.2/
//!     bootloader.bin
//!     partition-table.bin
//!     pikk-sense-esp32s3.bin
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use ps280sync::{
    Esptool, FirmwareImageSet, FirmwareLifecycle, ToolLine, ToolStream, list_firmware_versions,
};

use crate::{Cli, config::Config, confirm, ensure_not_interrupted, transport};

/// List command implementation.
pub(crate) fn cmd_list(config: &Config, dir: Option<&Path>, json: bool) -> Result<()> {
    let root = config.firmware_dir(dir);
    let versions = list_firmware_versions(&root)
        .with_context(|| format!("Failed to list firmware in {}", root.display()))?;

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "dir": root.display().to_string(),
                "versions": versions,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!(
        "{} {}",
        style("Firmware in").bold(),
        style(root.display()).cyan()
    );
    if versions.is_empty() {
        eprintln!("  {}", style("No firmware versions found").dim());
    }
    for version in &versions {
        println!("{version}");
    }
    Ok(())
}

/// Resolve the port the flashing tool should use.
///
/// An explicit port wins; otherwise the same discovery as the console is
/// used, identifying the chip with the tool itself.
fn flash_port(cli: &Cli, config: &Config) -> Result<String> {
    let transport = transport(cli, config);
    let pb = crate::spinner(cli, "Looking for the sensor...");
    let port = transport.discover();
    pb.finish_and_clear();
    Ok(port?)
}

/// Print tool output as it arrives.
fn tool_printer(quiet: bool) -> impl FnMut(ToolLine) {
    move |line: ToolLine| {
        if quiet {
            return;
        }
        match line.stream {
            ToolStream::Stdout => eprintln!("  {} {}", style("│").dim(), line.text),
            ToolStream::Stderr => eprintln!("  {} {}", style("│").yellow(), line.text),
        }
    }
}

fn lifecycle(cli: &Cli, config: &Config) -> Result<FirmwareLifecycle<Esptool>> {
    let port = flash_port(cli, config)?;
    if !cli.quiet {
        eprintln!("{} Using {}", style("🔌").cyan(), style(&port).cyan());
    }
    Ok(FirmwareLifecycle::new(Esptool::new(
        config.flash_tool(Some(port)),
    )))
}

/// Erase command implementation.
pub(crate) fn cmd_erase(cli: &Cli, config: &Config) -> Result<()> {
    confirm(cli, "Erase the entire flash of the sensor?")?;

    let mut lifecycle = lifecycle(cli, config)?;
    if !cli.quiet {
        eprintln!("{} Erasing flash...", style("🗑").red());
    }
    lifecycle
        .erase(&mut tool_printer(cli.quiet))
        .context("Erase failed")?;

    if !cli.quiet {
        eprintln!("\n{} Flash erased", style("✓").green().bold());
    }
    Ok(())
}

/// Flash command implementation: erase, then write all three images.
pub(crate) fn cmd_flash(cli: &Cli, config: &Config, version: &str, dir: Option<&Path>) -> Result<()> {
    let root = config.firmware_dir(dir);
    let images = FirmwareImageSet::from_version_dir(&root.join(version))
        .with_context(|| format!("Firmware {version} not found in {}", root.display()))?;
    images.validate()?;

    if !cli.quiet {
        eprintln!("{} Firmware {}", style("📦").cyan(), style(&images.version).bold());
        for (offset, path) in images.images() {
            eprintln!(
                "    {} {} @ {offset:#07x}",
                style("•").dim(),
                path.display()
            );
        }
    }

    confirm(cli, &format!("Erase the sensor and flash firmware {version}?"))?;

    let mut lifecycle = lifecycle(cli, config)?;
    let mut printer = tool_printer(cli.quiet);

    if !cli.quiet {
        eprintln!("{} Erasing flash...", style("🗑").red());
    }
    lifecycle.erase(&mut printer).context("Erase failed")?;

    ensure_not_interrupted()?;

    if !cli.quiet {
        eprintln!("{} Writing images...", style("⏳").yellow());
    }
    lifecycle
        .flash(&images, &mut printer)
        .context("Flashing failed")?;

    if !cli.quiet {
        eprintln!(
            "\n{} Firmware {} flashed; the sensor reboots with default settings",
            style("🎉").green().bold(),
            images.version
        );
    }
    Ok(())
}
