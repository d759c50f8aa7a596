//! Single-setting commands: listing, get, set, info and reboot.

use {
    crate::{Cli, config::Config, open_sensor},
    anyhow::{Context, Result},
    console::style,
    ps280sync::{ParameterInfo, ParameterKey, SettingsSnapshot},
};

/// Settings as aligned `PARAM VALUE` rows under each group name.
fn render_snapshot(snapshot: &SettingsSnapshot) -> Vec<String> {
    let width = snapshot
        .iter()
        .map(|(_, parameter, _)| parameter.len())
        .max()
        .unwrap_or(0);

    let mut lines = Vec::new();
    for (group, parameters) in snapshot.groups() {
        lines.push(format!("[{group}]"));
        for (parameter, value) in parameters {
            lines.push(format!("  {parameter:<width$}  {value}"));
        }
    }
    lines
}

fn render_info(key: &ParameterKey, info: &ParameterInfo) -> Vec<String> {
    let mut lines = vec![key.to_string()];
    if !info.short_description.is_empty() {
        lines.push(format!("  Description: {}", info.short_description));
    }
    if !info.min.is_empty() || !info.max.is_empty() {
        lines.push(format!("  Range:       {} .. {}", info.min, info.max));
    }
    if !info.allowed_values.is_empty() {
        lines.push(format!("  Allowed:     {}", info.allowed_values.join(", ")));
    }
    lines
}

/// Settings command implementation.
pub(crate) fn cmd_settings(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let mut sensor = open_sensor(cli, config)?;
    let snapshot = sensor.settings().context("Failed to read settings")?;
    sensor.disconnect();

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    for line in render_snapshot(&snapshot) {
        println!("{line}");
    }
    if !cli.quiet {
        eprintln!(
            "\n{} {} settings",
            style("ℹ").blue(),
            snapshot.len()
        );
    }
    Ok(())
}

/// Get command implementation.
pub(crate) fn cmd_get(cli: &Cli, config: &Config, key: &ParameterKey) -> Result<()> {
    let mut sensor = open_sensor(cli, config)?;
    let value = sensor
        .get(&key.group, &key.parameter)
        .with_context(|| format!("Failed to read {key}"))?;
    sensor.disconnect();

    println!("{value}");
    Ok(())
}

/// Set command implementation.
pub(crate) fn cmd_set(
    cli: &Cli,
    config: &Config,
    key: &ParameterKey,
    value: &str,
    superuser: bool,
) -> Result<()> {
    let superuser = superuser || config.parameter_policy().requires_superuser(key);

    let mut sensor = open_sensor(cli, config)?;
    sensor
        .set(&key.group, &key.parameter, value, superuser)
        .with_context(|| format!("Failed to write {key}"))?;
    sensor.disconnect();

    if !cli.quiet {
        eprintln!(
            "{} {} = {}",
            style("✓").green(),
            style(key).cyan(),
            value
        );
    }
    Ok(())
}

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &Config, key: &ParameterKey, json: bool) -> Result<()> {
    let mut sensor = open_sensor(cli, config)?;
    let info = sensor
        .info(&key.group, &key.parameter)
        .with_context(|| format!("Failed to describe {key}"))?;
    sensor.disconnect();

    if json {
        let output = serde_json::json!({
            "key": key.to_string(),
            "info": info,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    for line in render_info(key, &info) {
        println!("{line}");
    }
    Ok(())
}

/// Reboot command implementation.
pub(crate) fn cmd_reboot(cli: &Cli, config: &Config) -> Result<()> {
    let mut sensor = open_sensor(cli, config)?;
    sensor.reboot().context("Failed to reboot the sensor")?;

    if !cli.quiet {
        eprintln!("{} Reboot requested", style("🔄").cyan());
    }
    Ok(())
}
