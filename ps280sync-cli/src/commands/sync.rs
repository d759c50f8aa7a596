//! Configuration file synchronization: apply and capture.

use {
    crate::{Cli, CliError, config::Config, open_sensor},
    anyhow::{Context, Result},
    console::style,
    ps280sync::{
        CapturedParameter, DesiredConfiguration, Outcome, PlannedAction, PlannedChange,
        SkipReason, SyncReport, plan,
    },
    std::{collections::BTreeMap, fs, path::Path},
};

/// Settings files ending in `.json` are JSON, everything else is TOML.
fn is_json(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// Parse a desired configuration from `content`.
fn parse_desired(path: &Path, content: &str) -> Result<DesiredConfiguration> {
    if is_json(path) {
        serde_json::from_str(content)
            .with_context(|| format!("Invalid JSON configuration in {}", path.display()))
    } else {
        toml::from_str(content)
            .with_context(|| format!("Invalid TOML configuration in {}", path.display()))
    }
}

fn load_desired(path: &Path) -> Result<DesiredConfiguration> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
    parse_desired(path, &content)
}

fn render_change(change: &PlannedChange) -> String {
    let current = change.current.as_deref().unwrap_or("");
    match &change.action {
        PlannedAction::Write { value, superuser } => {
            let su = if *superuser { " (su)" } else { "" };
            format!("~ {}: '{current}' -> '{value}'{su}", change.key)
        },
        PlannedAction::Unchanged => format!("= {}: '{current}'", change.key),
        PlannedAction::Skip(SkipReason::Ignored) => format!("- {}: ignored", change.key),
        PlannedAction::Skip(SkipReason::Unsupported) => {
            format!("? {}: not supported by device", change.key)
        },
    }
}

fn change_json(change: &PlannedChange) -> serde_json::Value {
    let key = change.key.to_string();
    match &change.action {
        PlannedAction::Write { value, superuser } => serde_json::json!({
            "key": key,
            "current": change.current,
            "action": "write",
            "value": value,
            "superuser": superuser,
        }),
        PlannedAction::Unchanged => serde_json::json!({
            "key": key,
            "current": change.current,
            "action": "unchanged",
        }),
        PlannedAction::Skip(reason) => serde_json::json!({
            "key": key,
            "current": change.current,
            "action": "skip",
            "reason": reason,
        }),
    }
}

fn outcome_marker(outcome: &Outcome) -> console::StyledObject<&'static str> {
    match outcome {
        Outcome::Applied { .. } => style("✓").green(),
        Outcome::Unchanged => style("=").dim(),
        Outcome::Skipped { .. } => style("-").yellow(),
        Outcome::Failed { .. } => style("✗").red(),
    }
}

fn summary(report: &SyncReport) -> String {
    format!(
        "{} applied, {} unchanged, {} skipped, {} failed",
        report.count(|o| matches!(o, Outcome::Applied { .. })),
        report.count(|o| matches!(o, Outcome::Unchanged)),
        report.count(|o| matches!(o, Outcome::Skipped { .. })),
        report.count(Outcome::is_failure),
    )
}

/// Map the report to the command's result.
fn report_result(report: &SyncReport) -> Result<()> {
    if report.interrupted {
        return Err(CliError::Cancelled.into());
    }
    let failed = report.count(Outcome::is_failure);
    if failed > 0 {
        return Err(CliError::SyncFailed(format!(
            "{failed} of {} settings did not take the desired value",
            report.entries.len()
        ))
        .into());
    }
    Ok(())
}

/// Apply command implementation.
pub(crate) fn cmd_apply(
    cli: &Cli,
    config: &Config,
    file: &Path,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let desired = load_desired(file)?;
    let policy = config.parameter_policy();
    if !cli.quiet {
        eprintln!(
            "{} Loaded {} settings from {}",
            style("📄").cyan(),
            desired.len(),
            file.display()
        );
    }

    let mut sensor = open_sensor(cli, config)?;

    if dry_run {
        let baseline = sensor.settings().context("Failed to read settings")?;
        sensor.disconnect();
        let changes = plan(&desired, &baseline, &policy);

        if json {
            let output = serde_json::json!({
                "ok": true,
                "data": {
                    "changes": changes.iter().map(change_json).collect::<Vec<_>>(),
                }
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            for change in &changes {
                println!("{}", render_change(change));
            }
        }
        return Ok(());
    }

    let report = sensor
        .apply(&desired, &policy)
        .context("Synchronization could not start")?;
    sensor.disconnect();

    if json {
        let output = serde_json::json!({
            "ok": report.is_success(),
            "data": report,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        for entry in &report.entries {
            eprintln!(
                "  {} {} {}",
                outcome_marker(&entry.outcome),
                style(&entry.key).cyan(),
                entry.outcome
            );
        }
        if !cli.quiet {
            eprintln!("\n{} {}", style("ℹ").blue(), summary(&report));
        }
    }

    report_result(&report)
}

/// Values only, in the shape `apply` reads back.
fn values_only(
    captured: &BTreeMap<String, BTreeMap<String, CapturedParameter>>,
) -> BTreeMap<&str, BTreeMap<&str, &str>> {
    captured
        .iter()
        .map(|(group, parameters)| {
            let values = parameters
                .iter()
                .map(|(parameter, captured)| (parameter.as_str(), captured.value.as_str()))
                .collect();
            (group.as_str(), values)
        })
        .collect()
}

fn serialize<T: serde::Serialize>(path: &Path, value: &T) -> Result<String> {
    if is_json(path) {
        Ok(serde_json::to_string_pretty(value)?)
    } else {
        Ok(toml::to_string_pretty(value)?)
    }
}

/// Capture command implementation.
pub(crate) fn cmd_capture(cli: &Cli, config: &Config, file: &Path, with_info: bool) -> Result<()> {
    let mut sensor = open_sensor(cli, config)?;
    let pb = crate::spinner(cli, "Reading settings...");
    let captured = sensor.capture(with_info);
    pb.finish_and_clear();
    let captured = captured.context("Failed to capture settings")?;
    sensor.disconnect();

    let content = if with_info {
        serialize(file, &captured)?
    } else {
        serialize(file, &values_only(&captured))?
    };
    fs::write(file, content).with_context(|| format!("Failed to write {}", file.display()))?;

    if !cli.quiet {
        let count: usize = captured.values().map(BTreeMap::len).sum();
        eprintln!(
            "{} Captured {count} settings to {}",
            style("✓").green(),
            style(file.display()).cyan()
        );
    }
    Ok(())
}
