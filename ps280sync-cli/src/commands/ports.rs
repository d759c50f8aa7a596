//! Port listing command implementation.

use {
    crate::config::Config,
    anyhow::{Context, Result},
    console::style,
    ps280sync::{CandidatePort, list_candidate_ports},
};

/// Keep ports the discovery allow-list accepts, unless `all` is set.
fn visible_ports(ports: Vec<CandidatePort>, config: &Config, all: bool) -> Vec<CandidatePort> {
    if all {
        return ports;
    }
    let allow_list = config.transport(None, None).allow_list;
    ports
        .into_iter()
        .filter(|port| port.is_allowed(&allow_list))
        .collect()
}

fn port_json(port: &CandidatePort) -> serde_json::Value {
    serde_json::json!({
        "name": port.name,
        "device": port.device.name(),
        "known": port.device.is_known(),
        "vid": port.usb.map(|id| id.vid),
        "pid": port.usb.map(|id| id.pid),
        "product": port.product,
    })
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(config: &Config, json: bool, all: bool) -> Result<()> {
    let ports = list_candidate_ports().context("Failed to enumerate serial ports")?;
    let ports = visible_ports(ports, config, all);

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports.iter().map(port_json).collect::<Vec<_>>(),
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Serial ports").bold().underlined());

    if ports.is_empty() {
        let hint = if all { "" } else { " (use --all to show every port)" };
        eprintln!("  {}", style(format!("No sensor ports found{hint}")).dim());
        return Ok(());
    }

    for port in &ports {
        let device = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };
        let usb = port.usb.map(|id| format!(" ({id})")).unwrap_or_default();
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();
        eprintln!(
            "  {} {}{}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            device,
            usb,
            product
        );
    }

    Ok(())
}
