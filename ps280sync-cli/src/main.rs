//! ps280sync CLI - Command-line tool for PS-280 climate sensors.
//!
//! ## Features
//!
//! - Discover the sensor console among USB serial ports
//! - Read, write and describe individual settings
//! - Synchronize a TOML configuration file onto the device
//! - Capture the device configuration to a file
//! - Erase and reflash firmware through `esptool`
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use ps280sync::{NativeBackend, ParameterKey, Ps280, Transport, tool::EsptoolProbe};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl+C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// ps280sync - Configure, synchronize and reflash PS-280 climate sensors.
///
/// Environment variables:
///   PS280SYNC_PORT              - Sensor serial port (skips discovery)
///   PS280SYNC_BAUD              - Console baud rate (default: 115200)
///   PS280SYNC_CONFIG            - Configuration file
///   PS280SYNC_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "ps280sync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "PS280SYNC_PORT")]
    port: Option<String>,

    /// Console baud rate.
    #[arg(short, long, global = true, env = "PS280SYNC_BAUD")]
    baud: Option<u32>,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH", env = "PS280SYNC_CONFIG")]
    config_path: Option<PathBuf>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "PS280SYNC_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Answer yes to confirmation prompts.
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List serial ports that may host a sensor.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,

        /// Include ports whose USB ID is not on the allow-list.
        #[arg(long)]
        all: bool,
    },

    /// Print every setting on the device.
    Settings {
        /// Output settings as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Print one setting.
    Get {
        /// Setting key, e.g. CORE.MSI.
        #[arg(value_parser = parse_key)]
        key: ParameterKey,
    },

    /// Write one setting.
    Set {
        /// Setting key, e.g. CORE.MSI.
        #[arg(value_parser = parse_key)]
        key: ParameterKey,

        /// New value.
        value: String,

        /// Elevate with `su` before writing.
        #[arg(long)]
        superuser: bool,
    },

    /// Describe one setting (description, range, allowed values).
    Info {
        /// Setting key, e.g. CORE.MSI.
        #[arg(value_parser = parse_key)]
        key: ParameterKey,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Bring the device in line with a configuration file.
    Apply {
        /// TOML (or .json) file of GROUP tables with PARAM = value entries.
        file: PathBuf,

        /// Show what would change without writing.
        #[arg(long)]
        dry_run: bool,

        /// Output the report as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Save the device configuration to a file.
    Capture {
        /// Output file (.toml or .json).
        file: PathBuf,

        /// Include description and limits of every setting.
        #[arg(long)]
        with_info: bool,
    },

    /// Restart the sensor.
    Reboot,

    /// Manage sensor firmware.
    #[command(subcommand)]
    Firmware(FirmwareCommands),

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Firmware subcommands.
#[derive(Subcommand)]
enum FirmwareCommands {
    /// List available firmware versions.
    List {
        /// Firmware root directory.
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Output versions as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Erase the whole flash.
    Erase,

    /// Erase, then write bootloader, partition table and application.
    Flash {
        /// Version directory name under the firmware root.
        #[arg(id = "firmware_version", value_name = "VERSION")]
        version: String,

        /// Firmware root directory.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
enum CliError {
    /// Invalid invocation.
    #[error("{0}")]
    Usage(String),
    /// The user declined or interrupted.
    #[error("Operation cancelled")]
    Cancelled,
    /// Some parameters did not end up with the desired value.
    #[error("{0}")]
    SyncFailed(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled => 130,
            Self::SyncFailed(_) => 1,
        }
    }
}

/// Map an error chain to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(cli_error) = err.downcast_ref::<CliError>() {
        return cli_error.exit_code();
    }
    if let Some(ps280sync::Error::Interrupted) = err.downcast_ref::<ps280sync::Error>() {
        return 130;
    }
    1
}

/// Parse a `GROUP.PARAM` argument.
fn parse_key(s: &str) -> Result<ParameterKey, String> {
    s.parse::<ParameterKey>().map_err(|e| e.to_string())
}

fn main() {
    let cli = Cli::parse();

    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

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
        "ps280sync v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("\nStopping after the current step (press Ctrl+C again to abort)");
    }) {
        warn!("Could not install Ctrl+C handler: {e}");
    }
    ps280sync::set_interrupt_checker(|| INTERRUPTED.load(Ordering::SeqCst));

    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    if let Err(e) = run(&cli, &config) {
        eprintln!("{} {e:#}", style("Error:").red().bold());
        std::process::exit(exit_code_for(&e));
    }
}

fn run(cli: &Cli, config: &Config) -> Result<()> {
    match &cli.command {
        Commands::ListPorts { json, all } => commands::ports::cmd_list_ports(config, *json, *all),
        Commands::Settings { json } => commands::settings::cmd_settings(cli, config, *json),
        Commands::Get { key } => commands::settings::cmd_get(cli, config, key),
        Commands::Set {
            key,
            value,
            superuser,
        } => commands::settings::cmd_set(cli, config, key, value, *superuser),
        Commands::Info { key, json } => commands::settings::cmd_info(cli, config, key, *json),
        Commands::Apply {
            file,
            dry_run,
            json,
        } => commands::sync::cmd_apply(cli, config, file, *dry_run, *json),
        Commands::Capture { file, with_info } => {
            commands::sync::cmd_capture(cli, config, file, *with_info)
        },
        Commands::Reboot => commands::settings::cmd_reboot(cli, config),
        Commands::Firmware(FirmwareCommands::List { dir, json }) => {
            commands::firmware::cmd_list(config, dir.as_deref(), *json)
        },
        Commands::Firmware(FirmwareCommands::Erase) => commands::firmware::cmd_erase(cli, config),
        Commands::Firmware(FirmwareCommands::Flash { version, dir }) => {
            commands::firmware::cmd_flash(cli, config, version, dir.as_deref())
        },
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Serial discovery configured from the command line and config files.
fn transport(cli: &Cli, config: &Config) -> Transport<NativeBackend> {
    let probe = EsptoolProbe::new(config.flash_tool(None));
    Transport::new(
        NativeBackend::new(probe),
        config.transport(cli.port.as_deref(), cli.baud),
    )
}

/// Find the sensor and open its console.
fn open_sensor(cli: &Cli, config: &Config) -> Result<Ps280<NativeBackend>> {
    let mut sensor = Ps280::new(transport(cli, config))
        .with_timing(config.timing())
        .with_su_password(config.su_password());

    let pb = spinner(cli, "Looking for the sensor...");
    let connected = sensor.connect();
    pb.finish_and_clear();
    let port = connected?;

    if !cli.quiet {
        eprintln!("{} Connected on {}", style("✓").green(), style(&port).cyan());
    }
    Ok(sensor)
}

/// A stderr spinner, hidden in quiet mode or when stderr is not a terminal.
fn spinner(cli: &Cli, message: &str) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}").unwrap());
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Ask before a destructive step.
///
/// `--yes` skips the prompt; without it, non-interactive mode is a usage error.
fn confirm(cli: &Cli, prompt: &str) -> Result<()> {
    if cli.yes {
        return Ok(());
    }
    if cli.non_interactive {
        return Err(CliError::Usage(format!("{prompt} Pass --yes to confirm in non-interactive mode")).into());
    }

    let accepted = dialoguer::Confirm::with_theme(&dialoguer::theme::ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()
        .map_err(|e| anyhow::anyhow!("Confirmation prompt failed: {e}"))?;
    if accepted {
        Ok(())
    } else {
        Err(CliError::Cancelled.into())
    }
}

/// Stop between steps after Ctrl+C.
fn ensure_not_interrupted() -> Result<()> {
    if INTERRUPTED.load(Ordering::SeqCst) {
        Err(CliError::Cancelled.into())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_key() {
        let key = parse_key("CORE.MSI").unwrap();
        assert_eq!(key, ParameterKey::new("CORE", "MSI"));
        assert!(parse_key("CORE").is_err());
        assert!(parse_key("A.B.C").is_err());
    }

    #[test]
    fn test_exit_codes() {
        let usage = anyhow::Error::from(CliError::Usage("bad".to_string()));
        assert_eq!(exit_code_for(&usage), 2);
        assert_eq!(exit_code_for(&anyhow::Error::from(CliError::Cancelled)), 130);
        let failed = anyhow::Error::from(CliError::SyncFailed("1 failed".to_string()));
        assert_eq!(exit_code_for(&failed), 1);
        assert_eq!(exit_code_for(&anyhow::Error::from(ps280sync::Error::Interrupted)), 130);
        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), 1);
    }

    #[test]
    fn test_exit_code_survives_context() {
        let err = anyhow::Error::from(CliError::Cancelled).context("while flashing");
        assert_eq!(exit_code_for(&err), 130);
    }

    #[test]
    fn test_parse_set_command() {
        let cli = Cli::try_parse_from(["ps280sync", "set", "CORE.SERIAL", "PS-0042", "--superuser"])
            .unwrap();
        match cli.command {
            Commands::Set {
                key,
                value,
                superuser,
            } => {
                assert_eq!(key.to_string(), "CORE.SERIAL");
                assert_eq!(value, "PS-0042");
                assert!(superuser);
            },
            _ => panic!("expected set"),
        }
    }

    #[test]
    fn test_parse_firmware_flash() {
        let cli = Cli::try_parse_from(["ps280sync", "-y", "firmware", "flash", "v1.2.0", "--dir", "fw"])
            .unwrap();
        assert!(cli.yes);
        match cli.command {
            Commands::Firmware(FirmwareCommands::Flash { version, dir }) => {
                assert_eq!(version, "v1.2.0");
                assert_eq!(dir, Some(PathBuf::from("fw")));
            },
            _ => panic!("expected firmware flash"),
        }
    }

    #[test]
    fn test_confirm_with_yes() {
        let cli = Cli::try_parse_from(["ps280sync", "--yes", "firmware", "erase"]).unwrap();
        assert!(confirm(&cli, "Erase?").is_ok());
    }

    #[test]
    fn test_confirm_non_interactive_is_usage_error() {
        let cli = Cli::try_parse_from(["ps280sync", "--non-interactive", "firmware", "erase"]).unwrap();
        let err = confirm(&cli, "Erase?").unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
        assert!(err.to_string().contains("--yes"));
    }
}
