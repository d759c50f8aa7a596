//! External flashing tool invocation.
//!
//! Chip identification and firmware erase/flash are delegated to
//! `esptool`. Its output is streamed line by line to a caller-supplied sink
//! while the process runs.

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Sender};
use std::thread;

use log::{debug, trace};

use crate::error::{Error, Result};

/// Baud rate used for erase and flash operations.
pub const DEFAULT_FLASH_BAUD: u32 = 460_800;

/// Substring printed by `esptool` once it has talked to a chip.
pub const CHIP_DETECTED_MARKER: &str = "Detecting chip type";

/// How to launch the flashing tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashToolConfig {
    /// Program to execute.
    pub program: String,
    /// Arguments placed before everything else (e.g. `-m esptool`).
    pub base_args: Vec<String>,
    /// Baud rate for erase/flash.
    pub baud_rate: u32,
    /// Port to pass to the tool; the tool auto-detects when `None`.
    pub port: Option<String>,
}

impl Default for FlashToolConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            base_args: vec!["-m".to_string(), "esptool".to_string()],
            baud_rate: DEFAULT_FLASH_BAUD,
            port: None,
        }
    }
}

impl FlashToolConfig {
    /// Use a specific executable with no base arguments.
    pub fn program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            ..Default::default()
        }
    }

    /// Set the port handed to the tool.
    #[must_use]
    pub fn with_port(mut self, port: Option<String>) -> Self {
        self.port = port;
        self
    }

    /// Set the baud rate.
    #[must_use]
    pub fn with_baud(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Build the command line for one tool operation.
    pub fn command<I, S>(&self, operation: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(&self.program);
        command.args(&self.base_args);
        if let Some(port) = &self.port {
            command.arg("--port").arg(port);
        }
        command.arg("-b").arg(self.baud_rate.to_string());
        command.args(operation);
        command
    }
}

/// Which pipe a line of tool output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One line of tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolLine {
    /// Originating pipe.
    pub stream: ToolStream,
    /// Line text without terminator.
    pub text: String,
}

fn forward_lines<R: Read>(reader: R, stream: ToolStream, tx: &Sender<ToolLine>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if tx.send(ToolLine { stream, text }).is_err() {
                    break;
                }
            },
        }
    }
}

/// Run `command`, streaming stdout and stderr lines to `sink` as they arrive.
///
/// Both pipes are drained concurrently so a chatty stderr cannot stall the
/// process. Returns the exit status once the process has ended.
pub fn run_streaming(mut command: Command, sink: &mut dyn FnMut(ToolLine)) -> Result<ExitStatus> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("PYTHONUNBUFFERED", "1");

    debug!("Running {command:?}");
    let mut child = command.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Io(std::io::Error::other("tool stdout not captured")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Io(std::io::Error::other("tool stderr not captured")))?;

    let (tx, rx) = mpsc::channel();
    thread::scope(|scope| {
        let tx_err = tx.clone();
        scope.spawn(move || forward_lines(stdout, ToolStream::Stdout, &tx));
        scope.spawn(move || forward_lines(stderr, ToolStream::Stderr, &tx_err));
        for line in rx {
            trace!("tool: {}", line.text);
            sink(line);
        }
    });

    let status = child.wait()?;
    debug!("Tool exited with {status}");
    Ok(status)
}

/// Chip-identification probe used to validate discovery candidates.
#[derive(Debug, Clone, Default)]
pub struct EsptoolProbe {
    config: FlashToolConfig,
}

impl EsptoolProbe {
    /// Create a probe running the given tool.
    pub fn new(config: FlashToolConfig) -> Self {
        Self { config }
    }

    /// Ask the tool to identify the chip on `port_name`.
    ///
    /// Accepted only if the tool exits successfully and reported detecting a
    /// chip. Any failure to run the tool counts as "not a PS-280".
    pub fn identify(&self, port_name: &str) -> bool {
        let config = self.config.clone().with_port(Some(port_name.to_string()));
        let mut detected = false;
        let status = run_streaming(config.command(["chip_id"]), &mut |line| {
            if line.text.contains(CHIP_DETECTED_MARKER) {
                detected = true;
            }
        });

        match status {
            Ok(status) => {
                debug!("Probe on {port_name}: {status}, chip detected: {detected}");
                status.success() && detected
            },
            Err(e) => {
                debug!("Probe on {port_name} could not run: {e}");
                false
            },
        }
    }
}
