//! Token-delimited command exchange over the PS-280 console.
//!
//! The console is line oriented. A command is one line terminated by
//! `\r\n`; the reply is whatever the shell prints afterwards, up to the next
//! prompt. An exchange is described by up to three tokens matched against
//! cleaned lines:
//!
//! - **start token**: the reply only begins at the line containing it. If no
//!   end token is given, that line alone is the reply (e.g. `stored`).
//! - **end token**: the line containing it terminates the reply and is not
//!   part of it (usually the prompt).
//! - **error token**: the device rejected the command; reading stops
//!   immediately.
//!
//! Lines echoing the command itself are ignored.

pub mod clean;

use std::io::{ErrorKind, Read};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};

pub use clean::{LineAssembler, PROMPT, clean_line, drain_utf8_lossy};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::retry::RetryPolicy;

/// Line terminator expected by the console.
pub const LINE_ENDING: &str = "\r\n";

/// Delays and attempt budgets for console exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolTiming {
    /// Settle delay after an ordinary command (writes, reboot).
    pub command_settle: Duration,
    /// Settle delay after requesting the full settings listing.
    pub settings_settle: Duration,
    /// Settle delay after a parameter-info request.
    pub info_settle: Duration,
    /// Settle delay after the superuser elevation command.
    pub elevation_settle: Duration,
    /// How long a single exchange waits for its terminating condition.
    pub exchange_timeout: Duration,
    /// Retry budget for reading the settings listing.
    pub settings_retry: RetryPolicy,
    /// Retry budget for a single parameter write.
    pub write_retry: RetryPolicy,
}

impl Default for ProtocolTiming {
    fn default() -> Self {
        Self {
            command_settle: Duration::from_millis(300),
            settings_settle: Duration::from_millis(500),
            info_settle: Duration::from_millis(100),
            elevation_settle: Duration::from_millis(300),
            exchange_timeout: Duration::from_secs(3),
            settings_retry: RetryPolicy::exponential(
                10,
                Duration::from_millis(200),
                Duration::from_secs(2),
            ),
            write_retry: RetryPolicy::exponential(
                5,
                Duration::from_millis(300),
                Duration::from_secs(2),
            ),
        }
    }
}

impl ProtocolTiming {
    /// No settle delays, no backoff, short exchange timeout.
    #[cfg(test)]
    pub(crate) fn immediate() -> Self {
        Self {
            command_settle: Duration::ZERO,
            settings_settle: Duration::ZERO,
            info_settle: Duration::ZERO,
            elevation_settle: Duration::ZERO,
            exchange_timeout: Duration::from_millis(150),
            settings_retry: RetryPolicy::fixed(10, Duration::ZERO),
            write_retry: RetryPolicy::fixed(5, Duration::ZERO),
        }
    }
}

/// A command plus the tokens that delimit its reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExchange {
    /// Command line, without terminator.
    pub command: String,
    /// Token marking the first line of the reply.
    pub start_token: Option<String>,
    /// Token marking the line after the last line of the reply.
    pub end_token: Option<String>,
    /// Token signalling that the device rejected the command.
    pub error_token: Option<String>,
    /// Pause between sending the command and reading the reply.
    pub settle: Duration,
    /// Overall time budget for reading the reply.
    pub timeout: Duration,
}

impl CommandExchange {
    /// Create an exchange with no tokens and a 3 s timeout.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            start_token: None,
            end_token: None,
            error_token: None,
            settle: Duration::ZERO,
            timeout: Duration::from_secs(3),
        }
    }

    /// Set the start token.
    #[must_use]
    pub fn start(mut self, token: impl Into<String>) -> Self {
        self.start_token = Some(token.into());
        self
    }

    /// Set the end token.
    #[must_use]
    pub fn end(mut self, token: impl Into<String>) -> Self {
        self.end_token = Some(token.into());
        self
    }

    /// Set the error token.
    #[must_use]
    pub fn error(mut self, token: impl Into<String>) -> Self {
        self.error_token = Some(token.into());
        self
    }

    /// Set the settle delay.
    #[must_use]
    pub fn settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Set the read timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Result of a single exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The terminating condition was observed.
    Complete(Vec<String>),
    /// The error token was observed; carries the offending line.
    Rejected(String),
    /// The timeout elapsed first; carries whatever was accumulated.
    TimedOut(Vec<String>),
}

impl Reply {
    /// Reply lines (the offending line for [`Reply::Rejected`]).
    pub fn lines(&self) -> &[String] {
        match self {
            Self::Complete(lines) | Self::TimedOut(lines) => lines,
            Self::Rejected(line) => std::slice::from_ref(line),
        }
    }

    /// Whether the reply carries no lines at all.
    pub fn is_empty(&self) -> bool {
        self.lines().is_empty()
    }

    /// Consume the reply, returning its lines.
    pub fn into_lines(self) -> Vec<String> {
        match self {
            Self::Complete(lines) | Self::TimedOut(lines) => lines,
            Self::Rejected(line) => vec![line],
        }
    }
}

/// Token matching state for one exchange.
struct ReplyCollector<'a> {
    exchange: &'a CommandExchange,
    started: bool,
    lines: Vec<String>,
}

impl<'a> ReplyCollector<'a> {
    fn new(exchange: &'a CommandExchange) -> Self {
        Self {
            exchange,
            started: exchange.start_token.is_none(),
            lines: Vec::new(),
        }
    }

    fn is_echo(&self, line: &str) -> bool {
        !self.exchange.command.is_empty() && line.contains(self.exchange.command.as_str())
    }

    /// Feed one raw line; returns the reply once it is decided.
    fn feed(&mut self, raw: &str) -> Option<Reply> {
        let line = clean_line(raw);
        if line.is_empty() {
            return None;
        }
        trace!("<< {line}");

        if self.is_echo(&line) {
            return None;
        }

        if let Some(error) = &self.exchange.error_token {
            if line.contains(error.as_str()) {
                return Some(Reply::Rejected(line));
            }
        }

        if !self.started {
            if let Some(start) = &self.exchange.start_token {
                if line.contains(start.as_str()) {
                    self.started = true;
                    if self.exchange.end_token.is_none() {
                        return Some(Reply::Complete(vec![line]));
                    }
                }
            }
            return None;
        }

        if let Some(end) = &self.exchange.end_token {
            if line.contains(end.as_str()) {
                return Some(Reply::Complete(std::mem::take(&mut self.lines)));
            }
        }

        self.lines.push(line);
        None
    }

    /// Check an unterminated line for a decisive end or error token.
    fn peek(&mut self, raw: &str) -> Option<Reply> {
        let line = clean_line(raw);
        if self.is_echo(&line) {
            None
        } else if contains_token(&line, self.exchange.error_token.as_deref()) {
            Some(Reply::Rejected(line))
        } else if self.started && contains_token(&line, self.exchange.end_token.as_deref()) {
            Some(Reply::Complete(std::mem::take(&mut self.lines)))
        } else {
            None
        }
    }

    fn finish(mut self, pending: &str) -> Reply {
        if !pending.is_empty() {
            if let Some(reply) = self.feed(pending) {
                return reply;
            }
        }
        Reply::TimedOut(self.lines)
    }
}

fn contains_token(line: &str, token: Option<&str>) -> bool {
    token.is_some_and(|t| line.contains(t))
}

fn connection_error<P: Port>(port: &P, err: &impl std::fmt::Display) -> Error {
    Error::Connection {
        port: port.name().to_string(),
        reason: err.to_string(),
    }
}

/// Send one command line and wait for the settle delay, without reading.
///
/// Input buffered before the command is discarded.
pub fn send_line<P: Port>(port: &mut P, command: &str, settle: Duration) -> Result<()> {
    port.clear_buffers()?;
    debug!(">> {command}");
    let line = format!("{command}{LINE_ENDING}");
    port.write_all_bytes(line.as_bytes())
        .map_err(|e| connection_error(port, &e))?;
    if !settle.is_zero() {
        thread::sleep(settle);
    }
    Ok(())
}

/// Run a full command exchange.
///
/// Clears stale input, sends the command, waits `exchange.settle`, then
/// reads cleaned lines until the exchange is decided or `exchange.timeout`
/// elapses. A timeout is not an error: it yields [`Reply::TimedOut`] with
/// the lines accumulated so far, and callers decide whether to retry.
pub fn send_command<P: Port>(port: &mut P, exchange: &CommandExchange) -> Result<Reply> {
    send_line(port, &exchange.command, exchange.settle)?;

    let deadline = Instant::now() + exchange.timeout;
    let mut collector = ReplyCollector::new(exchange);
    let mut assembler = LineAssembler::default();
    let mut buf = [0u8; 256];

    while Instant::now() < deadline {
        match port.read(&mut buf) {
            Ok(0) => {},
            Ok(n) => {
                for line in assembler.push(&buf[..n]) {
                    if let Some(reply) = collector.feed(&line) {
                        return Ok(reply);
                    }
                }
                if let Some(reply) = collector.peek(assembler.pending()) {
                    return Ok(reply);
                }
            },
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {},
            Err(e) => return Err(connection_error(port, &e)),
        }
    }

    let reply = collector.finish(&assembler.take_pending());
    if let Reply::TimedOut(lines) = &reply {
        debug!(
            "'{}' timed out after {:?} with {} line(s)",
            exchange.command,
            exchange.timeout,
            lines.len()
        );
    }
    Ok(reply)
}
