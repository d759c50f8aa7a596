//! Console noise removal.
//!
//! The PS-280 console is an interactive shell: replies arrive interleaved
//! with VT100 color/cursor sequences, redrawn prompts and stray control
//! bytes. Token matching only works on text that went through
//! [`clean_line`].

use std::sync::LazyLock;

use regex::Regex;

/// Canonical form of the console prompt.
pub const PROMPT: &str = "/ >";

/// CSI sequences (`ESC [ ... final`), OSC strings and two-byte escapes.
#[allow(clippy::unwrap_used)] // Static pattern
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b(?:\[[0-?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)?|[@-Z\\-_])").unwrap()
});

/// One or more prompts in a row, with arbitrary spacing.
#[allow(clippy::unwrap_used)] // Static pattern
static PROMPT_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?:/[ \t]*>[ \t]*)+").unwrap());

/// Strip escape sequences and non-printable characters, collapse repeated
/// prompts into [`PROMPT`], and trim surrounding whitespace.
pub fn clean_line(raw: &str) -> String {
    let without_escapes = ANSI_ESCAPE.replace_all(raw, "");

    let mut printable = String::with_capacity(without_escapes.len());
    for ch in without_escapes.chars() {
        match ch {
            '\t' => printable.push(' '),
            _ if ch.is_control() => {},
            _ => printable.push(ch),
        }
    }

    let collapsed = PROMPT_RUN.replace_all(&printable, "/ > ");
    collapsed.trim().to_string()
}

/// Drain buffered bytes into text without stalling on invalid bytes.
///
/// - Valid UTF-8 is emitted as-is.
/// - Invalid byte sequences emit the replacement char `�` and continue.
/// - An incomplete UTF-8 suffix is kept in `buffer` for the next read.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if valid_up_to > 0 {
                    if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                        output.push_str(valid);
                    }
                }

                match err.error_len() {
                    Some(invalid_len) => {
                        output.push('�');
                        let drain_to = valid_up_to.saturating_add(invalid_len).min(buffer.len());
                        buffer.drain(..drain_to);
                    },
                    None => {
                        if valid_up_to > 0 {
                            buffer.drain(..valid_up_to);
                        }
                        break;
                    },
                }
            },
        }
    }

    output
}

/// Splits a byte stream into raw lines.
///
/// Both `\n` and `\r` terminate a line; the console uses bare `\r` when it
/// redraws the prompt. Empty lines are dropped.
#[derive(Debug, Default)]
pub struct LineAssembler {
    bytes: Vec<u8>,
    partial: String,
}

impl LineAssembler {
    /// Feed received bytes, returning every line completed by them.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(data);
        let text = drain_utf8_lossy(&mut self.bytes);

        let mut lines = Vec::new();
        for ch in text.chars() {
            if ch == '\n' || ch == '\r' {
                if !self.partial.is_empty() {
                    lines.push(std::mem::take(&mut self.partial));
                }
            } else {
                self.partial.push(ch);
            }
        }
        lines
    }

    /// The unterminated tail received so far (typically a prompt).
    pub fn pending(&self) -> &str {
        &self.partial
    }

    /// Take the unterminated tail, leaving the assembler empty.
    pub fn take_pending(&mut self) -> String {
        std::mem::take(&mut self.partial)
    }
}
