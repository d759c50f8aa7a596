//! In-memory PS-280 console and serial backend for unit tests.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::port::{Port, PortInfo, SerialConfig};
use crate::protocol::ProtocolTiming;
use crate::sensor::Ps280;
use crate::transport::{SerialBackend, Transport, TransportConfig};

const PROMPT: &str = "\x1b[0m/ > ";

#[derive(Default)]
struct ConsoleState {
    settings: Vec<(String, String, String)>,
    infos: BTreeMap<String, Vec<String>>,
    rejected: BTreeSet<String>,
    clamped: BTreeMap<String, String>,
    script: Option<String>,
    noisy: bool,
    silent_settings: usize,
    silent_writes: usize,
    unplugged: bool,
    fail_next_write: bool,
    commands: Vec<String>,
    input: Vec<u8>,
    /// Bytes that reached the host's receive buffer.
    output: VecDeque<u8>,
    /// Replies still on the wire; they land in `output` on the next read.
    in_flight: VecDeque<u8>,
}

impl ConsoleState {
    fn emit(&mut self, text: &str) {
        self.in_flight.extend(text.as_bytes());
    }

    fn emit_line(&mut self, text: &str) {
        if self.noisy {
            self.emit(&format!("\x1b[1;36m{text}\x1b[0m\x1b[K\r\n"));
        } else {
            self.emit(&format!("{text}\r\n"));
        }
    }

    fn prompt(&mut self) {
        if self.noisy {
            self.emit("\x1b[32m/ >\x1b[0m / > ");
        } else {
            self.emit(PROMPT);
        }
    }

    fn store(&mut self, group: &str, parameter: &str, value: &str) {
        if let Some(entry) = self
            .settings
            .iter_mut()
            .find(|(g, p, _)| g == group && p == parameter)
        {
            entry.2 = value.to_string();
        }
    }

    fn handle(&mut self, line: &str) {
        self.commands.push(line.to_string());

        if let Some(script) = self.script.clone() {
            self.emit(&script);
            return;
        }

        self.emit_line(&format!("/ > {line}"));
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["settings", "get"] => {
                if self.silent_settings > 0 {
                    self.silent_settings -= 1;
                } else {
                    self.emit_line("Module     Name            Value");
                    self.emit_line("------------------------------------");
                    for (group, parameter, value) in self.settings.clone() {
                        self.emit_line(&format!("{group:<10} {parameter:<15} {value}"));
                    }
                }
            },
            ["settings", "set", group, parameter, rest @ ..] => {
                let key = format!("{group}.{parameter}");
                let value = rest.join(" ");
                if self.silent_writes > 0 {
                    self.silent_writes -= 1;
                } else if self.rejected.contains(&key) {
                    self.emit_line("Error: illegal value");
                } else {
                    let stored = self.clamped.get(&key).cloned().unwrap_or(value);
                    self.store(group, parameter, &stored);
                    self.emit_line(&format!("{group} {parameter}: stored"));
                }
            },
            ["settings", "info", group, parameter] => {
                match self.infos.get(&format!("{group}.{parameter}")).cloned() {
                    Some(lines) => {
                        for info in lines {
                            self.emit_line(&info);
                        }
                    },
                    None => self.emit_line(&format!("{group} {parameter}: unknown setting")),
                }
            },
            ["su", ..] => {},
            ["reboot"] => {
                self.emit_line("Rebooting...");
                return;
            },
            _ => self.emit_line(&format!("{line}: command not found")),
        }
        self.prompt();
    }
}

/// Simulated sensor console. Clones share the same device.
#[derive(Clone)]
pub(crate) struct MockConsole {
    state: Arc<Mutex<ConsoleState>>,
    name: String,
    timeout: Duration,
}

impl MockConsole {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ConsoleState::default())),
            name: "mock".to_string(),
            timeout: Duration::from_millis(2),
        }
    }

    /// A device with the given `(group, parameter, value)` settings.
    pub(crate) fn with_settings(settings: &[(&str, &str, &str)]) -> Self {
        let console = Self::new();
        console.lock().settings = settings
            .iter()
            .map(|(g, p, v)| ((*g).to_string(), (*p).to_string(), (*v).to_string()))
            .collect();
        console
    }

    /// A console that answers every command with `reply`, without echo.
    pub(crate) fn scripted(reply: &str) -> Self {
        let console = Self::new();
        console.lock().script = Some(reply.to_string());
        console
    }

    /// Wrap every line in VT100 sequences.
    pub(crate) fn noisy(self) -> Self {
        self.lock().noisy = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ConsoleState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_name(&self, name: &str) -> Self {
        Self {
            state: Arc::clone(&self.state),
            name: name.to_string(),
            timeout: self.timeout,
        }
    }

    /// Place bytes directly in the host's receive buffer.
    pub(crate) fn inject(&self, bytes: &[u8]) {
        self.lock().output.extend(bytes);
    }

    pub(crate) fn reject(&self, group: &str, parameter: &str) {
        self.lock().rejected.insert(format!("{group}.{parameter}"));
    }

    /// Store `value` instead of whatever is written to the parameter.
    pub(crate) fn clamp(&self, group: &str, parameter: &str, value: &str) {
        self.lock()
            .clamped
            .insert(format!("{group}.{parameter}"), value.to_string());
    }

    pub(crate) fn set_info(&self, group: &str, parameter: &str, lines: &[&str]) {
        self.lock().infos.insert(
            format!("{group}.{parameter}"),
            lines.iter().map(|l| (*l).to_string()).collect(),
        );
    }

    /// Answer the next `count` settings listings with a bare prompt.
    pub(crate) fn silence_settings(&self, count: usize) {
        self.lock().silent_settings = count;
    }

    /// Ignore the next `count` writes entirely.
    pub(crate) fn silence_writes(&self, count: usize) {
        self.lock().silent_writes = count;
    }

    pub(crate) fn unplug(&self) {
        self.lock().unplugged = true;
    }

    pub(crate) fn replug(&self) {
        self.lock().unplugged = false;
    }

    pub(crate) fn fail_next_write(&self) {
        self.lock().fail_next_write = true;
    }

    pub(crate) fn value(&self, group: &str, parameter: &str) -> Option<String> {
        self.lock()
            .settings
            .iter()
            .find(|(g, p, _)| g == group && p == parameter)
            .map(|(_, _, v)| v.clone())
    }

    /// Every command line received, in order.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

}

impl Read for MockConsole {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        let arrived: Vec<u8> = state.in_flight.drain(..).collect();
        state.output.extend(arrived);
        if state.output.is_empty() {
            drop(state);
            thread::sleep(self.timeout);
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.output.len()).min(16);
        for (slot, byte) in buf.iter_mut().zip(state.output.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockConsole {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.unplugged || state.fail_next_write {
            state.fail_next_write = false;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone"));
        }

        state.input.extend_from_slice(buf);
        while let Some(pos) = state.input.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = state.input.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                state.handle(&line);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockConsole {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn baud_rate(&self) -> u32 {
        crate::port::DEFAULT_BAUD
    }

    /// Drops what has arrived; replies still in flight survive.
    fn clear_buffers(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.output.clear();
        state.input.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Backend exposing a fixed port list and handing out [`MockConsole`]s.
pub(crate) struct MockBackend {
    console: MockConsole,
    ports: Vec<(PortInfo, bool)>,
    open_fails: bool,
    probed: RefCell<Vec<String>>,
    list_calls: Cell<usize>,
    open_calls: Cell<usize>,
}

impl MockBackend {
    pub(crate) fn new(console: MockConsole) -> Self {
        Self {
            console,
            ports: Vec::new(),
            open_fails: false,
            probed: RefCell::new(Vec::new()),
            list_calls: Cell::new(0),
            open_calls: Cell::new(0),
        }
    }

    /// Add a port; `accepted` is the probe's verdict for it.
    pub(crate) fn with_port(mut self, info: PortInfo, accepted: bool) -> Self {
        self.ports.push((info, accepted));
        self
    }

    pub(crate) fn failing_open(mut self) -> Self {
        self.open_fails = true;
        self
    }

    pub(crate) fn probed(&self) -> Vec<String> {
        self.probed.borrow().clone()
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.get()
    }

    pub(crate) fn open_calls(&self) -> usize {
        self.open_calls.get()
    }
}

impl SerialBackend for MockBackend {
    type Port = MockConsole;

    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        self.list_calls.set(self.list_calls.get() + 1);
        Ok(self.ports.iter().map(|(info, _)| info.clone()).collect())
    }

    fn identify(&self, port_name: &str) -> bool {
        self.probed.borrow_mut().push(port_name.to_string());
        self.ports
            .iter()
            .any(|(info, accepted)| *accepted && info.name == port_name)
    }

    fn open(&self, config: &SerialConfig) -> Result<MockConsole> {
        self.open_calls.set(self.open_calls.get() + 1);
        if self.open_fails {
            return Err(Error::Connection {
                port: config.port_name.clone(),
                reason: "Device or resource busy".to_string(),
            });
        }
        Ok(self.console.with_name(&config.port_name))
    }
}

/// A sensor session on one simulated ESP32-S3 port, with no delays.
pub(crate) fn mock_sensor(console: &MockConsole) -> Ps280<MockBackend> {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = MockBackend::new(console.clone())
        .with_port(PortInfo::usb("/dev/ttyACM0", 0x303A, 0x1001), true);
    let config = TransportConfig::default().with_retries(2, Duration::ZERO);
    Ps280::new(Transport::new(backend, config)).with_timing(ProtocolTiming::immediate())
}
