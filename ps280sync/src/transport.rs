//! Device discovery and connection management.
//!
//! [`Transport`] owns at most one open [`Connection`]. Everything above it
//! calls [`Transport::reconnect`] before talking to the device: a held
//! connection is reused as-is, otherwise the device is rediscovered and a
//! fresh port is opened. A connection that fails an I/O call is dropped,
//! so holding one means it has not failed yet. [`Transport::is_live`]
//! actively checks a held connection.

use std::time::Duration;

use log::{debug, info, warn};

use crate::device::{UsbId, default_allow_list, filter_candidates};
use crate::error::{Error, Result};
use crate::port::{DEFAULT_BAUD, Port, PortInfo, SerialConfig};
use crate::protocol::{self, CommandExchange, PROMPT};
use crate::retry::RetryPolicy;

/// Line written to check that a connection still accepts writes.
pub const LIVENESS_PROBE: &str = "teststring";

/// How long to wait for the console to finish answering the probe.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_millis(500);

/// Discovery rounds before giving up.
pub const DEFAULT_MAX_RETRIES: usize = 5;

/// Delay between discovery rounds.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Access to the host's serial ports.
///
/// Production code uses [`NativeBackend`]; tests plug in a simulated
/// console.
pub trait SerialBackend {
    /// Port type produced by [`SerialBackend::open`].
    type Port: Port;

    /// Enumerate the system's serial ports.
    fn list_ports(&self) -> Result<Vec<PortInfo>>;

    /// Run the chip-identification probe against a candidate port.
    fn identify(&self, port_name: &str) -> bool;

    /// Open a port.
    fn open(&self, config: &SerialConfig) -> Result<Self::Port>;
}

/// Discovery and connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Use this port and skip discovery.
    pub port: Option<String>,
    /// USB identifiers considered during discovery.
    pub allow_list: Vec<UsbId>,
    /// Console baud rate.
    pub baud_rate: u32,
    /// Per-call serial timeout.
    pub timeout: Duration,
    /// Discovery rounds before [`Error::DeviceNotFound`].
    pub max_retries: usize,
    /// Delay between discovery rounds.
    pub retry_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: None,
            allow_list: default_allow_list(),
            baud_rate: DEFAULT_BAUD,
            timeout: Duration::from_millis(100),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl TransportConfig {
    /// Pin the port, bypassing discovery.
    #[must_use]
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    /// Replace the discovery allow-list.
    #[must_use]
    pub fn with_allow_list(mut self, allow_list: Vec<UsbId>) -> Self {
        self.allow_list = allow_list;
        self
    }

    /// Set the discovery retry budget.
    #[must_use]
    pub fn with_retries(mut self, max_retries: usize, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    fn serial_config(&self, port_name: &str) -> SerialConfig {
        SerialConfig::new(port_name, self.baud_rate).with_timeout(self.timeout)
    }
}

/// An open serial link to the sensor.
pub struct Connection<P: Port> {
    port: P,
}

impl<P: Port> Connection<P> {
    /// Port name/path.
    pub fn port_name(&self) -> &str {
        self.port.name()
    }

    /// Baud rate of the link.
    pub fn baud_rate(&self) -> u32 {
        self.port.baud_rate()
    }

    /// Per-call timeout of the link.
    pub fn timeout(&self) -> Duration {
        self.port.timeout()
    }

    /// Mutable access to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}

/// Discovery, open, liveness and reconnection.
pub struct Transport<B: SerialBackend> {
    backend: B,
    config: TransportConfig,
    connection: Option<Connection<B::Port>>,
}

impl<B: SerialBackend> Transport<B> {
    /// Create a transport; nothing is opened until first use.
    pub fn new(backend: B, config: TransportConfig) -> Self {
        Self {
            backend,
            config,
            connection: None,
        }
    }

    /// The transport configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// The serial backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether a connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Name of the currently connected port.
    pub fn port_name(&self) -> Option<&str> {
        self.connection.as_ref().map(Connection::port_name)
    }

    /// Find the sensor's port.
    ///
    /// A configured port is returned as-is. Otherwise each round enumerates
    /// the ports, keeps those on the allow-list and probes them in order;
    /// the first accepted port wins.
    pub fn discover(&self) -> Result<String> {
        if let Some(port) = &self.config.port {
            debug!("Using configured port {port}");
            return Ok(port.clone());
        }

        let rounds = self.config.max_retries.max(1);
        let policy = RetryPolicy::fixed(rounds, self.config.retry_delay);
        let found = policy.run(|round| {
            let ports = match self.backend.list_ports() {
                Ok(ports) => ports,
                Err(e) => {
                    warn!("Port enumeration failed: {e}");
                    return Ok(None);
                },
            };

            let candidates = filter_candidates(ports, &self.config.allow_list);
            debug!("Discovery round {round}/{rounds}: {} candidate(s)", candidates.len());

            for candidate in candidates {
                if self.backend.identify(&candidate.name) {
                    info!("Found PS-280 on {} ({})", candidate.name, candidate.device.name());
                    return Ok(Some(candidate.name));
                }
                debug!("{} did not identify as a PS-280", candidate.name);
            }
            Ok(None)
        })?;

        found.ok_or(Error::DeviceNotFound { attempts: rounds })
    }

    /// Open `port_name`, replacing any existing connection.
    pub fn open(&mut self, port_name: &str) -> Result<&mut Connection<B::Port>> {
        self.disconnect();
        let port = self.backend.open(&self.config.serial_config(port_name))?;
        info!("Connected to {port_name} at {} baud", self.config.baud_rate);
        Ok(self.connection.insert(Connection { port }))
    }

    /// Write the liveness probe; a failed write drops the connection.
    ///
    /// The console's answer to the probe is read off up to the prompt, so
    /// it cannot surface in the next exchange.
    pub fn is_live(&mut self) -> bool {
        let Some(connection) = self.connection.as_mut() else {
            return false;
        };

        let probe = CommandExchange::new(LIVENESS_PROBE)
            .end(PROMPT)
            .timeout(LIVENESS_TIMEOUT);
        match protocol::send_command(&mut connection.port, &probe) {
            Ok(_) => true,
            Err(e) => {
                warn!("Lost connection: {e}");
                self.disconnect();
                false
            },
        }
    }

    /// Return a connection, rediscovering and reopening if none is held.
    ///
    /// Calling this repeatedly on a held connection writes nothing.
    pub fn reconnect(&mut self) -> Result<&mut Connection<B::Port>> {
        if self.connection.is_none() {
            let port_name = self.discover()?;
            self.open(&port_name)?;
        }
        self.connection
            .as_mut()
            .ok_or_else(|| Error::InvalidState("connection vanished".to_string()))
    }

    /// Close the current connection, if any.
    pub fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            debug!("Closing {}", connection.port_name());
            if let Err(e) = connection.port.close() {
                debug!("Error while closing port: {e}");
            }
        }
    }
}

/// Host serial ports plus the `esptool` identification probe.
#[cfg(feature = "native")]
#[derive(Debug, Clone, Default)]
pub struct NativeBackend {
    probe: crate::tool::EsptoolProbe,
}

#[cfg(feature = "native")]
impl NativeBackend {
    /// Use a specific probe.
    pub fn new(probe: crate::tool::EsptoolProbe) -> Self {
        Self { probe }
    }
}

#[cfg(feature = "native")]
impl SerialBackend for NativeBackend {
    type Port = crate::port::NativePort;

    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        use crate::port::{NativePortEnumerator, PortEnumerator};
        NativePortEnumerator::list_ports()
    }

    fn identify(&self, port_name: &str) -> bool {
        self.probe.identify(port_name)
    }

    fn open(&self, config: &SerialConfig) -> Result<Self::Port> {
        crate::port::NativePort::open(config)
    }
}
