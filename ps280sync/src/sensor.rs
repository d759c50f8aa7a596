//! PS-280 console session.
//!
//! [`Ps280`] is the only type that issues console commands. Every
//! operation goes through [`Transport::reconnect`] first, and an exchange
//! whose connection fails is repeated once on a freshly discovered port, so
//! a sensor that was unplugged and replugged between calls is picked up
//! transparently.

use std::collections::BTreeMap;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{self, CommandExchange, PROMPT, ProtocolTiming, Reply};
use crate::settings::{CapturedParameter, DesiredConfiguration, ParameterInfo, SettingsSnapshot};
use crate::sync::{self, ParameterPolicy, SyncReport};
use crate::transport::{SerialBackend, Transport};

/// Command listing every setting.
pub const SETTINGS_COMMAND: &str = "settings get";
/// First line of the settings listing.
pub const SETTINGS_START_TOKEN: &str = "Module";
/// Acknowledgment of a successful write.
pub const STORED_TOKEN: &str = "stored";
/// Rejection of a write.
pub const ILLEGAL_VALUE_TOKEN: &str = "illegal value";
/// Reply to an info request for a parameter that does not exist.
pub const UNKNOWN_SETTING_TOKEN: &str = "unknown setting";
/// Factory superuser password.
pub const DEFAULT_SU_PASSWORD: &str = "PS!_@dmin";

/// Read/write access to device settings.
///
/// Implemented by [`Ps280`]; the synchronization engine and the
/// [`controls`](crate::controls) helpers only depend on this trait.
pub trait ConfigurableDevice {
    /// Read the complete current configuration.
    fn fetch_snapshot(&mut self) -> Result<SettingsSnapshot>;

    /// Write one parameter, elevating first when `superuser` is set.
    fn write(&mut self, group: &str, parameter: &str, value: &str, superuser: bool) -> Result<()>;
}

/// A session with one PS-280 sensor.
pub struct Ps280<B: SerialBackend> {
    transport: Transport<B>,
    timing: ProtocolTiming,
    su_password: String,
}

#[cfg(feature = "native")]
impl Ps280<crate::transport::NativeBackend> {
    /// Session over the host's serial ports with default discovery.
    pub fn native(config: crate::transport::TransportConfig) -> Self {
        Self::new(Transport::new(
            crate::transport::NativeBackend::default(),
            config,
        ))
    }
}

impl<B: SerialBackend> Ps280<B> {
    /// Create a session; nothing is opened until first use.
    pub fn new(transport: Transport<B>) -> Self {
        Self {
            transport,
            timing: ProtocolTiming::default(),
            su_password: DEFAULT_SU_PASSWORD.to_string(),
        }
    }

    /// Override the protocol timing.
    #[must_use]
    pub fn with_timing(mut self, timing: ProtocolTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Override the superuser password.
    #[must_use]
    pub fn with_su_password(mut self, password: impl Into<String>) -> Self {
        self.su_password = password.into();
        self
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Transport<B> {
        &self.transport
    }

    /// Mutable access to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut Transport<B> {
        &mut self.transport
    }

    /// Make sure a live connection exists; returns the port name.
    ///
    /// A held connection is checked with the liveness probe and replaced
    /// when the probe fails.
    pub fn connect(&mut self) -> Result<String> {
        if self.transport.is_connected() && !self.transport.is_live() {
            debug!("Held connection is dead, rediscovering");
        }
        Ok(self.transport.reconnect()?.port_name().to_string())
    }

    /// Close the connection.
    pub fn disconnect(&mut self) {
        self.transport.disconnect();
    }

    fn exchange(&mut self, exchange: &CommandExchange) -> Result<Reply> {
        self.exchange_elevated(exchange, None)
    }

    /// Run `exchange`, preceded by `elevation` on the same connection.
    ///
    /// A connection error drops the connection; the sequence is then
    /// repeated once on a reopened port.
    fn exchange_elevated(
        &mut self,
        exchange: &CommandExchange,
        elevation: Option<&CommandExchange>,
    ) -> Result<Reply> {
        let mut reopened = false;
        loop {
            let port = self.transport.reconnect()?.port_mut();
            let result = match elevation {
                Some(su) => protocol::send_command(port, su)
                    .and_then(|_| protocol::send_command(port, exchange)),
                None => protocol::send_command(port, exchange),
            };

            match result {
                Err(Error::Connection { port, reason }) => {
                    self.transport.disconnect();
                    if reopened {
                        return Err(Error::Connection { port, reason });
                    }
                    warn!("Lost {port} ({reason}), reconnecting");
                    reopened = true;
                },
                other => return other,
            }
        }
    }

    fn elevation(&self) -> CommandExchange {
        CommandExchange::new(format!("su {}", self.su_password))
            .end(PROMPT)
            .settle(self.timing.elevation_settle)
            .timeout(self.timing.exchange_timeout)
    }

    /// Read the complete current configuration.
    ///
    /// The listing is requested repeatedly until it comes back non-empty;
    /// a freshly booted sensor needs a few seconds before it answers.
    pub fn settings(&mut self) -> Result<SettingsSnapshot> {
        let exchange = CommandExchange::new(SETTINGS_COMMAND)
            .start(SETTINGS_START_TOKEN)
            .end(PROMPT)
            .settle(self.timing.settings_settle)
            .timeout(self.timing.exchange_timeout);

        let policy = self.timing.settings_retry;
        let lines = policy
            .run(|_| {
                let reply = self.exchange(&exchange)?;
                Ok((!reply.is_empty()).then(|| reply.into_lines()))
            })?
            .ok_or_else(|| Error::ProtocolTimeout {
                command: SETTINGS_COMMAND.to_string(),
                attempts: policy.max_attempts.max(1),
            })?;

        let snapshot = SettingsSnapshot::from_lines(&lines);
        info!(
            "Read {} parameters in {} groups",
            snapshot.len(),
            snapshot.groups().count()
        );
        Ok(snapshot)
    }

    /// Read one parameter.
    pub fn get(&mut self, group: &str, parameter: &str) -> Result<String> {
        Ok(self.settings()?.get(group, parameter)?.to_string())
    }

    /// Write one parameter.
    ///
    /// With `superuser`, every write attempt is immediately preceded by the
    /// elevation command on the same connection. The write is repeated
    /// until the device either acknowledges or rejects it.
    pub fn set(&mut self, group: &str, parameter: &str, value: &str, superuser: bool) -> Result<()> {
        info!("Setting {group}.{parameter} to '{value}'");
        let elevation = superuser.then(|| self.elevation());

        let exchange = CommandExchange::new(format!("settings set {group} {parameter} {value}"))
            .start(STORED_TOKEN)
            .error(ILLEGAL_VALUE_TOKEN)
            .settle(self.timing.command_settle)
            .timeout(self.timing.exchange_timeout);

        let policy = self.timing.write_retry;
        let reply = policy
            .run(|_| {
                let reply = self.exchange_elevated(&exchange, elevation.as_ref())?;
                Ok((!reply.is_empty()).then_some(reply))
            })?
            .ok_or_else(|| Error::ProtocolTimeout {
                command: exchange.command.clone(),
                attempts: policy.max_attempts.max(1),
            })?;

        match reply {
            Reply::Rejected(line) => {
                warn!("{group}.{parameter} = '{value}' rejected: {line}");
                Err(Error::IllegalValue {
                    group: group.to_string(),
                    parameter: parameter.to_string(),
                    value: value.to_string(),
                })
            },
            Reply::Complete(_) | Reply::TimedOut(_) => Ok(()),
        }
    }

    /// Read the metadata of one parameter.
    pub fn info(&mut self, group: &str, parameter: &str) -> Result<ParameterInfo> {
        let exchange = CommandExchange::new(format!("settings info {group} {parameter}"))
            .end(PROMPT)
            .error(UNKNOWN_SETTING_TOKEN)
            .settle(self.timing.info_settle)
            .timeout(self.timing.exchange_timeout);

        match self.exchange(&exchange)? {
            Reply::Rejected(_) => Err(Error::UnknownParameter {
                group: group.to_string(),
                parameter: parameter.to_string(),
            }),
            reply => Ok(ParameterInfo::from_lines(reply.lines())),
        }
    }

    /// Snapshot every parameter, optionally with its metadata.
    pub fn capture(
        &mut self,
        with_info: bool,
    ) -> Result<BTreeMap<String, BTreeMap<String, CapturedParameter>>> {
        let snapshot = self.settings()?;
        let mut captured: BTreeMap<String, BTreeMap<String, CapturedParameter>> = BTreeMap::new();

        for (group, parameter, value) in snapshot.iter() {
            let info = if with_info {
                Some(self.info(group, parameter)?)
            } else {
                None
            };
            captured.entry(group.to_string()).or_default().insert(
                parameter.to_string(),
                CapturedParameter {
                    value: value.to_string(),
                    info,
                },
            );
        }
        Ok(captured)
    }

    /// Restart the sensor. The connection is dropped since the USB console
    /// re-enumerates during boot.
    pub fn reboot(&mut self) -> Result<()> {
        info!("Rebooting sensor");
        let port = self.transport.reconnect()?.port_mut();
        let result = protocol::send_line(port, "reboot", self.timing.command_settle);
        self.transport.disconnect();
        result
    }

    /// Bring the device in line with `desired`.
    pub fn apply(
        &mut self,
        desired: &DesiredConfiguration,
        policy: &ParameterPolicy,
    ) -> Result<SyncReport> {
        sync::apply(self, desired, policy)
    }
}

impl<B: SerialBackend> ConfigurableDevice for Ps280<B> {
    fn fetch_snapshot(&mut self) -> Result<SettingsSnapshot> {
        self.settings()
    }

    fn write(&mut self, group: &str, parameter: &str, value: &str, superuser: bool) -> Result<()> {
        self.set(group, parameter, value, superuser)
    }
}
