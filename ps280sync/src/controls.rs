//! Typed helpers for frequently changed parameters.
//!
//! These wrap [`ConfigurableDevice::write`] with the parameter addresses and
//! value formats the PS-280 firmware uses, so callers do not have to know
//! them.

use log::info;

use crate::error::{Error, Result};
use crate::sensor::ConfigurableDevice;

/// A boolean parameter stored as `0`/`1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    /// Parameter group.
    pub group: &'static str,
    /// Parameter name.
    pub parameter: &'static str,
}

/// Beep on boot.
pub const BOOT_AURAL_SIGNAL: Switch = Switch::new("SIG", "BOOT_AUR");
/// LED on registration.
pub const REGISTRATION_VISUAL_SIGNAL: Switch = Switch::new("SIG", "REG_VIS");
/// LED on boot.
pub const BOOT_VISUAL_SIGNAL: Switch = Switch::new("SIG", "BOOT_VIS");

impl Switch {
    /// Address a switch.
    pub const fn new(group: &'static str, parameter: &'static str) -> Self {
        Self { group, parameter }
    }

    /// Turn on.
    pub fn on<D: ConfigurableDevice + ?Sized>(&self, device: &mut D) -> Result<()> {
        self.set(device, true)
    }

    /// Turn off.
    pub fn off<D: ConfigurableDevice + ?Sized>(&self, device: &mut D) -> Result<()> {
        self.set(device, false)
    }

    /// Set explicitly.
    pub fn set<D: ConfigurableDevice + ?Sized>(&self, device: &mut D, enabled: bool) -> Result<()> {
        device.write(self.group, self.parameter, if enabled { "1" } else { "0" }, false)
    }
}

/// A low/high warning threshold pair with hard bounds and an optional
/// enable flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarningThreshold {
    /// Parameter group.
    pub group: &'static str,
    /// Low threshold parameter.
    pub low: &'static str,
    /// High threshold parameter.
    pub high: &'static str,
    /// Enable flag parameter, if the warning can be toggled.
    pub enable: Option<&'static str>,
    /// Smallest accepted threshold.
    pub lowest: i32,
    /// Largest accepted threshold.
    pub highest: i32,
}

/// CO2 warning (ppm).
pub const CO2_WARNING: WarningThreshold = WarningThreshold {
    group: "THRESH",
    low: "SUNRISE_CO2_LO",
    high: "SUNRISE_CO2_HI",
    enable: None,
    lowest: 0,
    highest: 1000,
};

/// Relative humidity warning (%).
pub const HUMIDITY_WARNING: WarningThreshold = WarningThreshold {
    group: "THRESH",
    low: "AHT_HUM_LO",
    high: "AHT_HUM_HI",
    enable: Some("AHT_HUM_ENA"),
    lowest: -100,
    highest: 200,
};

/// Temperature warning (°C).
pub const TEMPERATURE_WARNING: WarningThreshold = WarningThreshold {
    group: "THRESH",
    low: "AHT_TEM_LO",
    high: "AHT_TEM_HI",
    enable: Some("AHT_TEM_ENA"),
    lowest: -100,
    highest: 100,
};

impl WarningThreshold {
    fn check(&self, name: &str, value: i32) -> Result<()> {
        if (self.lowest..=self.highest).contains(&value) {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "{}.{name} must be within {}..={}, got {value}",
                self.group, self.lowest, self.highest
            )))
        }
    }

    /// Enable the warning and set whichever thresholds are given.
    pub fn on<D: ConfigurableDevice + ?Sized>(
        &self,
        device: &mut D,
        low: Option<i32>,
        high: Option<i32>,
    ) -> Result<()> {
        if let Some(low) = low {
            self.check(self.low, low)?;
        }
        if let Some(high) = high {
            self.check(self.high, high)?;
        }

        if let Some(enable) = self.enable {
            device.write(self.group, enable, "1", false)?;
        }
        if let Some(low) = low {
            device.write(self.group, self.low, &low.to_string(), false)?;
        }
        if let Some(high) = high {
            device.write(self.group, self.high, &high.to_string(), false)?;
        }
        Ok(())
    }

    /// Open the thresholds to their bounds and disable the warning.
    pub fn off<D: ConfigurableDevice + ?Sized>(&self, device: &mut D) -> Result<()> {
        device.write(self.group, self.low, &self.lowest.to_string(), false)?;
        device.write(self.group, self.high, &self.highest.to_string(), false)?;
        if let Some(enable) = self.enable {
            device.write(self.group, enable, "0", false)?;
        }
        Ok(())
    }
}

/// Set the device serial number (superuser).
pub fn set_serial<D: ConfigurableDevice + ?Sized>(device: &mut D, serial: &str) -> Result<()> {
    device.write("CORE", "SERIAL", serial, true)
}

/// Set the measuring interval in seconds.
pub fn set_measuring_interval<D: ConfigurableDevice + ?Sized>(
    device: &mut D,
    seconds: u32,
) -> Result<()> {
    device.write("CORE", "MSI", &seconds.to_string(), false)
}

/// Set how many measurements are collected per transmission.
pub fn set_measurements_per_send<D: ConfigurableDevice + ?Sized>(
    device: &mut D,
    count: u32,
) -> Result<()> {
    device.write("CORE", "MSC", &count.to_string(), false)
}

/// Set the MQTT uplink topic; the downlink topic is derived from it.
pub fn set_topic<D: ConfigurableDevice + ?Sized>(device: &mut D, topic: &str) -> Result<()> {
    device.write("MQTT", "TOPIC_UP", topic, false)?;
    device.write("MQTT", "TOPIC_DOWN", &format!("{topic}/dl"), false)
}

/// Hub and MQTT connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    /// Broker address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client identifier.
    pub client_id: String,
    /// Uplink topic; the downlink topic is `<topic>/dl`.
    pub topic: String,
    /// Username, if the broker needs one.
    pub user: Option<String>,
    /// Password, if the broker needs one.
    pub password: Option<String>,
    /// Connection lifetime in seconds.
    pub lifetime: u32,
    /// MQTT operation timeout in seconds.
    pub timeout: u32,
    /// Publish retries.
    pub max_retry: u32,
    /// Quality of service level.
    pub qos: u8,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            client_id: String::new(),
            topic: String::new(),
            user: None,
            password: None,
            lifetime: 300,
            timeout: 15,
            max_retry: 4,
            qos: 1,
        }
    }
}

impl MqttSettings {
    /// Every `(group, parameter, value)` write needed to switch the hub to
    /// this broker, in the order they are sent.
    pub fn writes(&self) -> Vec<(&'static str, &'static str, String)> {
        let mut writes = vec![
            ("HUB", "TYPE", "mqtt".to_string()),
            ("HUB", "TSYNC_WAIT", "1".to_string()),
            ("HUB", "T_RETRY_MODE", "1".to_string()),
            ("HUB", "T_RETRY", "60".to_string()),
            ("HUB", "T_RETRY_MAX", "43200".to_string()),
            ("HUB", "LIFETIME", self.lifetime.to_string()),
            ("HUB", "PROTOCOL", "tcp".to_string()),
            ("HUB", "REMOTE_IP", self.host.clone()),
            ("HUB", "REMOTE_PORT", self.port.to_string()),
        ];
        if let Some(user) = &self.user {
            writes.push(("MQTT", "USER", user.clone()));
        }
        if let Some(password) = &self.password {
            writes.push(("MQTT", "PW", password.clone()));
        }
        writes.extend([
            ("MQTT", "TIMEOUT", self.timeout.to_string()),
            ("MQTT", "MAX_RETRY", self.max_retry.to_string()),
            ("MQTT", "QOS", self.qos.to_string()),
            ("MQTT", "CLIENT_ID", self.client_id.clone()),
            ("MQTT", "TOPIC_UP", self.topic.clone()),
            ("MQTT", "TOPIC_DOWN", format!("{}/dl", self.topic)),
        ]);
        writes
    }

    /// Send every write to the device.
    pub fn apply<D: ConfigurableDevice + ?Sized>(&self, device: &mut D) -> Result<()> {
        info!("Configuring MQTT broker {}:{}", self.host, self.port);
        for (group, parameter, value) in self.writes() {
            device.write(group, parameter, &value, false)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsSnapshot;

    #[derive(Default)]
    struct Recorder {
        writes: Vec<(String, String, String, bool)>,
    }

    impl ConfigurableDevice for Recorder {
        fn fetch_snapshot(&mut self) -> Result<SettingsSnapshot> {
            Ok(SettingsSnapshot::default())
        }

        fn write(&mut self, group: &str, parameter: &str, value: &str, superuser: bool) -> Result<()> {
            self.writes
                .push((group.into(), parameter.into(), value.into(), superuser));
            Ok(())
        }
    }

    impl Recorder {
        fn keys(&self) -> Vec<String> {
            self.writes
                .iter()
                .map(|(g, p, v, _)| format!("{g}.{p}={v}"))
                .collect()
        }
    }

    #[test]
    fn test_switch() {
        let mut device = Recorder::default();
        BOOT_AURAL_SIGNAL.on(&mut device).unwrap();
        BOOT_VISUAL_SIGNAL.off(&mut device).unwrap();
        assert_eq!(device.keys(), ["SIG.BOOT_AUR=1", "SIG.BOOT_VIS=0"]);
    }

    #[test]
    fn test_warning_on_enables_then_sets_thresholds() {
        let mut device = Recorder::default();
        HUMIDITY_WARNING.on(&mut device, Some(20), Some(80)).unwrap();
        assert_eq!(
            device.keys(),
            ["THRESH.AHT_HUM_ENA=1", "THRESH.AHT_HUM_LO=20", "THRESH.AHT_HUM_HI=80"]
        );
    }

    #[test]
    fn test_warning_rejects_out_of_range_before_writing() {
        let mut device = Recorder::default();
        let result = CO2_WARNING.on(&mut device, Some(100), Some(5000));
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(device.writes.is_empty());
    }

    #[test]
    fn test_warning_off_resets_bounds() {
        let mut device = Recorder::default();
        TEMPERATURE_WARNING.off(&mut device).unwrap();
        assert_eq!(
            device.keys(),
            ["THRESH.AHT_TEM_LO=-100", "THRESH.AHT_TEM_HI=100", "THRESH.AHT_TEM_ENA=0"]
        );

        let mut device = Recorder::default();
        CO2_WARNING.off(&mut device).unwrap();
        assert_eq!(device.keys(), ["THRESH.SUNRISE_CO2_LO=0", "THRESH.SUNRISE_CO2_HI=1000"]);
    }

    #[test]
    fn test_serial_needs_superuser() {
        let mut device = Recorder::default();
        set_serial(&mut device, "PS280-0042").unwrap();
        set_measuring_interval(&mut device, 300).unwrap();
        assert!(device.writes[0].3);
        assert!(!device.writes[1].3);
    }

    #[test]
    fn test_topic_derives_downlink() {
        let mut device = Recorder::default();
        set_topic(&mut device, "site/ps280").unwrap();
        assert_eq!(
            device.keys(),
            ["MQTT.TOPIC_UP=site/ps280", "MQTT.TOPIC_DOWN=site/ps280/dl"]
        );
    }

    #[test]
    fn test_mqtt_writes() {
        let settings = MqttSettings {
            host: "10.0.0.5".into(),
            client_id: "ps280-1".into(),
            topic: "sensors/1".into(),
            user: Some("alice".into()),
            ..Default::default()
        };
        let mut device = Recorder::default();
        settings.apply(&mut device).unwrap();

        let keys = device.keys();
        assert_eq!(keys[0], "HUB.TYPE=mqtt");
        assert!(keys.contains(&"HUB.REMOTE_IP=10.0.0.5".to_string()));
        assert!(keys.contains(&"HUB.REMOTE_PORT=1883".to_string()));
        assert!(keys.contains(&"MQTT.USER=alice".to_string()));
        assert!(!keys.iter().any(|k| k.starts_with("MQTT.PW=")));
        assert_eq!(keys.last().unwrap(), "MQTT.TOPIC_DOWN=sensors/1/dl");
    }
}
