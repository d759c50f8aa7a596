//! Candidate port classification.
//!
//! Discovery only considers serial ports whose USB `vendor:product`
//! identifier appears in an allow-list. The default allow-list covers the
//! ESP32-S3 native USB console of the PS-280 and the USB-UART bridges found
//! on development boards.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::port::PortInfo;

/// A USB `vendor:product` identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UsbId {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbId {
    /// Create a new identifier.
    pub const fn new(vid: u16, pid: u16) -> Self {
        Self { vid, pid }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vid, self.pid)
    }
}

impl FromStr for UsbId {
    type Err = Error;

    /// Parse `"303a:1001"` (hex, optional `0x` prefixes).
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("invalid USB id '{s}' (expected VID:PID in hex)"));
        let (vid, pid) = s.trim().split_once(':').ok_or_else(invalid)?;
        let parse = |part: &str| {
            let part = part.trim();
            let part = part
                .strip_prefix("0x")
                .or_else(|| part.strip_prefix("0X"))
                .unwrap_or(part);
            u16::from_str_radix(part, 16).map_err(|_| invalid())
        };
        Ok(Self::new(parse(vid)?, parse(pid)?))
    }
}

/// Known USB devices a PS-280 console shows up as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// ESP32-S3 built-in USB-Serial/JTAG.
    EspressifUsb,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// WCH CH340/CH9102 USB-to-Serial converter.
    Ch340,
    /// FTDI FT232 USB-to-Serial converter.
    Ftdi,
    /// Unknown device.
    Unknown,
}

const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (0x303A, &[0x1001, 0x0002], DeviceKind::EspressifUsb),
    (0x10C4, &[0xEA60], DeviceKind::Cp210x),
    (0x1A86, &[0x7523, 0x55D4], DeviceKind::Ch340),
    (0x0403, &[0x6001, 0x6015], DeviceKind::Ftdi),
];

impl DeviceKind {
    /// Classify a VID/PID combination.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && pids.contains(&pid))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Get a human-readable name for the device kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::EspressifUsb => "ESP32-S3 USB",
            Self::Cp210x => "CP210x",
            Self::Ch340 => "CH340/CH9102",
            Self::Ftdi => "FTDI",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known device kind.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// The default discovery allow-list: every known VID/PID pair.
pub fn default_allow_list() -> Vec<UsbId> {
    KNOWN_USB_DEVICES
        .iter()
        .flat_map(|(vid, pids, _)| pids.iter().map(|pid| UsbId::new(*vid, *pid)))
        .collect()
}

/// A system serial port considered during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePort {
    /// Port name/path (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// USB identifier, if the port is a USB device.
    pub usb: Option<UsbId>,
    /// Classified device kind.
    pub device: DeviceKind,
    /// Product string (if available).
    pub product: Option<String>,
}

impl From<PortInfo> for CandidatePort {
    fn from(info: PortInfo) -> Self {
        let usb = info.vid.zip(info.pid).map(|(vid, pid)| UsbId::new(vid, pid));
        Self {
            name: info.name,
            device: usb.map_or(DeviceKind::Unknown, |id| DeviceKind::from_vid_pid(id.vid, id.pid)),
            usb,
            product: info.product,
        }
    }
}

impl CandidatePort {
    /// Whether the port's USB identifier is on the allow-list.
    pub fn is_allowed(&self, allow_list: &[UsbId]) -> bool {
        self.usb.is_some_and(|id| allow_list.contains(&id))
    }
}

/// Keep only the ports whose USB identifier is on the allow-list.
pub fn filter_candidates(ports: Vec<PortInfo>, allow_list: &[UsbId]) -> Vec<CandidatePort> {
    ports
        .into_iter()
        .map(CandidatePort::from)
        .filter(|c| c.is_allowed(allow_list))
        .collect()
}

/// List every system serial port, classified.
#[cfg(feature = "native")]
pub fn list_candidate_ports() -> Result<Vec<CandidatePort>> {
    use crate::port::{NativePortEnumerator, PortEnumerator};

    Ok(NativePortEnumerator::list_ports()?
        .into_iter()
        .map(CandidatePort::from)
        .collect())
}

/// Format a list of ports for display.
pub fn format_port_list(ports: &[CandidatePort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = match (port.device.is_known(), port.usb) {
                (true, _) => format!(" [{}]", port.device.name()),
                (false, Some(id)) => format!(" [{id}]"),
                (false, None) => String::new(),
            };
            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();
            format!("{}{}{}", port.name, device_info, product_info)
        })
        .collect()
}
