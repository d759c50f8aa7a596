//! Settings model.
//!
//! The device reports its configuration as a table of
//! `GROUP PARAMETER VALUE` lines. This module turns those lines into a
//! [`SettingsSnapshot`], parses per-parameter metadata, and renders desired
//! values in the device's own textual form.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use log::trace;

use crate::error::{Error, Result};

/// A `GROUP.PARAMETER` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterKey {
    /// Parameter group (e.g. `CORE`).
    pub group: String,
    /// Parameter name within the group (e.g. `MSI`).
    pub parameter: String,
}

impl ParameterKey {
    /// Create a key.
    pub fn new(group: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            parameter: parameter.into(),
        }
    }
}

impl fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.parameter)
    }
}

impl FromStr for ParameterKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().split_once('.') {
            Some((group, parameter))
                if !group.is_empty() && !parameter.is_empty() && !parameter.contains('.') =>
            {
                Ok(Self::new(group, parameter))
            },
            _ => Err(Error::InvalidKey(s.to_string())),
        }
    }
}

/// Parse one line of the settings listing.
///
/// The first token must be purely alphanumeric (the group), the second is the
/// parameter name and, when more tokens follow, the last one is the value.
/// A parameter without a value maps to the empty string. Anything else
/// (headers, prompts, separators) yields `None`.
pub fn parse_settings_line(line: &str) -> Option<(String, String, String)> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let [group, parameter, rest @ ..] = tokens.as_slice() else {
        return None;
    };
    if !group.chars().all(char::is_alphanumeric) {
        return None;
    }
    let value = rest.last().copied().unwrap_or_default();
    Some(((*group).to_string(), (*parameter).to_string(), value.to_string()))
}

/// Current device configuration, grouped by parameter group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(transparent)
)]
pub struct SettingsSnapshot {
    groups: BTreeMap<String, BTreeMap<String, String>>,
}

impl SettingsSnapshot {
    /// Build a snapshot from the lines of a settings listing.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut snapshot = Self::default();
        for line in lines {
            match parse_settings_line(line.as_ref()) {
                Some((group, parameter, value)) => snapshot.insert(group, parameter, value),
                None => trace!("Skipping settings line '{}'", line.as_ref()),
            }
        }
        snapshot
    }

    /// Insert or replace one value.
    pub fn insert(
        &mut self,
        group: impl Into<String>,
        parameter: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.groups
            .entry(group.into())
            .or_default()
            .insert(parameter.into(), value.into());
    }

    /// Look up a value.
    pub fn get(&self, group: &str, parameter: &str) -> Result<&str> {
        self.groups
            .get(group)
            .and_then(|params| params.get(parameter))
            .map(String::as_str)
            .ok_or_else(|| Error::UnknownParameter {
                group: group.to_string(),
                parameter: parameter.to_string(),
            })
    }

    /// Whether the parameter exists.
    pub fn contains(&self, group: &str, parameter: &str) -> bool {
        self.get(group, parameter).is_ok()
    }

    /// Parameters of one group.
    pub fn group(&self, group: &str) -> Option<&BTreeMap<String, String>> {
        self.groups.get(group)
    }

    /// All groups, in name order.
    pub fn groups(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, String>)> {
        self.groups.iter().map(|(name, params)| (name.as_str(), params))
    }

    /// Every `(group, parameter, value)` triple, in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.groups.iter().flat_map(|(group, params)| {
            params
                .iter()
                .map(move |(param, value)| (group.as_str(), param.as_str(), value.as_str()))
        })
    }

    /// Total number of parameters.
    pub fn len(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }

    /// Whether the snapshot holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Descriptive metadata for one parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParameterInfo {
    /// One-line description (`Info:`).
    pub short_description: String,
    /// Lower bound (`Min. value:`).
    pub min: String,
    /// Upper bound (`Max. value:`).
    pub max: String,
    /// Enumerated values (`Allowed:`), empty when unrestricted.
    pub allowed_values: Vec<String>,
}

impl ParameterInfo {
    /// Parse the reply to a parameter-info request.
    ///
    /// Lines without a recognized prefix are ignored; missing prefixes leave
    /// their field empty.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut info = Self::default();
        for line in lines {
            let line = line.as_ref().trim();
            if let Some(rest) = line.strip_prefix("Info:") {
                info.short_description = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("Min. value:") {
                info.min = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("Max. value:") {
                info.max = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("Allowed:") {
                info.allowed_values = rest
                    .trim()
                    .trim_start_matches('{')
                    .trim_end_matches('}')
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect();
            }
        }
        info
    }
}

/// A captured parameter value, optionally with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CapturedParameter {
    /// Current value.
    pub value: String,
    /// Metadata, when requested.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub info: Option<ParameterInfo>,
}

/// The native type of a device value, inferred from its textual form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// `true`/`false` or `0`/`1`.
    Boolean,
    /// Any other integer.
    Integer,
    /// Everything else.
    Text,
}

impl ValueKind {
    /// Infer the kind of a baseline value.
    ///
    /// `"0"` and `"1"` are classified as booleans even when the parameter is
    /// numeric; desired values for such parameters are rendered as `0`/`1`.
    pub fn infer(baseline: &str) -> Self {
        let trimmed = baseline.trim();
        if trimmed == "0"
            || trimmed == "1"
            || trimmed.eq_ignore_ascii_case("true")
            || trimmed.eq_ignore_ascii_case("false")
        {
            Self::Boolean
        } else if trimmed.parse::<i64>().is_ok() {
            Self::Integer
        } else {
            Self::Text
        }
    }
}

/// A desired parameter value as written in a configuration file.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(untagged)
)]
pub enum DesiredValue {
    /// Boolean.
    Boolean(bool),
    /// Integer.
    Integer(i64),
    /// Floating point.
    Float(f64),
    /// String.
    Text(String),
    /// List of values.
    List(Vec<DesiredValue>),
}

impl DesiredValue {
    /// Only `1`, `true` and `yes` are true, whatever the value's type.
    fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            Self::Integer(i) => Some(*i == 1),
            #[allow(clippy::float_cmp)]
            Self::Float(f) => Some(*f == 1.0),
            Self::Text(s) => Some(matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "true" | "1" | "yes"
            )),
            Self::List(_) => None,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Boolean(b) => Some(i64::from(*b)),
            Self::Integer(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Float(_) | Self::List(_) => None,
        }
    }

    /// Render this value in the native form of `baseline`.
    ///
    /// Booleans follow the baseline's spelling (`0`/`1` or `false`/`true`).
    /// Values that cannot be coerced fall back to their plain text form.
    pub fn render_for(&self, baseline: &str) -> String {
        match ValueKind::infer(baseline) {
            ValueKind::Boolean => match self.as_bool() {
                Some(value) if baseline.trim().len() == 1 => {
                    String::from(if value { "1" } else { "0" })
                },
                Some(value) => value.to_string(),
                None => self.to_string(),
            },
            ValueKind::Integer => self
                .as_integer()
                .map_or_else(|| self.to_string(), |value| value.to_string()),
            ValueKind::Text => self.to_string(),
        }
    }
}

impl fmt::Display for DesiredValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            },
        }
    }
}

impl From<&str> for DesiredValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Desired configuration: group -> parameter -> value.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(transparent)
)]
pub struct DesiredConfiguration {
    groups: BTreeMap<String, BTreeMap<String, DesiredValue>>,
}

impl DesiredConfiguration {
    /// Add or replace one desired value.
    pub fn insert(
        &mut self,
        group: impl Into<String>,
        parameter: impl Into<String>,
        value: DesiredValue,
    ) {
        self.groups
            .entry(group.into())
            .or_default()
            .insert(parameter.into(), value);
    }

    /// Every desired value in group, then parameter, order.
    pub fn iter(&self) -> impl Iterator<Item = (ParameterKey, &DesiredValue)> {
        self.groups.iter().flat_map(|(group, params)| {
            params
                .iter()
                .map(move |(param, value)| (ParameterKey::new(group.as_str(), param.as_str()), value))
        })
    }

    /// Look up one desired value.
    pub fn get(&self, group: &str, parameter: &str) -> Option<&DesiredValue> {
        self.groups.get(group).and_then(|params| params.get(parameter))
    }

    /// Number of desired values.
    pub fn len(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }

    /// Whether nothing is desired.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&SettingsSnapshot> for DesiredConfiguration {
    fn from(snapshot: &SettingsSnapshot) -> Self {
        let mut desired = Self::default();
        for (group, parameter, value) in snapshot.iter() {
            desired.insert(group, parameter, DesiredValue::from(value));
        }
        desired
    }
}
