//! Configuration synchronization.
//!
//! [`plan`] compares a desired configuration with a device snapshot without
//! touching the device. [`apply`] executes the plan: every write is
//! followed by a fresh read, and the outcome of each parameter is recorded
//! in a [`SyncReport`].

use std::collections::BTreeSet;
use std::fmt;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::sensor::ConfigurableDevice;
use crate::settings::{DesiredConfiguration, ParameterKey, SettingsSnapshot};

/// Which parameters are never written, and which need elevation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterPolicy {
    ignored: BTreeSet<String>,
    superuser: BTreeSet<String>,
}

impl ParameterPolicy {
    /// An empty policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `GROUP.PARAMETER` keys that must never be written.
    #[must_use]
    pub fn with_ignored<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Add `GROUP.PARAMETER` keys that need superuser elevation.
    #[must_use]
    pub fn with_superuser<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.superuser.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Whether `key` is on the ignore list.
    pub fn is_ignored(&self, key: &ParameterKey) -> bool {
        self.ignored.contains(&key.to_string())
    }

    /// Whether `key` needs elevation.
    pub fn requires_superuser(&self, key: &ParameterKey) -> bool {
        self.superuser.contains(&key.to_string())
    }
}

/// Why a parameter was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum SkipReason {
    /// On the ignore list.
    Ignored,
    /// Not present on the device.
    Unsupported,
}

/// Why a parameter could not be brought in line.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case", tag = "kind")
)]
pub enum FailReason {
    /// The value read back after the write differs from the one written.
    Mismatch {
        /// Value that was written.
        expected: String,
        /// Value read back.
        actual: String,
    },
    /// The write or the verification read failed.
    Protocol {
        /// Error description.
        message: String,
    },
}

/// Result for one desired parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case", tag = "status")
)]
pub enum Outcome {
    /// Written and verified.
    Applied {
        /// Value now on the device.
        value: String,
    },
    /// Already had the desired value.
    Unchanged,
    /// Not written.
    Skipped {
        /// Why.
        reason: SkipReason,
    },
    /// Written but not verified.
    Failed {
        /// Why.
        reason: FailReason,
    },
}

impl Outcome {
    /// Whether this outcome counts against overall success.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied { value } => write!(f, "applied ({value})"),
            Self::Unchanged => f.write_str("unchanged"),
            Self::Skipped { reason: SkipReason::Ignored } => f.write_str("skipped (ignored)"),
            Self::Skipped { reason: SkipReason::Unsupported } => {
                f.write_str("skipped (not supported by device)")
            },
            Self::Failed {
                reason: FailReason::Mismatch { expected, actual },
            } => write!(f, "failed (wrote '{expected}', device reports '{actual}')"),
            Self::Failed {
                reason: FailReason::Protocol { message },
            } => write!(f, "failed ({message})"),
        }
    }
}

/// What [`apply`] will do for one parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    /// Leave alone.
    Skip(SkipReason),
    /// Device already matches.
    Unchanged,
    /// Write `value`, elevating first if `superuser`.
    Write {
        /// Value rendered in the device's native form.
        value: String,
        /// Whether elevation is needed.
        superuser: bool,
    },
}

/// One step of a synchronization plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChange {
    /// Target parameter.
    pub key: ParameterKey,
    /// Current device value, if the device has the parameter.
    pub current: Option<String>,
    /// Planned action.
    pub action: PlannedAction,
}

/// Compute the actions needed to bring `baseline` to `desired`.
///
/// Steps follow the desired configuration's order. Ignored keys are
/// checked before anything else, so they are never compared or written.
pub fn plan(
    desired: &DesiredConfiguration,
    baseline: &SettingsSnapshot,
    policy: &ParameterPolicy,
) -> Vec<PlannedChange> {
    desired
        .iter()
        .map(|(key, value)| {
            let current = baseline.get(&key.group, &key.parameter).ok();
            let action = if policy.is_ignored(&key) {
                PlannedAction::Skip(SkipReason::Ignored)
            } else if let Some(current) = current {
                let rendered = value.render_for(current);
                if rendered == current {
                    PlannedAction::Unchanged
                } else {
                    PlannedAction::Write {
                        value: rendered,
                        superuser: policy.requires_superuser(&key),
                    }
                }
            } else {
                PlannedAction::Skip(SkipReason::Unsupported)
            };
            PlannedChange {
                current: current.map(str::to_string),
                key,
                action,
            }
        })
        .collect()
}

/// Outcome for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct KeyOutcome {
    /// Target parameter.
    #[cfg_attr(feature = "serde", serde(serialize_with = "serialize_key"))]
    pub key: ParameterKey,
    /// What happened.
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub outcome: Outcome,
}

#[cfg(feature = "serde")]
fn serialize_key<S: serde::Serializer>(
    key: &ParameterKey,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(key)
}

/// Per-key outcomes of one synchronization run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SyncReport {
    /// Outcomes in processing order.
    pub entries: Vec<KeyOutcome>,
    /// Whether the run stopped early on request.
    pub interrupted: bool,
}

impl SyncReport {
    /// True iff the run completed and no key failed.
    pub fn is_success(&self) -> bool {
        !self.interrupted && !self.entries.iter().any(|e| e.outcome.is_failure())
    }

    /// Look up the outcome for one key.
    pub fn outcome(&self, key: &ParameterKey) -> Option<&Outcome> {
        self.entries
            .iter()
            .find(|e| &e.key == key)
            .map(|e| &e.outcome)
    }

    /// Count outcomes matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Outcome) -> bool) -> usize {
        self.entries.iter().filter(|e| predicate(&e.outcome)).count()
    }

    fn push(&mut self, key: ParameterKey, outcome: Outcome) {
        self.entries.push(KeyOutcome { key, outcome });
    }
}

fn write_and_verify<D: ConfigurableDevice + ?Sized>(
    device: &mut D,
    key: &ParameterKey,
    value: &str,
    superuser: bool,
) -> Outcome {
    match device.write(&key.group, &key.parameter, value, superuser) {
        Ok(()) | Err(Error::IllegalValue { .. }) => {},
        Err(e) => {
            return Outcome::Failed {
                reason: FailReason::Protocol {
                    message: e.to_string(),
                },
            };
        },
    }

    let actual = device
        .fetch_snapshot()
        .and_then(|snapshot| snapshot.get(&key.group, &key.parameter).map(str::to_string));
    match actual {
        Ok(actual) if actual == value => {
            info!("{key} = '{value}' verified");
            Outcome::Applied { value: actual }
        },
        Ok(actual) => {
            warn!("{key}: wrote '{value}' but device reports '{actual}'");
            Outcome::Failed {
                reason: FailReason::Mismatch {
                    expected: value.to_string(),
                    actual,
                },
            }
        },
        Err(e) => Outcome::Failed {
            reason: FailReason::Protocol {
                message: e.to_string(),
            },
        },
    }
}

/// Bring `device` in line with `desired`.
///
/// A fresh snapshot is taken first; failing to read it is the only error.
/// Keys are then processed one at a time in desired order. A rejected write
/// is not an error: the read-back decides the outcome. Cancellation is
/// honored between keys and marks the report as interrupted.
pub fn apply<D: ConfigurableDevice + ?Sized>(
    device: &mut D,
    desired: &DesiredConfiguration,
    policy: &ParameterPolicy,
) -> Result<SyncReport> {
    let baseline = device.fetch_snapshot()?;
    let mut report = SyncReport::default();

    for change in plan(desired, &baseline, policy) {
        if crate::is_interrupted_requested() {
            warn!("Synchronization interrupted before {}", change.key);
            report.interrupted = true;
            break;
        }

        let outcome = match change.action {
            PlannedAction::Skip(reason) => Outcome::Skipped { reason },
            PlannedAction::Unchanged => Outcome::Unchanged,
            PlannedAction::Write { value, superuser } => {
                write_and_verify(device, &change.key, &value, superuser)
            },
        };
        report.push(change.key, outcome);
    }

    info!(
        "Synchronization finished: {} applied, {} unchanged, {} skipped, {} failed",
        report.count(|o| matches!(o, Outcome::Applied { .. })),
        report.count(|o| matches!(o, Outcome::Unchanged)),
        report.count(|o| matches!(o, Outcome::Skipped { .. })),
        report.count(Outcome::is_failure),
    );
    Ok(report)
}
