//! Per-device outcomes and the batch result accumulated over a run.

use std::fmt;

use indexmap::IndexMap;

use crate::error::SessionError;
use crate::rules::OperationKind;

/// Outcome of one operation on one device.
#[derive(Debug)]
pub enum DeviceOutcome {
    Success,
    Skipped(String),
    Failed(SessionError),
}

impl DeviceOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeviceOutcome::Success)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, DeviceOutcome::Failed(_))
    }
}

impl fmt::Display for DeviceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceOutcome::Success => write!(f, "success"),
            DeviceOutcome::Skipped(reason) => write!(f, "skipped ({reason})"),
            DeviceOutcome::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Outcomes of one operation, in device order.
pub type Outcomes = Vec<(String, DeviceOutcome)>;

/// Results of a run, keyed by device name.
///
/// Entries are only ever appended: one per device per operation, in the
/// order operations ran.
#[derive(Debug, Default)]
pub struct BatchResult {
    devices: IndexMap<String, Vec<(OperationKind, DeviceOutcome)>>,
}

impl BatchResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one outcome.
    pub fn record(&mut self, device: impl Into<String>, kind: OperationKind, outcome: DeviceOutcome) {
        self.devices
            .entry(device.into())
            .or_default()
            .push((kind, outcome));
    }

    /// Append the outcomes of a whole operation.
    pub fn record_all(&mut self, kind: OperationKind, outcomes: Outcomes) {
        for (device, outcome) in outcomes {
            self.record(device, kind, outcome);
        }
    }

    /// Outcome of an operation on a device.
    pub fn outcome(&self, device: &str, kind: OperationKind) -> Option<&DeviceOutcome> {
        self.outcomes(device)
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, outcome)| outcome)
    }

    /// All outcomes for a device, in operation order.
    pub fn outcomes(&self, device: &str) -> &[(OperationKind, DeviceOutcome)] {
        self.devices.get(device).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[(OperationKind, DeviceOutcome)])> {
        self.devices.iter().map(|(name, outcomes)| (name.as_str(), outcomes.as_slice()))
    }

    /// Whether an operation has any recorded outcome.
    pub fn ran(&self, kind: OperationKind) -> bool {
        self.devices
            .values()
            .any(|outcomes| outcomes.iter().any(|(k, _)| *k == kind))
    }

    /// Devices with at least one failed operation.
    pub fn failed_devices(&self) -> Vec<&str> {
        self.devices
            .iter()
            .filter(|(_, outcomes)| outcomes.iter().any(|(_, o)| o.is_failed()))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_devices().is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
