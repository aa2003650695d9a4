//! Planned steps and cutover actions.

use std::time::Duration;

/// Action the fleet actuator performs for one step.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CutoverAction {
    /// Bring up new-version instances without shifting live traffic.
    ProvisionFleet { version: String, count: u32 },
    /// Route `percent` of live traffic to the new version.
    ShiftTraffic { percent: u8 },
    /// Replace instances in range `[start_index, start_index + count)`.
    ReplaceBatch {
        start_index: u32,
        count: u32,
        version: String,
    },
    /// Tear down a version's fleet.
    DecommissionFleet { version: String },
    /// No actuator work; exists to anchor a hold/validation window.
    Observe,
}

impl CutoverAction {
    /// Whether executing this action changes what live traffic sees.
    ///
    /// Failures before the first traffic-affecting step leave nothing
    /// externally visible; failures at or after it require rollback.
    pub fn affects_traffic(&self) -> bool {
        matches!(self, Self::ShiftTraffic { .. } | Self::ReplaceBatch { .. })
    }
}

/// One step of a strategy's plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStep {
    pub name: String,
    pub action: CutoverAction,
    /// Wait applied after the action, cancellable by the rollback observer.
    pub hold: Option<Duration>,
    /// Whether a fresh healthy snapshot is required to advance past this step.
    pub requires_healthy: bool,
}

impl PlannedStep {
    pub fn new(name: impl Into<String>, action: CutoverAction) -> Self {
        Self {
            name: name.into(),
            action,
            hold: None,
            requires_healthy: false,
        }
    }

    pub fn holding(mut self, hold: Duration) -> Self {
        self.hold = Some(hold);
        self
    }

    pub fn gated(mut self) -> Self {
        self.requires_healthy = true;
        self
    }
}

/// Controller verdict after a step's action and hold complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Proceed to the next step.
    Advance,
    /// Halt the sequence and flag the session for rollback.
    FlagRollback(String),
}
