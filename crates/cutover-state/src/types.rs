//! Domain types for the upgrade orchestrator.
//!
//! These types represent agent versions, deployment strategies, health
//! verdicts, upgrade steps, and the `UpgradeSession` root aggregate. All
//! types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Unique identifier for a managed agent.
pub type AgentId = String;

/// Unique identifier for an upgrade session.
pub type SessionId = String;

/// Current unix timestamp in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Versions ──────────────────────────────────────────────────────

/// A deployable agent build, as published by the version catalog.
///
/// Immutable once published; only the catalog may reassign `lifecycle`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentVersion {
    pub version: String,
    pub size_bytes: u64,
    pub release_notes: String,
    pub lifecycle: VersionLifecycle,
}

/// Catalog lifecycle tag for a published version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionLifecycle {
    Current,
    Recommended,
    Available,
    Deprecated,
}

// ── Strategies ────────────────────────────────────────────────────

/// How to move an agent from one version to the next.
///
/// Exactly one strategy is bound to a session at plan time and is
/// immutable for that session's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploymentStrategy {
    /// Full parallel fleet, then an atomic traffic switch.
    BlueGreen {
        /// Seconds to validate the green fleet before switching.
        validation_period_secs: u64,
        /// Keep the old fleet addressable until an explicit cleanup.
        keep_old_version: bool,
    },
    /// Progressive traffic phases ending at 100%.
    Canary { phases: Vec<CanaryPhase> },
    /// Replace instances in sequential batches.
    Rolling {
        batch_size: u32,
        wait_between_batches_secs: u64,
        health_check_interval_secs: u64,
    },
}

/// One canary phase: shift to `traffic_percent`, hold for `hold_secs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanaryPhase {
    pub traffic_percent: u8,
    pub hold_secs: u64,
}

/// A strategy configuration the orchestrator refuses to bind.
#[derive(Debug, Error, PartialEq)]
pub enum InvalidStrategy {
    #[error("canary strategy requires at least one phase")]
    EmptyCanary,

    #[error("canary traffic must be monotonically non-decreasing (phase {phase})")]
    NonMonotonicTraffic { phase: usize },

    #[error("canary traffic percent cannot exceed 100 (phase {phase})")]
    TrafficOutOfRange { phase: usize },

    #[error("final canary phase must shift 100% of traffic, got {last}%")]
    IncompleteCanary { last: u8 },

    #[error("rolling batch_size must be at least 1")]
    ZeroBatchSize,
}

impl DeploymentStrategy {
    /// Short name for logs and step labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BlueGreen { .. } => "blue_green",
            Self::Canary { .. } => "canary",
            Self::Rolling { .. } => "rolling",
        }
    }

    /// Validate strategy parameters before binding to a session.
    pub fn validate(&self) -> Result<(), InvalidStrategy> {
        match self {
            Self::BlueGreen { .. } => Ok(()),
            Self::Canary { phases } => {
                if phases.is_empty() {
                    return Err(InvalidStrategy::EmptyCanary);
                }
                let mut prev = 0u8;
                for (i, phase) in phases.iter().enumerate() {
                    if phase.traffic_percent > 100 {
                        return Err(InvalidStrategy::TrafficOutOfRange { phase: i });
                    }
                    if phase.traffic_percent < prev {
                        return Err(InvalidStrategy::NonMonotonicTraffic { phase: i });
                    }
                    prev = phase.traffic_percent;
                }
                if prev != 100 {
                    return Err(InvalidStrategy::IncompleteCanary { last: prev });
                }
                Ok(())
            }
            Self::Rolling { batch_size, .. } => {
                if *batch_size == 0 {
                    return Err(InvalidStrategy::ZeroBatchSize);
                }
                Ok(())
            }
        }
    }
}

// ── Health ────────────────────────────────────────────────────────

/// Verdict of a single health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

/// A named probe result with numeric metrics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheck {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    /// Well-known keys: `response_time_ms`, `error_rate_pct`, `cpu_pct`, `mem_pct`.
    pub metrics: HashMap<String, f64>,
    pub checked_at: u64,
}

/// Aggregate verdict over a battery of checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// N health checks folded into one aggregate verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSnapshot {
    pub checks: Vec<HealthCheck>,
    pub status: AggregateHealth,
    pub taken_at: u64,
}

impl HealthSnapshot {
    /// Aggregate a battery of checks. Deterministic and order-independent:
    /// any fail → unhealthy; else any warn → degraded; else healthy.
    pub fn from_checks(checks: Vec<HealthCheck>) -> Self {
        let status = if checks.iter().any(|c| c.status == CheckStatus::Fail) {
            AggregateHealth::Unhealthy
        } else if checks.iter().any(|c| c.status == CheckStatus::Warn) {
            AggregateHealth::Degraded
        } else {
            AggregateHealth::Healthy
        };
        Self {
            checks,
            status,
            taken_at: epoch_secs(),
        }
    }

    /// Mean of a named metric across all checks reporting it.
    pub fn metric_mean(&self, name: &str) -> Option<f64> {
        let values: Vec<f64> = self
            .checks
            .iter()
            .filter_map(|c| c.metrics.get(name).copied())
            .collect();
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }

    /// Maximum of a named metric across all checks reporting it.
    pub fn metric_max(&self, name: &str) -> Option<f64> {
        self.checks
            .iter()
            .filter_map(|c| c.metrics.get(name).copied())
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
    }
}

// ── Steps ─────────────────────────────────────────────────────────

/// Execution status of one upgrade step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One phase of execution within a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpgradeStep {
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

impl UpgradeStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn start(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(epoch_secs());
    }

    pub fn complete(&mut self) {
        self.status = StepStatus::Completed;
        self.finished_at = Some(epoch_secs());
    }

    pub fn fail(&mut self) {
        self.status = StepStatus::Failed;
        self.finished_at = Some(epoch_secs());
    }
}

// ── Sessions ──────────────────────────────────────────────────────

/// State of the per-session upgrade state machine.
///
/// Forward order is `Plan → Backup → Deploy → Test → Cutover → Verify`;
/// the only backward edge is through `RollingBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Plan,
    Backup,
    Deploy,
    Test,
    Cutover,
    Verify,
    RollingBack,
    Success,
    Failed,
    RolledBack,
    /// Reversion itself failed; excluded from automatic retry.
    ManualInterventionRequired,
}

impl SessionState {
    /// Whether no further transition will occur.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::RolledBack | Self::ManualInterventionRequired
        )
    }
}

/// Terminal outcome of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
    RolledBack,
}

/// What caused a rollback. First trigger wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollbackTrigger {
    /// Aggregate health verdict was unhealthy.
    UnhealthySnapshot,
    /// Aggregate error rate exceeded the 5% ceiling.
    ErrorRate { pct: f64 },
    /// Latency rose more than 50% over the pre-upgrade baseline.
    LatencyRegression { increase_pct: f64 },
    /// Operator-issued rollback request.
    Manual,
    /// Session exceeded its maximum total duration.
    Stuck { elapsed_secs: u64 },
}

impl RollbackTrigger {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::UnhealthySnapshot => "unhealthy_snapshot",
            Self::ErrorRate { .. } => "error_rate",
            Self::LatencyRegression { .. } => "latency_regression",
            Self::Manual => "manual",
            Self::Stuck { .. } => "stuck",
        }
    }
}

/// The step/trigger that produced a terminal state. "It failed" without
/// the triggering check or step is not an acceptable report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureDetail {
    pub step: String,
    pub trigger: Option<RollbackTrigger>,
    pub message: String,
}

/// Durable point-in-time capture of an agent's deployable state.
///
/// Content-addressed: `digest` is the sha256 of the captured bytes, so
/// repeated identical backups are idempotent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRecord {
    pub digest: String,
    pub agent_id: AgentId,
    pub version: String,
    pub size_bytes: u64,
    pub created_at: u64,
}

/// Root aggregate for one upgrade request.
///
/// Owned exclusively by the orchestrator for its lifetime; written once
/// to history on reaching a terminal outcome, after which it is immutable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpgradeSession {
    pub id: SessionId,
    pub agent_ids: Vec<AgentId>,
    pub from_version: String,
    pub to_version: String,
    pub strategy: DeploymentStrategy,
    pub state: SessionState,
    /// One backup per target agent, created before any traffic-affecting step.
    pub backups: Vec<BackupRecord>,
    pub steps: Vec<UpgradeStep>,
    /// Reverse-procedure steps; populated only once a rollback begins.
    pub rollback_steps: Vec<UpgradeStep>,
    pub health: Option<HealthSnapshot>,
    /// Mean response_time_ms captured before the upgrade touched anything.
    pub baseline_latency_ms: Option<f64>,
    pub rollback_eligible: bool,
    pub outcome: Option<Outcome>,
    pub failure: Option<FailureDetail>,
    pub created_at: u64,
    pub updated_at: u64,
    pub finished_at: Option<u64>,
}

impl UpgradeSession {
    pub fn new(
        id: impl Into<SessionId>,
        agent_ids: Vec<AgentId>,
        from_version: impl Into<String>,
        to_version: impl Into<String>,
        strategy: DeploymentStrategy,
    ) -> Self {
        let now = epoch_secs();
        Self {
            id: id.into(),
            agent_ids,
            from_version: from_version.into(),
            to_version: to_version.into(),
            strategy,
            state: SessionState::Plan,
            backups: Vec::new(),
            steps: Vec::new(),
            rollback_steps: Vec::new(),
            health: None,
            baseline_latency_ms: None,
            rollback_eligible: false,
            outcome: None,
            failure: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Forward progress: completed steps / total steps.
    ///
    /// Non-decreasing until a rollback begins; rollback progress is
    /// reported on a separate counter and this one never moves backward.
    pub fn progress_percentage(&self) -> u8 {
        percentage(
            self.steps
                .iter()
                .filter(|s| s.status == StepStatus::Completed)
                .count(),
            self.steps.len(),
        )
    }

    /// Rollback progress over the reverse-procedure steps.
    pub fn rollback_progress_percentage(&self) -> u8 {
        percentage(
            self.rollback_steps
                .iter()
                .filter(|s| s.status == StepStatus::Completed)
                .count(),
            self.rollback_steps.len(),
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Transition to a new state, stamping `updated_at` (and `finished_at`
    /// on terminal states).
    pub fn transition(&mut self, next: SessionState) {
        self.state = next;
        self.updated_at = epoch_secs();
        if next.is_terminal() {
            self.finished_at = Some(self.updated_at);
        }
    }
}

fn percentage(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done * 100) / total) as u8
}

// ── Events ────────────────────────────────────────────────────────

/// One entry in a session's append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEvent {
    pub seq: u64,
    pub session_id: SessionId,
    pub at: u64,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

/// What happened, for the event log and the live stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEventKind {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    StepStarted {
        name: String,
    },
    StepCompleted {
        name: String,
    },
    StepFailed {
        name: String,
        message: String,
    },
    HealthReported {
        status: AggregateHealth,
    },
    RollbackTriggered {
        trigger: RollbackTrigger,
    },
    Terminal {
        outcome: Outcome,
        summary: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(name: &str, status: CheckStatus) -> HealthCheck {
        HealthCheck {
            name: name.to_string(),
            status,
            message: String::new(),
            metrics: HashMap::new(),
            checked_at: 0,
        }
    }

    #[test]
    fn aggregate_any_fail_is_unhealthy() {
        let snap = HealthSnapshot::from_checks(vec![
            check("a", CheckStatus::Pass),
            check("b", CheckStatus::Warn),
            check("c", CheckStatus::Fail),
        ]);
        assert_eq!(snap.status, AggregateHealth::Unhealthy);
    }

    #[test]
    fn aggregate_warn_without_fail_is_degraded() {
        let snap = HealthSnapshot::from_checks(vec![
            check("a", CheckStatus::Warn),
            check("b", CheckStatus::Pass),
        ]);
        assert_eq!(snap.status, AggregateHealth::Degraded);
    }

    #[test]
    fn aggregate_all_pass_is_healthy() {
        let snap = HealthSnapshot::from_checks(vec![
            check("a", CheckStatus::Pass),
            check("b", CheckStatus::Pass),
        ]);
        assert_eq!(snap.status, AggregateHealth::Healthy);
    }

    #[test]
    fn aggregate_is_order_independent() {
        let forward = HealthSnapshot::from_checks(vec![
            check("a", CheckStatus::Fail),
            check("b", CheckStatus::Warn),
            check("c", CheckStatus::Pass),
        ]);
        let reversed = HealthSnapshot::from_checks(vec![
            check("c", CheckStatus::Pass),
            check("b", CheckStatus::Warn),
            check("a", CheckStatus::Fail),
        ]);
        assert_eq!(forward.status, reversed.status);
    }

    #[test]
    fn metric_mean_and_max() {
        let mut a = check("a", CheckStatus::Pass);
        a.metrics.insert("response_time_ms".to_string(), 100.0);
        let mut b = check("b", CheckStatus::Pass);
        b.metrics.insert("response_time_ms".to_string(), 300.0);
        let c = check("c", CheckStatus::Pass);

        let snap = HealthSnapshot::from_checks(vec![a, b, c]);
        assert_eq!(snap.metric_mean("response_time_ms"), Some(200.0));
        assert_eq!(snap.metric_max("response_time_ms"), Some(300.0));
        assert_eq!(snap.metric_mean("error_rate_pct"), None);
    }

    #[test]
    fn canary_validation_accepts_monotonic_to_100() {
        let strategy = DeploymentStrategy::Canary {
            phases: vec![
                CanaryPhase {
                    traffic_percent: 10,
                    hold_secs: 60,
                },
                CanaryPhase {
                    traffic_percent: 50,
                    hold_secs: 60,
                },
                CanaryPhase {
                    traffic_percent: 100,
                    hold_secs: 60,
                },
            ],
        };
        assert!(strategy.validate().is_ok());
    }

    #[test]
    fn canary_validation_rejects_decreasing_traffic() {
        let strategy = DeploymentStrategy::Canary {
            phases: vec![
                CanaryPhase {
                    traffic_percent: 50,
                    hold_secs: 60,
                },
                CanaryPhase {
                    traffic_percent: 10,
                    hold_secs: 60,
                },
            ],
        };
        assert_eq!(
            strategy.validate(),
            Err(InvalidStrategy::NonMonotonicTraffic { phase: 1 })
        );
    }

    #[test]
    fn canary_validation_rejects_incomplete_final_phase() {
        let strategy = DeploymentStrategy::Canary {
            phases: vec![CanaryPhase {
                traffic_percent: 50,
                hold_secs: 60,
            }],
        };
        assert_eq!(
            strategy.validate(),
            Err(InvalidStrategy::IncompleteCanary { last: 50 })
        );
    }

    #[test]
    fn canary_validation_rejects_empty_phases() {
        let strategy = DeploymentStrategy::Canary { phases: vec![] };
        assert_eq!(strategy.validate(), Err(InvalidStrategy::EmptyCanary));
    }

    #[test]
    fn rolling_validation_rejects_zero_batch() {
        let strategy = DeploymentStrategy::Rolling {
            batch_size: 0,
            wait_between_batches_secs: 5,
            health_check_interval_secs: 5,
        };
        assert_eq!(strategy.validate(), Err(InvalidStrategy::ZeroBatchSize));
    }

    #[test]
    fn progress_is_completed_over_total() {
        let mut session = UpgradeSession::new(
            "s-1",
            vec!["agent-1".to_string()],
            "1.0.0",
            "1.1.0",
            DeploymentStrategy::BlueGreen {
                validation_period_secs: 30,
                keep_old_version: true,
            },
        );
        session.steps = vec![
            UpgradeStep::new("a"),
            UpgradeStep::new("b"),
            UpgradeStep::new("c"),
            UpgradeStep::new("d"),
        ];
        assert_eq!(session.progress_percentage(), 0);

        session.steps[0].complete();
        session.steps[1].complete();
        assert_eq!(session.progress_percentage(), 50);

        // A failed step does not count toward forward progress.
        session.steps[2].fail();
        assert_eq!(session.progress_percentage(), 50);
    }

    #[test]
    fn rollback_progress_is_a_separate_counter() {
        let mut session = UpgradeSession::new(
            "s-1",
            vec!["agent-1".to_string()],
            "1.0.0",
            "1.1.0",
            DeploymentStrategy::BlueGreen {
                validation_period_secs: 30,
                keep_old_version: true,
            },
        );
        session.steps = vec![UpgradeStep::new("a"), UpgradeStep::new("b")];
        session.steps[0].complete();
        let forward = session.progress_percentage();

        session.rollback_steps = vec![UpgradeStep::new("revert")];
        session.rollback_steps[0].complete();

        // Forward progress never moves backward once rollback begins.
        assert_eq!(session.progress_percentage(), forward);
        assert_eq!(session.rollback_progress_percentage(), 100);
    }

    #[test]
    fn terminal_transition_stamps_finished_at() {
        let mut session = UpgradeSession::new(
            "s-1",
            vec!["agent-1".to_string()],
            "1.0.0",
            "1.1.0",
            DeploymentStrategy::BlueGreen {
                validation_period_secs: 30,
                keep_old_version: true,
            },
        );
        assert!(session.finished_at.is_none());
        session.transition(SessionState::Success);
        assert!(session.is_terminal());
        assert!(session.finished_at.is_some());
    }

    #[test]
    fn strategy_serializes_tagged() {
        let strategy = DeploymentStrategy::Rolling {
            batch_size: 2,
            wait_between_batches_secs: 10,
            health_check_interval_secs: 5,
        };
        let json = serde_json::to_string(&strategy).unwrap();
        assert!(json.contains("\"type\":\"rolling\""));
        let back: DeploymentStrategy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, strategy);
    }

    #[test]
    fn trigger_kind_strings() {
        assert_eq!(RollbackTrigger::Manual.kind_str(), "manual");
        assert_eq!(
            RollbackTrigger::ErrorRate { pct: 8.0 }.kind_str(),
            "error_rate"
        );
    }
}
