//! Battery execution and retry policy.
//!
//! `HealthProber` drives the fixed check battery with an independent
//! timeout per check and a small bounded retry for transient runner
//! errors. Timeouts are never retried and never skipped: they become
//! `fail` checks with message "timeout".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use cutover_state::{CheckStatus, HealthCheck, HealthSnapshot, epoch_secs};

use crate::checker::{CheckKind, CheckRunner};

/// Runs the fixed check battery against one agent per invocation.
pub struct HealthProber {
    runner: Arc<dyn CheckRunner>,
    /// Independent deadline per check.
    check_timeout: Duration,
    /// Total attempts per check for transient errors.
    attempts: u32,
}

impl HealthProber {
    pub fn new(runner: Arc<dyn CheckRunner>) -> Self {
        Self {
            runner,
            check_timeout: Duration::from_secs(2),
            attempts: 2,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Run the full battery and aggregate into a snapshot.
    pub async fn probe(&self, agent_id: &str) -> HealthSnapshot {
        let mut checks = Vec::with_capacity(CheckKind::BATTERY.len());
        for kind in CheckKind::BATTERY {
            checks.push(self.run_one(agent_id, kind).await);
        }
        let snapshot = HealthSnapshot::from_checks(checks);
        debug!(%agent_id, status = ?snapshot.status, "health battery completed");
        snapshot
    }

    async fn run_one(&self, agent_id: &str, kind: CheckKind) -> HealthCheck {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match tokio::time::timeout(self.check_timeout, self.runner.run(agent_id, kind)).await {
                // Independent check timeout: recorded as fail, never retried.
                Err(_) => {
                    warn!(%agent_id, check = kind.name(), "health check timed out");
                    return fail_check(kind, "timeout");
                }
                Ok(Ok(check)) => return check,
                Ok(Err(e)) if e.is_transient() && attempt < self.attempts => {
                    debug!(%agent_id, check = kind.name(), error = %e, attempt, "transient probe error, retrying");
                }
                Ok(Err(e)) => {
                    warn!(%agent_id, check = kind.name(), error = %e, "health check failed");
                    return fail_check(kind, &e.to_string());
                }
            }
        }
    }
}

fn fail_check(kind: CheckKind, message: &str) -> HealthCheck {
    HealthCheck {
        name: kind.name().to_string(),
        status: CheckStatus::Fail,
        message: message.to_string(),
        metrics: HashMap::new(),
        checked_at: epoch_secs(),
    }
}

/// Percentage increase of `current` over `baseline`. Zero when the
/// baseline is missing or latency improved.
pub fn latency_increase_pct(baseline_ms: f64, current_ms: f64) -> f64 {
    if baseline_ms <= 0.0 || current_ms <= baseline_ms {
        return 0.0;
    }
    (current_ms - baseline_ms) / baseline_ms * 100.0
}
