//! Rollback trigger evaluation.
//!
//! The rollback controller samples fresh health snapshots during
//! Cutover and Verify and fires on the first matching trigger. Manual
//! and watchdog triggers arrive over channels; this module owns the
//! signal-derived ones.

use cutover_health::latency_increase_pct;
use cutover_state::{AggregateHealth, HealthSnapshot, RollbackTrigger};

/// Aggregate error rate above this fires a rollback.
pub const ERROR_RATE_CEILING_PCT: f64 = 5.0;

/// Latency increase over the pre-upgrade baseline above this fires a rollback.
pub const LATENCY_REGRESSION_CEILING_PCT: f64 = 50.0;

/// Evaluate a fresh snapshot against the automatic triggers.
///
/// First one wins, in spec order: unhealthy snapshot, error rate,
/// latency regression.
pub fn evaluate(
    snapshot: &HealthSnapshot,
    baseline_latency_ms: Option<f64>,
) -> Option<RollbackTrigger> {
    if snapshot.status == AggregateHealth::Unhealthy {
        return Some(RollbackTrigger::UnhealthySnapshot);
    }

    if let Some(pct) = snapshot.metric_max("error_rate_pct") {
        if pct > ERROR_RATE_CEILING_PCT {
            return Some(RollbackTrigger::ErrorRate { pct });
        }
    }

    if let (Some(baseline), Some(current)) =
        (baseline_latency_ms, snapshot.metric_mean("response_time_ms"))
    {
        let increase_pct = latency_increase_pct(baseline, current);
        if increase_pct > LATENCY_REGRESSION_CEILING_PCT {
            return Some(RollbackTrigger::LatencyRegression { increase_pct });
        }
    }

    None
}
