//! The `StrategyController` contract and its three implementations.
//!
//! Controllers translate a bound `DeploymentStrategy` into an ordered
//! step plan and a reverse procedure. The executor performs the actions,
//! runs the holds, and feeds fresh health snapshots back through
//! `advance`.

use std::time::Duration;

use tracing::debug;

use cutover_state::{AggregateHealth, DeploymentStrategy, HealthSnapshot};

use crate::plan::{CutoverAction, PlannedStep, StepOutcome};

/// Common contract shared by all deployment strategies.
pub trait StrategyController: Send + Sync {
    fn name(&self) -> &'static str;

    /// Ordered step list for upgrading `instance_count` instances.
    fn plan(&self, instance_count: u32) -> Vec<PlannedStep>;

    /// Index of the first traffic-affecting step in `plan`.
    ///
    /// Everything before it failing leaves the session `Failed` with no
    /// visible change; failures at or after it demand rollback.
    fn cutover_boundary(&self, plan: &[PlannedStep]) -> usize {
        plan.iter()
            .position(|s| s.action.affects_traffic())
            .unwrap_or(plan.len())
    }

    /// Decide whether to proceed past a completed step given the
    /// freshest health snapshot.
    fn advance(&self, step: &PlannedStep, health: &HealthSnapshot) -> StepOutcome {
        if step.requires_healthy && health.status != AggregateHealth::Healthy {
            return StepOutcome::FlagRollback(format!(
                "health gate failed at step '{}': {:?}",
                step.name, health.status
            ));
        }
        StepOutcome::Advance
    }

    /// Reverse procedure for the steps that actually completed.
    fn reverse(&self, completed: &[PlannedStep], instance_count: u32) -> Vec<PlannedStep>;

    /// Strategy-defined post-cutover verification window, if any.
    fn verify_window(&self) -> Option<Duration> {
        None
    }

    /// Steps that run only after post-cutover verification succeeds.
    ///
    /// Nothing here may be required by `reverse`: a rollback can fire at
    /// any point before cleanup starts.
    fn cleanup(&self) -> Vec<PlannedStep> {
        Vec::new()
    }
}

/// Build the controller bound to a session's strategy.
pub fn controller_for(
    strategy: &DeploymentStrategy,
    from_version: &str,
    to_version: &str,
) -> Box<dyn StrategyController> {
    match strategy {
        DeploymentStrategy::BlueGreen {
            validation_period_secs,
            keep_old_version,
        } => Box::new(BlueGreenController {
            validation_period: Duration::from_secs(*validation_period_secs),
            keep_old_version: *keep_old_version,
            from_version: from_version.to_string(),
            to_version: to_version.to_string(),
        }),
        DeploymentStrategy::Canary { phases } => Box::new(CanaryController {
            phases: phases.clone(),
            to_version: to_version.to_string(),
        }),
        DeploymentStrategy::Rolling {
            batch_size,
            wait_between_batches_secs,
            health_check_interval_secs,
        } => Box::new(RollingController {
            batch_size: *batch_size,
            wait_between_batches: Duration::from_secs(*wait_between_batches_secs),
            health_check_interval: Duration::from_secs(*health_check_interval_secs),
            from_version: from_version.to_string(),
            to_version: to_version.to_string(),
        }),
    }
}

// ── Blue-Green ────────────────────────────────────────────────────

/// Full parallel fleet, validation window, then an atomic traffic switch.
///
/// The old fleet stays addressable through post-cutover verification; the
/// explicit cleanup step retires it only after verification succeeds, and
/// is omitted entirely when `keep_old_version` is set. Rollback is a
/// traffic pointer flip — the fastest revert any strategy offers.
pub struct BlueGreenController {
    validation_period: Duration,
    keep_old_version: bool,
    from_version: String,
    to_version: String,
}

impl StrategyController for BlueGreenController {
    fn name(&self) -> &'static str {
        "blue_green"
    }

    fn plan(&self, instance_count: u32) -> Vec<PlannedStep> {
        let steps = vec![
            PlannedStep::new(
                "provision_green_fleet",
                CutoverAction::ProvisionFleet {
                    version: self.to_version.clone(),
                    count: instance_count,
                },
            ),
            PlannedStep::new("validate_green_fleet", CutoverAction::Observe)
                .holding(self.validation_period)
                .gated(),
            PlannedStep::new("switch_traffic", CutoverAction::ShiftTraffic { percent: 100 })
                .gated(),
        ];
        debug!(steps = steps.len(), "blue-green plan built");
        steps
    }

    fn reverse(&self, _completed: &[PlannedStep], _instance_count: u32) -> Vec<PlannedStep> {
        // The blue fleet is still provisioned; reverting is one pointer flip.
        vec![PlannedStep::new(
            "restore_traffic_pointer",
            CutoverAction::ShiftTraffic { percent: 0 },
        )]
    }

    fn verify_window(&self) -> Option<Duration> {
        Some(self.validation_period)
    }

    fn cleanup(&self) -> Vec<PlannedStep> {
        if self.keep_old_version {
            return Vec::new();
        }
        vec![PlannedStep::new(
            "decommission_blue_fleet",
            CutoverAction::DecommissionFleet {
                version: self.from_version.clone(),
            },
        )]
    }
}

// ── Canary ────────────────────────────────────────────────────────

/// Progressive traffic phases, each gated on a healthy snapshot.
pub struct CanaryController {
    phases: Vec<cutover_state::CanaryPhase>,
    to_version: String,
}

impl StrategyController for CanaryController {
    fn name(&self) -> &'static str {
        "canary"
    }

    fn plan(&self, instance_count: u32) -> Vec<PlannedStep> {
        let mut steps = vec![PlannedStep::new(
            "provision_canary_fleet",
            CutoverAction::ProvisionFleet {
                version: self.to_version.clone(),
                count: instance_count,
            },
        )];
        for (i, phase) in self.phases.iter().enumerate() {
            steps.push(
                PlannedStep::new(
                    format!("canary_phase_{}_{}_pct", i + 1, phase.traffic_percent),
                    CutoverAction::ShiftTraffic {
                        percent: phase.traffic_percent,
                    },
                )
                .holding(Duration::from_secs(phase.hold_secs))
                .gated(),
            );
        }
        debug!(phases = self.phases.len(), "canary plan built");
        steps
    }

    fn reverse(&self, _completed: &[PlannedStep], _instance_count: u32) -> Vec<PlannedStep> {
        // Drop the canary back to zero traffic, then retire its fleet.
        vec![
            PlannedStep::new("drop_canary_traffic", CutoverAction::ShiftTraffic { percent: 0 }),
            PlannedStep::new(
                "decommission_canary_fleet",
                CutoverAction::DecommissionFleet {
                    version: self.to_version.clone(),
                },
            ),
        ]
    }
}

// ── Rolling ───────────────────────────────────────────────────────

/// Sequential batch replacement with a health confirmation per batch.
///
/// No atomic revert point exists: rollback re-runs the batch procedure
/// in reverse over the batches that were actually touched.
pub struct RollingController {
    batch_size: u32,
    wait_between_batches: Duration,
    health_check_interval: Duration,
    from_version: String,
    to_version: String,
}

impl StrategyController for RollingController {
    fn name(&self) -> &'static str {
        "rolling"
    }

    fn plan(&self, instance_count: u32) -> Vec<PlannedStep> {
        let total = batch_count(instance_count, self.batch_size);
        let mut steps = Vec::new();
        for batch in 0..total {
            let start = batch * self.batch_size;
            let count = self.batch_size.min(instance_count - start);
            steps.push(
                PlannedStep::new(
                    format!("replace_batch_{}_of_{}", batch + 1, total),
                    CutoverAction::ReplaceBatch {
                        start_index: start,
                        count,
                        version: self.to_version.clone(),
                    },
                )
                .holding(self.health_check_interval)
                .gated(),
            );
            if batch + 1 < total {
                steps.push(
                    PlannedStep::new(
                        format!("pause_after_batch_{}", batch + 1),
                        CutoverAction::Observe,
                    )
                    .holding(self.wait_between_batches),
                );
            }
        }
        debug!(batches = total, batch_size = self.batch_size, "rolling plan built");
        steps
    }

    fn reverse(&self, completed: &[PlannedStep], _instance_count: u32) -> Vec<PlannedStep> {
        // Only batches that were touched get re-replaced, newest first.
        // Batches never reached need no action.
        completed
            .iter()
            .rev()
            .filter_map(|step| match &step.action {
                CutoverAction::ReplaceBatch {
                    start_index, count, ..
                } => Some(PlannedStep::new(
                    format!("revert_{}", step.name),
                    CutoverAction::ReplaceBatch {
                        start_index: *start_index,
                        count: *count,
                        version: self.from_version.clone(),
                    },
                )),
                _ => None,
            })
            .collect()
    }
}

/// Number of batches needed to cover all instances.
fn batch_count(total_instances: u32, batch_size: u32) -> u32 {
    if batch_size == 0 {
        return 1;
    }
    total_instances.div_ceil(batch_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutover_state::{CanaryPhase, CheckStatus, HealthCheck};
    use std::collections::HashMap;

    fn snapshot(status: CheckStatus) -> HealthSnapshot {
        HealthSnapshot::from_checks(vec![HealthCheck {
            name: "api_reachability".to_string(),
            status,
            message: String::new(),
            metrics: HashMap::new(),
            checked_at: 0,
        }])
    }

    fn blue_green(keep_old: bool) -> Box<dyn StrategyController> {
        controller_for(
            &DeploymentStrategy::BlueGreen {
                validation_period_secs: 60,
                keep_old_version: keep_old,
            },
            "1.0.0",
            "1.1.0",
        )
    }

    #[test]
    fn blue_green_plan_shape() {
        let plan = blue_green(false).plan(4);
        let names: Vec<&str> = plan.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "provision_green_fleet",
                "validate_green_fleet",
                "switch_traffic",
            ]
        );
        // Validation holds before any traffic moves.
        assert_eq!(plan[1].hold, Some(Duration::from_secs(60)));
        assert!(plan[1].requires_healthy);
    }

    #[test]
    fn blue_green_cleanup_retires_the_old_fleet_after_verification() {
        let controller = blue_green(false);
        // The forward plan never touches the blue fleet; it must stay
        // addressable for a revert until verification has passed.
        assert!(
            !controller
                .plan(4)
                .iter()
                .any(|s| matches!(s.action, CutoverAction::DecommissionFleet { .. }))
        );
        let cleanup = controller.cleanup();
        assert_eq!(cleanup.len(), 1);
        assert_eq!(cleanup[0].name, "decommission_blue_fleet");
        assert_eq!(
            cleanup[0].action,
            CutoverAction::DecommissionFleet {
                version: "1.0.0".to_string()
            }
        );
    }

    #[test]
    fn blue_green_keep_old_skips_cleanup() {
        assert!(blue_green(true).cleanup().is_empty());
        let plan = blue_green(true).plan(4);
        assert!(!plan.iter().any(|s| s.name == "decommission_blue_fleet"));
    }

    #[test]
    fn verify_window_comes_from_the_strategy_where_defined() {
        assert_eq!(
            blue_green(false).verify_window(),
            Some(Duration::from_secs(60))
        );
        assert_eq!(canary().verify_window(), None);
        assert_eq!(rolling(2).verify_window(), None);
    }

    #[test]
    fn blue_green_boundary_is_the_switch() {
        let controller = blue_green(false);
        let plan = controller.plan(4);
        assert_eq!(controller.cutover_boundary(&plan), 2);
        assert_eq!(
            plan[2].action,
            CutoverAction::ShiftTraffic { percent: 100 }
        );
    }

    #[test]
    fn blue_green_reverse_is_single_pointer_flip() {
        let controller = blue_green(false);
        let plan = controller.plan(4);
        let reverse = controller.reverse(&plan[..3], 4);
        assert_eq!(reverse.len(), 1);
        assert_eq!(reverse[0].action, CutoverAction::ShiftTraffic { percent: 0 });
    }

    fn canary() -> Box<dyn StrategyController> {
        controller_for(
            &DeploymentStrategy::Canary {
                phases: vec![
                    CanaryPhase {
                        traffic_percent: 10,
                        hold_secs: 30,
                    },
                    CanaryPhase {
                        traffic_percent: 50,
                        hold_secs: 30,
                    },
                    CanaryPhase {
                        traffic_percent: 100,
                        hold_secs: 30,
                    },
                ],
            },
            "1.0.0",
            "1.1.0",
        )
    }

    #[test]
    fn canary_plan_tracks_phase_percentages() {
        let plan = canary().plan(5);
        let percents: Vec<u8> = plan
            .iter()
            .filter_map(|s| match s.action {
                CutoverAction::ShiftTraffic { percent } => Some(percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![10, 50, 100]);
        // Every traffic phase is health-gated and held.
        for step in plan.iter().skip(1) {
            assert!(step.requires_healthy);
            assert_eq!(step.hold, Some(Duration::from_secs(30)));
        }
    }

    #[test]
    fn canary_boundary_is_first_phase() {
        let controller = canary();
        let plan = controller.plan(5);
        // Provisioning is pre-boundary; the first shift is the boundary.
        assert_eq!(controller.cutover_boundary(&plan), 1);
    }

    #[test]
    fn canary_reverse_drops_to_zero_and_decommissions() {
        let controller = canary();
        let plan = controller.plan(5);
        let reverse = controller.reverse(&plan[..2], 5);
        assert_eq!(reverse[0].action, CutoverAction::ShiftTraffic { percent: 0 });
        assert_eq!(
            reverse[1].action,
            CutoverAction::DecommissionFleet {
                version: "1.1.0".to_string()
            }
        );
    }

    fn rolling(batch_size: u32) -> Box<dyn StrategyController> {
        controller_for(
            &DeploymentStrategy::Rolling {
                batch_size,
                wait_between_batches_secs: 10,
                health_check_interval_secs: 5,
            },
            "1.0.0",
            "1.1.0",
        )
    }

    #[test]
    fn rolling_plan_covers_all_instances() {
        let plan = rolling(2).plan(5); // 3 batches: 2 + 2 + 1
        let batches: Vec<(u32, u32)> = plan
            .iter()
            .filter_map(|s| match s.action {
                CutoverAction::ReplaceBatch {
                    start_index, count, ..
                } => Some((start_index, count)),
                _ => None,
            })
            .collect();
        assert_eq!(batches, vec![(0, 2), (2, 2), (4, 1)]);
        // Pauses between batches, none after the last.
        let pauses = plan.iter().filter(|s| s.name.starts_with("pause")).count();
        assert_eq!(pauses, 2);
    }

    #[test]
    fn rolling_boundary_is_the_first_batch() {
        let controller = rolling(1);
        let plan = controller.plan(4);
        assert_eq!(controller.cutover_boundary(&plan), 0);
    }

    #[test]
    fn rolling_reverse_only_touched_batches() {
        let controller = rolling(1);
        let plan = controller.plan(4);

        // Batches 1-2 completed, batch 3 was attempted and failed; its
        // ReplaceBatch action ran, so it is included among completed
        // actuator actions. Batch 4 was never reached.
        let touched: Vec<PlannedStep> = plan
            .iter()
            .filter(|s| matches!(s.action, CutoverAction::ReplaceBatch { .. }))
            .take(3)
            .cloned()
            .collect();

        let reverse = controller.reverse(&touched, 4);
        let reverted: Vec<u32> = reverse
            .iter()
            .filter_map(|s| match s.action {
                CutoverAction::ReplaceBatch { start_index, ref version, .. } => {
                    assert_eq!(version, "1.0.0");
                    Some(start_index)
                }
                _ => None,
            })
            .collect();
        // Reverse order, batch 4 untouched.
        assert_eq!(reverted, vec![2, 1, 0]);
    }

    #[test]
    fn gated_step_flags_rollback_on_non_healthy() {
        let controller = canary();
        let plan = controller.plan(5);
        let gated = &plan[1];

        assert_eq!(
            controller.advance(gated, &snapshot(CheckStatus::Pass)),
            StepOutcome::Advance
        );
        assert!(matches!(
            controller.advance(gated, &snapshot(CheckStatus::Warn)),
            StepOutcome::FlagRollback(_)
        ));
        assert!(matches!(
            controller.advance(gated, &snapshot(CheckStatus::Fail)),
            StepOutcome::FlagRollback(_)
        ));
    }

    #[test]
    fn ungated_step_advances_regardless() {
        let controller = blue_green(true);
        let plan = controller.plan(4);
        // Provisioning is not health-gated.
        assert_eq!(
            controller.advance(&plan[0], &snapshot(CheckStatus::Fail)),
            StepOutcome::Advance
        );
    }

    #[test]
    fn batch_count_arithmetic() {
        assert_eq!(batch_count(4, 2), 2);
        assert_eq!(batch_count(5, 2), 3);
        assert_eq!(batch_count(1, 1), 1);
        assert_eq!(batch_count(0, 5), 0);
    }
}
