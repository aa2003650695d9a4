//! The per-session cutover executor.
//!
//! `run_session` drives one `UpgradeSession` through
//! `Backup → Deploy → Test → Cutover → Verify`, executing the bound
//! strategy's plan step by step. Steps execute strictly in plan order;
//! step N+1 never begins before step N completes. Every hold is a
//! `tokio::select!` over the hold timer, the manual-rollback channel,
//! the session watchdog, and (during cutover) a periodic health probe —
//! so a trigger interrupts a wait instead of waiting it out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use cutover_backup::BackupManager;
use cutover_health::HealthProber;
use cutover_state::{
    AggregateHealth, FailureDetail, HealthSnapshot, Outcome, RollbackTrigger, SessionEvent,
    SessionEventKind, SessionState, StateStore, UpgradeSession, UpgradeStep, epoch_secs,
};
use cutover_strategy::{CutoverAction, PlannedStep, StepOutcome, StrategyController, controller_for};

use crate::SessionError;
use crate::catalog::VersionCatalog;
use crate::fleet::Fleet;
use crate::notify::{NotificationSink, TerminalNotice};
use crate::rollback;

/// Shared collaborators every session task needs.
#[derive(Clone)]
pub struct SessionContext {
    pub store: StateStore,
    pub prober: Arc<HealthProber>,
    pub fleet: Arc<dyn Fleet>,
    pub backups: Arc<BackupManager>,
    pub catalog: Arc<dyn VersionCatalog>,
    pub notifier: Arc<dyn NotificationSink>,
}

/// Timing knobs for session execution.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Observer sampling interval during Cutover/Verify holds.
    pub probe_interval: Duration,
    /// Post-cutover re-confirmation window for strategies that do not
    /// define their own.
    pub verify_window: Duration,
    /// Watchdog: a session exceeding this is force-evaluated as stuck.
    pub max_session_duration: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            verify_window: Duration::from_secs(15),
            max_session_duration: Duration::from_secs(3600),
        }
    }
}

/// Appends to the durable event log and fans out to live subscribers.
struct Recorder {
    store: StateStore,
    tx: broadcast::Sender<SessionEvent>,
    session_id: String,
    seq: u64,
}

impl Recorder {
    fn emit(&mut self, kind: SessionEventKind) {
        let event = SessionEvent {
            seq: self.seq,
            session_id: self.session_id.clone(),
            at: epoch_secs(),
            kind,
        };
        self.seq += 1;
        if let Err(e) = self.store.append_event(&event) {
            error!(session_id = %self.session_id, error = %e, "failed to append session event");
        }
        // No live subscribers is fine.
        let _ = self.tx.send(event);
    }
}

/// Run one session to its terminal state and return the final snapshot.
pub(crate) async fn run_session(
    ctx: SessionContext,
    config: OrchestratorConfig,
    session: UpgradeSession,
    manual_rx: watch::Receiver<bool>,
    events_tx: broadcast::Sender<SessionEvent>,
) -> UpgradeSession {
    let deadline = Instant::now() + config.max_session_duration;
    let rec = Recorder {
        store: ctx.store.clone(),
        tx: events_tx,
        session_id: session.id.clone(),
        seq: 0,
    };
    let mut run = SessionRun {
        ctx,
        config,
        session,
        manual_rx,
        rec,
        deadline,
    };
    run.drive().await;
    run.session
}

struct SessionRun {
    ctx: SessionContext,
    config: OrchestratorConfig,
    session: UpgradeSession,
    manual_rx: watch::Receiver<bool>,
    rec: Recorder,
    deadline: Instant,
}

impl SessionRun {
    async fn drive(&mut self) {
        let from = self.session.from_version.clone();
        let to = self.session.to_version.clone();

        // ── Backup: precondition for everything that follows ──────
        self.set_state(SessionState::Backup);
        for agent_id in self.session.agent_ids.clone() {
            match self.ctx.backups.create(&agent_id, &from).await {
                Ok(record) => {
                    self.session.backups.push(record);
                    self.persist();
                }
                Err(e) => {
                    return self.finish_failed(
                        "backup",
                        &format!("backup failed for {agent_id}: {e}"),
                        None,
                    );
                }
            }
        }
        self.session.rollback_eligible = true;

        // Pre-upgrade latency baseline for regression detection.
        let baseline = self.probe_all().await;
        self.session.baseline_latency_ms = baseline.metric_mean("response_time_ms");
        self.persist();

        // ── Plan the bound strategy ───────────────────────────────
        let mut instance_count = 0u32;
        for agent_id in &self.session.agent_ids {
            match self.ctx.fleet.instance_count(agent_id).await {
                Ok(n) => instance_count = instance_count.max(n),
                Err(e) => {
                    return self.finish_failed(
                        "plan_strategy",
                        &format!("fleet lookup failed: {e}"),
                        None,
                    );
                }
            }
        }
        let controller = controller_for(&self.session.strategy, &from, &to);
        let plan = controller.plan(instance_count);
        let boundary = controller.cutover_boundary(&plan);
        self.session.steps = plan.iter().map(|s| UpgradeStep::new(&s.name)).collect();
        self.persist();

        self.set_state(SessionState::Deploy);
        // Steps whose actuator action ran, gate outcome aside; the
        // reverse procedure must cover all of them.
        let mut executed: Vec<PlannedStep> = Vec::new();

        for (i, step) in plan.iter().enumerate() {
            let in_cutover = i >= boundary;

            if i == boundary {
                // Test gate: the new version is checked in isolation
                // before any traffic moves — the cheapest possible abort.
                self.set_state(SessionState::Test);
                let snap = self.probe_all().await;
                self.record_health(&snap);
                if snap.status == AggregateHealth::Unhealthy {
                    return self.finish_failed(
                        "pre_cutover_test",
                        "new version unhealthy before traffic exposure",
                        None,
                    );
                }
                self.set_state(SessionState::Cutover);
            }

            if self.manual_requested() {
                if in_cutover {
                    return self
                        .execute_rollback(
                            controller.as_ref(),
                            &executed,
                            instance_count,
                            &step.name,
                            "operator requested rollback",
                            Some(RollbackTrigger::Manual),
                        )
                        .await;
                }
                return self.finish_failed(
                    &step.name,
                    "cancelled by operator before cutover",
                    Some(RollbackTrigger::Manual),
                );
            }

            self.session.steps[i].start();
            self.rec.emit(SessionEventKind::StepStarted {
                name: step.name.clone(),
            });
            self.persist();
            debug!(session_id = %self.session.id, step = %step.name, "step starting");

            if let Err(e) = self.apply_action(&step.action).await {
                self.session.steps[i].fail();
                self.rec.emit(SessionEventKind::StepFailed {
                    name: step.name.clone(),
                    message: e.to_string(),
                });
                self.persist();
                if in_cutover {
                    return self
                        .execute_rollback(
                            controller.as_ref(),
                            &executed,
                            instance_count,
                            &step.name,
                            &format!("cutover action failed: {e}"),
                            None,
                        )
                        .await;
                }
                return self.finish_failed(&step.name, &format!("step action failed: {e}"), None);
            }
            executed.push(step.clone());

            if let Some(hold) = step.hold {
                if let Err(trigger) = self.observed_hold(hold, in_cutover).await {
                    self.session.steps[i].fail();
                    self.rec.emit(SessionEventKind::StepFailed {
                        name: step.name.clone(),
                        message: format!("interrupted by {} trigger", trigger.kind_str()),
                    });
                    self.persist();
                    if in_cutover {
                        return self
                            .execute_rollback(
                                controller.as_ref(),
                                &executed,
                                instance_count,
                                &step.name,
                                "hold interrupted",
                                Some(trigger),
                            )
                            .await;
                    }
                    return self.finish_failed(
                        &step.name,
                        &format!("interrupted before cutover: {}", trigger.kind_str()),
                        Some(trigger),
                    );
                }
            }

            // Fresh snapshot after the action and hold — never cached.
            let snap = self.probe_all().await;
            self.record_health(&snap);

            if in_cutover {
                if let Some(trigger) = rollback::evaluate(&snap, self.session.baseline_latency_ms)
                {
                    self.session.steps[i].fail();
                    self.rec.emit(SessionEventKind::StepFailed {
                        name: step.name.clone(),
                        message: format!("{} trigger fired", trigger.kind_str()),
                    });
                    self.persist();
                    return self
                        .execute_rollback(
                            controller.as_ref(),
                            &executed,
                            instance_count,
                            &step.name,
                            "rollback trigger fired during cutover",
                            Some(trigger),
                        )
                        .await;
                }
            }

            match controller.advance(step, &snap) {
                StepOutcome::Advance => {
                    self.session.steps[i].complete();
                    self.rec.emit(SessionEventKind::StepCompleted {
                        name: step.name.clone(),
                    });
                    self.persist();
                }
                StepOutcome::FlagRollback(reason) => {
                    self.session.steps[i].fail();
                    self.rec.emit(SessionEventKind::StepFailed {
                        name: step.name.clone(),
                        message: reason.clone(),
                    });
                    self.persist();
                    if in_cutover {
                        return self
                            .execute_rollback(
                                controller.as_ref(),
                                &executed,
                                instance_count,
                                &step.name,
                                &reason,
                                Some(
                                    rollback::evaluate(&snap, self.session.baseline_latency_ms)
                                        .unwrap_or(RollbackTrigger::UnhealthySnapshot),
                                ),
                            )
                            .await;
                    }
                    return self.finish_failed(&step.name, &reason, None);
                }
            }
        }

        // ── Verify: re-confirm over the validation window ─────────
        let verify_window = controller
            .verify_window()
            .unwrap_or(self.config.verify_window);
        self.set_state(SessionState::Verify);
        if let Err(trigger) = self.observed_hold(verify_window, true).await {
            return self
                .execute_rollback(
                    controller.as_ref(),
                    &executed,
                    instance_count,
                    "verify",
                    "verification window interrupted",
                    Some(trigger),
                )
                .await;
        }
        let snap = self.probe_all().await;
        self.record_health(&snap);
        if let Some(trigger) = rollback::evaluate(&snap, self.session.baseline_latency_ms) {
            return self
                .execute_rollback(
                    controller.as_ref(),
                    &executed,
                    instance_count,
                    "verify",
                    "post-cutover verification failed",
                    Some(trigger),
                )
                .await;
        }

        // ── Cleanup: retire superseded fleets, verification done ──
        // A rollback can no longer fire past this point, so tearing the
        // old fleet down is safe now and only now.
        let cleanup = controller.cleanup();
        let base = self.session.steps.len();
        self.session
            .steps
            .extend(cleanup.iter().map(|s| UpgradeStep::new(&s.name)));
        self.persist();
        for (i, step) in cleanup.iter().enumerate() {
            self.session.steps[base + i].start();
            self.rec.emit(SessionEventKind::StepStarted {
                name: step.name.clone(),
            });
            if let Err(e) = self.apply_action(&step.action).await {
                // Verified traffic is already on the new fleet; a
                // leftover old fleet can be retired by hand.
                warn!(
                    session_id = %self.session.id,
                    step = %step.name,
                    error = %e,
                    "cleanup step failed, old fleet left running"
                );
                self.session.steps[base + i].fail();
                self.rec.emit(SessionEventKind::StepFailed {
                    name: step.name.clone(),
                    message: e.to_string(),
                });
                self.persist();
                break;
            }
            self.session.steps[base + i].complete();
            self.rec.emit(SessionEventKind::StepCompleted {
                name: step.name.clone(),
            });
            self.persist();
        }

        let summary = format!(
            "upgraded {} agent(s) from {from} to {to}",
            self.session.agent_ids.len()
        );
        self.finish(SessionState::Success, Outcome::Success, summary);
    }

    /// Run the bound strategy's reverse procedure and confirm the result.
    async fn execute_rollback(
        &mut self,
        controller: &dyn StrategyController,
        completed: &[PlannedStep],
        instance_count: u32,
        at_step: &str,
        reason: &str,
        trigger: Option<RollbackTrigger>,
    ) {
        let started = Instant::now();
        warn!(session_id = %self.session.id, step = at_step, reason, "rollback starting");

        self.session.failure = Some(FailureDetail {
            step: at_step.to_string(),
            trigger: trigger.clone(),
            message: reason.to_string(),
        });
        self.set_state(SessionState::RollingBack);
        if let Some(t) = trigger.clone() {
            self.rec.emit(SessionEventKind::RollbackTriggered { trigger: t });
        }

        let reverse = controller.reverse(completed, instance_count);
        self.session.rollback_steps = reverse.iter().map(|s| UpgradeStep::new(&s.name)).collect();
        self.persist();

        // Rolling re-deploys the prior version from the backup; restore
        // the captured state before replaying batches.
        let needs_restore = reverse
            .iter()
            .any(|s| matches!(s.action, CutoverAction::ReplaceBatch { .. }));
        if needs_restore {
            for record in self.session.backups.clone() {
                if let Err(e) = self.ctx.backups.restore(&record).await {
                    return self.finish_manual_intervention(
                        at_step,
                        &format!("backup restore failed for {}: {e}", record.agent_id),
                    );
                }
            }
        }

        for (i, step) in reverse.iter().enumerate() {
            self.session.rollback_steps[i].start();
            self.rec.emit(SessionEventKind::StepStarted {
                name: step.name.clone(),
            });
            if let Err(e) = self.apply_action(&step.action).await {
                self.session.rollback_steps[i].fail();
                self.rec.emit(SessionEventKind::StepFailed {
                    name: step.name.clone(),
                    message: e.to_string(),
                });
                self.persist();
                return self
                    .finish_manual_intervention(&step.name, &format!("rollback step failed: {e}"));
            }
            self.session.rollback_steps[i].complete();
            self.rec.emit(SessionEventKind::StepCompleted {
                name: step.name.clone(),
            });
            self.persist();
        }

        // Confirm the reverted state is actually healthy.
        let snap = self.probe_all().await;
        self.record_health(&snap);
        if snap.status == AggregateHealth::Unhealthy {
            return self.finish_manual_intervention(at_step, "reverted state is still unhealthy");
        }

        info!(
            session_id = %self.session.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rollback completed"
        );
        let trigger_desc = trigger.as_ref().map(|t| t.kind_str()).unwrap_or("cutover_error");
        self.finish(
            SessionState::RolledBack,
            Outcome::RolledBack,
            format!("rolled back at step '{at_step}': {reason} (trigger: {trigger_desc})"),
        );
    }

    /// Wait out a hold, interruptibly.
    ///
    /// Returns `Err(trigger)` if the manual channel, the watchdog, or
    /// (during cutover) a sampled health snapshot fires first.
    async fn observed_hold(
        &mut self,
        duration: Duration,
        in_cutover: bool,
    ) -> Result<(), RollbackTrigger> {
        if self.manual_requested() {
            return Err(RollbackTrigger::Manual);
        }
        if Instant::now() >= self.deadline {
            return Err(self.stuck());
        }

        let hold_deadline = Instant::now() + duration;
        let mut manual = self.manual_rx.clone();
        let mut manual_open = true;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(hold_deadline) => return Ok(()),
                res = manual.changed(), if manual_open => {
                    match res {
                        Ok(()) => {
                            if *manual.borrow() {
                                return Err(RollbackTrigger::Manual);
                            }
                        }
                        Err(_) => manual_open = false,
                    }
                }
                _ = tokio::time::sleep_until(self.deadline) => return Err(self.stuck()),
                _ = tokio::time::sleep(self.config.probe_interval), if in_cutover => {
                    let snap = self.probe_all().await;
                    self.record_health(&snap);
                    if let Some(trigger) =
                        rollback::evaluate(&snap, self.session.baseline_latency_ms)
                    {
                        return Err(trigger);
                    }
                }
            }
        }
    }

    fn stuck(&self) -> RollbackTrigger {
        RollbackTrigger::Stuck {
            elapsed_secs: self.config.max_session_duration.as_secs(),
        }
    }

    fn manual_requested(&self) -> bool {
        *self.manual_rx.borrow()
    }

    /// One battery per target agent, folded into a single snapshot.
    async fn probe_all(&self) -> HealthSnapshot {
        let mut checks = Vec::new();
        for agent_id in &self.session.agent_ids {
            checks.extend(self.ctx.prober.probe(agent_id).await.checks);
        }
        HealthSnapshot::from_checks(checks)
    }

    async fn apply_action(&self, action: &CutoverAction) -> Result<(), SessionError> {
        for agent_id in &self.session.agent_ids {
            match action {
                CutoverAction::ProvisionFleet { version, count } => {
                    self.ctx.fleet.provision(agent_id, version, *count).await?
                }
                CutoverAction::ShiftTraffic { percent } => {
                    self.ctx.fleet.shift_traffic(agent_id, *percent).await?
                }
                CutoverAction::ReplaceBatch {
                    start_index,
                    count,
                    version,
                } => {
                    self.ctx
                        .fleet
                        .replace_batch(agent_id, *start_index, *count, version)
                        .await?
                }
                CutoverAction::DecommissionFleet { version } => {
                    self.ctx.fleet.decommission(agent_id, version).await?
                }
                CutoverAction::Observe => {}
            }
        }
        Ok(())
    }

    fn record_health(&mut self, snap: &HealthSnapshot) {
        self.session.health = Some(snap.clone());
        self.rec.emit(SessionEventKind::HealthReported {
            status: snap.status,
        });
        self.persist();
    }

    fn set_state(&mut self, next: SessionState) {
        let from = self.session.state;
        self.session.transition(next);
        self.rec.emit(SessionEventKind::StateChanged { from, to: next });
        self.persist();
    }

    fn persist(&self) {
        if let Err(e) = self.ctx.store.put_session(&self.session) {
            error!(session_id = %self.session.id, error = %e, "failed to persist session");
        }
    }

    fn finish(&mut self, state: SessionState, outcome: Outcome, summary: String) {
        self.session.outcome = Some(outcome);
        self.set_state(state);
        self.rec.emit(SessionEventKind::Terminal {
            outcome,
            summary: summary.clone(),
        });
        if let Err(e) = self.ctx.store.append_history(&self.session) {
            error!(session_id = %self.session.id, error = %e, "failed to append session history");
        }
        self.persist();
        self.ctx.notifier.notify(TerminalNotice {
            session_id: self.session.id.clone(),
            outcome,
            summary,
        });
    }

    fn finish_failed(&mut self, step: &str, message: &str, trigger: Option<RollbackTrigger>) {
        self.session.failure = Some(FailureDetail {
            step: step.to_string(),
            trigger,
            message: message.to_string(),
        });
        self.finish(
            SessionState::Failed,
            Outcome::Failed,
            format!("failed at step '{step}': {message}"),
        );
    }

    fn finish_manual_intervention(&mut self, step: &str, message: &str) {
        error!(session_id = %self.session.id, step, message, "manual intervention required");
        // Preserve the original failure detail; it names the first cause.
        if self.session.failure.is_none() {
            self.session.failure = Some(FailureDetail {
                step: step.to_string(),
                trigger: None,
                message: message.to_string(),
            });
        }
        self.finish(
            SessionState::ManualInterventionRequired,
            Outcome::Failed,
            format!("manual intervention required at '{step}': {message}"),
        );
    }
}
