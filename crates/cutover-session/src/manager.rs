//! Session lifecycle: validation, per-agent locks, task spawning,
//! manual rollback, and event fanout.
//!
//! The manager owns the per-agent exclusive locks. A lock is taken for
//! every target agent before the session task spawns and released only
//! when the task reaches a terminal state, so two sessions can never
//! act on the same agent concurrently while sessions for disjoint
//! agents run fully in parallel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use semver::Version;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use cutover_state::{
    AgentId, AgentVersion, FailureDetail, Outcome, SessionEvent, SessionEventKind, SessionId,
    SessionState, UpgradeSession, epoch_secs,
};

use crate::SessionError;
use crate::executor::{OrchestratorConfig, SessionContext, run_session};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A request to upgrade one or more agents to a target version.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub agent_ids: Vec<AgentId>,
    pub to_version: String,
    pub strategy: cutover_state::DeploymentStrategy,
}

/// Channels into one live session task.
struct SessionHandle {
    manual_tx: watch::Sender<bool>,
    events: broadcast::Sender<SessionEvent>,
}

/// Creates, tracks, and terminates upgrade sessions.
pub struct SessionManager {
    ctx: SessionContext,
    config: OrchestratorConfig,
    locked_agents: Arc<Mutex<HashSet<AgentId>>>,
    live: Arc<Mutex<HashMap<SessionId, SessionHandle>>>,
    counter: AtomicU64,
}

impl SessionManager {
    pub fn new(ctx: SessionContext, config: OrchestratorConfig) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            config,
            locked_agents: Arc::new(Mutex::new(HashSet::new())),
            live: Arc::new(Mutex::new(HashMap::new())),
            counter: AtomicU64::new(0),
        })
    }

    /// Finalize sessions a previous process left non-terminal.
    ///
    /// Run once at boot, before the API starts serving. In-memory
    /// execution state (agent locks, the live task's channels) does not
    /// survive a restart, so an interrupted session cannot be resumed;
    /// each one is escalated to `ManualInterventionRequired` with a
    /// terminal event and a history entry, and its agents become
    /// lockable again for a fresh session.
    pub fn recover_interrupted(&self) -> Result<Vec<UpgradeSession>, SessionError> {
        let interrupted = self.ctx.store.list_active_sessions()?;
        let mut finalized = Vec::with_capacity(interrupted.len());
        for mut session in interrupted {
            warn!(
                session_id = %session.id,
                state = ?session.state,
                "finalizing session interrupted by a restart"
            );
            let mut seq = self.ctx.store.events_for_session(&session.id)?.len() as u64;
            let from = session.state;
            if session.failure.is_none() {
                session.failure = Some(FailureDetail {
                    step: "recovery".to_string(),
                    trigger: None,
                    message: "process exited mid-session".to_string(),
                });
            }
            session.outcome = Some(Outcome::Failed);
            session.transition(SessionState::ManualInterventionRequired);
            for kind in [
                SessionEventKind::StateChanged {
                    from,
                    to: SessionState::ManualInterventionRequired,
                },
                SessionEventKind::Terminal {
                    outcome: Outcome::Failed,
                    summary: format!("interrupted in {from:?} by a process restart"),
                },
            ] {
                self.ctx.store.append_event(&SessionEvent {
                    seq,
                    session_id: session.id.clone(),
                    at: epoch_secs(),
                    kind,
                })?;
                seq += 1;
            }
            self.ctx.store.append_history(&session)?;
            self.ctx.store.put_session(&session)?;
            finalized.push(session);
        }
        Ok(finalized)
    }

    /// Validate a request, lock its agents, and spawn the session task.
    ///
    /// All validation happens before any lock or store write, and the
    /// lock grab is all-or-nothing: if any target agent is busy the
    /// request is rejected with no side effect.
    pub async fn start_upgrade(
        self: &Arc<Self>,
        request: UpgradeRequest,
    ) -> Result<UpgradeSession, SessionError> {
        if request.agent_ids.is_empty() {
            return Err(SessionError::Validation(
                "at least one agent id is required".to_string(),
            ));
        }
        request
            .strategy
            .validate()
            .map_err(|e| SessionError::Validation(e.to_string()))?;
        Version::parse(&request.to_version).map_err(|e| {
            SessionError::Validation(format!(
                "invalid target version '{}': {e}",
                request.to_version
            ))
        })?;
        if self.ctx.catalog.get_version(&request.to_version)?.is_none() {
            return Err(SessionError::UnknownVersion(request.to_version));
        }

        // All agents must exist and actually need the upgrade.
        let mut from_versions = Vec::with_capacity(request.agent_ids.len());
        for agent_id in &request.agent_ids {
            let current = self.ctx.fleet.current_version(agent_id).await?;
            if current == request.to_version {
                return Err(SessionError::SameVersion {
                    agent_id: agent_id.clone(),
                    version: current,
                });
            }
            from_versions.push(current);
        }
        // Multi-agent sessions record the highest observed source version.
        let from_version = from_versions
            .iter()
            .max()
            .cloned()
            .unwrap_or_default();

        // All-or-nothing lock grab.
        {
            let mut locked = self
                .locked_agents
                .lock()
                .map_err(|_| SessionError::Cutover("lock registry poisoned".to_string()))?;
            if let Some(busy) = request.agent_ids.iter().find(|a| locked.contains(*a)) {
                return Err(SessionError::Busy(busy.clone()));
            }
            for agent_id in &request.agent_ids {
                locked.insert(agent_id.clone());
            }
        }

        let id = self.next_session_id();
        let session = UpgradeSession::new(
            &id,
            request.agent_ids.clone(),
            from_version,
            request.to_version,
            request.strategy,
        );
        if let Err(e) = self.ctx.store.put_session(&session) {
            self.release_agents(&request.agent_ids);
            return Err(e.into());
        }

        let (manual_tx, manual_rx) = watch::channel(false);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        {
            let mut live = self
                .live
                .lock()
                .map_err(|_| SessionError::Cutover("live registry poisoned".to_string()))?;
            live.insert(
                id.clone(),
                SessionHandle {
                    manual_tx,
                    events: events_tx.clone(),
                },
            );
        }

        info!(
            session_id = %id,
            agents = ?session.agent_ids,
            from = %session.from_version,
            to = %session.to_version,
            strategy = session.strategy.kind(),
            "upgrade session starting"
        );

        let manager = Arc::clone(self);
        let ctx = self.ctx.clone();
        let config = self.config.clone();
        let task_session = session.clone();
        tokio::spawn(async move {
            let finished =
                run_session(ctx, config, task_session, manual_rx, events_tx).await;
            manager.release_agents(&finished.agent_ids);
            if let Ok(mut live) = manager.live.lock() {
                live.remove(&finished.id);
            }
        });

        Ok(session)
    }

    /// Request a rollback of a running session.
    ///
    /// Idempotent: re-triggering a session that is already rolling back
    /// (or rolled back) returns its current snapshot unchanged.
    pub fn trigger_rollback(&self, session_id: &str) -> Result<UpgradeSession, SessionError> {
        let session = self
            .ctx
            .store
            .get_session(session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        match session.state {
            SessionState::RollingBack | SessionState::RolledBack => return Ok(session),
            s if s.is_terminal() => {
                return Err(SessionError::Validation(format!(
                    "session {session_id} already finished as {s:?}"
                )));
            }
            _ => {}
        }

        let live = self
            .live
            .lock()
            .map_err(|_| SessionError::Cutover("live registry poisoned".to_string()))?;
        match live.get(session_id) {
            Some(handle) => {
                // The task observes the flip at its next wait point.
                let _ = handle.manual_tx.send(true);
                info!(session_id, "manual rollback requested");
                Ok(session)
            }
            None => {
                warn!(session_id, "rollback requested for a session with no live task");
                Err(SessionError::Validation(format!(
                    "session {session_id} is not running"
                )))
            }
        }
    }

    /// Current snapshot of one session.
    pub fn get_session(&self, session_id: &str) -> Result<UpgradeSession, SessionError> {
        self.ctx
            .store
            .get_session(session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub fn list_sessions(&self) -> Result<Vec<UpgradeSession>, SessionError> {
        Ok(self.ctx.store.list_sessions()?)
    }

    pub fn list_active_sessions(&self) -> Result<Vec<UpgradeSession>, SessionError> {
        Ok(self.ctx.store.list_active_sessions()?)
    }

    /// Completed sessions for one agent, oldest first.
    pub fn history(
        &self,
        agent_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<UpgradeSession>, SessionError> {
        Ok(self.ctx.store.history_for_agent(agent_id, limit, offset)?)
    }

    /// Publish a version to the catalog so sessions can target it.
    pub fn publish_version(&self, version: &AgentVersion) -> Result<(), SessionError> {
        Version::parse(&version.version).map_err(|e| {
            SessionError::Validation(format!("invalid version '{}': {e}", version.version))
        })?;
        Ok(self.ctx.store.put_version(version)?)
    }

    pub fn list_versions(&self) -> Result<Vec<AgentVersion>, SessionError> {
        Ok(self.ctx.store.list_versions()?)
    }

    /// Replay of a session's event log plus, for live sessions, a
    /// receiver for events still to come.
    ///
    /// The receiver is subscribed before the log is read, so events that
    /// land in between appear in both; consumers dedupe on `seq`.
    pub fn subscribe(
        &self,
        session_id: &str,
    ) -> Result<(Vec<SessionEvent>, Option<broadcast::Receiver<SessionEvent>>), SessionError>
    {
        let rx = self
            .live
            .lock()
            .map_err(|_| SessionError::Cutover("live registry poisoned".to_string()))?
            .get(session_id)
            .map(|handle| handle.events.subscribe());

        let replay = self.ctx.store.events_for_session(session_id)?;
        if replay.is_empty() && rx.is_none() && self.ctx.store.get_session(session_id)?.is_none()
        {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        Ok((replay, rx))
    }

    fn release_agents(&self, agent_ids: &[AgentId]) {
        if let Ok(mut locked) = self.locked_agents.lock() {
            for agent_id in agent_ids {
                locked.remove(agent_id);
            }
        }
    }

    fn next_session_id(&self) -> SessionId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("session-{}-{n}", epoch_secs())
    }
}
