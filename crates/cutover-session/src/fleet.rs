//! The fleet actuator boundary.
//!
//! Traffic shaping and instance lifecycle are external systems; the
//! orchestrator drives them through the `Fleet` trait. `SimFleet` is the
//! in-process implementation used by tests and dry-run mode: it records
//! every action and tracks per-instance versions and the new-version
//! traffic share.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

/// Errors from the fleet actuator.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("agent not found: {0}")]
    NotFound(String),

    #[error("actuation failed: {0}")]
    Actuation(String),
}

type FleetFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, FleetError>> + Send + 'a>>;

/// Actuator interface for instances and traffic, one agent at a time.
pub trait Fleet: Send + Sync {
    /// Number of live instances serving this agent.
    fn instance_count<'a>(&'a self, agent_id: &'a str) -> FleetFuture<'a, u32>;

    /// Version the agent's live fleet is currently running.
    fn current_version<'a>(&'a self, agent_id: &'a str) -> FleetFuture<'a, String>;

    /// Bring up `count` instances of `version` without shifting traffic.
    fn provision<'a>(
        &'a self,
        agent_id: &'a str,
        version: &'a str,
        count: u32,
    ) -> FleetFuture<'a, ()>;

    /// Route `percent` of live traffic to the most recently provisioned version.
    fn shift_traffic<'a>(&'a self, agent_id: &'a str, percent: u8) -> FleetFuture<'a, ()>;

    /// Replace instances `[start_index, start_index + count)` with `version`.
    fn replace_batch<'a>(
        &'a self,
        agent_id: &'a str,
        start_index: u32,
        count: u32,
        version: &'a str,
    ) -> FleetFuture<'a, ()>;

    /// Tear down the standby fleet running `version`.
    fn decommission<'a>(&'a self, agent_id: &'a str, version: &'a str) -> FleetFuture<'a, ()>;
}

/// Snapshot of one simulated agent.
#[derive(Debug, Clone)]
pub struct SimAgent {
    /// Version each live instance runs, by index.
    pub instance_versions: Vec<String>,
    /// Versions with a provisioned (standby or live) fleet.
    pub provisioned: Vec<String>,
    /// Share of traffic currently routed to the newest provisioned version.
    pub new_traffic_pct: u8,
}

struct SimInner {
    agents: HashMap<String, SimAgent>,
    actions: Vec<String>,
    /// Action-name substring that should fail once, for fault injection.
    fail_matching: Option<String>,
}

/// In-process fleet for tests and dry-run mode.
pub struct SimFleet {
    inner: Mutex<SimInner>,
}

impl SimFleet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SimInner {
                agents: HashMap::new(),
                actions: Vec::new(),
                fail_matching: None,
            }),
        })
    }

    /// Register an agent running `version` on `instances` instances.
    pub fn register(&self, agent_id: &str, version: &str, instances: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.agents.insert(
            agent_id.to_string(),
            SimAgent {
                instance_versions: vec![version.to_string(); instances as usize],
                provisioned: vec![version.to_string()],
                new_traffic_pct: 0,
            },
        );
    }

    /// Fail the next action whose description contains `substr`.
    pub fn fail_on(&self, substr: &str) {
        self.inner.lock().unwrap().fail_matching = Some(substr.to_string());
    }

    /// Every action performed so far, in order.
    pub fn actions(&self) -> Vec<String> {
        self.inner.lock().unwrap().actions.clone()
    }

    pub fn agent(&self, agent_id: &str) -> Option<SimAgent> {
        self.inner.lock().unwrap().agents.get(agent_id).cloned()
    }

    pub fn traffic_percent(&self, agent_id: &str) -> u8 {
        self.agent(agent_id).map(|a| a.new_traffic_pct).unwrap_or(0)
    }

    pub fn instance_versions(&self, agent_id: &str) -> Vec<String> {
        self.agent(agent_id)
            .map(|a| a.instance_versions)
            .unwrap_or_default()
    }

    fn record(&self, action: String) -> Result<(), FleetError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pattern) = &inner.fail_matching {
            if action.contains(pattern.as_str()) {
                let pattern = pattern.clone();
                inner.fail_matching = None;
                return Err(FleetError::Actuation(format!(
                    "injected failure on '{pattern}'"
                )));
            }
        }
        debug!(%action, "sim fleet action");
        inner.actions.push(action);
        Ok(())
    }
}

impl Fleet for SimFleet {
    fn instance_count<'a>(&'a self, agent_id: &'a str) -> FleetFuture<'a, u32> {
        Box::pin(async move {
            self.agent(agent_id)
                .map(|a| a.instance_versions.len() as u32)
                .ok_or_else(|| FleetError::NotFound(agent_id.to_string()))
        })
    }

    fn current_version<'a>(&'a self, agent_id: &'a str) -> FleetFuture<'a, String> {
        Box::pin(async move {
            self.agent(agent_id)
                .and_then(|a| a.instance_versions.first().cloned())
                .ok_or_else(|| FleetError::NotFound(agent_id.to_string()))
        })
    }

    fn provision<'a>(
        &'a self,
        agent_id: &'a str,
        version: &'a str,
        count: u32,
    ) -> FleetFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("provision {agent_id} {version} x{count}"))?;
            let mut inner = self.inner.lock().unwrap();
            let agent = inner
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| FleetError::NotFound(agent_id.to_string()))?;
            if !agent.provisioned.contains(&version.to_string()) {
                agent.provisioned.push(version.to_string());
            }
            Ok(())
        })
    }

    fn shift_traffic<'a>(&'a self, agent_id: &'a str, percent: u8) -> FleetFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("shift_traffic {agent_id} {percent}%"))?;
            let mut inner = self.inner.lock().unwrap();
            let agent = inner
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| FleetError::NotFound(agent_id.to_string()))?;
            agent.new_traffic_pct = percent;
            Ok(())
        })
    }

    fn replace_batch<'a>(
        &'a self,
        agent_id: &'a str,
        start_index: u32,
        count: u32,
        version: &'a str,
    ) -> FleetFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!(
                "replace_batch {agent_id} [{start_index}..{}) -> {version}",
                start_index + count
            ))?;
            let mut inner = self.inner.lock().unwrap();
            let agent = inner
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| FleetError::NotFound(agent_id.to_string()))?;
            for i in start_index..(start_index + count) {
                if let Some(slot) = agent.instance_versions.get_mut(i as usize) {
                    *slot = version.to_string();
                }
            }
            Ok(())
        })
    }

    fn decommission<'a>(&'a self, agent_id: &'a str, version: &'a str) -> FleetFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("decommission {agent_id} {version}"))?;
            let mut inner = self.inner.lock().unwrap();
            let agent = inner
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| FleetError::NotFound(agent_id.to_string()))?;
            agent.provisioned.retain(|v| v != version);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_query() {
        let fleet = SimFleet::new();
        fleet.register("agent-1", "1.0.0", 3);

        assert_eq!(fleet.instance_count("agent-1").await.unwrap(), 3);
        assert_eq!(fleet.current_version("agent-1").await.unwrap(), "1.0.0");
        assert!(fleet.instance_count("agent-9").await.is_err());
    }

    #[tokio::test]
    async fn provision_adds_standby_fleet() {
        let fleet = SimFleet::new();
        fleet.register("agent-1", "1.0.0", 2);
        fleet.provision("agent-1", "1.1.0", 2).await.unwrap();

        let agent = fleet.agent("agent-1").unwrap();
        assert_eq!(agent.provisioned, vec!["1.0.0", "1.1.0"]);
        // Provisioning shifts no traffic.
        assert_eq!(agent.new_traffic_pct, 0);
    }

    #[tokio::test]
    async fn replace_batch_updates_instance_versions() {
        let fleet = SimFleet::new();
        fleet.register("agent-1", "1.0.0", 4);
        fleet
            .replace_batch("agent-1", 1, 2, "1.1.0")
            .await
            .unwrap();

        assert_eq!(
            fleet.instance_versions("agent-1"),
            vec!["1.0.0", "1.1.0", "1.1.0", "1.0.0"]
        );
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let fleet = SimFleet::new();
        fleet.register("agent-1", "1.0.0", 2);
        fleet.fail_on("shift_traffic");

        assert!(fleet.shift_traffic("agent-1", 50).await.is_err());
        assert!(fleet.shift_traffic("agent-1", 50).await.is_ok());
        assert_eq!(fleet.traffic_percent("agent-1"), 50);
    }

    #[tokio::test]
    async fn decommission_removes_standby() {
        let fleet = SimFleet::new();
        fleet.register("agent-1", "1.0.0", 2);
        fleet.provision("agent-1", "1.1.0", 2).await.unwrap();
        fleet.decommission("agent-1", "1.0.0").await.unwrap();

        assert_eq!(fleet.agent("agent-1").unwrap().provisioned, vec!["1.1.0"]);
    }
}
