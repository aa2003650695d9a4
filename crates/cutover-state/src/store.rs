//! StateStore — redb-backed persistence for the upgrade orchestrator.
//!
//! Provides typed operations over sessions, the append-only session event
//! log, upgrade history, backup records, and the local version catalog.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
///
/// Clones share one database handle; redb serializes writers, so
/// concurrent appends from parallel sessions are safe.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        txn.open_table(SESSION_EVENTS).map_err(map_err!(Table))?;
        txn.open_table(HISTORY).map_err(map_err!(Table))?;
        txn.open_table(BACKUPS).map_err(map_err!(Table))?;
        txn.open_table(VERSIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Insert or update a session snapshot.
    pub fn put_session(&self, session: &UpgradeSession) -> StateResult<()> {
        let value = serde_json::to_vec(session).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            table
                .insert(session.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a session by id.
    pub fn get_session(&self, id: &str) -> StateResult<Option<UpgradeSession>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let session: UpgradeSession =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// List all session snapshots.
    pub fn list_sessions(&self) -> StateResult<Vec<UpgradeSession>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let session: UpgradeSession =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(session);
        }
        Ok(results)
    }

    /// List sessions that have not reached a terminal state.
    pub fn list_active_sessions(&self) -> StateResult<Vec<UpgradeSession>> {
        Ok(self
            .list_sessions()?
            .into_iter()
            .filter(|s| !s.is_terminal())
            .collect())
    }

    // ── Event log ──────────────────────────────────────────────────

    /// Append one event to a session's log.
    ///
    /// Keys embed a zero-padded sequence number so replay order equals
    /// redb's sorted iteration order.
    pub fn append_event(&self, event: &SessionEvent) -> StateResult<()> {
        let key = event_key(&event.session_id, event.seq);
        let value = serde_json::to_vec(event).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SESSION_EVENTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// All events for one session, in append order.
    pub fn events_for_session(&self, session_id: &str) -> StateResult<Vec<SessionEvent>> {
        let prefix = format!("{session_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSION_EVENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let event: SessionEvent =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(event);
            }
        }
        Ok(results)
    }

    // ── History ────────────────────────────────────────────────────

    /// Append a terminal session to history, once per target agent.
    ///
    /// Refuses non-terminal sessions; this is the exactly-once write at
    /// the end of a session's life.
    pub fn append_history(&self, session: &UpgradeSession) -> StateResult<()> {
        if !session.is_terminal() {
            return Err(StateError::NotTerminal(session.id.clone()));
        }
        let finished = session.finished_at.unwrap_or(session.updated_at);
        let value = serde_json::to_vec(session).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(HISTORY).map_err(map_err!(Table))?;
            for agent_id in &session.agent_ids {
                let key = history_key(agent_id, finished, &session.id);
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(session_id = %session.id, "session appended to history");
        Ok(())
    }

    /// Paginated history for one agent, oldest first.
    pub fn history_for_agent(
        &self,
        agent_id: &str,
        limit: usize,
        offset: usize,
    ) -> StateResult<Vec<UpgradeSession>> {
        let prefix = format!("{agent_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HISTORY).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        let mut skipped = 0usize;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            if results.len() >= limit {
                break;
            }
            let session: UpgradeSession =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(session);
        }
        Ok(results)
    }

    // ── Backups ────────────────────────────────────────────────────

    /// Insert or update a backup record.
    pub fn put_backup(&self, record: &BackupRecord) -> StateResult<()> {
        let key = format!("{}:{}", record.agent_id, record.digest);
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(BACKUPS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(agent_id = %record.agent_id, digest = %record.digest, "backup record stored");
        Ok(())
    }

    /// Get a backup record by agent and digest.
    pub fn get_backup(&self, agent_id: &str, digest: &str) -> StateResult<Option<BackupRecord>> {
        let key = format!("{agent_id}:{digest}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BACKUPS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: BackupRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// All backup records for one agent.
    pub fn list_backups_for_agent(&self, agent_id: &str) -> StateResult<Vec<BackupRecord>> {
        let prefix = format!("{agent_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BACKUPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let record: BackupRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        Ok(results)
    }

    // ── Versions ───────────────────────────────────────────────────

    /// Insert or update a catalog version.
    pub fn put_version(&self, version: &AgentVersion) -> StateResult<()> {
        let value = serde_json::to_vec(version).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
            table
                .insert(version.version.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a catalog version by version string.
    pub fn get_version(&self, version: &str) -> StateResult<Option<AgentVersion>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
        match table.get(version).map_err(map_err!(Read))? {
            Some(guard) => {
                let v: AgentVersion =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    /// List all catalog versions.
    pub fn list_versions(&self) -> StateResult<Vec<AgentVersion>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let v: AgentVersion =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(v);
        }
        Ok(results)
    }
}

fn event_key(session_id: &str, seq: u64) -> String {
    format!("{session_id}:{seq:08}")
}

fn history_key(agent_id: &str, finished_at: u64, session_id: &str) -> String {
    format!("{agent_id}:{finished_at:012}:{session_id}")
}
