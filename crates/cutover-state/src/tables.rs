//! redb table definitions for the Cutover state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys are `{parent}:{child}` with zero-padded numeric
//! components so redb's sorted iteration yields chronological order.

use redb::TableDefinition;

/// Live session snapshots keyed by `{session_id}`.
pub const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// Append-only session event log keyed by `{session_id}:{seq:08}`.
pub const SESSION_EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("session_events");

/// Terminal sessions keyed by `{agent_id}:{finished_at:012}:{session_id}`.
pub const HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("history");

/// Backup records keyed by `{agent_id}:{digest}`.
pub const BACKUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("backups");

/// Agent version catalog entries keyed by `{version}`.
pub const VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("versions");
