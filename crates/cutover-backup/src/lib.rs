//! cutover-backup — durable point-in-time captures for rollback.
//!
//! Backups are content-addressed: the blob lives at `<root>/<sha256>`,
//! so repeated identical backups are idempotent and cheap. A backup is
//! the precondition for a session continuing past its Backup phase and
//! the sole input to a Rolling rollback. Restore failures are fatal and
//! escalate to manual intervention; they are never retried in a loop.

pub mod manager;

pub use manager::{BackupError, BackupManager, FileSnapshotSource, SnapshotSource};
