//! cutover-state — persistent state for the upgrade orchestrator.
//!
//! Domain types (versions, strategies, health, sessions, events) plus a
//! redb-backed store. Session progress is persisted as an append-only
//! event log so a crash mid-upgrade can be replayed rather than trusting
//! a possibly-stale snapshot; completed sessions land in an immutable
//! history table.
//!
//! # Components
//!
//! - **`types`** — serializable domain types
//! - **`tables`** — redb table definitions
//! - **`store`** — typed CRUD + append-only event/history operations
//! - **`error`** — `StateError` / `StateResult`

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
