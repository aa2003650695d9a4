//! cutover-session — the upgrade orchestrator core.
//!
//! One `UpgradeSession` runs as one independent tokio task driving the
//! `Plan → Backup → Deploy → Test → Cutover → Verify` state machine.
//! Sessions for different agents execute fully in parallel; at most one
//! active session per agent is enforced by an exclusive lock held from
//! Plan until a terminal state. The rollback controller observes health
//! concurrently with every timed wait, so a trigger interrupts a hold
//! instead of waiting it out.
//!
//! # Components
//!
//! - **`manager`** — session lifecycle, locks, event fanout, manual triggers
//! - **`executor`** — the per-session state machine task
//! - **`rollback`** — trigger evaluation (first one wins)
//! - **`fleet`** — actuator boundary (`Fleet` trait, `SimFleet`)
//! - **`catalog`** — version catalog boundary
//! - **`notify`** — fire-and-forget terminal notifications
//! - **`error`** — `SessionError`

pub mod catalog;
pub mod error;
pub mod executor;
pub mod fleet;
pub mod manager;
pub mod notify;
pub mod rollback;

pub use catalog::{StoreCatalog, VersionCatalog};
pub use error::SessionError;
pub use executor::{OrchestratorConfig, SessionContext};
pub use fleet::{Fleet, FleetError, SimFleet};
pub use manager::{SessionManager, UpgradeRequest};
pub use notify::{LogSink, NotificationSink, TerminalNotice};
