//! cutover-health — health probing for upgrade verification.
//!
//! Runs a fixed battery of checks (API reachability, dependency
//! connectivity, resource saturation, error rate) against a running agent
//! and folds the results into a `HealthSnapshot`. Each check has an
//! independent timeout; a timed-out check is recorded as `fail` with
//! message "timeout" rather than being skipped — absence of a result is
//! never interpreted as a pass.
//!
//! # Components
//!
//! - **`checker`** — `CheckRunner` trait + HTTP probe implementation
//! - **`prober`** — battery execution, retry policy, baseline helpers

pub mod checker;
pub mod prober;

pub use checker::{CheckFuture, CheckKind, CheckRunner, HttpCheckRunner, ProbeError};
pub use prober::{HealthProber, latency_increase_pct};
