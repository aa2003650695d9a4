//! cutover-strategy — deployment strategy controllers.
//!
//! Each strategy (blue-green, canary, rolling) implements the common
//! `StrategyController` contract: `plan` an ordered step list, `advance`
//! past a step given the latest health snapshot, and `reverse` the
//! completed steps for rollback. Controllers own only the cutover
//! mechanics; health evaluation and timing live with the executor.
//!
//! # Components
//!
//! - **`plan`** — `PlannedStep`, `CutoverAction`, `StepOutcome`
//! - **`controllers`** — the trait and its three implementations

pub mod controllers;
pub mod plan;

pub use controllers::{
    BlueGreenController, CanaryController, RollingController, StrategyController, controller_for,
};
pub use plan::{CutoverAction, PlannedStep, StepOutcome};
