//! Decomposition engine -- goal to team epics, team epic to leaf tasks.

pub mod engine;
pub mod plan_format;
pub mod validate;

pub use engine::{decompose_epic, decompose_goal, DecomposeOutcome};
