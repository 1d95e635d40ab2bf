//! Typed query modules, one per table family.

pub mod agents;
pub mod change_sets;
pub mod escalations;
pub mod executions;
pub mod goals;
pub mod knowledge;
pub mod orgs;
pub mod projects;
pub mod roles;
pub mod tasks;
pub mod teams;
