//! Persistent store for the hollon control plane.
//!
//! Entity models, typed query modules, connection pool and migration
//! management. The store is the single source of truth and the sole
//! synchronization point for logical state: all status transitions go
//! through optimistic CAS queries, and the task claim primitive is the
//! one serializable critical section of the whole system.

pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod queries;
