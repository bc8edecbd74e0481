//! Core domain types and pure logic for job synchronization.
//!
//! Everything in this crate is transport-agnostic: job state, the
//! sticky-terminal merge rule and the in-memory store that both the
//! streaming path and the polling path write into.

pub mod job;
pub mod job_events;
pub mod merge;
pub mod store;
pub mod types;
