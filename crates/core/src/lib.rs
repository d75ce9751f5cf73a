//! `herald-core`: domain foundation for scheduled social posts.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! job identity, destinations, the status state machine and the claimed job row.

pub mod destination;
pub mod error;
pub mod id;
pub mod job;

pub use destination::Destination;
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{Job, JobStatus};
