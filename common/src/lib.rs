//! Shared types for the batch job orchestrator.
//!
//! This crate holds only the domain model and error kinds that are shared
//! between the HTTP facade, the lifecycle coordinator, and the reconciler.
//! Nothing here talks to Kubernetes, object storage, or a database directly.

pub mod error;
pub mod models;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use models::{BatchJob, BatchStatus, JobParameters, ResourceQuantities};
