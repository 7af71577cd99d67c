//! Core data models module

pub mod job;

pub use job::{BatchJob, BatchStatus, JobParameters, ResourceQuantities};
