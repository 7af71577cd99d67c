//! Cluster Adapter: manifest rendering plus Kubernetes CRUD.

pub mod client;
pub mod manifests;

pub use client::{ClusterAdapter, ClusterError, JobObservation, K8sClusterAdapter};
