//! Kubernetes integration module.
//!
//! This module talks to the API server on behalf of the plugin: it publishes
//! the node's device inventory, resolves the pod waiting for devices and
//! releases the node lock the scheduler took for it.
//!
//! The main components are:
//! - [`ClusterClient`]: the operations the plugin needs from the cluster
//! - [`KubeClusterClient`]: the API server backed implementation
//! - [`annotations`]: annotation keys and payload codecs

pub mod annotations;
pub mod client;
pub mod types;

use std::collections::BTreeMap;

use async_trait::async_trait;
use error_stack::Report;

pub use client::KubeClusterClient;
pub use types::KubernetesError;
pub use types::PendingWorkload;

/// Cluster operations used by the allocation path and the announce task.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Resolve the pod currently waiting for device assignment on `node_name`.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::NoPendingPod`] if no such pod exists
    async fn pending_workload(
        &self,
        node_name: &str,
    ) -> Result<PendingWorkload, Report<KubernetesError>>;

    /// Release the node lock `lock_name` taken for `workload` and record the
    /// allocation outcome on the pod.
    ///
    /// Without a workload the lock is released unconditionally.
    async fn release_node_lock(
        &self,
        node_name: &str,
        lock_name: &str,
        workload: Option<&PendingWorkload>,
        success: bool,
    ) -> Result<(), Report<KubernetesError>>;

    /// Merge `annotations` into the node's annotations.
    async fn patch_node_annotations(
        &self,
        node_name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Report<KubernetesError>>;
}
