use core::error::Error;
use std::collections::BTreeMap;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Kubernetes API request failed: {message}")]
    RequestFailed { message: String },
    #[display("Failed to parse annotations: {message}")]
    AnnotationParseError { message: String },
    #[display("Pod not found: {pod_name} in namespace {namespace}")]
    PodNotFound { pod_name: String, namespace: String },
    #[display("No pod waiting for device allocation on node {node_name}")]
    NoPendingPod { node_name: String },
    #[display("Failed to release lock {lock_name} on node {node_name}")]
    LockReleaseFailed { node_name: String, lock_name: String },
}

impl Error for KubernetesError {}

/// A pod that was bound to this node and waits for its devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingWorkload {
    pub namespace: String,
    pub name: String,
    pub annotations: BTreeMap<String, String>,
}

impl std::fmt::Display for PendingWorkload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
