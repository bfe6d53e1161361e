use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Api;
use kube::Client;
use kube::Config;
use serde_json::json;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::annotations::NodeLockValue;
use super::annotations::ASSIGNED_NODE_ANNOTATION;
use super::annotations::BIND_PHASE_ALLOCATING;
use super::annotations::BIND_PHASE_ANNOTATION;
use super::annotations::BIND_PHASE_FAILED;
use super::annotations::BIND_PHASE_SUCCESS;
use super::annotations::BIND_TIME_ANNOTATION;
use super::annotations::NODE_LOCK_ANNOTATION;
use super::ClusterClient;
use super::KubernetesError;
use super::PendingWorkload;

const MAX_LOCK_RETRY: usize = 5;
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// [`ClusterClient`] talking to the Kubernetes API server.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from an explicit kubeconfig, or from the in-cluster /
    /// default configuration when none is given.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::ConnectionFailed`] if no usable configuration is found
    pub async fn connect(kubeconfig: Option<PathBuf>) -> Result<Self, Report<KubernetesError>> {
        let Some(path) = kubeconfig else {
            let client = Client::try_default().await.change_context(
                KubernetesError::ConnectionFailed {
                    message: "no in-cluster or default kubeconfig".to_string(),
                },
            )?;
            return Ok(Self::new(client));
        };

        let connection_failed = || KubernetesError::ConnectionFailed {
            message: format!("kubeconfig {}", path.display()),
        };
        let kubeconfig = Kubeconfig::read_from(&path).change_context_lazy(connection_failed)?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .change_context_lazy(connection_failed)?;
        let client = Client::try_from(config).change_context_lazy(connection_failed)?;
        Ok(Self::new(client))
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    async fn get_node(&self, node_name: &str) -> Result<Node, Report<KubernetesError>> {
        self.nodes()
            .get(node_name)
            .await
            .change_context(KubernetesError::RequestFailed {
                message: format!("get node {node_name}"),
            })
    }

    async fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PendingWorkload, Report<KubernetesError>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = api.get(name).await.map_err(|e| {
            Report::new(KubernetesError::PodNotFound {
                pod_name: name.to_string(),
                namespace: namespace.to_string(),
            })
            .attach_printable(format!("Kubernetes API error: {e}"))
        })?;
        Ok(workload_from_pod(pod))
    }

    /// Fallback when the lock doesn't name its pod: the oldest pod bound to
    /// this node that the scheduler marked as allocating.
    async fn find_allocating_pod(
        &self,
        node_name: &str,
    ) -> Result<PendingWorkload, Report<KubernetesError>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        let pods = api
            .list(&params)
            .await
            .change_context(KubernetesError::RequestFailed {
                message: format!("list pods on node {node_name}"),
            })?;

        pods.items
            .into_iter()
            .map(workload_from_pod)
            .filter(|w| is_allocating_on(w, node_name))
            .min_by_key(|w| {
                w.annotations
                    .get(BIND_TIME_ANNOTATION)
                    .and_then(|t| t.parse::<i64>().ok())
                    .unwrap_or(i64::MAX)
            })
            .ok_or_else(|| {
                Report::new(KubernetesError::NoPendingPod {
                    node_name: node_name.to_string(),
                })
            })
    }

    async fn set_bind_phase(
        &self,
        workload: &PendingWorkload,
        success: bool,
    ) -> Result<(), Report<KubernetesError>> {
        let phase = if success {
            BIND_PHASE_SUCCESS
        } else {
            BIND_PHASE_FAILED
        };
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &workload.namespace);
        let patch = json!({ "metadata": { "annotations": { BIND_PHASE_ANNOTATION: phase } } });
        api.patch(&workload.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .change_context(KubernetesError::RequestFailed {
                message: format!("patch bind phase of pod {workload}"),
            })?;
        debug!("pod {workload} bind phase set to {phase}");
        Ok(())
    }

    /// One attempt at removing the lock. `Ok(true)` when the lock is gone,
    /// `Ok(false)` when it belongs to someone else and was left alone.
    async fn try_release_lock(
        &self,
        node_name: &str,
        lock_name: &str,
        workload: Option<&PendingWorkload>,
    ) -> Result<bool, Report<KubernetesError>> {
        let node = self.get_node(node_name).await?;
        let Some(value) = node
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(lock_name))
        else {
            debug!("node {node_name} is not locked");
            return Ok(true);
        };

        if let Some(w) = workload {
            if !NodeLockValue::parse(value).is_held_for(&w.namespace, &w.name) {
                warn!("lock {lock_name} on node {node_name} is held for another pod: {value}");
                return Ok(false);
            }
        }

        // resourceVersion turns the merge patch into a compare-and-swap
        let patch = json!({
            "metadata": {
                "resourceVersion": node.metadata.resource_version,
                "annotations": { lock_name: null },
            }
        });
        self.nodes()
            .patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .change_context(KubernetesError::RequestFailed {
                message: format!("remove {lock_name} from node {node_name}"),
            })?;
        Ok(true)
    }
}

fn workload_from_pod(pod: Pod) -> PendingWorkload {
    let metadata = pod.metadata;
    PendingWorkload {
        namespace: metadata.namespace.unwrap_or_else(|| "default".to_string()),
        name: metadata.name.unwrap_or_default(),
        annotations: metadata.annotations.unwrap_or_default(),
    }
}

fn is_allocating_on(workload: &PendingWorkload, node_name: &str) -> bool {
    let annotation = |key: &str| workload.annotations.get(key).map(String::as_str);
    annotation(BIND_PHASE_ANNOTATION) == Some(BIND_PHASE_ALLOCATING)
        && annotation(ASSIGNED_NODE_ANNOTATION) == Some(node_name)
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn pending_workload(
        &self,
        node_name: &str,
    ) -> Result<PendingWorkload, Report<KubernetesError>> {
        let node = self.get_node(node_name).await?;
        let owner = node
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(NODE_LOCK_ANNOTATION))
            .and_then(|value| NodeLockValue::parse(value).owner);

        match owner {
            Some((namespace, name)) => self.get_pod(&namespace, &name).await,
            None => self.find_allocating_pod(node_name).await,
        }
    }

    async fn release_node_lock(
        &self,
        node_name: &str,
        lock_name: &str,
        workload: Option<&PendingWorkload>,
        success: bool,
    ) -> Result<(), Report<KubernetesError>> {
        if let Some(w) = workload {
            // the lock still has to go even if the pod can't be updated
            if let Err(e) = self.set_bind_phase(w, success).await {
                warn!("failed to record allocation outcome on pod {w}: {e:?}");
            }
        }

        let mut last_err = None;
        for attempt in 1..=MAX_LOCK_RETRY {
            match self.try_release_lock(node_name, lock_name, workload).await {
                Ok(_) => {
                    info!(success, "node {node_name} lock {lock_name} released");
                    return Ok(());
                }
                Err(e) => {
                    debug!("release attempt {attempt} of {lock_name} on {node_name} failed: {e:?}");
                    last_err = Some(e);
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
            }
        }

        let report = Report::new(KubernetesError::LockReleaseFailed {
            node_name: node_name.to_string(),
            lock_name: lock_name.to_string(),
        });
        Err(match last_err {
            Some(e) => report.attach_printable(format!("last error: {e:?}")),
            None => report,
        })
    }

    async fn patch_node_annotations(
        &self,
        node_name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Report<KubernetesError>> {
        let patch = json!({ "metadata": { "annotations": annotations } });
        self.nodes()
            .patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .change_context(KubernetesError::RequestFailed {
                message: format!("patch annotations of node {node_name}"),
            })?;
        debug!("patch node {node_name} annotations: {annotations:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(annotations: &[(&str, &str)]) -> PendingWorkload {
        PendingWorkload {
            namespace: "default".to_string(),
            name: "trainer-0".to_string(),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn allocating_pod_must_target_this_node() {
        let pod = workload(&[
            (BIND_PHASE_ANNOTATION, BIND_PHASE_ALLOCATING),
            (ASSIGNED_NODE_ANNOTATION, "node-a"),
        ]);
        assert!(is_allocating_on(&pod, "node-a"));
        assert!(!is_allocating_on(&pod, "node-b"));
    }

    #[test]
    fn finished_pod_is_not_pending() {
        let pod = workload(&[
            (BIND_PHASE_ANNOTATION, BIND_PHASE_SUCCESS),
            (ASSIGNED_NODE_ANNOTATION, "node-a"),
        ]);
        assert!(!is_allocating_on(&pod, "node-a"));
        assert!(!is_allocating_on(&workload(&[]), "node-a"));
    }

    #[test]
    fn workload_from_pod_defaults_namespace() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("trainer-0".to_string());
        let w = workload_from_pod(pod);
        assert_eq!(w.namespace, "default");
        assert_eq!(w.name, "trainer-0");
        assert!(w.annotations.is_empty());
    }
}
