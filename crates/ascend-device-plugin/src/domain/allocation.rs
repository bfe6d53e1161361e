use core::error::Error;
use std::collections::HashMap;
use std::sync::Arc;

use error_stack::Report;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::inventory::DeviceInventory;
use crate::infrastructure::k8s::annotations::NODE_LOCK_ANNOTATION;
use crate::infrastructure::k8s::ClusterClient;
use crate::infrastructure::k8s::PendingWorkload;

pub const NODE_LOCK_NAME: &str = NODE_LOCK_ANNOTATION;
pub const VISIBLE_DEVICES_ENV: &str = "ASCEND_VISIBLE_DEVICES";
pub const VNPU_SPECS_ENV: &str = "ASCEND_VNPU_SPECS";

#[derive(Debug, derive_more::Display)]
pub enum AllocationError {
    #[display("No pod pending device allocation on node {node_name}")]
    NoPendingWorkload { node_name: String },
    #[display("Annotation {key} is missing")]
    MissingAnnotation { key: String },
    #[display("Annotation {key} is malformed")]
    MalformedAnnotation { key: String },
    #[display("Unknown device uuid {uuid}")]
    UnknownDeviceUuid { uuid: String },
    #[display("Allocation request names no device")]
    EmptyAllocationRequest,
}

impl Error for AllocationError {}

/// One device assignment written by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationEntry {
    #[serde(rename = "UUID", alias = "uuid", default)]
    pub uuid: String,
    #[serde(default)]
    pub temp: String,
}

/// What the container runtime needs to expose the assigned devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationDirectives {
    /// Physical IDs, comma separated, in assignment order
    pub visible_devices: String,
    pub vnpu_spec: Option<String>,
}

impl AllocationDirectives {
    pub fn envs(&self) -> HashMap<String, String> {
        let mut envs = HashMap::from([(
            VISIBLE_DEVICES_ENV.to_string(),
            self.visible_devices.clone(),
        )]);
        if let Some(spec) = &self.vnpu_spec {
            envs.insert(VNPU_SPECS_ENV.to_string(), spec.clone());
        }
        envs
    }
}

/// Turns the scheduler's decision for the pending pod into runtime
/// directives and hands the node lock back.
pub struct AllocationCoordinator {
    node_name: String,
    allocation_annotation: String,
    inventory: Arc<DeviceInventory>,
    cluster: Arc<dyn ClusterClient>,
}

impl std::fmt::Debug for AllocationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationCoordinator")
            .field("node_name", &self.node_name)
            .field("allocation_annotation", &self.allocation_annotation)
            .finish_non_exhaustive()
    }
}

impl AllocationCoordinator {
    pub fn new(
        node_name: String,
        allocation_annotation: String,
        inventory: Arc<DeviceInventory>,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        Self {
            node_name,
            allocation_annotation,
            inventory,
            cluster,
        }
    }

    /// Resolve the pending pod's assignment.
    ///
    /// The node lock is released exactly once on every path, flagged with
    /// whether the assignment resolved. A failed release is only logged.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::NoPendingWorkload`] if no pod waits on this node
    /// - any error of [`AllocationCoordinator::resolve`]
    #[tracing::instrument(skip(self), fields(node = %self.node_name))]
    pub async fn allocate(&self) -> Result<AllocationDirectives, Report<AllocationError>> {
        let workload = match self.cluster.pending_workload(&self.node_name).await {
            Ok(workload) => workload,
            Err(e) => {
                error!("failed to find pending pod: {e:?}");
                self.release(None, false).await;
                return Err(e.change_context(AllocationError::NoPendingWorkload {
                    node_name: self.node_name.clone(),
                }));
            }
        };
        debug!("pending pod {workload}");

        let result = self.resolve(&workload);
        self.release(Some(&workload), result.is_ok()).await;

        match &result {
            Ok(directives) => info!(
                "allocated devices {} to {workload}",
                directives.visible_devices
            ),
            Err(e) => error!("failed to allocate devices to {workload}: {e:?}"),
        }
        result
    }

    /// Map the allocation record on `workload` to directives.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::MissingAnnotation`] if the record is absent
    /// - [`AllocationError::MalformedAnnotation`] if it isn't valid JSON
    /// - [`AllocationError::EmptyAllocationRequest`] if it names no device
    /// - [`AllocationError::UnknownDeviceUuid`] for a uuid not in inventory
    pub fn resolve(
        &self,
        workload: &PendingWorkload,
    ) -> Result<AllocationDirectives, Report<AllocationError>> {
        let key = &self.allocation_annotation;
        let raw = workload.annotations.get(key).ok_or_else(|| {
            Report::new(AllocationError::MissingAnnotation { key: key.clone() })
        })?;

        let entries: Vec<AllocationEntry> = serde_json::from_str(raw).map_err(|e| {
            Report::new(AllocationError::MalformedAnnotation { key: key.clone() })
                .attach_printable(e.to_string())
        })?;

        let mut physical_ids = Vec::with_capacity(entries.len());
        let mut vnpu_spec = None;
        for entry in entries.iter().filter(|e| !e.uuid.is_empty()) {
            let device = self.inventory.lookup_by_uuid(&entry.uuid).ok_or_else(|| {
                Report::new(AllocationError::UnknownDeviceUuid {
                    uuid: entry.uuid.clone(),
                })
            })?;
            physical_ids.push(device.physical_id.to_string());
            if vnpu_spec.is_none() && !entry.temp.is_empty() {
                vnpu_spec = Some(entry.temp.clone());
            }
        }

        if physical_ids.is_empty() {
            return Err(Report::new(AllocationError::EmptyAllocationRequest));
        }

        Ok(AllocationDirectives {
            visible_devices: physical_ids.join(","),
            vnpu_spec,
        })
    }

    async fn release(&self, workload: Option<&PendingWorkload>, success: bool) {
        if let Err(e) = self
            .cluster
            .release_node_lock(&self.node_name, NODE_LOCK_NAME, workload, success)
            .await
        {
            error!("failed to release lock {NODE_LOCK_NAME}: {e:?}");
        }
    }
}
