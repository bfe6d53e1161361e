use std::pin::Pin;
use std::sync::Arc;

use error_stack::Report;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::api;
use super::api::device_plugin_server::DevicePlugin;
use super::api::AllocateRequest;
use super::api::AllocateResponse;
use super::api::ContainerAllocateResponse;
use super::api::DevicePluginOptions;
use super::api::Empty;
use super::api::ListAndWatchResponse;
use super::api::PreStartContainerRequest;
use super::api::PreStartContainerResponse;
use super::api::PreferredAllocationRequest;
use super::api::PreferredAllocationResponse;
use crate::domain::allocation::AllocationCoordinator;
use crate::domain::allocation::AllocationError;
use crate::domain::inventory::DeviceInventory;
use crate::domain::inventory::PhysicalDevice;

pub const HEALTHY: &str = "Healthy";
pub const UNHEALTHY: &str = "Unhealthy";

/// Expand physical devices into the slots kubelet schedules, `{uuid}-{i}`.
pub fn slot_devices(devices: &[PhysicalDevice], slots_per_device: usize) -> Vec<api::Device> {
    devices
        .iter()
        .flat_map(|dev| {
            let health = if dev.healthy { HEALTHY } else { UNHEALTHY };
            (0..slots_per_device).map(move |i| api::Device {
                id: format!("{}-{i}", dev.uuid),
                health: health.to_string(),
                topology: None,
            })
        })
        .collect()
}

fn allocation_status(report: &Report<AllocationError>) -> Status {
    let message = report.to_string();
    match report.current_context() {
        AllocationError::NoPendingWorkload { .. } => Status::failed_precondition(message),
        AllocationError::UnknownDeviceUuid { .. } => Status::not_found(message),
        AllocationError::MissingAnnotation { .. }
        | AllocationError::MalformedAnnotation { .. }
        | AllocationError::EmptyAllocationRequest => Status::invalid_argument(message),
    }
}

/// Device plugin gRPC service of one plugin lifetime.
#[derive(Debug, Clone)]
pub struct DevicePluginService {
    inventory: Arc<DeviceInventory>,
    coordinator: Arc<AllocationCoordinator>,
    health: Arc<watch::Sender<Option<i32>>>,
    cancellation_token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        inventory: Arc<DeviceInventory>,
        coordinator: Arc<AllocationCoordinator>,
        health: Arc<watch::Sender<Option<i32>>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            inventory,
            coordinator,
            health,
            cancellation_token,
        }
    }

    fn snapshot(inventory: &DeviceInventory) -> ListAndWatchResponse {
        ListAndWatchResponse {
            devices: slot_devices(&inventory.devices(), inventory.max_slots_per_device()),
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");
        Ok(Response::new(DevicePluginOptions::default()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Send the slot list now and again after every health change.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch device list");

        let (tx, rx) = mpsc::unbounded_channel();
        let inventory = self.inventory.clone();
        let mut health = self.health.subscribe();
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            loop {
                let response = Self::snapshot(&inventory);
                debug!("sending {} device slots", response.devices.len());
                if let Err(e) = tx.send(Ok(response)) {
                    error!("failed to send device list: {e}");
                    return;
                }

                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("device watch task stopped");
                        return;
                    }
                    _ = tx.closed() => {
                        debug!("kubelet closed the device watch stream");
                        return;
                    }
                    changed = health.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        info!("device health changed, resending device list");
                    }
                }
            }
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        Err(Status::unimplemented(
            "preferred allocation is not supported",
        ))
    }

    /// Devices come from the scheduler's annotation on the pending pod; the
    /// slot IDs kubelet picked are only logged. One decision, and so one
    /// node lock release, covers every container of the request.
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        for container_req in &req.container_requests {
            info!(
                "allocating devices to container, device IDs: {:?}",
                container_req.devices_ids
            );
        }

        let directives = self
            .coordinator
            .allocate()
            .await
            .map_err(|e| allocation_status(&e))?;
        let envs = directives.envs();

        let container_responses = req
            .container_requests
            .iter()
            .map(|_| ContainerAllocateResponse {
                envs: envs.clone(),
                ..Default::default()
            })
            .collect();

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
