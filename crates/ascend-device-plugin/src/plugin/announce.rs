use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use error_stack::Report;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::domain::inventory::DeviceInventory;
use crate::infrastructure::k8s::annotations::encode_node_devices;
use crate::infrastructure::k8s::annotations::handshake_annotation;
use crate::infrastructure::k8s::annotations::handshake_value;
use crate::infrastructure::k8s::annotations::register_annotation;
use crate::infrastructure::k8s::annotations::NodeDeviceInfo;
use crate::infrastructure::k8s::ClusterClient;
use crate::infrastructure::k8s::KubernetesError;

/// Delays between announce ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceCadence {
    pub initial: Duration,
    pub success: Duration,
    pub failure: Duration,
}

impl Default for AnnounceCadence {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            success: Duration::from_secs(30),
            failure: Duration::from_secs(5),
        }
    }
}

/// Periodically checks device health and publishes the node's register and
/// handshake annotations.
pub struct Announcer {
    node_name: String,
    inventory: Arc<DeviceInventory>,
    cluster: Arc<dyn ClusterClient>,
    health: Arc<watch::Sender<Option<i32>>>,
    cadence: AnnounceCadence,
    report_time_offset: i64,
}

impl Announcer {
    pub fn new(
        node_name: String,
        inventory: Arc<DeviceInventory>,
        cluster: Arc<dyn ClusterClient>,
        health: Arc<watch::Sender<Option<i32>>>,
        cadence: AnnounceCadence,
        report_time_offset: i64,
    ) -> Self {
        Self {
            node_name,
            inventory,
            cluster,
            health,
            cadence,
            report_time_offset,
        }
    }

    /// Run until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) {
        let mut delay = self.cadence.initial;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("announce task stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {
                    delay = self.tick().await;
                }
            }
        }
    }

    /// One health check and announce round. Returns the delay before the
    /// next one.
    pub async fn tick(&self) -> Duration {
        let unhealthy = self.inventory.unhealthy_device_ids();
        if let Some(&first) = unhealthy.first() {
            warn!("unhealthy devices: {unhealthy:?}");
            if self.inventory.refresh().is_err() {
                return self.cadence.failure;
            }
            self.health.send_replace(Some(first));
        } else if self.inventory.has_unhealthy_devices() {
            info!("all devices report healthy again");
            if self.inventory.refresh().is_err() {
                return self.cadence.failure;
            }
            self.health.send_replace(None);
        }

        match self.announce().await {
            Ok(()) => {
                debug!("announced devices on node {}", self.node_name);
                self.cadence.success
            }
            Err(e) => {
                error!("failed to announce devices: {e:?}");
                self.cadence.failure
            }
        }
    }

    async fn announce(&self) -> Result<(), Report<KubernetesError>> {
        let common_word = &self.inventory.profile().common_word;
        let devices = NodeDeviceInfo::from_devices(
            &self.inventory.devices(),
            self.inventory.max_slots_per_device(),
            common_word,
        );

        let annotations = BTreeMap::from([
            (
                register_annotation(common_word),
                encode_node_devices(&devices)?,
            ),
            (
                handshake_annotation(common_word),
                handshake_value(Local::now(), self.report_time_offset),
            ),
        ]);
        self.cluster
            .patch_node_annotations(&self.node_name, annotations)
            .await
    }
}
