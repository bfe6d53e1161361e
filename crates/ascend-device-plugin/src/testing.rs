//! Test adapters for the driver and cluster traits.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use error_stack::Report;

use crate::config::CapacityTemplate;
use crate::config::ChipProfile;
use crate::infrastructure::driver::ChipIdentity;
use crate::infrastructure::driver::DeviceQuery;
use crate::infrastructure::driver::DriverError;
use crate::infrastructure::k8s::ClusterClient;
use crate::infrastructure::k8s::KubernetesError;
use crate::infrastructure::k8s::PendingWorkload;

/// Profile of a 910B3 with two templates, already sorted by memory.
pub fn profile_910b() -> ChipProfile {
    ChipProfile {
        chip_name: "910B3".to_string(),
        common_word: "Ascend910B".to_string(),
        resource_name: "huawei.com/Ascend910B".to_string(),
        resource_memory_name: "huawei.com/Ascend910B-memory".to_string(),
        allocatable_memory: 65536,
        memory_capacity: 65536,
        compute_units: 20,
        aux_compute_units: 7,
        templates: vec![
            CapacityTemplate {
                name: "vir05_1c_16g".to_string(),
                memory_units: 16384,
                compute_units: 5,
                aux_compute_units: 1,
            },
            CapacityTemplate {
                name: "vir10_3c_32g".to_string(),
                memory_units: 32768,
                compute_units: 10,
                aux_compute_units: 3,
            },
        ],
    }
}

#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub logical_id: i32,
    pub physical_id: i32,
    pub uuid: String,
    pub health: u32,
}

impl FakeDevice {
    /// Card ID mirrors the logical ID, sub-device ID is always 0.
    pub fn new(logical_id: i32, physical_id: i32, uuid: &str) -> Self {
        Self {
            logical_id,
            physical_id,
            uuid: uuid.to_string(),
            health: 0,
        }
    }

    pub fn with_health(mut self, health: u32) -> Self {
        self.health = health;
        self
    }
}

#[derive(Debug, Default)]
struct FakeDriverState {
    devices: Vec<FakeDevice>,
    fail_list: bool,
    /// Devices at or past this position fail their uuid query
    fail_uuid_from: Option<usize>,
}

/// In-memory driver.
#[derive(Debug)]
pub struct FakeDeviceQuery {
    chip: ChipIdentity,
    state: Mutex<FakeDriverState>,
}

impl FakeDeviceQuery {
    pub fn new(devices: Vec<FakeDevice>) -> Self {
        Self {
            chip: ChipIdentity {
                chip_type: "Ascend".to_string(),
                name: "910B3".to_string(),
            },
            state: Mutex::new(FakeDriverState {
                devices,
                ..Default::default()
            }),
        }
    }

    pub fn with_chip(mut self, chip_type: &str, name: &str) -> Self {
        self.chip = ChipIdentity {
            chip_type: chip_type.to_string(),
            name: name.to_string(),
        };
        self
    }

    pub fn set_devices(&self, devices: Vec<FakeDevice>) {
        self.state.lock().unwrap().devices = devices;
    }

    pub fn set_health(&self, logical_id: i32, health: u32) {
        let mut state = self.state.lock().unwrap();
        for device in state.devices.iter_mut().filter(|d| d.logical_id == logical_id) {
            device.health = health;
        }
    }

    pub fn fail_list(&self, fail: bool) {
        self.state.lock().unwrap().fail_list = fail;
    }

    pub fn fail_uuid_after(&self, count: usize) {
        self.state.lock().unwrap().fail_uuid_from = Some(count);
    }

    fn with_device<T>(
        &self,
        logical_id: i32,
        call: &'static str,
        f: impl FnOnce(usize, &FakeDevice) -> Option<T>,
    ) -> Result<T, Report<DriverError>> {
        let state = self.state.lock().unwrap();
        state
            .devices
            .iter()
            .enumerate()
            .find(|(_, d)| d.logical_id == logical_id)
            .and_then(|(pos, d)| f(pos, d))
            .ok_or_else(|| Report::new(DriverError::CallFailed { call, code: -8005 }))
    }
}

impl DeviceQuery for FakeDeviceQuery {
    fn list_device_ids(&self) -> Result<Vec<i32>, Report<DriverError>> {
        let state = self.state.lock().unwrap();
        if state.fail_list {
            return Err(Report::new(DriverError::CallFailed {
                call: "list",
                code: -1,
            }));
        }
        Ok(state.devices.iter().map(|d| d.logical_id).collect())
    }

    fn physical_id_from_logical_id(&self, logical_id: i32) -> Result<i32, Report<DriverError>> {
        self.with_device(logical_id, "physical_id", |_, d| Some(d.physical_id))
    }

    fn card_and_sub_device_id(&self, logical_id: i32) -> Result<(i32, i32), Report<DriverError>> {
        self.with_device(logical_id, "card_id", |_, d| Some((d.logical_id, 0)))
    }

    fn unique_identifier(&self, logical_id: i32) -> Result<String, Report<DriverError>> {
        let fail_from = self.state.lock().unwrap().fail_uuid_from;
        self.with_device(logical_id, "uuid", |pos, d| match fail_from {
            Some(limit) if pos >= limit => None,
            _ => Some(d.uuid.clone()),
        })
    }

    fn health_code(&self, logical_id: i32) -> Result<u32, Report<DriverError>> {
        self.with_device(logical_id, "health", |_, d| Some(d.health))
    }

    fn chip_identity(&self) -> Result<ChipIdentity, Report<DriverError>> {
        Ok(self.chip.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseCall {
    pub node_name: String,
    pub lock_name: String,
    pub workload: Option<String>,
    pub success: bool,
}

#[derive(Debug, Default)]
struct FakeClusterState {
    pending: Option<PendingWorkload>,
    releases: Vec<ReleaseCall>,
    patches: Vec<(String, BTreeMap<String, String>)>,
    fail_release: bool,
    fail_patch: bool,
}

/// In-memory cluster recording every call.
#[derive(Debug, Default)]
pub struct FakeClusterClient {
    state: Mutex<FakeClusterState>,
}

impl FakeClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pending(pending: PendingWorkload) -> Self {
        let client = Self::default();
        client.state.lock().unwrap().pending = Some(pending);
        client
    }

    pub fn fail_release(&self, fail: bool) {
        self.state.lock().unwrap().fail_release = fail;
    }

    pub fn fail_patch(&self, fail: bool) {
        self.state.lock().unwrap().fail_patch = fail;
    }

    pub fn releases(&self) -> Vec<ReleaseCall> {
        self.state.lock().unwrap().releases.clone()
    }

    pub fn patches(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.state.lock().unwrap().patches.clone()
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn pending_workload(
        &self,
        node_name: &str,
    ) -> Result<PendingWorkload, Report<KubernetesError>> {
        self.state.lock().unwrap().pending.clone().ok_or_else(|| {
            Report::new(KubernetesError::NoPendingPod {
                node_name: node_name.to_string(),
            })
        })
    }

    async fn release_node_lock(
        &self,
        node_name: &str,
        lock_name: &str,
        workload: Option<&PendingWorkload>,
        success: bool,
    ) -> Result<(), Report<KubernetesError>> {
        let mut state = self.state.lock().unwrap();
        state.releases.push(ReleaseCall {
            node_name: node_name.to_string(),
            lock_name: lock_name.to_string(),
            workload: workload.map(ToString::to_string),
            success,
        });
        if state.fail_release {
            return Err(Report::new(KubernetesError::LockReleaseFailed {
                node_name: node_name.to_string(),
                lock_name: lock_name.to_string(),
            }));
        }
        Ok(())
    }

    async fn patch_node_annotations(
        &self,
        node_name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Report<KubernetesError>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_patch {
            return Err(Report::new(KubernetesError::RequestFailed {
                message: "injected".to_string(),
            }));
        }
        state.patches.push((node_name.to_string(), annotations));
        Ok(())
    }
}
