use core::error::Error;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::config::ChipProfile;
use crate::config::VnpuConfig;
use crate::infrastructure::driver::DeviceQuery;

const ASCEND_CHIP_TYPE: &str = "Ascend";

#[derive(Debug, derive_more::Display)]
pub enum InventoryError {
    #[display("Chip type {chip_type} is not Ascend")]
    UnsupportedChip { chip_type: String },
    #[display("No vNPU profile for the local chip")]
    ProfileSelection,
    #[display("Device query failed: {step}")]
    DriverQuery { step: &'static str },
}

impl Error for InventoryError {}

/// One physical NPU as last reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDevice {
    pub uuid: String,
    pub logical_id: i32,
    pub physical_id: i32,
    pub card_id: i32,
    pub sub_device_id: i32,
    pub memory_units: i64,
    pub compute_units: i32,
    pub healthy: bool,
}

/// The local chip profile plus the live device list.
///
/// The device list is only ever replaced as a whole, so readers holding a
/// snapshot from [`DeviceInventory::devices`] never see a partial refresh.
pub struct DeviceInventory {
    query: Arc<dyn DeviceQuery>,
    profile: ChipProfile,
    devices: RwLock<Arc<[PhysicalDevice]>>,
}

impl std::fmt::Debug for DeviceInventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceInventory")
            .field("profile", &self.profile.chip_name)
            .field("devices", &self.devices())
            .finish()
    }
}

impl DeviceInventory {
    pub fn new(query: Arc<dyn DeviceQuery>, profile: ChipProfile) -> Self {
        Self {
            query,
            profile,
            devices: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Detect the local chip and pick its profile from `config`.
    ///
    /// # Errors
    ///
    /// - [`InventoryError::DriverQuery`] if the chip can't be identified
    /// - [`InventoryError::UnsupportedChip`] if the chip isn't an Ascend NPU
    /// - [`InventoryError::ProfileSelection`] if `config` has no profile for it
    pub fn load(
        query: Arc<dyn DeviceQuery>,
        config: &VnpuConfig,
    ) -> Result<Self, Report<InventoryError>> {
        let chip = query
            .chip_identity()
            .change_context(InventoryError::DriverQuery {
                step: "chip identity",
            })?;
        info!("detected chip {} {}", chip.chip_type, chip.name);

        if chip.chip_type != ASCEND_CHIP_TYPE {
            return Err(Report::new(InventoryError::UnsupportedChip {
                chip_type: chip.chip_type,
            }));
        }

        let profile = config
            .select_profile(&chip.name)
            .change_context(InventoryError::ProfileSelection)?;
        Ok(Self::new(query, profile))
    }

    pub fn profile(&self) -> &ChipProfile {
        &self.profile
    }

    pub fn max_slots_per_device(&self) -> usize {
        self.profile.max_slots_per_device()
    }

    /// Current device list.
    pub fn devices(&self) -> Arc<[PhysicalDevice]> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn lookup_by_uuid(&self, uuid: &str) -> Option<PhysicalDevice> {
        self.devices().iter().find(|d| d.uuid == uuid).cloned()
    }

    /// Re-enumerate every device through the driver.
    ///
    /// The new list is installed only when every device resolved; on error
    /// the previous list stays in place.
    ///
    /// # Errors
    ///
    /// - [`InventoryError::DriverQuery`] naming the driver step that failed
    pub fn refresh(&self) -> Result<(), Report<InventoryError>> {
        let devices = self.enumerate().inspect_err(|e| {
            error!("failed to refresh devices: {e:?}");
        })?;
        debug!("refreshed {} devices", devices.len());

        *self
            .devices
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::from(devices);
        Ok(())
    }

    fn enumerate(&self) -> Result<Vec<PhysicalDevice>, Report<InventoryError>> {
        let ids = self
            .query
            .list_device_ids()
            .change_context(InventoryError::DriverQuery {
                step: "device list",
            })?;

        let mut devices = Vec::with_capacity(ids.len());
        for logical_id in ids {
            let physical_id = self
                .query
                .physical_id_from_logical_id(logical_id)
                .change_context(InventoryError::DriverQuery {
                    step: "physical id",
                })?;
            let (card_id, sub_device_id) = self
                .query
                .card_and_sub_device_id(logical_id)
                .change_context(InventoryError::DriverQuery {
                    step: "card and device id",
                })?;
            let uuid = self
                .query
                .unique_identifier(logical_id)
                .change_context(InventoryError::DriverQuery { step: "uuid" })?;
            let health = self
                .query
                .health_code(logical_id)
                .change_context(InventoryError::DriverQuery { step: "health" })?;

            devices.push(PhysicalDevice {
                uuid,
                logical_id,
                physical_id,
                card_id,
                sub_device_id,
                memory_units: self.profile.allocatable_memory,
                compute_units: self.profile.compute_units,
                healthy: health == 0,
            });
        }
        Ok(devices)
    }

    /// Logical IDs of devices the driver currently reports unhealthy.
    ///
    /// Queries the driver directly; the stored list is not touched. Devices
    /// whose health can't be read are skipped.
    pub fn unhealthy_device_ids(&self) -> Vec<i32> {
        let ids = match self.query.list_device_ids() {
            Ok(ids) => ids,
            Err(e) => {
                debug!("failed to list devices for health check: {e:?}");
                return Vec::new();
            }
        };
        ids.into_iter()
            .filter(|&id| matches!(self.query.health_code(id), Ok(code) if code != 0))
            .collect()
    }

    /// Whether the stored list still carries devices marked unhealthy.
    pub fn has_unhealthy_devices(&self) -> bool {
        self.devices().iter().any(|d| !d.healthy)
    }
}
