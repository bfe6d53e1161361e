//! Access to the NPU driver.
//!
//! [`DeviceQuery`] is the only surface the rest of the plugin sees; the
//! production implementation is [`DcmiDeviceQuery`].

pub mod dcmi;

use core::error::Error;

use error_stack::Report;

pub use dcmi::DcmiDeviceQuery;

/// Chip family and model as reported by the driver, e.g. `Ascend` / `910B3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipIdentity {
    pub chip_type: String,
    pub name: String,
}

#[derive(Debug, derive_more::Display)]
pub enum DriverError {
    #[display("Failed to load driver library: {message}")]
    LoadFailed { message: String },
    #[display("Driver symbol {symbol} is unavailable")]
    MissingSymbol { symbol: &'static str },
    #[display("Driver call {call} failed with code {code}")]
    CallFailed { call: &'static str, code: i32 },
    #[display("No NPU found")]
    NoDevice,
}

impl Error for DriverError {}

/// Black-box view of the vendor driver.
///
/// Device identifiers passed in are logical IDs as returned by
/// [`DeviceQuery::list_device_ids`].
pub trait DeviceQuery: Send + Sync {
    fn list_device_ids(&self) -> Result<Vec<i32>, Report<DriverError>>;

    fn physical_id_from_logical_id(&self, logical_id: i32) -> Result<i32, Report<DriverError>>;

    /// Returns `(card_id, device_id_in_card)`.
    fn card_and_sub_device_id(&self, logical_id: i32) -> Result<(i32, i32), Report<DriverError>>;

    /// Vendor-issued identifier, stable across reboots.
    fn unique_identifier(&self, logical_id: i32) -> Result<String, Report<DriverError>>;

    /// `0` means healthy.
    fn health_code(&self, logical_id: i32) -> Result<u32, Report<DriverError>>;

    fn chip_identity(&self) -> Result<ChipIdentity, Report<DriverError>>;
}
