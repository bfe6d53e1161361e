use core::ffi;
use std::ffi::CStr;

use error_stack::Report;
use libloading::Library;
use libloading::Symbol;

use super::ChipIdentity;
use super::DeviceQuery;
use super::DriverError;

const MAX_CARD_NUM: usize = 64;
const DIE_ID_WORDS: usize = 5;
const MAX_CHIP_NAME_LEN: usize = 32;

#[allow(
    non_camel_case_types,
    dead_code,
    reason = "FFI types must match DCMI API naming and struct layout"
)]
mod ffi_types {
    use super::*;

    /// `DCMI_VDIE` of `enum dcmi_die_type`
    pub(super) const DCMI_VDIE: ffi::c_int = 1;

    #[repr(C)]
    #[derive(Debug, Copy, Clone, Default)]
    pub(super) struct dcmi_die_id {
        pub soc_die: [ffi::c_uint; DIE_ID_WORDS],
    }

    #[repr(C)]
    #[derive(Debug, Copy, Clone)]
    pub(super) struct dcmi_chip_info {
        pub chip_type: [ffi::c_uchar; MAX_CHIP_NAME_LEN],
        pub chip_name: [ffi::c_uchar; MAX_CHIP_NAME_LEN],
        pub chip_ver: [ffi::c_uchar; MAX_CHIP_NAME_LEN],
        pub aicore_cnt: ffi::c_uint,
    }

    impl Default for dcmi_chip_info {
        fn default() -> Self {
            Self {
                chip_type: [0; MAX_CHIP_NAME_LEN],
                chip_name: [0; MAX_CHIP_NAME_LEN],
                chip_ver: [0; MAX_CHIP_NAME_LEN],
                aicore_cnt: 0,
            }
        }
    }

    pub(super) type DcmiInit = unsafe extern "C" fn() -> ffi::c_int;
    pub(super) type DcmiGetCardNumList = unsafe extern "C" fn(
        card_num: *mut ffi::c_int,
        card_list: *mut ffi::c_int,
        list_len: ffi::c_int,
    ) -> ffi::c_int;
    pub(super) type DcmiGetDeviceNumInCard =
        unsafe extern "C" fn(card_id: ffi::c_int, device_num: *mut ffi::c_int) -> ffi::c_int;
    pub(super) type DcmiGetDeviceLogicId = unsafe extern "C" fn(
        device_logic_id: *mut ffi::c_int,
        card_id: ffi::c_int,
        device_id: ffi::c_int,
    ) -> ffi::c_int;
    pub(super) type DcmiGetDevicePhyIdFromLogicId =
        unsafe extern "C" fn(logic_id: ffi::c_uint, phy_id: *mut ffi::c_uint) -> ffi::c_int;
    pub(super) type DcmiGetCardIdDeviceIdFromLogicId = unsafe extern "C" fn(
        card_id: *mut ffi::c_int,
        device_id: *mut ffi::c_int,
        logic_id: ffi::c_uint,
    ) -> ffi::c_int;
    pub(super) type DcmiGetDeviceDieV2 = unsafe extern "C" fn(
        card_id: ffi::c_int,
        device_id: ffi::c_int,
        die_type: ffi::c_int,
        die_id: *mut dcmi_die_id,
    ) -> ffi::c_int;
    pub(super) type DcmiGetDeviceHealth = unsafe extern "C" fn(
        card_id: ffi::c_int,
        device_id: ffi::c_int,
        health: *mut ffi::c_uint,
    ) -> ffi::c_int;
    pub(super) type DcmiGetDeviceChipInfo = unsafe extern "C" fn(
        card_id: ffi::c_int,
        device_id: ffi::c_int,
        chip_info: *mut dcmi_chip_info,
    ) -> ffi::c_int;
}

use ffi_types::*;

/// [`DeviceQuery`] backed by the Ascend DCMI library, loaded at runtime.
pub struct DcmiDeviceQuery {
    lib: Library,
}

impl std::fmt::Debug for DcmiDeviceQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DcmiDeviceQuery").finish_non_exhaustive()
    }
}

impl DcmiDeviceQuery {
    /// Load the DCMI library and initialise it.
    ///
    /// # Errors
    ///
    /// - [`DriverError::LoadFailed`] if the library can't be opened
    /// - [`DriverError::CallFailed`] if `dcmi_init` fails
    pub fn open(lib_path: &str) -> Result<Self, Report<DriverError>> {
        tracing::info!("Loading DCMI library from {}", lib_path);
        // SAFETY: loading the vendor library runs its initialisers, which is
        // the documented way of using DCMI.
        let lib = unsafe { Library::new(lib_path) }.map_err(|e| {
            Report::new(DriverError::LoadFailed {
                message: format!("{lib_path}: {e}"),
            })
        })?;
        let query = Self { lib };

        let init = query.symbol::<DcmiInit>("dcmi_init")?;
        // SAFETY: dcmi_init takes no arguments.
        check("dcmi_init", unsafe { init() })?;
        Ok(query)
    }

    fn symbol<T>(&self, name: &'static str) -> Result<Symbol<'_, T>, Report<DriverError>> {
        let mut bytes = Vec::with_capacity(name.len() + 1);
        bytes.extend_from_slice(name.as_bytes());
        bytes.push(0);
        // SAFETY: every symbol type used in this module matches the DCMI
        // header declaration of the same name.
        unsafe { self.lib.get::<T>(&bytes) }
            .map_err(|_| Report::new(DriverError::MissingSymbol { symbol: name }))
    }

    fn card_ids(&self) -> Result<Vec<i32>, Report<DriverError>> {
        let get_card_num_list = self.symbol::<DcmiGetCardNumList>("dcmi_get_card_num_list")?;
        let mut card_num: ffi::c_int = 0;
        let mut card_list = [0 as ffi::c_int; MAX_CARD_NUM];
        // SAFETY: card_list holds MAX_CARD_NUM entries as announced in list_len.
        check("dcmi_get_card_num_list", unsafe {
            get_card_num_list(
                &mut card_num,
                card_list.as_mut_ptr(),
                MAX_CARD_NUM as ffi::c_int,
            )
        })?;
        let count = usize::try_from(card_num).unwrap_or(0).min(MAX_CARD_NUM);
        Ok(card_list[..count].to_vec())
    }
}

impl DeviceQuery for DcmiDeviceQuery {
    fn list_device_ids(&self) -> Result<Vec<i32>, Report<DriverError>> {
        let get_device_num = self.symbol::<DcmiGetDeviceNumInCard>("dcmi_get_device_num_in_card")?;
        let get_logic_id = self.symbol::<DcmiGetDeviceLogicId>("dcmi_get_device_logic_id")?;

        let mut ids = Vec::new();
        for card_id in self.card_ids()? {
            let mut device_num: ffi::c_int = 0;
            // SAFETY: out-pointer to a local.
            check("dcmi_get_device_num_in_card", unsafe {
                get_device_num(card_id, &mut device_num)
            })?;
            for device_id in 0..device_num {
                let mut logic_id: ffi::c_int = 0;
                // SAFETY: out-pointer to a local.
                check("dcmi_get_device_logic_id", unsafe {
                    get_logic_id(&mut logic_id, card_id, device_id)
                })?;
                ids.push(logic_id);
            }
        }
        Ok(ids)
    }

    fn physical_id_from_logical_id(&self, logical_id: i32) -> Result<i32, Report<DriverError>> {
        let get_phy_id =
            self.symbol::<DcmiGetDevicePhyIdFromLogicId>("dcmi_get_device_phyid_from_logicid")?;
        let mut phy_id: ffi::c_uint = 0;
        // SAFETY: out-pointer to a local.
        check("dcmi_get_device_phyid_from_logicid", unsafe {
            get_phy_id(logical_id as ffi::c_uint, &mut phy_id)
        })?;
        Ok(phy_id as i32)
    }

    fn card_and_sub_device_id(&self, logical_id: i32) -> Result<(i32, i32), Report<DriverError>> {
        let get_ids = self.symbol::<DcmiGetCardIdDeviceIdFromLogicId>(
            "dcmi_get_card_id_device_id_from_logicid",
        )?;
        let mut card_id: ffi::c_int = 0;
        let mut device_id: ffi::c_int = 0;
        // SAFETY: out-pointers to locals.
        check("dcmi_get_card_id_device_id_from_logicid", unsafe {
            get_ids(&mut card_id, &mut device_id, logical_id as ffi::c_uint)
        })?;
        Ok((card_id, device_id))
    }

    fn unique_identifier(&self, logical_id: i32) -> Result<String, Report<DriverError>> {
        let (card_id, device_id) = self.card_and_sub_device_id(logical_id)?;
        let get_die = self.symbol::<DcmiGetDeviceDieV2>("dcmi_get_device_die_v2")?;
        let mut die = dcmi_die_id::default();
        // SAFETY: die is a properly sized dcmi_die_id.
        check("dcmi_get_device_die_v2", unsafe {
            get_die(card_id, device_id, DCMI_VDIE, &mut die)
        })?;
        Ok(format_die_id(&die.soc_die))
    }

    fn health_code(&self, logical_id: i32) -> Result<u32, Report<DriverError>> {
        let (card_id, device_id) = self.card_and_sub_device_id(logical_id)?;
        let get_health = self.symbol::<DcmiGetDeviceHealth>("dcmi_get_device_health")?;
        let mut health: ffi::c_uint = 0;
        // SAFETY: out-pointer to a local.
        check("dcmi_get_device_health", unsafe {
            get_health(card_id, device_id, &mut health)
        })?;
        Ok(health)
    }

    fn chip_identity(&self) -> Result<ChipIdentity, Report<DriverError>> {
        let get_chip_info = self.symbol::<DcmiGetDeviceChipInfo>("dcmi_get_device_chip_info")?;

        let mut last_err = Report::new(DriverError::NoDevice);
        for logical_id in self.list_device_ids()? {
            let (card_id, device_id) = match self.card_and_sub_device_id(logical_id) {
                Ok(ids) => ids,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };
            let mut info = dcmi_chip_info::default();
            // SAFETY: info is a properly sized dcmi_chip_info.
            let code = unsafe { get_chip_info(card_id, device_id, &mut info) };
            if let Err(e) = check("dcmi_get_device_chip_info", code) {
                last_err = e;
                continue;
            }
            return Ok(ChipIdentity {
                chip_type: c_chars_to_string(&info.chip_type),
                name: c_chars_to_string(&info.chip_name),
            });
        }
        Err(last_err)
    }
}

fn check(call: &'static str, code: ffi::c_int) -> Result<(), Report<DriverError>> {
    if code == 0 {
        Ok(())
    } else {
        Err(Report::new(DriverError::CallFailed { call, code }))
    }
}

/// Renders the die words the way the Ascend tooling prints them.
fn format_die_id(words: &[ffi::c_uint; DIE_ID_WORDS]) -> String {
    words
        .iter()
        .map(|w| format!("{w:08X}"))
        .collect::<Vec<_>>()
        .join("-")
}

fn c_chars_to_string(raw: &[ffi::c_uchar]) -> String {
    match CStr::from_bytes_until_nul(raw) {
        Ok(s) => s.to_string_lossy().into_owned(),
        Err(_) => String::from_utf8_lossy(raw).into_owned(),
    }
}
