//! Annotation keys and payloads shared with the HAMi scheduler.

use chrono::DateTime;
use chrono::Local;
use chrono::TimeDelta;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;

use crate::domain::inventory::PhysicalDevice;
use crate::infrastructure::k8s::KubernetesError;

/// Node annotation carrying the node lock.
pub const NODE_LOCK_ANNOTATION: &str = "hami.io/mutex.lock";
/// Pod annotation the scheduler sets while a pod waits for its devices.
pub const BIND_PHASE_ANNOTATION: &str = "hami.io/bind-phase";
/// Pod annotation naming the node the scheduler assigned.
pub const ASSIGNED_NODE_ANNOTATION: &str = "hami.io/vgpu-node";
/// Pod annotation with the unix time the pod was bound.
pub const BIND_TIME_ANNOTATION: &str = "hami.io/bind-time";

pub const BIND_PHASE_ALLOCATING: &str = "allocating";
pub const BIND_PHASE_SUCCESS: &str = "success";
pub const BIND_PHASE_FAILED: &str = "failed";

const HANDSHAKE_TIME_FORMAT: &str = "%Y.%m.%d %H:%M:%S";

/// Node annotation the scheduler reads the device inventory from.
pub fn register_annotation(common_word: &str) -> String {
    format!("hami.io/node-register-{common_word}")
}

/// Node annotation carrying the liveness timestamp.
pub fn handshake_annotation(common_word: &str) -> String {
    format!("hami.io/node-handshake-{common_word}")
}

/// Pod annotation carrying the scheduler's allocation decision.
pub fn allocation_annotation(common_word: &str) -> String {
    format!("huawei.com/{common_word}")
}

/// One physical device as advertised on the node.
///
/// The scheduler expects indices to start from 0 and be contiguous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDeviceInfo {
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub index: u32,
    pub id: String,
    pub count: i32,
    pub devmem: i32,
    pub devcore: i32,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub numa: i32,
    pub health: bool,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

impl NodeDeviceInfo {
    pub fn from_devices(
        devices: &[PhysicalDevice],
        slots_per_device: usize,
        common_word: &str,
    ) -> Vec<Self> {
        let count = i32::try_from(slots_per_device).unwrap_or(i32::MAX);
        devices
            .iter()
            .enumerate()
            .map(|(i, dev)| Self {
                index: i as u32,
                id: dev.uuid.clone(),
                count,
                devmem: i32::try_from(dev.memory_units).unwrap_or(i32::MAX),
                devcore: dev.compute_units,
                device_type: common_word.to_string(),
                numa: 0,
                health: dev.healthy,
            })
            .collect()
    }
}

/// Serialise the device list for the register annotation.
///
/// # Errors
///
/// - [`KubernetesError::AnnotationParseError`] if serialisation fails
pub fn encode_node_devices(devices: &[NodeDeviceInfo]) -> Result<String, Report<KubernetesError>> {
    serde_json::to_string(devices).change_context(KubernetesError::AnnotationParseError {
        message: "failed to encode node devices".to_string(),
    })
}

/// Parse a register annotation back into device records.
///
/// # Errors
///
/// - [`KubernetesError::AnnotationParseError`] if the value isn't a device list
pub fn decode_node_devices(value: &str) -> Result<Vec<NodeDeviceInfo>, Report<KubernetesError>> {
    serde_json::from_str(value).change_context(KubernetesError::AnnotationParseError {
        message: format!("invalid node devices: {value}"),
    })
}

/// Handshake value: `Reported_<local time + offset>`.
pub fn handshake_value(now: DateTime<Local>, offset_secs: i64) -> String {
    let reported = now + TimeDelta::try_seconds(offset_secs).unwrap_or_default();
    format!("Reported_{}", reported.format(HANDSHAKE_TIME_FORMAT))
}

/// Parsed node lock annotation.
///
/// Current schedulers write `<RFC3339 time>,<namespace>,<pod>`; older ones
/// only wrote the timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLockValue {
    pub locked_at: String,
    pub owner: Option<(String, String)>,
}

impl NodeLockValue {
    pub fn parse(value: &str) -> Self {
        let mut parts = value.splitn(3, ',');
        let locked_at = parts.next().unwrap_or_default().trim().to_string();
        let owner = match (parts.next(), parts.next()) {
            (Some(ns), Some(name)) if !ns.trim().is_empty() && !name.trim().is_empty() => {
                Some((ns.trim().to_string(), name.trim().to_string()))
            }
            _ => None,
        };
        Self { locked_at, owner }
    }

    /// Whether the lock was taken on behalf of `namespace/name`. A lock
    /// without an owner matches any pod.
    pub fn is_held_for(&self, namespace: &str, name: &str) -> bool {
        match &self.owner {
            Some((ns, n)) => ns == namespace && n == name,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::TimeZone;
    use similar_asserts::assert_eq;

    use super::*;

    fn device(uuid: &str, healthy: bool) -> PhysicalDevice {
        PhysicalDevice {
            uuid: uuid.to_string(),
            logical_id: 0,
            physical_id: 0,
            card_id: 0,
            sub_device_id: 0,
            memory_units: 65536,
            compute_units: 20,
            healthy,
        }
    }

    #[test]
    fn annotation_keys_use_common_word() {
        assert_eq!(
            register_annotation("Ascend910B"),
            "hami.io/node-register-Ascend910B"
        );
        assert_eq!(
            handshake_annotation("Ascend910B"),
            "hami.io/node-handshake-Ascend910B"
        );
        assert_eq!(allocation_annotation("Ascend910B"), "huawei.com/Ascend910B");
    }

    #[test]
    fn register_annotation_round_trip() {
        let devices = vec![device("A", true), device("B", false), device("C", true)];
        let infos = NodeDeviceInfo::from_devices(&devices, 4, "Ascend910B");

        let encoded = encode_node_devices(&infos).expect("should encode");
        let decoded = decode_node_devices(&encoded).expect("should decode");

        let tuples = |list: &[NodeDeviceInfo]| -> BTreeSet<(String, i32, i32, i32, bool)> {
            list.iter()
                .map(|d| (d.id.clone(), d.count, d.devmem, d.devcore, d.health))
                .collect()
        };
        let expected: BTreeSet<_> = devices
            .iter()
            .map(|d| (d.uuid.clone(), 4, 65536, 20, d.healthy))
            .collect();

        assert_eq!(tuples(&decoded), expected);
        assert_eq!(decoded, infos);
    }

    #[test]
    fn register_annotation_omits_zero_index() {
        let infos = NodeDeviceInfo::from_devices(&[device("A", true), device("B", true)], 2, "Ascend310P");
        let encoded = encode_node_devices(&infos).expect("should encode");

        assert_eq!(
            encoded,
            r#"[{"id":"A","count":2,"devmem":65536,"devcore":20,"type":"Ascend310P","health":true},{"index":1,"id":"B","count":2,"devmem":65536,"devcore":20,"type":"Ascend310P","health":true}]"#
        );
    }

    #[test]
    fn handshake_value_applies_offset() {
        let now = Local
            .with_ymd_and_hms(2025, 7, 10, 7, 48, 33)
            .single()
            .expect("valid local time");
        assert_eq!(handshake_value(now, 1), "Reported_2025.07.10 07:48:34");
        assert_eq!(handshake_value(now, 0), "Reported_2025.07.10 07:48:33");
    }

    #[test]
    fn parse_node_lock_with_owner() {
        let lock = NodeLockValue::parse("2025-07-10T07:48:33Z,default,trainer-0");
        assert_eq!(lock.locked_at, "2025-07-10T07:48:33Z");
        assert_eq!(
            lock.owner,
            Some(("default".to_string(), "trainer-0".to_string()))
        );
        assert!(lock.is_held_for("default", "trainer-0"));
        assert!(!lock.is_held_for("default", "trainer-1"));
    }

    #[test]
    fn parse_legacy_node_lock() {
        let lock = NodeLockValue::parse("2025-07-10T07:48:33Z");
        assert_eq!(lock.owner, None);
        assert!(lock.is_held_for("any", "pod"));
    }
}
