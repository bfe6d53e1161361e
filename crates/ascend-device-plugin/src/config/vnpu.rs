use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;

use crate::config::ConfigError;

/// One way of carving a physical NPU into a virtual one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityTemplate {
    pub name: String,
    /// Device memory in MiB
    #[serde(rename = "memory")]
    pub memory_units: i64,
    #[serde(rename = "aiCore", default)]
    pub compute_units: i32,
    #[serde(rename = "aiCPU", default)]
    pub aux_compute_units: i32,
}

/// vNPU capabilities of one chip model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChipProfile {
    pub chip_name: String,
    pub common_word: String,
    pub resource_name: String,
    #[serde(default)]
    pub resource_memory_name: String,
    #[serde(rename = "memoryAllocatable")]
    pub allocatable_memory: i64,
    #[serde(default)]
    pub memory_capacity: i64,
    #[serde(rename = "aiCore", default)]
    pub compute_units: i32,
    #[serde(rename = "aiCPU", default)]
    pub aux_compute_units: i32,
    #[serde(default)]
    pub templates: Vec<CapacityTemplate>,
}

impl ChipProfile {
    /// Number of slots one physical device is split into.
    ///
    /// Derived from the smallest template, so `templates` must already be
    /// sorted by memory (see [`VnpuConfig::select_profile`]). Without any
    /// template the device is handed out whole.
    pub fn max_slots_per_device(&self) -> usize {
        match self.templates.first() {
            Some(smallest) if smallest.memory_units > 0 => {
                usize::try_from(self.allocatable_memory / smallest.memory_units).unwrap_or(0)
            }
            _ => 1,
        }
    }
}

/// Root of the vNPU configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VnpuConfig {
    #[serde(rename = "vnpus", default)]
    pub profiles: Vec<ChipProfile>,
}

/// The config is usually shipped as a ConfigMap manifest; only `data` matters.
#[derive(Debug, Deserialize)]
struct ConfigMapManifest {
    #[serde(default)]
    data: std::collections::BTreeMap<String, String>,
}

impl VnpuConfig {
    /// Read and parse the vNPU configuration file.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::ReadFailed`] if the file can't be read
    /// - [`ConfigError::ParseFailed`] if the content is neither a vNPU
    ///   document nor a ConfigMap embedding one
    pub fn load(path: &Path) -> Result<Self, Report<ConfigError>> {
        tracing::info!("Loading vNPU configuration from {}", path.display());

        let content =
            std::fs::read_to_string(path).change_context(ConfigError::ReadFailed {
                path: path.display().to_string(),
            })?;

        Self::parse(&content).attach_printable_lazy(|| format!("config file: {}", path.display()))
    }

    /// Parse the configuration from YAML text.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::ParseFailed`] if no vNPU profiles can be found
    pub fn parse(content: &str) -> Result<Self, Report<ConfigError>> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(content).change_context(ConfigError::ParseFailed {
                message: "invalid YAML".to_string(),
            })?;

        if value.get("vnpus").is_some() {
            return serde_yaml::from_value(value).change_context(ConfigError::ParseFailed {
                message: "invalid vnpus document".to_string(),
            });
        }

        let manifest: ConfigMapManifest =
            serde_yaml::from_value(value).change_context(ConfigError::ParseFailed {
                message: "document has neither vnpus nor data".to_string(),
            })?;
        for (key, embedded) in &manifest.data {
            match serde_yaml::from_str::<VnpuConfig>(embedded) {
                Ok(config) if !config.profiles.is_empty() => {
                    tracing::debug!("Using vNPU configuration from ConfigMap key {key}");
                    return Ok(config);
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("ConfigMap key {key} is not a vNPU config: {e}"),
            }
        }

        Err(Report::new(ConfigError::ParseFailed {
            message: "no vnpus found in ConfigMap data".to_string(),
        }))
    }

    /// Pick the profile for `chip_name` and sort its templates by memory,
    /// smallest first.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::ProfileNotFound`] if no profile matches exactly
    /// - [`ConfigError::InvalidTemplate`] if a template has no memory
    pub fn select_profile(&self, chip_name: &str) -> Result<ChipProfile, Report<ConfigError>> {
        let mut profile = self
            .profiles
            .iter()
            .find(|p| p.chip_name == chip_name)
            .cloned()
            .ok_or_else(|| {
                Report::new(ConfigError::ProfileNotFound {
                    chip_name: chip_name.to_string(),
                })
            })?;

        if let Some(bad) = profile.templates.iter().find(|t| t.memory_units <= 0) {
            return Err(Report::new(ConfigError::InvalidTemplate {
                chip_name: chip_name.to_string(),
                template: bad.name.clone(),
            }));
        }

        profile.templates.sort_by_key(|t| t.memory_units);
        tracing::info!("load config: {profile:?}");
        Ok(profile)
    }
}
