pub mod cli;
pub mod vnpu;

use core::error::Error;
use std::time::Duration;

pub use cli::*;
pub use vnpu::*;

use crate::plugin::announce::AnnounceCadence;
use crate::plugin::restart_budget::RestartBudgetConfig;

/// Errors raised while loading the vNPU configuration.
#[derive(Debug, derive_more::Display)]
pub enum ConfigError {
    #[display("Failed to read config file {path}")]
    ReadFailed { path: String },
    #[display("Failed to parse config: {message}")]
    ParseFailed { message: String },
    #[display("Can not find vnpu config for chip {chip_name}")]
    ProfileNotFound { chip_name: String },
    #[display("Template {template} of chip {chip_name} has no memory")]
    InvalidTemplate { chip_name: String, template: String },
}

impl Error for ConfigError {}

/// Timing knobs of the plugin server and its background tasks.
#[derive(Debug, Clone)]
pub struct PluginTuning {
    pub restart_budget: RestartBudgetConfig,
    /// Pause before the gRPC server is brought back after a crash
    pub restart_delay: Duration,
    /// Bound on the liveness probe and the kubelet registration dial
    pub dial_timeout: Duration,
    pub announce: AnnounceCadence,
}

impl Default for PluginTuning {
    fn default() -> Self {
        Self {
            restart_budget: RestartBudgetConfig::default(),
            restart_delay: Duration::from_secs(1),
            dial_timeout: Duration::from_secs(5),
            announce: AnnounceCadence::default(),
        }
    }
}
