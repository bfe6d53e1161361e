//! Kubelet device plugin.
//!
//! [`PluginServer`] owns one plugin lifetime: it binds the plugin socket,
//! serves the [`api`] device plugin service, registers with kubelet and keeps
//! the node annotations fresh through the [`announce`] task.

#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

pub mod announce;
pub mod restart_budget;
pub mod server;
pub mod service;

use core::error::Error;

use async_trait::async_trait;
use error_stack::Report;

pub use server::PluginServer;
pub use service::DevicePluginService;

pub const API_VERSION: &str = "v1beta1";
pub const KUBELET_SOCKET: &str = "kubelet.sock";

#[derive(Debug, derive_more::Display)]
pub enum PluginError {
    #[display("Failed to refresh device inventory")]
    InventoryRefresh,
    #[display("Failed to bind plugin socket {path}")]
    BindFailed { path: String },
    #[display("gRPC server failed")]
    ServeFailed,
    #[display("Plugin socket {path} did not answer")]
    ProbeFailed { path: String },
    #[display("Failed to register with kubelet: {message}")]
    RegistrationFailed { message: String },
    #[display("gRPC server crashed {crashes} times within {window_secs}s")]
    RestartBudgetExhausted { crashes: u32, window_secs: u64 },
}

impl Error for PluginError {}

/// Start and stop of one plugin lifetime, driven by the supervisor.
#[async_trait]
pub trait PluginLifecycle: Send {
    async fn start(&mut self) -> Result<(), Report<PluginError>>;

    /// Stopping a plugin that isn't running is a no-op.
    async fn stop(&mut self) -> Result<(), Report<PluginError>>;
}
