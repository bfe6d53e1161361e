pub mod supervisor;

pub use supervisor::forward_signals;
pub use supervisor::watch_kubelet_socket;
pub use supervisor::ProcessSignal;
pub use supervisor::Supervisor;
pub use supervisor::SupervisorEvent;
