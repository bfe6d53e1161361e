pub mod app;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod plugin;

#[cfg(test)]
mod testing;

// Re-export main modules
pub use domain::allocation;
pub use domain::inventory;
pub use infrastructure::driver;
pub use infrastructure::k8s;
