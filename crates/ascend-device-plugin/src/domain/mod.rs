pub mod allocation;
pub mod inventory;
