//! Background Services
//!
//! Workers that keep the core honest without a caller asking:
//! - `RegistryMonitor`: gateway self-heartbeat and TTL sweep
//! - `CommandReaper`: command timeouts and status retention
//!
//! The automation worker lives in [`crate::automation`].

mod command_reaper;
mod registry_monitor;

pub use command_reaper::CommandReaper;
pub use registry_monitor::RegistryMonitor;
