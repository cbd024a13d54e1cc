//! Slidebolt Gateway Core
//!
//! The hub that plugins attach to:
//! - `registry`: plugin registration and liveness
//! - `store`: walled-garden device and entity documents
//! - `command`: async command dispatch over the plugin message bus
//! - `journal`: append-only per-entity event log
//! - `automation`: per-entity scripts driven by commands and events
//!
//! [`Gateway`] wires them together and runs the background workers.

pub mod automation;
pub mod command;
pub mod config;
pub mod error;
pub mod gateway;
pub mod journal;
pub mod registry;
pub mod runtime;
pub mod schema;
pub mod services;
pub mod store;
pub mod supervisor;

pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayHealth};

// Data model
pub use slidebolt_types;
