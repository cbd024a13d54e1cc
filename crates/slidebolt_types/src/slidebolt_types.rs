//! Slidebolt Types - Shared data model for the gateway core
//!
//! This crate contains the plain data structures every gateway component
//! agrees on: plugin registrations, the device/entity documents and their
//! walled-garden merge, command statuses, journal events and script state.
//! Nothing here performs I/O.

mod command;
mod device;
mod ident;
mod journal;
mod plugin;
mod script;

pub use command::*;
pub use device::*;
pub use ident::*;
pub use journal::*;
pub use plugin::*;
pub use script::*;
