//! Automation Bridge
//!
//! Per-entity scripts driven by commands and journal events.
//!
//! - `script`: the `Script` trait, triggers and the pattern table
//! - `context`: what a running handler may call
//! - `instance`: one task per script, panic isolation and restarts
//! - `bridge`: installation and trigger routing
//! - `worker`: runs the bridge under the worker manager

mod bridge;
mod context;
mod instance;
mod script;
mod worker;

pub use bridge::AutomationBridge;
pub use context::*;
pub use instance::SCRIPT_ERROR_EVENT;
pub use script::*;
pub use worker::AutomationWorker;
