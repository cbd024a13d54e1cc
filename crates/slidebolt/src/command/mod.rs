//! Command Router
//!
//! Dispatch state machine plus the message bus that carries envelopes to
//! plugins. The reaper worker lives with the other background services.

mod bus;
mod router;

pub use bus::*;
pub use router::*;
