//! cascaded — the Cascade distribution daemon.
//!
//! One TCP listener accepts receiver control channels; a registry maps
//! payload paths to live sessions; each session runs a wave scheduler
//! that owns its receivers and drives the multicast sender.

pub mod handshake;
pub mod listener;
pub mod registry;
pub mod scheduler;
pub mod sender;

pub use listener::{serve, ServerHandle};
