//! Cascade — wave-scheduled multicast payload distribution.
//!
//! This facade re-exports the protocol core. The server lives in the
//! `cascaded` crate, the receiver in `cascade-recv`; the workspace-level
//! integration suite under `tests/` drives both ends in-process.

pub use cascade_core as core;
