//! cascade-recv — the Cascade receiver.
//!
//! A receiver dials the server's control endpoint, authenticates, joins
//! the session for its payload path, then runs three concurrent
//! activities: datagram intake from the multicast group, the chunk
//! writer, and the status reporter on the control channel. Transport
//! failures after a completed join re-enter a reconnect loop; the local
//! bit-vector and on-disk partial files survive across attempts.

pub mod engine;
pub mod session;
pub mod stats;
pub mod uri;

pub use session::{ReceiverSession, TransferReport};
pub use uri::TransferUri;
