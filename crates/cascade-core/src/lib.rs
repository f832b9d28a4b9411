//! cascade-core — wire format, PSK cipher, chunk mapping, and the shared
//! transport pieces (control channel, multicast group). Both the server
//! (`cascaded`) and the receiver (`cascade-recv`) depend on this crate.

pub mod bitvec;
pub mod block;
pub mod channel;
pub mod config;
pub mod error;
pub mod fileset;
pub mod group;
pub mod psk;
pub mod wire;

pub use bitvec::BitVector;
pub use block::BlockSize;
pub use channel::ControlChannel;
pub use config::{ClientConfig, ServerConfig};
pub use error::TransferError;
pub use fileset::{DiskFileSet, FileChunk, FileHeader};
pub use group::{DatagramGroup, GroupInterface};
pub use psk::{PassphraseEncoder, PassphraseEncoding, PayloadCipher};
