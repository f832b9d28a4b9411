//! Block-size derivation from the configured MTU.
//!
//! The wire block must fit a single UDP datagram: MTU minus the IP and
//! UDP headers minus the `FileSegment` framing. When a payload encoder
//! is configured the usable (pre-encode) size shrinks further until the
//! encoded output still fits.

use crate::error::TransferError;
use crate::psk::PayloadCipher;
use crate::wire::SEGMENT_FRAMING_OVERHEAD;

pub const IPV4_HEADER: usize = 20;
pub const IPV6_HEADER: usize = 40;
pub const UDP_HEADER: usize = 8;

/// The two sizes every session agrees on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSize {
    /// Bytes of file data per block before encoding.
    pub usable: usize,
    /// Maximum encoded block bytes on the wire.
    pub wire: usize,
}

/// Derive the session block size. Fails with `ConfigInvalid` when the
/// MTU leaves no room for payload.
pub fn derive_block_size(
    mtu: usize,
    ipv6: bool,
    encoder: Option<&PayloadCipher>,
) -> Result<BlockSize, TransferError> {
    let ip_header = if ipv6 { IPV6_HEADER } else { IPV4_HEADER };
    let overhead = ip_header + UDP_HEADER + SEGMENT_FRAMING_OVERHEAD;
    let raw = mtu
        .checked_sub(overhead)
        .ok_or_else(|| TransferError::ConfigInvalid(format!("mtu {mtu} below {overhead}-byte overhead")))?;

    let usable = match encoder {
        None => raw,
        Some(cipher) => {
            // Downward scan from the raw budget to the largest size
            // whose encoded output still fits.
            let mut candidate = raw;
            while candidate > 0 && cipher.encoded_len(candidate) > raw {
                candidate -= 1;
            }
            candidate
        }
    };

    if usable == 0 {
        return Err(TransferError::ConfigInvalid(format!(
            "mtu {mtu} leaves no usable block after encoding overhead"
        )));
    }

    Ok(BlockSize { usable, wire: raw })
}
