//! Multicast sender — serialise, encode, emit.
//!
//! Serialisation and PSK encoding of a burst run as parallel tasks
//! (each with its own cheaply re-keyed cipher clone); the results are
//! re-ordered before hitting the socket, which stays single-writer, so
//! emission within a wave is strictly ascending by segment id. The
//! socket's own send buffer provides the coarse back-pressure between
//! bursts.

use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinSet;

use cascade_core::error::TransferError;
use cascade_core::fileset::DiskFileSet;
use cascade_core::group::DatagramGroup;
use cascade_core::psk::PayloadCipher;
use cascade_core::wire::{FileSegment, Message};

pub struct MulticastSender {
    group: Arc<DatagramGroup>,
    cipher: Option<PayloadCipher>,
    /// Pre-encode block size; every datagram carries exactly this many
    /// payload bytes, the final chunk zero-padded up to it.
    usable: usize,
}

impl MulticastSender {
    pub fn new(group: Arc<DatagramGroup>, cipher: Option<PayloadCipher>, usable: usize) -> Self {
        Self { group, cipher, usable }
    }

    /// Send one burst of segments in ascending order.
    ///
    /// `ids` index into the fileset's chunk sequence and must already be
    /// sorted; chunk reads are sequential, encode fans out, emission is
    /// ordered.
    pub async fn send_burst(
        &self,
        fileset: &mut DiskFileSet,
        ids: &[u64],
    ) -> Result<(), TransferError> {
        let mut jobs = Vec::with_capacity(ids.len());
        for &segment_id in ids {
            let chunk = *fileset
                .chunk(segment_id)
                .ok_or_else(|| io_error(format!("segment {segment_id} out of range")))?;
            let mut data = fileset.read_chunk(&chunk)?;
            data.resize(self.usable, 0);
            jobs.push((segment_id, data));
        }

        let mut tasks = JoinSet::new();
        for (index, (segment_id, data)) in jobs.into_iter().enumerate() {
            let cipher = self.cipher.clone();
            tasks.spawn(async move {
                let payload = match &cipher {
                    Some(c) => c
                        .encode_block(segment_id, &data)
                        .map_err(|e| io_error(e.to_string()))?,
                    None => data,
                };
                let datagram = Message::FileSegment(FileSegment {
                    segment_id,
                    data: Bytes::from(payload),
                })
                .encode_to_vec();
                Ok::<_, TransferError>((index, datagram))
            });
        }

        let mut encoded: Vec<Option<Vec<u8>>> = vec![None; ids.len()];
        while let Some(joined) = tasks.join_next().await {
            let (index, datagram) = joined.map_err(|e| io_error(e.to_string()))??;
            encoded[index] = Some(datagram);
        }

        for datagram in encoded.into_iter().flatten() {
            self.group.send(&datagram).await?;
        }
        Ok(())
    }
}

fn io_error(message: String) -> TransferError {
    TransferError::TransportLost(std::io::Error::other(message))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
