//! Reception engine — datagram intake, chunk writer, status reporter.
//!
//! Intake and the writer form a producer/consumer pair over a bounded
//! queue: intake blocks when the writer falls behind, which is the only
//! back-pressure the data plane needs. The writer is the sole owner of
//! the file set and the bit-vector, so writes to a byte range never
//! race; duplicate segments are dropped on the bit check, making
//! retransmission idempotent. The reporter owns the control channel and
//! is its only user after the join, keeping the channel FIFO trivially.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};

use cascade_core::bitvec::BitVector;
use cascade_core::channel::ControlChannel;
use cascade_core::error::TransferError;
use cascade_core::fileset::DiskFileSet;
use cascade_core::group::DatagramGroup;
use cascade_core::psk::PayloadCipher;
use cascade_core::wire::{
    Message, PacketStatusUpdate, ResponseType, Status, WaveStatusUpdate, WireError,
};

use crate::stats::{Progress, ThroughputWindow};

/// Hand-off queue depth between intake and the writer.
pub(crate) const QUEUE_DEPTH: usize = 256;

/// Chunks written per batch before the writer yields.
const WRITE_BATCH: usize = 64;

/// State shared between the three engine activities and the session.
pub struct EngineShared {
    /// Owned by the writer; the reporter locks it only at wave
    /// boundaries to snapshot raw bytes.
    pub bits: Mutex<BitVector>,
    /// Segments accepted by intake but not yet written.
    pending_writes: AtomicU64,
    pub progress: Progress,
}

impl EngineShared {
    pub fn new(bits: BitVector, bytes_left: u64) -> Arc<Self> {
        let shared = Self {
            bits: Mutex::new(bits),
            pending_writes: AtomicU64::new(0),
            progress: Progress::default(),
        };
        shared.progress.bytes_left.store(bytes_left, Ordering::Relaxed);
        Arc::new(shared)
    }

    fn drained(&self) -> bool {
        self.pending_writes.load(Ordering::Acquire) == 0
    }
}

// ── Datagram intake ───────────────────────────────────────────────────────────

/// Receive datagrams, decode them, and push accepted segments onto the
/// hand-off queue. Undecodable datagrams are counted and dropped — the
/// next wave resends whatever they carried.
pub async fn intake_loop(
    group: Arc<DatagramGroup>,
    cipher: Option<PayloadCipher>,
    shared: Arc<EngineShared>,
    queue: mpsc::Sender<(u64, Vec<u8>)>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let len = tokio::select! {
            _ = cancel.changed() => return,
            received = group.recv(&mut buf) => match received {
                Ok(len) => len,
                Err(e) => {
                    tracing::warn!(error = %e, "group receive failed");
                    continue;
                }
            },
        };

        let segment = match Message::decode(&buf[..len]) {
            Ok(Message::FileSegment(segment)) => segment,
            Ok(other) => {
                tracing::trace!(?other, "non-segment datagram on the group");
                continue;
            }
            Err(e) => {
                let dropped = shared.progress.decode_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(error = %e, dropped, "undecodable datagram dropped");
                continue;
            }
        };

        let payload = match &cipher {
            Some(c) => match c.decode_block(segment.segment_id, &segment.data) {
                Ok(plain) => plain,
                Err(e) => {
                    let dropped =
                        shared.progress.decode_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        error = %e,
                        segment = segment.segment_id,
                        dropped,
                        "segment failed to decode"
                    );
                    continue;
                }
            },
            None => segment.data.to_vec(),
        };

        shared
            .progress
            .last_segment
            .store(segment.segment_id, Ordering::Relaxed);
        shared.pending_writes.fetch_add(1, Ordering::AcqRel);
        if queue.send((segment.segment_id, payload)).await.is_err() {
            return;
        }
    }
}

// ── Chunk writer ──────────────────────────────────────────────────────────────

/// Drain the queue in batches, write each new chunk at its mapped
/// range, and raise the completion flag once no bit is left unset.
pub async fn writer_loop(
    mut fileset: DiskFileSet,
    shared: Arc<EngineShared>,
    mut queue: mpsc::Receiver<(u64, Vec<u8>)>,
    complete: watch::Sender<bool>,
    mut cancel: watch::Receiver<bool>,
) -> Result<DiskFileSet, TransferError> {
    let mut batch = Vec::with_capacity(WRITE_BATCH);
    loop {
        let first = tokio::select! {
            _ = cancel.changed() => return Ok(fileset),
            received = queue.recv() => match received {
                Some(item) => item,
                None => return Ok(fileset),
            },
        };
        batch.push(first);
        while batch.len() < WRITE_BATCH {
            match queue.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }

        let mut wrote_any = false;
        for (segment_id, payload) in batch.drain(..) {
            let result = write_segment(&mut fileset, &shared, segment_id, &payload).await;
            shared.pending_writes.fetch_sub(1, Ordering::AcqRel);
            match result {
                Ok(true) => wrote_any = true,
                Ok(false) => {}
                Err(e) => return Err(e),
            }
        }

        if wrote_any {
            let bits = shared.bits.lock().await;
            if !bits.any_unset() {
                drop(bits);
                fileset.flush()?;
                tracing::info!("payload complete on disk");
                let _ = complete.send(true);
            }
        }
    }
}

/// Returns true when the segment was new and written.
async fn write_segment(
    fileset: &mut DiskFileSet,
    shared: &EngineShared,
    segment_id: u64,
    payload: &[u8],
) -> Result<bool, TransferError> {
    let Some(chunk) = fileset.chunk(segment_id).copied() else {
        tracing::warn!(segment_id, "segment outside the chunk sequence; dropped");
        return Ok(false);
    };
    // Blocks travel padded to the full block size; only the mapped
    // length is meaningful.
    if payload.len() < chunk.len as usize {
        tracing::warn!(
            segment_id,
            got = payload.len(),
            want = chunk.len,
            "short segment dropped"
        );
        return Ok(false);
    }

    {
        let bits = shared.bits.lock().await;
        if bits.test(segment_id as usize) {
            // Retransmission of something already durable.
            return Ok(false);
        }
    }

    fileset.write(&chunk, &payload[..chunk.len as usize])?;

    let mut bits = shared.bits.lock().await;
    bits.set(segment_id as usize);
    shared
        .progress
        .bytes_left
        .fetch_sub(chunk.len as u64, Ordering::AcqRel);
    Ok(true)
}

// ── Status reporter ───────────────────────────────────────────────────────────

/// Drive the control channel: periodic `PacketStatusUpdate`s, a full
/// `WaveStatusUpdate` whenever the server marks the wave complete, and
/// the final departing update once the payload is whole.
pub async fn reporter_loop(
    channel: &mut ControlChannel,
    shared: Arc<EngineShared>,
    update_interval: std::time::Duration,
    mut complete: watch::Receiver<bool>,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), TransferError> {
    let mut window = ThroughputWindow::new();
    let mut ticker = tokio::time::interval(update_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.changed() => return Err(TransferError::Cancelled),
            _ = complete.changed() => {
                if *complete.borrow() {
                    return send_departure(channel, &shared).await;
                }
            }
            _ = ticker.tick() => {}
        }
        if *complete.borrow() {
            return send_departure(channel, &shared).await;
        }

        let bytes_left = shared.progress.bytes_left.load(Ordering::Relaxed);
        channel
            .send(&Message::PacketStatusUpdate(PacketStatusUpdate {
                bytes_left,
                leaving_session: false,
            }))
            .await?;

        let response = match channel.recv().await? {
            Message::PacketStatusUpdateResponse(r) => r,
            other => {
                tracing::warn!(?other, "expected PacketStatusUpdateResponse");
                return Err(WireError::UnexpectedMessage("PacketStatusUpdateResponse").into());
            }
        };
        if response.status != Status::Ok {
            return Err(status_error(response.status, &response.error_message));
        }

        shared.progress.set_reception_rate(response.reception_rate);
        let rate = window.push(bytes_left);
        shared
            .progress
            .bytes_per_second
            .store(rate, Ordering::Relaxed);
        tracing::debug!(
            bytes_left,
            bytes_per_second = rate,
            reception_rate = response.reception_rate,
            "status reported"
        );

        if response.response_type == ResponseType::WaveComplete {
            wave_report(channel, &shared, false).await?;
        }
    }
}

/// Wait for the writer to drain, then deliver the full bit-vector and
/// absorb the wave-complete ack.
async fn wave_report(
    channel: &mut ControlChannel,
    shared: &EngineShared,
    leaving: bool,
) -> Result<(), TransferError> {
    while !shared.drained() {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let raw = shared.bits.lock().await.to_bytes();
    let bytes_left = shared.progress.bytes_left.load(Ordering::Relaxed);
    channel
        .send(&Message::WaveStatusUpdate(WaveStatusUpdate {
            bytes_left,
            leaving_session: leaving,
            file_bit_vector: raw,
        }))
        .await?;

    match channel.recv().await? {
        Message::WaveCompleteResponse(r) if r.status == Status::Ok => {
            shared.progress.wave.store(r.wave_number, Ordering::Relaxed);
            tracing::debug!(wave = r.wave_number, leaving, "wave boundary acknowledged");
            Ok(())
        }
        Message::WaveCompleteResponse(r) => Err(status_error(r.status, &r.error_message)),
        other => {
            tracing::warn!(?other, "expected WaveCompleteResponse");
            Err(WireError::UnexpectedMessage("WaveCompleteResponse").into())
        }
    }
}

async fn send_departure(
    channel: &mut ControlChannel,
    shared: &EngineShared,
) -> Result<(), TransferError> {
    wave_report(channel, shared, true).await
}

pub(crate) fn status_error(status: Status, message: &str) -> TransferError {
    match status {
        Status::AuthFailed => TransferError::AuthFailed,
        Status::PayloadMismatch => TransferError::PayloadMismatch,
        Status::Refused => TransferError::Refused(message.to_string()),
        Status::Ok => TransferError::TransportLost(std::io::Error::other(
            "server reported Ok where an error was required",
        )),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::fileset::FileHeader;

    fn prepared_fileset(label: &str, length: u64, block: usize) -> (DiskFileSet, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "cascade-engine-{label}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let files = vec![FileHeader { name: "out.bin".into(), length, ordinal: 0 }];
        let mut set = DiskFileSet::prepare(&dir, "dest", files, block).unwrap();
        set.init_write().unwrap();
        (set, dir)
    }

    #[tokio::test]
    async fn writer_sets_bits_and_signals_completion() {
        let (fileset, dir) = prepared_fileset("complete", 300, 100);
        let shared = EngineShared::new(BitVector::new(3), 300);
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_DEPTH);
        let (complete_tx, mut complete_rx) = watch::channel(false);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let writer = tokio::spawn(writer_loop(
            fileset,
            shared.clone(),
            queue_rx,
            complete_tx,
            cancel_rx,
        ));

        for id in [2u64, 0, 1] {
            shared.pending_writes.fetch_add(1, Ordering::AcqRel);
            queue_tx.send((id, vec![id as u8 + 1; 100])).await.unwrap();
        }

        tokio::time::timeout(std::time::Duration::from_secs(5), complete_rx.changed())
            .await
            .expect("writer should signal completion")
            .unwrap();
        assert!(*complete_rx.borrow());
        assert_eq!(shared.progress.bytes_left.load(Ordering::Relaxed), 0);
        assert!(!shared.bits.lock().await.any_unset());

        drop(queue_tx);
        writer.await.unwrap().unwrap();

        let written = std::fs::read(dir.join("dest/out.bin")).unwrap();
        assert_eq!(&written[..100], &[1u8; 100][..]);
        assert_eq!(&written[100..200], &[2u8; 100][..]);
        assert_eq!(&written[200..], &[3u8; 100][..]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn duplicate_segments_are_idempotent() {
        let (fileset, dir) = prepared_fileset("dup", 200, 100);
        let shared = EngineShared::new(BitVector::new(2), 200);
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_DEPTH);
        let (complete_tx, _complete_rx) = watch::channel(false);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let writer = tokio::spawn(writer_loop(
            fileset,
            shared.clone(),
            queue_rx,
            complete_tx,
            cancel_rx,
        ));

        // The same segment five times, then its sibling.
        for _ in 0..5 {
            shared.pending_writes.fetch_add(1, Ordering::AcqRel);
            queue_tx.send((0u64, vec![7u8; 100])).await.unwrap();
        }
        shared.pending_writes.fetch_add(1, Ordering::AcqRel);
        queue_tx.send((1u64, vec![9u8; 100])).await.unwrap();
        drop(queue_tx);
        writer.await.unwrap().unwrap();

        assert_eq!(shared.progress.bytes_left.load(Ordering::Relaxed), 0);
        let written = std::fs::read(dir.join("dest/out.bin")).unwrap();
        assert_eq!(&written[..100], &[7u8; 100][..]);
        assert_eq!(&written[100..], &[9u8; 100][..]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn out_of_range_and_short_segments_are_dropped() {
        let (fileset, dir) = prepared_fileset("drop", 100, 100);
        let shared = EngineShared::new(BitVector::new(1), 100);
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_DEPTH);
        let (complete_tx, _complete_rx) = watch::channel(false);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let writer = tokio::spawn(writer_loop(
            fileset,
            shared.clone(),
            queue_rx,
            complete_tx,
            cancel_rx,
        ));

        shared.pending_writes.fetch_add(1, Ordering::AcqRel);
        queue_tx.send((9u64, vec![0u8; 100])).await.unwrap();
        shared.pending_writes.fetch_add(1, Ordering::AcqRel);
        queue_tx.send((0u64, vec![0u8; 10])).await.unwrap();
        drop(queue_tx);
        writer.await.unwrap().unwrap();

        assert!(shared.drained());
        assert_eq!(shared.progress.bytes_left.load(Ordering::Relaxed), 100);
        assert!(shared.bits.lock().await.any_unset());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
