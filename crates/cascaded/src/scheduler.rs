//! Wave scheduler — one task per session.
//!
//! The scheduler is the single logical thread for its session: receiver
//! records live here and every mutation (admission, status update,
//! bit-vector refresh, eviction) arrives as an event on one channel, so
//! no lock guards the records.
//!
//! A wave is one traversal of the transmit plan — the ascending
//! `segment_id`s unset in the aggregate (the AND across admitted
//! receivers' most recent bit-vectors; wave 0 plans every chunk).
//! Emission is burst-paced: after each burst the event queue is drained
//! so status updates are answered while data flows. When the plan is
//! exhausted, status updates are answered with `WaveComplete` until
//! every admitted receiver has delivered its `WaveStatusUpdate` or the
//! boundary timeout passes; stragglers are evicted, the aggregate is
//! rebuilt, and the wave counter moves on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot};

use cascade_core::bitvec::BitVector;
use cascade_core::block::BlockSize;
use cascade_core::config::ServerConfig;
use cascade_core::fileset::DiskFileSet;
use cascade_core::wire::{
    FileHeader, PacketStatusUpdate, PacketStatusUpdateResponse, ResponseType, Status,
    WaveCompleteResponse, WaveStatusUpdate,
};

use crate::sender::MulticastSender;

/// Everything a freshly admitted receiver needs to start listening.
#[derive(Debug, Clone)]
pub struct JoinGrant {
    pub receiver_id: u64,
    pub files: Vec<FileHeader>,
    pub multicast_address: String,
    pub multicast_port: u16,
    pub segment_size: u32,
    pub wave_number: u64,
}

/// Receiver-side happenings, serialized through the scheduler.
pub enum SchedulerEvent {
    Join {
        resume: bool,
        reply: oneshot::Sender<Result<JoinGrant, String>>,
    },
    Status {
        receiver_id: u64,
        update: PacketStatusUpdate,
        reply: oneshot::Sender<PacketStatusUpdateResponse>,
    },
    WaveStatus {
        receiver_id: u64,
        update: WaveStatusUpdate,
        reply: oneshot::Sender<WaveCompleteResponse>,
    },
    Disconnected {
        receiver_id: u64,
    },
}

struct ReceiverRecord {
    bits: BitVector,
    bytes_left: u64,
    leaving: bool,
    last_seen: Instant,
    /// Reply handle parked until the wave boundary resolves.
    pending_wave_reply: Option<oneshot::Sender<WaveCompleteResponse>>,
    reported_this_boundary: bool,
}

pub struct WaveScheduler {
    config: Arc<ServerConfig>,
    path: String,
    session_id: usize,
    fileset: DiskFileSet,
    files: Vec<FileHeader>,
    block: BlockSize,
    multicast_port: u16,
    sender: MulticastSender,
    events: mpsc::Receiver<SchedulerEvent>,
    shutdown: broadcast::Receiver<()>,

    receivers: HashMap<u64, ReceiverRecord>,
    next_receiver_id: u64,
    wave: u64,
    aggregate: BitVector,
    transmitted_in_wave: u64,
    /// True between plan exhaustion and the boundary resolving; status
    /// updates are answered with `WaveComplete` while set.
    soliciting: bool,
}

impl WaveScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ServerConfig>,
        path: String,
        session_id: usize,
        fileset: DiskFileSet,
        block: BlockSize,
        multicast_port: u16,
        sender: MulticastSender,
        events: mpsc::Receiver<SchedulerEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let files = fileset.files().to_vec();
        let total_chunks = fileset.enumerate_chunks().len();
        Self {
            config,
            path,
            session_id,
            fileset,
            files,
            block,
            multicast_port,
            sender,
            events,
            shutdown,
            receivers: HashMap::new(),
            next_receiver_id: 0,
            wave: 0,
            aggregate: BitVector::new(total_chunks),
            transmitted_in_wave: 0,
            soliciting: false,
        }
    }

    /// Drive the session to its end. Returns when the payload is fully
    /// delivered, every receiver has left, or the idle grace expires.
    pub async fn run(mut self) {
        tracing::info!(
            path = self.path,
            session = self.session_id,
            chunks = self.aggregate.len(),
            "session scheduler starting"
        );

        loop {
            if self.receivers.is_empty() {
                if !self.wait_for_join().await {
                    break;
                }
                continue;
            }

            let plan = self.aggregate.unset_indices();
            if plan.is_empty() {
                // Fully delivered to everyone admitted; wait for their
                // departure updates.
                if !self.drain_departures().await {
                    break;
                }
                continue;
            }

            if !self.emit_wave(&plan).await {
                break;
            }
            if self.receivers.is_empty() {
                continue;
            }
            self.wave_boundary().await;
        }

        tracing::info!(
            path = self.path,
            session = self.session_id,
            wave = self.wave,
            "session scheduler stopping"
        );
    }

    /// Idle phase: no admitted receivers. True when a join arrived
    /// within the grace period, false when the session should end.
    async fn wait_for_join(&mut self) -> bool {
        let grace = self.config.idle_grace();
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => return false,
                event = tokio::time::timeout(grace, self.events.recv()) => match event {
                    Err(_) => {
                        tracing::info!(path = self.path, "idle grace expired");
                        return false;
                    }
                    Ok(None) => return false,
                    Ok(Some(event)) => {
                        self.handle_event(event);
                        if !self.receivers.is_empty() {
                            return true;
                        }
                    }
                },
            }
        }
    }

    /// Emit one wave of the plan in ascending order, burst by burst,
    /// draining events between bursts. False on shutdown.
    async fn emit_wave(&mut self, plan: &[u64]) -> bool {
        self.transmitted_in_wave = 0;
        self.soliciting = false;
        tracing::debug!(
            path = self.path,
            wave = self.wave,
            planned = plan.len(),
            "wave emission starting"
        );

        for burst in plan.chunks(self.config.multicast_burst_length) {
            match self.sender.send_burst(&mut self.fileset, burst).await {
                Ok(()) => self.transmitted_in_wave += burst.len() as u64,
                Err(e) => {
                    // The wave mechanism absorbs datagram loss; log and
                    // let the next wave resend.
                    tracing::warn!(error = %e, wave = self.wave, "burst transmission failed");
                }
            }

            if self.shutdown.try_recv().is_ok() {
                return false;
            }
            while let Ok(event) = self.events.try_recv() {
                self.handle_event(event);
            }
            if self.receivers.is_empty() {
                tracing::debug!(path = self.path, wave = self.wave, "all receivers gone mid-wave");
                return true;
            }
        }

        tracing::debug!(
            path = self.path,
            wave = self.wave,
            transmitted = self.transmitted_in_wave,
            "wave emission complete"
        );
        true
    }

    /// Wave boundary: solicit full bit-vectors, wait for every admitted
    /// receiver (or the timeout), evict stragglers, advance the wave.
    async fn wave_boundary(&mut self) {
        self.soliciting = true;
        for record in self.receivers.values_mut() {
            record.reported_this_boundary = false;
        }

        let deadline = Instant::now() + self.config.wave_boundary_timeout();
        while self
            .receivers
            .values()
            .any(|r| !r.reported_this_boundary)
        {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                _ = self.shutdown.recv() => break,
                event = tokio::time::timeout(remaining, self.events.recv()) => match event {
                    Err(_) => break,
                    Ok(None) => break,
                    Ok(Some(event)) => self.handle_event(event),
                },
            }
        }

        // Evict receivers that stayed silent across the boundary.
        let evicted: Vec<u64> = self
            .receivers
            .iter()
            .filter(|(_, r)| !r.reported_this_boundary)
            .map(|(&id, _)| id)
            .collect();
        for id in evicted {
            tracing::warn!(
                path = self.path,
                receiver = id,
                wave = self.wave,
                "evicting receiver: no wave status before the boundary timeout"
            );
            // Dropping the record drops any parked reply; the control
            // loop observes the closed oneshot and closes the channel.
            self.receivers.remove(&id);
        }

        self.wave += 1;
        self.soliciting = false;
        self.rebuild_aggregate();

        for (id, record) in self.receivers.iter_mut() {
            if let Some(reply) = record.pending_wave_reply.take() {
                let _ = reply.send(WaveCompleteResponse {
                    status: Status::Ok,
                    error_message: String::new(),
                    wave_number: self.wave,
                });
            }
            tracing::trace!(receiver = id, wave = self.wave, "boundary resolved");
        }

        tracing::debug!(
            path = self.path,
            wave = self.wave,
            receivers = self.receivers.len(),
            outstanding = self.aggregate.count_unset(),
            "wave boundary resolved"
        );
    }

    /// Plan is empty but receivers remain: absorb their final updates.
    /// False when the scheduler should stop.
    async fn drain_departures(&mut self) -> bool {
        let timeout = self.config.wave_boundary_timeout();
        tokio::select! {
            _ = self.shutdown.recv() => return false,
            event = tokio::time::timeout(timeout, self.events.recv()) => match event {
                Err(_) => {
                    // Nothing heard for a whole boundary period; drop
                    // receivers that went quiet after completion.
                    let stale: Vec<u64> = self
                        .receivers
                        .iter()
                        .filter(|(_, r)| r.last_seen.elapsed() >= timeout)
                        .map(|(&id, _)| id)
                        .collect();
                    for id in stale {
                        tracing::warn!(receiver = id, "dropping silent receiver after completion");
                        self.receivers.remove(&id);
                    }
                }
                Ok(None) => return false,
                Ok(Some(event)) => self.handle_event(event),
            },
        }
        true
    }

    fn handle_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Join { resume, reply } => self.handle_join(resume, reply),
            SchedulerEvent::Status { receiver_id, update, reply } => {
                self.handle_status(receiver_id, update, reply)
            }
            SchedulerEvent::WaveStatus { receiver_id, update, reply } => {
                self.handle_wave_status(receiver_id, update, reply)
            }
            SchedulerEvent::Disconnected { receiver_id } => {
                if self.receivers.remove(&receiver_id).is_some() {
                    tracing::info!(
                        path = self.path,
                        receiver = receiver_id,
                        "receiver disconnected"
                    );
                }
            }
        }
    }

    fn handle_join(
        &mut self,
        resume: bool,
        reply: oneshot::Sender<Result<JoinGrant, String>>,
    ) {
        if self.receivers.len() >= self.config.max_connections_per_session {
            let _ = reply.send(Err(format!(
                "session {} at its {}-receiver limit",
                self.path, self.config.max_connections_per_session
            )));
            return;
        }

        let receiver_id = self.next_receiver_id;
        self.next_receiver_id += 1;
        let total_bytes = self.fileset.total_bytes();
        self.receivers.insert(
            receiver_id,
            ReceiverRecord {
                bits: BitVector::new(self.aggregate.len()),
                bytes_left: total_bytes,
                leaving: false,
                last_seen: Instant::now(),
                pending_wave_reply: None,
                // A mid-boundary joiner has nothing to report yet.
                reported_this_boundary: true,
            },
        );
        // An admitted receiver with an empty vector means the next plan
        // covers everything again until it reports otherwise.
        self.rebuild_aggregate();

        tracing::info!(
            path = self.path,
            receiver = receiver_id,
            resume,
            admitted = self.receivers.len(),
            "receiver admitted"
        );

        let _ = reply.send(Ok(JoinGrant {
            receiver_id,
            files: self.files.clone(),
            multicast_address: self.config.multicast_address.to_string(),
            multicast_port: self.multicast_port,
            segment_size: self.block.usable as u32,
            wave_number: self.wave,
        }));
    }

    fn handle_status(
        &mut self,
        receiver_id: u64,
        update: PacketStatusUpdate,
        reply: oneshot::Sender<PacketStatusUpdateResponse>,
    ) {
        let soliciting = self.soliciting;
        let rate = self.reception_rate(receiver_id);
        let Some(record) = self.receivers.get_mut(&receiver_id) else {
            // Evicted concurrently; dropping the reply closes the loop.
            return;
        };
        record.bytes_left = update.bytes_left;
        record.leaving = update.leaving_session;
        record.last_seen = Instant::now();

        let response_type = if soliciting {
            ResponseType::WaveComplete
        } else {
            ResponseType::Ok
        };
        let _ = reply.send(PacketStatusUpdateResponse {
            status: Status::Ok,
            error_message: String::new(),
            reception_rate: rate,
            response_type,
        });
    }

    fn handle_wave_status(
        &mut self,
        receiver_id: u64,
        update: WaveStatusUpdate,
        reply: oneshot::Sender<WaveCompleteResponse>,
    ) {
        let total = self.aggregate.len();
        let Some(record) = self.receivers.get_mut(&receiver_id) else {
            return;
        };

        match BitVector::from_bytes(total, &update.file_bit_vector) {
            Some(bits) => record.bits = bits,
            None => {
                tracing::warn!(
                    receiver = receiver_id,
                    got = update.file_bit_vector.len(),
                    "undersized bit-vector in wave status; ignoring"
                );
            }
        }
        record.bytes_left = update.bytes_left;
        record.last_seen = Instant::now();
        record.reported_this_boundary = true;

        if update.leaving_session {
            // Departing receiver: acknowledge and drop the record now so
            // the boundary never waits on it.
            let _ = reply.send(WaveCompleteResponse {
                status: Status::Ok,
                error_message: String::new(),
                wave_number: self.wave,
            });
            self.receivers.remove(&receiver_id);
            self.rebuild_aggregate();
            tracing::info!(
                path = self.path,
                receiver = receiver_id,
                remaining = self.receivers.len(),
                "receiver left the session"
            );
        } else if self.soliciting {
            record.pending_wave_reply = Some(reply);
        } else {
            // Unsolicited refresh (e.g. right after a reconnect).
            let _ = reply.send(WaveCompleteResponse {
                status: Status::Ok,
                error_message: String::new(),
                wave_number: self.wave,
            });
            self.rebuild_aggregate();
        }
    }

    /// `aggregate[i] = 1` iff every admitted receiver reports bit `i`.
    fn rebuild_aggregate(&mut self) {
        let total = self.aggregate.len();
        let mut aggregate = if self.receivers.is_empty() {
            BitVector::new(total)
        } else {
            BitVector::full(total)
        };
        for record in self.receivers.values() {
            aggregate.and_with(&record.bits);
        }
        self.aggregate = aggregate;
    }

    fn reception_rate(&self, receiver_id: u64) -> f32 {
        let transmitted = self.transmitted_in_wave as f64;
        let missing = self
            .receivers
            .get(&receiver_id)
            .map(|r| r.bits.count_unset() as f64)
            .unwrap_or(0.0);
        if transmitted + missing == 0.0 {
            return 1.0;
        }
        (transmitted / (transmitted + missing)).clamp(0.0, 1.0) as f32
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
