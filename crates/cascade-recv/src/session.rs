//! Receiver session — connect, authenticate, join, receive, report.
//!
//! Error handling is centralized here. Anything raised before
//! authentication and join have both completed is fatal and surfaces as
//! `SessionAborted`; afterwards, transport-class failures re-enter the
//! reconnect loop after a delay. `AuthFailed`, `PayloadMismatch`, and
//! `Cancelled` never retry. Admission refusals retry on the same delay,
//! since a slot may free up. The local bit-vector and on-disk partial
//! files are retained across attempts — a reconnect re-announces the
//! vector in its next wave status, so resumed transfers only pay for
//! the chunks still missing.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};

use cascade_core::bitvec::BitVector;
use cascade_core::channel::{ControlChannel, Side};
use cascade_core::config::ClientConfig;
use cascade_core::error::TransferError;
use cascade_core::fileset::DiskFileSet;
use cascade_core::group::{DatagramGroup, GroupInterface};
use cascade_core::psk::{PassphraseEncoder, PayloadCipher, CLIENT_MARKER};
use cascade_core::wire::{
    ChallengeResponse, FileHeader, Message, SessionJoinRequest, SessionJoinResponse, Status,
    WireError,
};

use crate::engine::{self, status_error, EngineShared, QUEUE_DEPTH};
use crate::uri::TransferUri;

/// What a completed transfer looked like.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub path: String,
    pub files: Vec<FileHeader>,
    pub bytes_total: u64,
    pub waves: u64,
    pub decode_failures: u64,
}

/// State carried across reconnect attempts.
struct RetainedState {
    files: Vec<FileHeader>,
    segment_size: u32,
    bits: BitVector,
}

pub struct ReceiverSession {
    uri: TransferUri,
    config: ClientConfig,
}

impl ReceiverSession {
    pub fn new(uri: TransferUri, config: ClientConfig) -> Result<Self, TransferError> {
        config.validate()?;
        if uri.secure && config.passphrase.is_empty() {
            return Err(TransferError::ConfigInvalid(
                "mcs:// requires a pass-phrase".into(),
            ));
        }
        Ok(Self { uri, config })
    }

    /// Run to completion, reconnecting where the error policy allows.
    pub async fn run(
        &self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<TransferReport, TransferError> {
        let mut retained: Option<RetainedState> = None;
        let mut joined_once = false;

        loop {
            let attempt = tokio::select! {
                _ = shutdown.recv() => return Err(TransferError::Cancelled),
                result = self.attempt(&mut retained, &mut joined_once) => result,
            };

            let error = match attempt {
                Ok(report) => return Ok(report),
                Err(e) => e,
            };
            let refused = matches!(error, TransferError::Refused(_));
            if !joined_once && !refused {
                // Failure before the first completed join: nothing worth
                // reconnecting for. Refusals are the exception — a slot
                // may free up.
                return Err(TransferError::aborted(error));
            }
            if error.is_fatal() {
                return Err(error);
            }

            let delay = self.config.reconnect_delay();
            tracing::warn!(
                error = %error,
                delay_secs = delay.as_secs_f64(),
                "transfer interrupted; reconnecting"
            );
            tokio::select! {
                _ = shutdown.recv() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(
        &self,
        retained: &mut Option<RetainedState>,
        joined_once: &mut bool,
    ) -> Result<TransferReport, TransferError> {
        let endpoint = self.uri.control_endpoint();
        let stream = TcpStream::connect(&endpoint).await?;
        let mut channel = ControlChannel::plain(stream, self.config.read_timeout());
        tracing::debug!(endpoint, secure = self.uri.secure, "control channel connected");

        let cipher = self.uri.secure.then(|| {
            let encoder = PassphraseEncoder::new(self.config.passphrase_encoding);
            PayloadCipher::from_passphrase(&encoder, &self.config.passphrase)
        });

        self.authenticate(&mut channel, cipher.as_ref()).await?;
        let join = self.join(&mut channel, *joined_once).await?;

        // Reconnects must find the payload they started with.
        if let Some(prior) = retained.as_ref() {
            if prior.files != join.files || prior.segment_size != join.segment_size {
                tracing::error!(path = self.uri.path, "payload changed since the last attempt");
                if let Ok(mut partial) = DiskFileSet::prepare(
                    &self.config.root_folder,
                    &self.uri.path,
                    prior.files.clone(),
                    prior.segment_size as usize,
                ) {
                    let _ = partial.clean();
                }
                return Err(TransferError::PayloadMismatch);
            }
        }
        if join.segment_size == 0 {
            return Err(TransferError::ConfigInvalid(
                "server announced a zero segment size".into(),
            ));
        }

        let mut fileset = DiskFileSet::prepare(
            &self.config.root_folder,
            &self.uri.path,
            join.files.clone(),
            join.segment_size as usize,
        )?;
        let total_chunks = fileset.enumerate_chunks().len();
        let bytes_total = fileset.total_bytes();

        let group = Arc::new(DatagramGroup::join(
            join.multicast_address.parse().map_err(|_| {
                TransferError::MalformedFrame(WireError::UnexpectedMessage("multicast address"))
            })?,
            join.multicast_port,
            &GroupInterface::default(),
            self.config.ttl,
            self.config.multicast_buffer_size,
        )?);

        let bits = match retained.take() {
            Some(state) => state.bits,
            None => BitVector::new(total_chunks),
        };
        let bytes_left: u64 = fileset
            .enumerate_chunks()
            .iter()
            .filter(|c| !bits.test(c.segment_id as usize))
            .map(|c| c.len as u64)
            .sum();
        fileset.init_write()?;

        *joined_once = true;
        tracing::info!(
            path = self.uri.path,
            files = join.files.len(),
            chunks = total_chunks,
            bytes_left,
            wave = join.wave_number,
            "joined session"
        );

        let already_complete = !bits.any_unset();
        let shared = EngineShared::new(bits, bytes_left);
        shared.progress.wave.store(join.wave_number, Ordering::Relaxed);
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_DEPTH);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (complete_tx, complete_rx) = watch::channel(already_complete);

        tokio::spawn(engine::intake_loop(
            group.clone(),
            cipher.clone(),
            shared.clone(),
            queue_tx,
            cancel_rx.clone(),
        ));
        let mut writer = tokio::spawn(engine::writer_loop(
            fileset,
            shared.clone(),
            queue_rx,
            complete_tx,
            cancel_rx.clone(),
        ));

        let result = {
            let reporter = engine::reporter_loop(
                &mut channel,
                shared.clone(),
                self.config.packet_update_interval(),
                complete_rx,
                cancel_rx,
            );
            tokio::pin!(reporter);

            tokio::select! {
                reported = &mut reporter => reported,
                wrote = &mut writer => match wrote {
                    Ok(Err(e)) => Err(e),
                    Ok(Ok(_)) | Err(_) => Err(TransferError::TransportLost(
                        std::io::Error::other("chunk writer stopped unexpectedly"),
                    )),
                },
            }
        };

        // Teardown: stop the engine, recover the bit-vector for the
        // next attempt, release the group and channel.
        let _ = cancel_tx.send(true);
        if !writer.is_finished() {
            let _ = (&mut writer).await;
        }
        let final_bits = shared.bits.lock().await.clone();
        *retained = Some(RetainedState {
            files: join.files.clone(),
            segment_size: join.segment_size,
            bits: final_bits,
        });
        channel.close().await;

        result.map(|()| TransferReport {
            path: self.uri.path.clone(),
            files: join.files,
            bytes_total,
            waves: shared.progress.wave.load(Ordering::Relaxed),
            decode_failures: shared.progress.decode_failures.load(Ordering::Relaxed),
        })
    }

    /// Client side of the challenge exchange.
    async fn authenticate(
        &self,
        channel: &mut ControlChannel,
        cipher: Option<&PayloadCipher>,
    ) -> Result<(), TransferError> {
        let challenge = match channel.recv().await? {
            Message::Challenge(c) => c,
            Message::Response(r) => return Err(status_error(r.status, &r.error_message)),
            other => {
                tracing::warn!(?other, "expected Challenge");
                return Err(WireError::UnexpectedMessage("Challenge").into());
            }
        };

        let challenge_key = match cipher {
            Some(c) => {
                // Recover the nonce; a wrong pass-phrase fails here, and
                // the sealed channel below would reject us anyway.
                let nonce = c
                    .decode_auth(&challenge.challenge_key)
                    .map_err(|_| TransferError::AuthFailed)?;
                channel.seal(c, &nonce, Side::Client);
                c.encode_auth(CLIENT_MARKER)
                    .map_err(|_| TransferError::AuthFailed)?
            }
            None => CLIENT_MARKER.to_vec(),
        };

        channel
            .send(&Message::ChallengeResponse(ChallengeResponse { challenge_key }))
            .await?;
        Ok(())
    }

    async fn join(
        &self,
        channel: &mut ControlChannel,
        resuming: bool,
    ) -> Result<SessionJoinResponse, TransferError> {
        channel
            .send(&Message::SessionJoinRequest(SessionJoinRequest {
                path: self.uri.path.clone(),
                state: resuming as u64,
            }))
            .await?;

        match channel.recv().await? {
            Message::SessionJoinResponse(join) if join.status == Status::Ok => Ok(join),
            Message::SessionJoinResponse(join) => {
                Err(status_error(join.status, &join.error_message))
            }
            Message::Response(r) => Err(status_error(r.status, &r.error_message)),
            other => {
                tracing::warn!(?other, "expected SessionJoinResponse");
                Err(WireError::UnexpectedMessage("SessionJoinResponse").into())
            }
        }
    }
}
