//! Control listener — TCP accept loop and per-receiver control loops.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};

use cascade_core::channel::ControlChannel;
use cascade_core::config::ServerConfig;
use cascade_core::error::TransferError;
use cascade_core::wire::{Message, Response, SessionJoinResponse, Status};

use crate::handshake;
use crate::registry::Registry;
use crate::scheduler::SchedulerEvent;

/// A running server: its bound control endpoint and supervising task.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    pub task: tokio::task::JoinHandle<()>,
}

/// Bind the control listener and start serving. Returns once the
/// listener is bound; the accept loop runs until `shutdown` fires.
pub async fn serve(config: ServerConfig, shutdown: broadcast::Sender<()>) -> Result<ServerHandle> {
    config.validate().context("server configuration rejected")?;
    let config = Arc::new(config);

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("failed to bind control listener on {}", config.bind_address))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, root = %config.root_folder.display(), "control listener ready");

    let registry = Registry::new(config.clone(), shutdown.clone());
    let mut shutdown_rx = shutdown.subscribe();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("control listener shutting down");
                    return;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tracing::debug!(%peer, "receiver connected");
                    let config = config.clone();
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_receiver(stream, peer, config, registry).await {
                            tracing::info!(%peer, error = %e, "receiver control loop ended");
                        }
                    });
                }
            }
        }
    });

    Ok(ServerHandle { local_addr, task })
}

/// One receiver, from authentication to departure.
async fn handle_receiver(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    registry: Arc<Registry>,
) -> Result<(), TransferError> {
    let mut channel = ControlChannel::plain(stream, config.read_timeout());

    handshake::authenticate(&mut channel, registry.cipher()).await?;
    tracing::debug!(%peer, sealed = channel.is_sealed(), "receiver authenticated");

    let join = match channel.recv().await? {
        Message::SessionJoinRequest(join) => join,
        other => {
            tracing::warn!(%peer, ?other, "expected SessionJoinRequest");
            return Err(TransferError::MalformedFrame(
                cascade_core::wire::WireError::UnexpectedMessage("SessionJoinRequest"),
            ));
        }
    };

    let (grant, events) = match registry.join(&join.path, join.state != 0).await {
        Ok(granted) => granted,
        Err(TransferError::Refused(reason)) => {
            tracing::info!(%peer, path = join.path, reason, "admission refused");
            channel
                .send(&Message::Response(Response::failed(Status::Refused, reason)))
                .await?;
            channel.close().await;
            return Ok(());
        }
        Err(e) => {
            tracing::warn!(%peer, path = join.path, error = %e, "join failed");
            channel
                .send(&Message::Response(Response::failed(
                    Status::Refused,
                    e.to_string(),
                )))
                .await?;
            channel.close().await;
            return Err(e);
        }
    };

    let receiver_id = grant.receiver_id;
    channel
        .send(&Message::SessionJoinResponse(SessionJoinResponse {
            status: Status::Ok,
            error_message: String::new(),
            files: grant.files,
            multicast_address: grant.multicast_address,
            multicast_port: grant.multicast_port,
            segment_size: grant.segment_size,
            wave_number: grant.wave_number,
        }))
        .await?;
    tracing::info!(%peer, path = join.path, receiver_id, resume = join.state != 0, "receiver joined");

    let result = control_loop(&mut channel, receiver_id, &events).await;

    // Whatever ended the loop, make sure the scheduler forgets us.
    let _ = events
        .send(SchedulerEvent::Disconnected { receiver_id })
        .await;
    channel.close().await;
    result
}

/// Relay status traffic between the control channel and the scheduler
/// until the receiver leaves, errors out, or is evicted.
async fn control_loop(
    channel: &mut ControlChannel,
    receiver_id: u64,
    events: &mpsc::Sender<SchedulerEvent>,
) -> Result<(), TransferError> {
    loop {
        match channel.recv().await? {
            Message::PacketStatusUpdate(update) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let event = SchedulerEvent::Status { receiver_id, update, reply: reply_tx };
                if events.send(event).await.is_err() {
                    // Session ended underneath us.
                    return Ok(());
                }
                match reply_rx.await {
                    Ok(response) => {
                        channel
                            .send(&Message::PacketStatusUpdateResponse(response))
                            .await?
                    }
                    // Dropped reply means the scheduler evicted us.
                    Err(_) => return Ok(()),
                }
            }
            Message::WaveStatusUpdate(update) => {
                let leaving = update.leaving_session;
                let (reply_tx, reply_rx) = oneshot::channel();
                let event = SchedulerEvent::WaveStatus { receiver_id, update, reply: reply_tx };
                if events.send(event).await.is_err() {
                    return Ok(());
                }
                match reply_rx.await {
                    Ok(response) => {
                        channel
                            .send(&Message::WaveCompleteResponse(response))
                            .await?
                    }
                    Err(_) => return Ok(()),
                }
                if leaving {
                    return Ok(());
                }
            }
            other => {
                tracing::warn!(receiver_id, ?other, "unexpected control message");
                return Err(TransferError::MalformedFrame(
                    cascade_core::wire::WireError::UnexpectedMessage("status update"),
                ));
            }
        }
    }
}
