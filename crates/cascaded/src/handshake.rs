//! Challenge/response authentication on a fresh control channel.
//!
//! The server draws a nonce and sends it as the challenge key — encoded
//! under the PSK when a pass-phrase is configured, in the clear
//! otherwise. With a pass-phrase, both ends then seal the channel with a
//! key derived from the PSK and that nonce, so a receiver holding the
//! wrong pass-phrase dies on the first sealed frame instead of being
//! silently downgraded. The receiver proves possession by returning the
//! canonical marker encoded the same deterministic way; the server
//! validates by re-encoding and comparing byte-for-byte.

use rand::RngCore;

use cascade_core::channel::{ControlChannel, Side};
use cascade_core::error::TransferError;
use cascade_core::psk::{PayloadCipher, CLIENT_MARKER};
use cascade_core::wire::{Challenge, Message, Response, Status};

/// Server side of the challenge exchange. On success the channel is
/// sealed iff a cipher is configured.
pub async fn authenticate(
    channel: &mut ControlChannel,
    cipher: Option<&PayloadCipher>,
) -> Result<(), TransferError> {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);

    let challenge_key = match cipher {
        Some(c) => c.encode_auth(&nonce).map_err(|_| TransferError::AuthFailed)?,
        None => nonce.to_vec(),
    };
    channel
        .send(&Message::Challenge(Challenge { challenge_key }))
        .await?;

    if let Some(c) = cipher {
        channel.seal(c, &nonce, Side::Server);
    }

    let response = match channel.recv().await {
        Ok(Message::ChallengeResponse(r)) => r,
        Ok(other) => {
            tracing::warn!(got = ?message_name(&other), "expected ChallengeResponse");
            reject(channel).await;
            return Err(TransferError::AuthFailed);
        }
        Err(TransferError::AuthFailed) => {
            // Sealed frame failed to open — wrong pass-phrase.
            reject(channel).await;
            return Err(TransferError::AuthFailed);
        }
        Err(e) => return Err(e),
    };

    let expected = match cipher {
        Some(c) => c.encode_auth(CLIENT_MARKER).map_err(|_| TransferError::AuthFailed)?,
        None => CLIENT_MARKER.to_vec(),
    };
    if response.challenge_key != expected {
        reject(channel).await;
        return Err(TransferError::AuthFailed);
    }

    Ok(())
}

async fn reject(channel: &mut ControlChannel) {
    let _ = channel
        .send(&Message::Response(Response::failed(
            Status::AuthFailed,
            "authentication failed",
        )))
        .await;
    channel.close().await;
}

fn message_name(msg: &Message) -> &'static str {
    match msg {
        Message::Challenge(_) => "Challenge",
        Message::ChallengeResponse(_) => "ChallengeResponse",
        Message::Response(_) => "Response",
        Message::SessionJoinRequest(_) => "SessionJoinRequest",
        Message::SessionJoinResponse(_) => "SessionJoinResponse",
        Message::FileSegment(_) => "FileSegment",
        Message::PacketStatusUpdate(_) => "PacketStatusUpdate",
        Message::PacketStatusUpdateResponse(_) => "PacketStatusUpdateResponse",
        Message::WaveStatusUpdate(_) => "WaveStatusUpdate",
        Message::WaveCompleteResponse(_) => "WaveCompleteResponse",
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
