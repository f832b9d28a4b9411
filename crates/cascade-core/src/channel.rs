//! Framed point-to-point control channel.
//!
//! Frames are a u32 BE length prefix followed by one message body. The
//! channel starts in the clear; once the challenge exchange has agreed
//! on a nonce, both sides upgrade in place to the sealed variant, which
//! encrypts every frame body under a key derived from the PSK and that
//! nonce. Per-direction frame counters feed the nonce, so replayed or
//! reordered frames fail to open — a mismatched pass-phrase therefore
//! dies at the first sealed frame rather than downgrading silently.
//!
//! Ordering is strictly FIFO in both directions; every receive honors
//! the configured read timeout.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::TransferError;
use crate::psk::{NonceDomain, PayloadCipher};
use crate::wire::{Message, WireError, MAX_FRAME_LEN};

/// Which end of the channel this is; decides the nonce domain used for
/// each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

enum ChannelCrypto {
    Plain,
    Sealed {
        cipher: PayloadCipher,
        send_domain: NonceDomain,
        recv_domain: NonceDomain,
        send_seq: u64,
        recv_seq: u64,
    },
}

pub struct ControlChannel {
    stream: TcpStream,
    crypto: ChannelCrypto,
    read_timeout: Duration,
}

impl ControlChannel {
    /// Wrap an established stream; frames travel in the clear until
    /// [`seal`](Self::seal) is called.
    pub fn plain(stream: TcpStream, read_timeout: Duration) -> Self {
        Self {
            stream,
            crypto: ChannelCrypto::Plain,
            read_timeout,
        }
    }

    /// Upgrade in place to the sealed variant. `base` is the PSK payload
    /// cipher; the channel key is bound to the challenge nonce.
    pub fn seal(&mut self, base: &PayloadCipher, challenge_nonce: &[u8], side: Side) {
        let cipher = base.channel_cipher(challenge_nonce);
        let (send_domain, recv_domain) = match side {
            Side::Client => (NonceDomain::ControlToServer, NonceDomain::ControlToClient),
            Side::Server => (NonceDomain::ControlToClient, NonceDomain::ControlToServer),
        };
        self.crypto = ChannelCrypto::Sealed {
            cipher,
            send_domain,
            recv_domain,
            send_seq: 0,
            recv_seq: 0,
        };
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.crypto, ChannelCrypto::Sealed { .. })
    }

    /// Send one message as one frame.
    pub async fn send(&mut self, msg: &Message) -> Result<(), TransferError> {
        let mut body = msg.encode_to_vec();
        if let ChannelCrypto::Sealed { cipher, send_domain, send_seq, .. } = &mut self.crypto {
            body = cipher
                .seal(*send_domain, *send_seq, &body)
                .map_err(|_| TransferError::AuthFailed)?;
            *send_seq += 1;
        }
        let len = body.len() as u32;
        self.stream.write_all(&len.to_be_bytes()).await?;
        self.stream.write_all(&body).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive one message, honoring the read timeout.
    pub async fn recv(&mut self) -> Result<Message, TransferError> {
        let deadline = self.read_timeout;
        tokio::time::timeout(deadline, self.recv_inner())
            .await
            .map_err(|_| {
                TransferError::TransportLost(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "control channel read timed out",
                ))
            })?
    }

    async fn recv_inner(&mut self) -> Result<Message, TransferError> {
        let mut len_bytes = [0u8; 4];
        self.stream.read_exact(&mut len_bytes).await?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(WireError::Oversized(len).into());
        }
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;

        if let ChannelCrypto::Sealed { cipher, recv_domain, recv_seq, .. } = &mut self.crypto {
            body = cipher
                .open(*recv_domain, *recv_seq, &body)
                .map_err(|_| TransferError::AuthFailed)?;
            *recv_seq += 1;
        }

        Ok(Message::decode(&body[..])?)
    }

    /// Orderly shutdown; best-effort, errors ignored.
    pub async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
