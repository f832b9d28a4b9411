//! Pre-shared-key material and the payload cipher.
//!
//! A pass-phrase, taken under a configurable text encoding (UTF-16LE by
//! default, matching what existing deployments feed in), is stretched
//! into a 32-byte key with blake3's derive-key mode. The same key drives
//! two things:
//!
//!   * the challenge exchange — the server encodes a fresh nonce under
//!     the PSK, and the receiver proves possession by returning the
//!     canonical receiver marker encoded the same way;
//!   * payload encoding — every multicast block is sealed individually,
//!     with the nonce derived from the segment id so no nonce travels on
//!     the wire and retransmissions are byte-identical.
//!
//! Nonce derivation makes encoding deterministic per (key, context, id),
//! which is what lets the server validate a `ChallengeResponse` by
//! re-encoding and comparing byte-for-byte.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use thiserror::Error;
use zeroize::Zeroizing;

/// Poly1305 tag appended to every sealed block.
pub const TAG_LEN: usize = 16;

/// Canonical receiver marker, the plaintext of every `ChallengeResponse`.
pub const CLIENT_MARKER: &[u8] = b"client";

const KEY_CONTEXT: &str = "cascade v1 payload key";
const CHANNEL_KEY_CONTEXT: &str = "cascade v1 control channel key";

/// Nonce domains. The id half of the nonce is scoped by one of these so
/// a segment nonce can never collide with an auth or channel nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NonceDomain {
    Segment = 1,
    Auth = 2,
    ControlToServer = 3,
    ControlToClient = 4,
}

#[derive(Debug, Error)]
pub enum PskError {
    #[error("block decode failed (key mismatch or corrupt data)")]
    DecodeFailed,

    #[error("block encode failed")]
    EncodeFailed,
}

// ── Pass-phrase encoding ──────────────────────────────────────────────────────

/// Text encoding applied to the pass-phrase before key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PassphraseEncoding {
    /// Two bytes per UTF-16 code unit, little-endian. The default, for
    /// compatibility with existing pass-phrase provisioning.
    #[default]
    Utf16Le,
    Utf8,
}

impl PassphraseEncoding {
    pub fn encode(&self, passphrase: &str) -> Zeroizing<Vec<u8>> {
        let bytes = match self {
            PassphraseEncoding::Utf16Le => passphrase
                .encode_utf16()
                .flat_map(|unit| unit.to_le_bytes())
                .collect(),
            PassphraseEncoding::Utf8 => passphrase.as_bytes().to_vec(),
        };
        Zeroizing::new(bytes)
    }
}

/// Derives PSK material from pass-phrases under a fixed encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassphraseEncoder {
    pub encoding: PassphraseEncoding,
}

impl PassphraseEncoder {
    pub fn new(encoding: PassphraseEncoding) -> Self {
        Self { encoding }
    }

    /// Pass-phrase → 32-byte payload key.
    pub fn derive_key(&self, passphrase: &str) -> Zeroizing<[u8; 32]> {
        let material = self.encoding.encode(passphrase);
        Zeroizing::new(blake3::derive_key(KEY_CONTEXT, &material))
    }
}

// ── Payload cipher ────────────────────────────────────────────────────────────

/// ChaCha20-Poly1305 over PSK-derived keys with derived nonces.
///
/// Cloning rebuilds the cipher from the stored key; the wave sender
/// clones one instance per encode task instead of re-deriving from the
/// pass-phrase.
pub struct PayloadCipher {
    cipher: ChaCha20Poly1305,
    key: Zeroizing<[u8; 32]>,
}

impl Clone for PayloadCipher {
    fn clone(&self) -> Self {
        Self::from_key(*self.key)
    }
}

impl PayloadCipher {
    pub fn from_key(key: [u8; 32]) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        Self { cipher, key: Zeroizing::new(key) }
    }

    pub fn from_passphrase(encoder: &PassphraseEncoder, passphrase: &str) -> Self {
        Self::from_key(*encoder.derive_key(passphrase))
    }

    /// Derive a sibling cipher for the control channel, bound to the
    /// challenge nonce so a stale or replayed nonce keys a dead channel.
    pub fn channel_cipher(&self, challenge_nonce: &[u8]) -> PayloadCipher {
        let mut material = Zeroizing::new(Vec::with_capacity(32 + challenge_nonce.len()));
        material.extend_from_slice(&*self.key);
        material.extend_from_slice(challenge_nonce);
        PayloadCipher::from_key(blake3::derive_key(CHANNEL_KEY_CONTEXT, &material))
    }

    fn nonce(domain: NonceDomain, id: u64) -> Nonce {
        let mut raw = [0u8; 12];
        raw[..4].copy_from_slice(&(domain as u32).to_le_bytes());
        raw[4..].copy_from_slice(&id.to_le_bytes());
        Nonce::from(raw)
    }

    /// Output length for an `n`-byte plaintext. The nonce is derived on
    /// both sides, so only the Poly1305 tag is carried.
    pub fn encoded_len(&self, n: usize) -> usize {
        n + TAG_LEN
    }

    pub fn seal(&self, domain: NonceDomain, id: u64, plaintext: &[u8]) -> Result<Vec<u8>, PskError> {
        self.cipher
            .encrypt(&Self::nonce(domain, id), Payload::from(plaintext))
            .map_err(|_| PskError::EncodeFailed)
    }

    pub fn open(&self, domain: NonceDomain, id: u64, sealed: &[u8]) -> Result<Vec<u8>, PskError> {
        self.cipher
            .decrypt(&Self::nonce(domain, id), Payload::from(sealed))
            .map_err(|_| PskError::DecodeFailed)
    }

    /// Seal one payload block; the segment id scopes the nonce.
    pub fn encode_block(&self, segment_id: u64, plaintext: &[u8]) -> Result<Vec<u8>, PskError> {
        self.seal(NonceDomain::Segment, segment_id, plaintext)
    }

    pub fn decode_block(&self, segment_id: u64, sealed: &[u8]) -> Result<Vec<u8>, PskError> {
        self.open(NonceDomain::Segment, segment_id, sealed)
    }

    /// Deterministic encoding used by the challenge exchange.
    pub fn encode_auth(&self, plaintext: &[u8]) -> Result<Vec<u8>, PskError> {
        self.seal(NonceDomain::Auth, 0, plaintext)
    }

    pub fn decode_auth(&self, sealed: &[u8]) -> Result<Vec<u8>, PskError> {
        self.open(NonceDomain::Auth, 0, sealed)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
