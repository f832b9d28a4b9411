//! Cascade wire format — on-wire types for all control and data traffic.
//!
//! These types ARE the protocol. Every message tag, every field tag, and
//! the varint/length-prefix rules below are part of the wire format and
//! must stay stable once assigned.
//!
//! Encoding rules:
//!   * a message body is one message-tag byte followed by its fields;
//!   * each field is one field-tag byte followed by its value;
//!   * integers are varint-encoded, booleans one byte, f32 four bytes LE;
//!   * strings and byte strings carry a varint length prefix;
//!   * on the control channel a body is framed by a u32 BE length prefix
//!     (see [`ControlChannel`](crate::channel::ControlChannel)); on the
//!     multicast path a [`FileSegment`] body is the whole datagram.
//!
//! A decoder that runs out of bytes, meets an unknown message tag, or
//! finds a field tag other than the one required next fails with
//! [`WireError`]; the caller treats that as a malformed frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use thiserror::Error;

// ── Limits ────────────────────────────────────────────────────────────────────

/// Upper bound on a single control frame body.
///
/// The largest legitimate frame is a `SessionJoinResponse` carrying the
/// full file list, or a `WaveStatusUpdate` carrying a raw bit-vector;
/// both stay far below this.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// ── Message tags ──────────────────────────────────────────────────────────────

const TAG_CHALLENGE: u8 = 1;
const TAG_CHALLENGE_RESPONSE: u8 = 2;
const TAG_RESPONSE: u8 = 3;
const TAG_SESSION_JOIN_REQUEST: u8 = 4;
const TAG_SESSION_JOIN_RESPONSE: u8 = 5;
const TAG_FILE_SEGMENT: u8 = 6;
const TAG_PACKET_STATUS_UPDATE: u8 = 7;
const TAG_PACKET_STATUS_UPDATE_RESPONSE: u8 = 8;
const TAG_WAVE_STATUS_UPDATE: u8 = 9;
const TAG_WAVE_COMPLETE_RESPONSE: u8 = 10;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("frame truncated")]
    Truncated,

    #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    Oversized(usize),

    #[error("unknown message tag 0x{0:02x}")]
    UnknownMessage(u8),

    #[error("unknown status byte 0x{0:02x}")]
    UnknownStatus(u8),

    #[error("unknown response type byte 0x{0:02x}")]
    UnknownResponseType(u8),

    #[error("required field {expected} missing, found tag {found}")]
    MissingField { expected: u8, found: u8 },

    #[error("unexpected message: wanted {0}")]
    UnexpectedMessage(&'static str),

    #[error("string field is not valid utf-8")]
    BadString,
}

impl From<bytes_varint::VarIntError> for WireError {
    fn from(_: bytes_varint::VarIntError) -> Self {
        WireError::Truncated
    }
}

// ── Enums ─────────────────────────────────────────────────────────────────────

/// Outcome carried by every server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    AuthFailed = 1,
    Refused = 2,
    PayloadMismatch = 3,
}

impl TryFrom<u8> for Status {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Ok),
            1 => Ok(Status::AuthFailed),
            2 => Ok(Status::Refused),
            3 => Ok(Status::PayloadMismatch),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

/// Discriminates a mid-wave ack from the wave-boundary solicitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseType {
    Ok = 0,
    WaveComplete = 1,
}

impl TryFrom<u8> for ResponseType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResponseType::Ok),
            1 => Ok(ResponseType::WaveComplete),
            other => Err(WireError::UnknownResponseType(other)),
        }
    }
}

// ── Field helpers ─────────────────────────────────────────────────────────────

fn get_u8(buf: &mut impl Buf) -> Result<u8, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u8())
}

fn expect_tag(buf: &mut impl Buf, expected: u8) -> Result<(), WireError> {
    let found = get_u8(buf)?;
    if found != expected {
        return Err(WireError::MissingField { expected, found });
    }
    Ok(())
}

fn put_varint_field(buf: &mut BytesMut, tag: u8, value: u64) {
    buf.put_u8(tag);
    buf.put_u64_varint(value);
}

fn get_varint_field(buf: &mut impl Buf, tag: u8) -> Result<u64, WireError> {
    expect_tag(buf, tag)?;
    Ok(buf.try_get_u64_varint()?)
}

fn put_bool_field(buf: &mut BytesMut, tag: u8, value: bool) {
    buf.put_u8(tag);
    buf.put_u8(value as u8);
}

fn get_bool_field(buf: &mut impl Buf, tag: u8) -> Result<bool, WireError> {
    expect_tag(buf, tag)?;
    Ok(get_u8(buf)? != 0)
}

fn put_byte_field(buf: &mut BytesMut, tag: u8, value: u8) {
    buf.put_u8(tag);
    buf.put_u8(value);
}

fn put_f32_field(buf: &mut BytesMut, tag: u8, value: f32) {
    buf.put_u8(tag);
    buf.put_u32_le(value.to_bits());
}

fn get_f32_field(buf: &mut impl Buf, tag: u8) -> Result<f32, WireError> {
    expect_tag(buf, tag)?;
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(f32::from_bits(buf.get_u32_le()))
}

fn put_bytes_field(buf: &mut BytesMut, tag: u8, value: &[u8]) {
    buf.put_u8(tag);
    buf.put_usize_varint(value.len());
    buf.put_slice(value);
}

fn get_bytes_field(buf: &mut impl Buf, tag: u8) -> Result<Vec<u8>, WireError> {
    expect_tag(buf, tag)?;
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn put_string_field(buf: &mut BytesMut, tag: u8, value: &str) {
    put_bytes_field(buf, tag, value.as_bytes());
}

fn get_string_field(buf: &mut impl Buf, tag: u8) -> Result<String, WireError> {
    let raw = get_bytes_field(buf, tag)?;
    String::from_utf8(raw).map_err(|_| WireError::BadString)
}

// ── File headers ──────────────────────────────────────────────────────────────

/// One file of the payload, as announced in `SessionJoinResponse`.
///
/// Server and receivers must agree on the ordered header list exactly;
/// structural equality of the two lists is what a reconnecting receiver
/// checks before resuming (`PayloadMismatch` otherwise).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Path relative to the payload root, `/`-separated.
    pub name: String,
    /// File length in bytes.
    pub length: u64,
    /// Position in the ordered payload sequence.
    pub ordinal: u32,
}

fn put_file_headers(buf: &mut BytesMut, tag: u8, files: &[FileHeader]) {
    buf.put_u8(tag);
    buf.put_usize_varint(files.len());
    for f in files {
        buf.put_usize_varint(f.name.len());
        buf.put_slice(f.name.as_bytes());
        buf.put_u64_varint(f.length);
        buf.put_u32_varint(f.ordinal);
    }
}

fn get_file_headers(buf: &mut impl Buf, tag: u8) -> Result<Vec<FileHeader>, WireError> {
    expect_tag(buf, tag)?;
    let count = buf.try_get_usize_varint()?;
    let mut files = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let name_len = buf.try_get_usize_varint()?;
        if buf.remaining() < name_len {
            return Err(WireError::Truncated);
        }
        let mut raw = vec![0u8; name_len];
        buf.copy_to_slice(&mut raw);
        let name = String::from_utf8(raw).map_err(|_| WireError::BadString)?;
        let length = buf.try_get_u64_varint()?;
        let ordinal = buf.try_get_u32_varint()?;
        files.push(FileHeader { name, length, ordinal });
    }
    Ok(files)
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Server → receiver, first frame after transport establishment.
/// `challenge_key` is a fresh nonce, PSK-encoded when a pass-phrase is
/// configured, in the clear otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub challenge_key: Vec<u8>,
}

/// Receiver → server; proves possession of the PSK by returning the
/// canonical receiver marker encoded under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeResponse {
    pub challenge_key: Vec<u8>,
}

/// Generic server → receiver ack carrying failure detail.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: Status,
    pub error_message: String,
}

impl Response {
    pub fn ok() -> Self {
        Response { status: Status::Ok, error_message: String::new() }
    }

    pub fn failed(status: Status, message: impl Into<String>) -> Self {
        Response { status, error_message: message.into() }
    }
}

/// Receiver → server. `path` selects the payload below the server root;
/// `state` is a reconnect hint (0 fresh, 1 resuming) echoed into logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionJoinRequest {
    pub path: String,
    pub state: u64,
}

/// Server → receiver on admission: the exact file list, the chosen
/// multicast endpoint, the usable (pre-encode) segment size, and the
/// wave counter at join time.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionJoinResponse {
    pub status: Status,
    pub error_message: String,
    pub files: Vec<FileHeader>,
    pub multicast_address: String,
    pub multicast_port: u16,
    pub segment_size: u32,
    pub wave_number: u64,
}

/// Server → group, multicast-only. `data` is the PSK-encoded block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSegment {
    pub segment_id: u64,
    pub data: Bytes,
}

/// Receiver → server, on the 1 s cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketStatusUpdate {
    pub bytes_left: u64,
    pub leaving_session: bool,
}

/// Server → receiver ack. `WaveComplete` solicits a full
/// `WaveStatusUpdate` carrying raw bit-vector bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketStatusUpdateResponse {
    pub status: Status,
    pub error_message: String,
    pub reception_rate: f32,
    pub response_type: ResponseType,
}

/// Receiver → server at a wave boundary (and on final departure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveStatusUpdate {
    pub bytes_left: u64,
    pub leaving_session: bool,
    pub file_bit_vector: Vec<u8>,
}

/// Server → receiver once the wave boundary resolves.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveCompleteResponse {
    pub status: Status,
    pub error_message: String,
    pub wave_number: u64,
}

/// Every message that can appear on a Cascade transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Challenge(Challenge),
    ChallengeResponse(ChallengeResponse),
    Response(Response),
    SessionJoinRequest(SessionJoinRequest),
    SessionJoinResponse(SessionJoinResponse),
    FileSegment(FileSegment),
    PacketStatusUpdate(PacketStatusUpdate),
    PacketStatusUpdateResponse(PacketStatusUpdateResponse),
    WaveStatusUpdate(WaveStatusUpdate),
    WaveCompleteResponse(WaveCompleteResponse),
}

impl Message {
    /// Serialize into `buf`: message tag, then tagged fields.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Message::Challenge(m) => {
                buf.put_u8(TAG_CHALLENGE);
                put_bytes_field(buf, 1, &m.challenge_key);
            }
            Message::ChallengeResponse(m) => {
                buf.put_u8(TAG_CHALLENGE_RESPONSE);
                put_bytes_field(buf, 1, &m.challenge_key);
            }
            Message::Response(m) => {
                buf.put_u8(TAG_RESPONSE);
                put_byte_field(buf, 1, m.status as u8);
                put_string_field(buf, 2, &m.error_message);
            }
            Message::SessionJoinRequest(m) => {
                buf.put_u8(TAG_SESSION_JOIN_REQUEST);
                put_string_field(buf, 1, &m.path);
                put_varint_field(buf, 2, m.state);
            }
            Message::SessionJoinResponse(m) => {
                buf.put_u8(TAG_SESSION_JOIN_RESPONSE);
                put_byte_field(buf, 1, m.status as u8);
                put_string_field(buf, 2, &m.error_message);
                put_file_headers(buf, 3, &m.files);
                put_string_field(buf, 4, &m.multicast_address);
                put_varint_field(buf, 5, m.multicast_port as u64);
                put_varint_field(buf, 6, m.segment_size as u64);
                put_varint_field(buf, 7, m.wave_number);
            }
            Message::FileSegment(m) => {
                buf.put_u8(TAG_FILE_SEGMENT);
                put_varint_field(buf, 1, m.segment_id);
                put_bytes_field(buf, 2, &m.data);
            }
            Message::PacketStatusUpdate(m) => {
                buf.put_u8(TAG_PACKET_STATUS_UPDATE);
                put_varint_field(buf, 1, m.bytes_left);
                put_bool_field(buf, 2, m.leaving_session);
            }
            Message::PacketStatusUpdateResponse(m) => {
                buf.put_u8(TAG_PACKET_STATUS_UPDATE_RESPONSE);
                put_byte_field(buf, 1, m.status as u8);
                put_string_field(buf, 2, &m.error_message);
                put_f32_field(buf, 3, m.reception_rate);
                put_byte_field(buf, 4, m.response_type as u8);
            }
            Message::WaveStatusUpdate(m) => {
                buf.put_u8(TAG_WAVE_STATUS_UPDATE);
                put_varint_field(buf, 1, m.bytes_left);
                put_bool_field(buf, 2, m.leaving_session);
                put_bytes_field(buf, 3, &m.file_bit_vector);
            }
            Message::WaveCompleteResponse(m) => {
                buf.put_u8(TAG_WAVE_COMPLETE_RESPONSE);
                put_byte_field(buf, 1, m.status as u8);
                put_string_field(buf, 2, &m.error_message);
                put_varint_field(buf, 3, m.wave_number);
            }
        }
    }

    /// Serialize into a fresh buffer.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// Parse one message body. Trailing bytes are an error on the
    /// datagram path and tolerated nowhere else either — a frame is
    /// exactly one message.
    pub fn decode(mut buf: impl Buf) -> Result<Message, WireError> {
        let tag = get_u8(&mut buf)?;
        let msg = match tag {
            TAG_CHALLENGE => Message::Challenge(Challenge {
                challenge_key: get_bytes_field(&mut buf, 1)?,
            }),
            TAG_CHALLENGE_RESPONSE => Message::ChallengeResponse(ChallengeResponse {
                challenge_key: get_bytes_field(&mut buf, 1)?,
            }),
            TAG_RESPONSE => {
                let status = Status::try_from({
                    expect_tag(&mut buf, 1)?;
                    get_u8(&mut buf)?
                })?;
                Message::Response(Response {
                    status,
                    error_message: get_string_field(&mut buf, 2)?,
                })
            }
            TAG_SESSION_JOIN_REQUEST => Message::SessionJoinRequest(SessionJoinRequest {
                path: get_string_field(&mut buf, 1)?,
                state: get_varint_field(&mut buf, 2)?,
            }),
            TAG_SESSION_JOIN_RESPONSE => {
                let status = Status::try_from({
                    expect_tag(&mut buf, 1)?;
                    get_u8(&mut buf)?
                })?;
                Message::SessionJoinResponse(SessionJoinResponse {
                    status,
                    error_message: get_string_field(&mut buf, 2)?,
                    files: get_file_headers(&mut buf, 3)?,
                    multicast_address: get_string_field(&mut buf, 4)?,
                    multicast_port: get_varint_field(&mut buf, 5)? as u16,
                    segment_size: get_varint_field(&mut buf, 6)? as u32,
                    wave_number: get_varint_field(&mut buf, 7)?,
                })
            }
            TAG_FILE_SEGMENT => {
                let segment_id = get_varint_field(&mut buf, 1)?;
                let data = Bytes::from(get_bytes_field(&mut buf, 2)?);
                Message::FileSegment(FileSegment { segment_id, data })
            }
            TAG_PACKET_STATUS_UPDATE => Message::PacketStatusUpdate(PacketStatusUpdate {
                bytes_left: get_varint_field(&mut buf, 1)?,
                leaving_session: get_bool_field(&mut buf, 2)?,
            }),
            TAG_PACKET_STATUS_UPDATE_RESPONSE => {
                let status = Status::try_from({
                    expect_tag(&mut buf, 1)?;
                    get_u8(&mut buf)?
                })?;
                let error_message = get_string_field(&mut buf, 2)?;
                let reception_rate = get_f32_field(&mut buf, 3)?;
                let response_type = ResponseType::try_from({
                    expect_tag(&mut buf, 4)?;
                    get_u8(&mut buf)?
                })?;
                Message::PacketStatusUpdateResponse(PacketStatusUpdateResponse {
                    status,
                    error_message,
                    reception_rate,
                    response_type,
                })
            }
            TAG_WAVE_STATUS_UPDATE => Message::WaveStatusUpdate(WaveStatusUpdate {
                bytes_left: get_varint_field(&mut buf, 1)?,
                leaving_session: get_bool_field(&mut buf, 2)?,
                file_bit_vector: get_bytes_field(&mut buf, 3)?,
            }),
            TAG_WAVE_COMPLETE_RESPONSE => {
                let status = Status::try_from({
                    expect_tag(&mut buf, 1)?;
                    get_u8(&mut buf)?
                })?;
                Message::WaveCompleteResponse(WaveCompleteResponse {
                    status,
                    error_message: get_string_field(&mut buf, 2)?,
                    wave_number: get_varint_field(&mut buf, 3)?,
                })
            }
            other => return Err(WireError::UnknownMessage(other)),
        };
        Ok(msg)
    }
}

/// Worst-case framing overhead of a `FileSegment` datagram: message tag,
/// two field tags, a ten-byte varint segment id, and a five-byte varint
/// data length. Block-size derivation subtracts this from the UDP
/// payload budget.
pub const SEGMENT_FRAMING_OVERHEAD: usize = 1 + 1 + 10 + 1 + 5;

// ── Tests ─────────────────────────────────────────────────────────────────────
