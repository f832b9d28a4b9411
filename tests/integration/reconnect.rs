//! Scenarios: reconnection after transport loss.
//!
//! These run the real receiver against a scripted server so the drop
//! happens at an exact protocol point: after half the payload in the
//! resume case, right after the join in the mismatch case. The script
//! speaks the wire protocol through cascade-core directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;

use crate::*;
use cascade_core::bitvec::BitVector;
use cascade_core::channel::ControlChannel;
use cascade_core::group::{DatagramGroup, GroupInterface};
use cascade_core::psk::CLIENT_MARKER;
use cascade_core::wire::{
    Challenge, FileHeader, FileSegment, Message, PacketStatusUpdateResponse, ResponseType,
    SessionJoinResponse, Status, WaveCompleteResponse,
};
use cascade_core::TransferError;

const SEGMENT: usize = 1000;
const GROUP_ADDR: &str = "239.255.91.50";

struct Script {
    listener: TcpListener,
    group: Arc<DatagramGroup>,
    group_port: u16,
    payload: Vec<u8>,
}

impl Script {
    async fn start(group_port: u16, payload: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let group = Arc::new(
            DatagramGroup::join(
                GROUP_ADDR.parse().unwrap(),
                group_port,
                &GroupInterface::default(),
                1,
                0,
            )
            .unwrap(),
        );
        Self { listener, group, group_port, payload }
    }

    fn addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    fn files(&self) -> Vec<FileHeader> {
        vec![FileHeader {
            name: "blob.bin".into(),
            length: self.payload.len() as u64,
            ordinal: 0,
        }]
    }

    async fn accept(&self) -> ControlChannel {
        let (stream, _) = self.listener.accept().await.unwrap();
        ControlChannel::plain(stream, Duration::from_secs(20))
    }

    /// Plaintext challenge exchange; returns the join request's `state`.
    async fn handshake(&self, channel: &mut ControlChannel) -> u64 {
        channel
            .send(&Message::Challenge(Challenge { challenge_key: vec![0x5a; 32] }))
            .await
            .unwrap();
        match channel.recv().await.unwrap() {
            Message::ChallengeResponse(r) => assert_eq!(r.challenge_key, CLIENT_MARKER),
            other => panic!("expected ChallengeResponse, got {other:?}"),
        }
        let state = match channel.recv().await.unwrap() {
            Message::SessionJoinRequest(j) => j.state,
            other => panic!("expected SessionJoinRequest, got {other:?}"),
        };
        channel
            .send(&Message::SessionJoinResponse(SessionJoinResponse {
                status: Status::Ok,
                error_message: String::new(),
                files: self.files(),
                multicast_address: GROUP_ADDR.into(),
                multicast_port: self.group_port,
                segment_size: SEGMENT as u32,
                wave_number: 0,
            }))
            .await
            .unwrap();
        state
    }

    async fn send_segments(&self, ids: &[u64]) {
        for &id in ids {
            let start = id as usize * SEGMENT;
            let end = (start + SEGMENT).min(self.payload.len());
            let mut data = self.payload[start..end].to_vec();
            data.resize(SEGMENT, 0);
            let datagram = Message::FileSegment(FileSegment {
                segment_id: id,
                data: Bytes::from(data),
            })
            .encode_to_vec();
            self.group.send(&datagram).await.unwrap();
        }
    }

    async fn ack_status(&self, channel: &mut ControlChannel, response_type: ResponseType) {
        channel
            .send(&Message::PacketStatusUpdateResponse(PacketStatusUpdateResponse {
                status: Status::Ok,
                error_message: String::new(),
                reception_rate: 0.5,
                response_type,
            }))
            .await
            .unwrap();
    }

    async fn ack_wave(&self, channel: &mut ControlChannel, wave_number: u64) {
        channel
            .send(&Message::WaveCompleteResponse(WaveCompleteResponse {
                status: Status::Ok,
                error_message: String::new(),
                wave_number,
            }))
            .await
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnect_resumes_with_the_retained_bit_vector() {
    if skip_without_multicast("reconnect_resumes_with_the_retained_bit_vector").await {
        return;
    }

    let payload = pattern(3, 4 * SEGMENT);
    let script = Script::start(17750, payload.clone()).await;
    let base = std::env::temp_dir().join(format!("cascade-it-resume-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&base);
    std::fs::create_dir_all(&base).unwrap();

    let uri = format!("mc://127.0.0.1:{}/blob", script.addr().port());
    let client = tokio::spawn({
        let config = client_config(base.clone());
        async move { run_client(&uri, config).await }
    });

    // Connection 1: deliver segments 0 and 2, collect the wave status,
    // then drop the channel.
    {
        let mut channel = script.accept().await;
        assert_eq!(script.handshake(&mut channel).await, 0, "first join is fresh");

        loop {
            match channel.recv().await.unwrap() {
                Message::PacketStatusUpdate(update) => {
                    if update.bytes_left > (2 * SEGMENT) as u64 {
                        script.ack_status(&mut channel, ResponseType::Ok).await;
                        // Client is listening by now; (re)send the first
                        // half. Duplicates are harmless.
                        script.send_segments(&[0, 2]).await;
                    } else {
                        script.ack_status(&mut channel, ResponseType::WaveComplete).await;
                    }
                }
                Message::WaveStatusUpdate(update) => {
                    let bits = BitVector::from_bytes(4, &update.file_bit_vector).unwrap();
                    assert!(bits.test(0) && bits.test(2), "first half should be durable");
                    assert!(!bits.test(1) && !bits.test(3), "second half still missing");
                    assert_eq!(update.bytes_left, (2 * SEGMENT) as u64);
                    script.ack_wave(&mut channel, 1).await;
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        // Dropping the channel severs the transport mid-session.
    }

    // Connection 2: the receiver comes back announcing a resume, and
    // only the missing half needs to move.
    {
        let mut channel = script.accept().await;
        assert_eq!(script.handshake(&mut channel).await, 1, "second join is a resume");

        loop {
            match channel.recv().await.unwrap() {
                Message::PacketStatusUpdate(update) => {
                    assert!(
                        update.bytes_left <= (2 * SEGMENT) as u64,
                        "resume must keep the retained first half"
                    );
                    script.ack_status(&mut channel, ResponseType::Ok).await;
                    script.send_segments(&[1, 3]).await;
                }
                Message::WaveStatusUpdate(update) => {
                    assert!(update.leaving_session, "final update should depart");
                    let bits = BitVector::from_bytes(4, &update.file_bit_vector).unwrap();
                    assert!(!bits.any_unset());
                    script.ack_wave(&mut channel, 2).await;
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    let report = client.await.unwrap().expect("resumed transfer should complete");
    assert_eq!(report.bytes_total, payload.len() as u64);
    assert_eq!(
        std::fs::read(base.join("blob/blob.bin")).unwrap(),
        payload,
        "delivered bytes must match across the reconnect"
    );

    let _ = std::fs::remove_dir_all(&base);
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnect_against_a_changed_payload_fails_and_cleans() {
    if skip_without_multicast("reconnect_against_a_changed_payload_fails_and_cleans").await {
        return;
    }

    let payload = pattern(5, 2 * SEGMENT);
    let script = Script::start(17752, payload).await;
    let base = std::env::temp_dir().join(format!("cascade-it-mismatch-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&base);
    std::fs::create_dir_all(&base).unwrap();

    let uri = format!("mc://127.0.0.1:{}/blob", script.addr().port());
    let client = tokio::spawn({
        let config = client_config(base.clone());
        async move { run_client(&uri, config).await }
    });

    // Connection 1: admit, confirm the engine is up, then drop without
    // delivering anything.
    {
        let mut channel = script.accept().await;
        script.handshake(&mut channel).await;
        match channel.recv().await.unwrap() {
            Message::PacketStatusUpdate(_) => {
                script.ack_status(&mut channel, ResponseType::Ok).await
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    let partial = base.join("blob/blob.bin");
    assert!(partial.exists(), "join should have laid out the destination file");

    // Connection 2: the payload has changed shape since the receiver
    // last saw it.
    {
        let mut channel = script.accept().await;
        channel
            .send(&Message::Challenge(Challenge { challenge_key: vec![0x5a; 32] }))
            .await
            .unwrap();
        match channel.recv().await.unwrap() {
            Message::ChallengeResponse(_) => {}
            other => panic!("unexpected {other:?}"),
        }
        match channel.recv().await.unwrap() {
            Message::SessionJoinRequest(j) => assert_eq!(j.state, 1),
            other => panic!("unexpected {other:?}"),
        }
        channel
            .send(&Message::SessionJoinResponse(SessionJoinResponse {
                status: Status::Ok,
                error_message: String::new(),
                files: vec![FileHeader {
                    name: "blob.bin".into(),
                    length: (3 * SEGMENT) as u64,
                    ordinal: 0,
                }],
                multicast_address: GROUP_ADDR.into(),
                multicast_port: 17752,
                segment_size: SEGMENT as u32,
                wave_number: 0,
            }))
            .await
            .unwrap();
    }

    let error = client
        .await
        .unwrap()
        .expect_err("a changed payload must abort the transfer");
    assert!(
        matches!(error, TransferError::PayloadMismatch),
        "expected PayloadMismatch, got {error:?}"
    );
    assert!(!partial.exists(), "partial files must be cleaned on mismatch");

    let _ = std::fs::remove_dir_all(&base);
}
