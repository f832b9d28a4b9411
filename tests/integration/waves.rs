//! Scenario: receiver dropout — a receiver that goes silent is evicted
//! at the wave boundary and the survivor still completes.

use std::time::Duration;

use crate::*;
use cascade_core::channel::ControlChannel;
use cascade_core::psk::CLIENT_MARKER;
use cascade_core::wire::{ChallengeResponse, Message, SessionJoinRequest, Status};

/// Join the session and then never speak again.
async fn silent_joiner(addr: std::net::SocketAddr, path: &str) -> ControlChannel {
    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut channel = ControlChannel::plain(stream, Duration::from_secs(30));
    match channel.recv().await.unwrap() {
        Message::Challenge(_) => {}
        other => panic!("expected Challenge, got {other:?}"),
    }
    channel
        .send(&Message::ChallengeResponse(ChallengeResponse {
            challenge_key: CLIENT_MARKER.to_vec(),
        }))
        .await
        .unwrap();
    channel
        .send(&Message::SessionJoinRequest(SessionJoinRequest {
            path: path.into(),
            state: 0,
        }))
        .await
        .unwrap();
    match channel.recv().await.unwrap() {
        Message::SessionJoinResponse(join) => assert_eq!(join.status, Status::Ok),
        other => panic!("unexpected join reply {other:?}"),
    }
    channel
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_receiver_is_evicted_and_the_survivor_completes() {
    if skip_without_multicast("silent_receiver_is_evicted_and_the_survivor_completes").await {
        return;
    }

    let fixture = Fixture::new("dropout", &[("firmware.bin", 32 * 1024)]);
    let server = start_server(server_config(&fixture, 40, 17740)).await;

    // The silent receiver is admitted first; its all-zero bit-vector
    // would otherwise keep every wave planning the full payload.
    let _silent = silent_joiner(server.addr, &fixture.path).await;

    let root = fixture.client_root("survivor");
    let report = run_client(&server.uri(false, &fixture.path), client_config(root.clone()))
        .await
        .expect("the live receiver should outlast the eviction");

    assert_eq!(report.bytes_total, 32 * 1024);
    fixture.assert_delivered(&root);

    server.stop().await;
}
