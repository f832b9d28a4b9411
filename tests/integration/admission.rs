//! Scenario: admission limits — the N+1th receiver is refused, and a
//! freed slot admits it on retry.

use std::net::SocketAddr;
use std::time::Duration;

use crate::*;
use cascade_core::channel::ControlChannel;
use cascade_core::psk::CLIENT_MARKER;
use cascade_core::wire::{
    ChallengeResponse, Message, SessionJoinRequest, SessionJoinResponse, Status,
};

/// A hand-driven receiver: authenticates and joins, then just holds its
/// admission slot without ever touching the multicast group.
struct ManualReceiver {
    channel: ControlChannel,
}

impl ManualReceiver {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut channel = ControlChannel::plain(stream, Duration::from_secs(5));
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
        Self { channel }
    }

    async fn join(&mut self, path: &str) -> Result<SessionJoinResponse, Status> {
        self.channel
            .send(&Message::SessionJoinRequest(SessionJoinRequest {
                path: path.into(),
                state: 0,
            }))
            .await
            .unwrap();
        match self.channel.recv().await.unwrap() {
            Message::SessionJoinResponse(join) if join.status == Status::Ok => Ok(join),
            Message::SessionJoinResponse(join) => Err(join.status),
            Message::Response(r) => Err(r.status),
            other => panic!("unexpected join reply {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn overflow_is_refused_until_a_slot_frees() {
    if skip_without_multicast("overflow_is_refused_until_a_slot_frees").await {
        return;
    }

    let fixture = Fixture::new("admission", &[("image.bin", 8 * 1024)]);
    let mut config = server_config(&fixture, 30, 17730);
    config.max_connections_per_session = 1;
    let server = start_server(config).await;

    // First receiver takes the only slot.
    let mut holder = ManualReceiver::connect(server.addr).await;
    holder.join(&fixture.path).await.expect("first join should be admitted");

    // Second receiver is refused outright.
    let mut overflow = ManualReceiver::connect(server.addr).await;
    assert_eq!(
        overflow.join(&fixture.path).await.unwrap_err(),
        Status::Refused,
        "the second receiver must be refused while the slot is held"
    );

    // Free the slot; the refused receiver's retry (driven by the real
    // client's reconnect loop) is admitted and completes.
    drop(holder);
    let root = fixture.client_root("retry");
    let report = run_client(&server.uri(false, &fixture.path), client_config(root.clone()))
        .await
        .expect("retry after a freed slot should complete");
    assert_eq!(report.bytes_total, 8 * 1024);
    fixture.assert_delivered(&root);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn session_limit_refuses_new_payload_paths() {
    if skip_without_multicast("session_limit_refuses_new_payload_paths").await {
        return;
    }

    let fixture = Fixture::new("sessions", &[("a.bin", 1024)]);
    // Second payload next to the first.
    std::fs::create_dir_all(fixture.server_root.join("other")).unwrap();
    std::fs::write(fixture.server_root.join("other/b.bin"), pattern(9, 1024)).unwrap();

    let mut config = server_config(&fixture, 31, 17732);
    config.max_sessions = 1;
    let server = start_server(config).await;

    let mut first = ManualReceiver::connect(server.addr).await;
    first.join(&fixture.path).await.expect("first session should start");

    let mut second = ManualReceiver::connect(server.addr).await;
    assert_eq!(
        second.join("other").await.unwrap_err(),
        Status::Refused,
        "a second session past the limit must be refused"
    );

    server.stop().await;
}
