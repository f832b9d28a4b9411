//! Scenario: one receiver, plaintext, small multi-file payload.

use crate::*;

#[tokio::test(flavor = "multi_thread")]
async fn single_receiver_plaintext_round_trip() {
    if skip_without_multicast("single_receiver_plaintext_round_trip").await {
        return;
    }

    let fixture = Fixture::new(
        "plain",
        &[
            ("boot.img", 7 * 1024),
            ("conf/settings.toml", 2 * 1024),
            ("notes.txt", 1024),
        ],
    );
    let server = start_server(server_config(&fixture, 10, 17710)).await;

    let root = fixture.client_root("a");
    let report = run_client(&server.uri(false, &fixture.path), client_config(root.clone()))
        .await
        .expect("transfer should complete");

    assert_eq!(report.bytes_total, 10 * 1024);
    assert_eq!(report.files.len(), 3);
    assert_eq!(report.decode_failures, 0);
    fixture.assert_delivered(&root);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_files_and_odd_sizes_survive_chunking() {
    if skip_without_multicast("empty_files_and_odd_sizes_survive_chunking").await {
        return;
    }

    // A zero-length file, a sub-block file, and one that is not a
    // multiple of the block size.
    let fixture = Fixture::new(
        "odd",
        &[("empty.bin", 0), ("tiny.bin", 17), ("awkward.bin", 3 * 1433 + 5)],
    );
    let server = start_server(server_config(&fixture, 11, 17712)).await;

    let root = fixture.client_root("a");
    let report = run_client(&server.uri(false, &fixture.path), client_config(root.clone()))
        .await
        .expect("transfer should complete");

    assert_eq!(report.files.len(), 3);
    fixture.assert_delivered(&root);
    assert_eq!(
        std::fs::read(root.join(&fixture.path).join("empty.bin")).unwrap().len(),
        0
    );

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sequential_receivers_reuse_the_payload_path() {
    if skip_without_multicast("sequential_receivers_reuse_the_payload_path").await {
        return;
    }

    let fixture = Fixture::new("seq", &[("data.bin", 20 * 1024)]);
    let server = start_server(server_config(&fixture, 12, 17714)).await;

    for tag in ["first", "second"] {
        let root = fixture.client_root(tag);
        run_client(&server.uri(false, &fixture.path), client_config(root.clone()))
            .await
            .expect("transfer should complete");
        fixture.assert_delivered(&root);
    }

    server.stop().await;
}
