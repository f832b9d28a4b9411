//! Scenarios: PSK-sealed transfers and authentication failure.

use crate::*;
use cascade_core::TransferError;

#[tokio::test(flavor = "multi_thread")]
async fn two_receivers_with_shared_passphrase() {
    if skip_without_multicast("two_receivers_with_shared_passphrase").await {
        return;
    }

    let fixture = Fixture::new("psk", &[("release.tar", 24 * 1024), ("sums.txt", 512)]);
    let mut config = server_config(&fixture, 20, 17720);
    config.passphrase = "foo123".into();
    let server = start_server(config).await;

    let root_a = fixture.client_root("a");
    let root_b = fixture.client_root("b");
    let uri = server.uri(true, &fixture.path);

    let mut config_a = client_config(root_a.clone());
    config_a.passphrase = "foo123".into();
    let mut config_b = client_config(root_b.clone());
    config_b.passphrase = "foo123".into();

    let (a, b) = tokio::join!(run_client(&uri, config_a), run_client(&uri, config_b));
    let a = a.expect("receiver a should complete");
    let b = b.expect("receiver b should complete");

    fixture.assert_delivered(&root_a);
    fixture.assert_delivered(&root_b);

    // Both transfers moved the whole payload; waves retransmit only on
    // loss, so each receiver saw at least the payload's worth of data.
    assert_eq!(a.bytes_total, 24 * 1024 + 512);
    assert_eq!(b.bytes_total, 24 * 1024 + 512);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_passphrase_fails_authentication() {
    if skip_without_multicast("mismatched_passphrase_fails_authentication").await {
        return;
    }

    let fixture = Fixture::new("badpsk", &[("secret.bin", 4 * 1024)]);
    let mut config = server_config(&fixture, 21, 17722);
    config.passphrase = "foo".into();
    let server = start_server(config).await;

    let root = fixture.client_root("a");
    let mut bad = client_config(root.clone());
    bad.passphrase = "bar".into();

    let error = run_client(&server.uri(true, &fixture.path), bad)
        .await
        .expect_err("wrong pass-phrase must not produce a transfer");
    match error {
        TransferError::SessionAborted(inner) => {
            assert!(
                matches!(*inner, TransferError::AuthFailed),
                "expected AuthFailed, got {inner:?}"
            );
        }
        other => panic!("expected SessionAborted(AuthFailed), got {other:?}"),
    }

    // Nothing was delivered.
    assert!(!root.join(&fixture.path).join("secret.bin").exists());

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn plaintext_client_cannot_join_a_sealed_server() {
    if skip_without_multicast("plaintext_client_cannot_join_a_sealed_server").await {
        return;
    }

    let fixture = Fixture::new("plainvs", &[("x.bin", 2048)]);
    let mut config = server_config(&fixture, 22, 17724);
    config.passphrase = "foo123".into();
    let server = start_server(config).await;

    let root = fixture.client_root("a");
    let error = run_client(&server.uri(false, &fixture.path), client_config(root))
        .await
        .expect_err("plaintext join against a sealed server must fail");
    assert!(error.is_fatal(), "expected a fatal error, got {error:?}");

    server.stop().await;
}
