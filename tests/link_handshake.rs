//! Link handshake and circuit creation, end to end over an in-memory
//! stream standing in for TLS.

mod common;

use std::time::Duration;

use common::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tor_relay::ExitPolicy;

#[tokio::test]
async fn version_negotiation_picks_v4() {
    let or = make_or(ExitPolicy::default(), Duration::ZERO);
    let mut link = start_server(or);

    // VERSIONS offering {4}: circuit 0, command 7, length 2.
    link.write_all(&[0, 0, 7, 0, 2, 0, 4]).await.unwrap();
    let mut reply = [0u8; 7];
    link.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0, 0, 7, 0, 2, 0, 4]);
}

#[tokio::test]
async fn version_negotiation_takes_highest_common() {
    let or = make_or(ExitPolicy::default(), Duration::ZERO);
    let mut link = start_server(or);

    // Offer {3, 4, 5}; only 4 is shared.
    link.write_all(&[0, 0, 7, 0, 6, 0, 3, 0, 4, 0, 5])
        .await
        .unwrap();
    let mut reply = [0u8; 7];
    link.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[5..7], &[0, 4]);
}

#[tokio::test]
async fn disjoint_versions_drop_the_connection() {
    let or = make_or(ExitPolicy::default(), Duration::ZERO);
    let mut link = start_server(or);

    link.write_all(&[0, 0, 7, 0, 2, 0, 3]).await.unwrap();
    // The server hangs up instead of answering.
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), link.read(&mut buf))
        .await
        .expect("server should close promptly")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn server_sends_certs_challenge_netinfo() {
    let or = make_or(ExitPolicy::default(), Duration::ZERO);
    let mut link = start_server(or);

    link.write_all(&[0, 0, 7, 0, 2, 0, 4]).await.unwrap();
    let mut reply = [0u8; 7];
    link.read_exact(&mut reply).await.unwrap();

    let certs = read_cell(&mut link).await;
    assert_eq!(certs.command, CMD_CERTS);
    assert_eq!(certs.circ_id, 0);
    // Two certificates: link (type 1) and identity (type 2).
    assert_eq!(certs.payload[0], 2);
    assert_eq!(certs.payload[1], 1);

    let challenge = read_cell(&mut link).await;
    assert_eq!(challenge.command, CMD_AUTH_CHALLENGE);
    assert_eq!(challenge.payload.len(), 36);
    // One supported method: 0x0001.
    assert_eq!(&challenge.payload[32..36], &[0, 1, 0, 1]);

    let netinfo = read_cell(&mut link).await;
    assert_eq!(netinfo.command, CMD_NETINFO);
    // Our address as the peer saw it: 198.51.100.7.
    assert_eq!(&netinfo.payload[4..10], &[4, 4, 198, 51, 100, 7]);
}

#[tokio::test]
async fn create_fast_derives_matching_keys() {
    let or = make_or(ExitPolicy::default(), Duration::ZERO);
    let mut link = start_server(or);
    complete_handshake(&mut link).await;

    // KH is checked against KDF-TOR(X | Y) inside the helper.
    let _circuit = ClientCircuit::create_fast(&mut link, 0x8000_0001).await;
}

#[tokio::test]
async fn create_fast_with_wrong_initiator_bit_is_refused() {
    let or = make_or(ExitPolicy::default(), Duration::ZERO);
    let mut link = start_server(or);
    complete_handshake(&mut link).await;

    // Initiator bit clear: that ID belongs to the server's side.
    link.write_all(&fixed_cell(0x0000_0001, CMD_CREATE_FAST, &[0; 20]))
        .await
        .unwrap();
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), link.read(&mut buf))
        .await
        .expect("server should hang up")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn duplicate_create_fast_is_refused_with_destroy() {
    let or = make_or(ExitPolicy::default(), Duration::ZERO);
    let mut link = start_server(or);
    complete_handshake(&mut link).await;

    let circuit = ClientCircuit::create_fast(&mut link, 0x8000_0001).await;
    link.write_all(&fixed_cell(circuit.circ_id, CMD_CREATE_FAST, &[0; 20]))
        .await
        .unwrap();

    let cell = read_cell(&mut link).await;
    assert_eq!(cell.command, CMD_DESTROY);
    assert_eq!(cell.circ_id, circuit.circ_id);
    assert_eq!(cell.payload[0], 1); // PROTOCOL
}
