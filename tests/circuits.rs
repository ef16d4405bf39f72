//! Circuit-level behavior end to end: flow control, exit policy, stream
//! refusal, and extension failure paths.

mod common;

use std::time::Duration;

use common::*;
use tokio::io::AsyncWriteExt;
use tor_relay::ExitPolicy;

#[tokio::test]
async fn hundred_data_cells_earn_exactly_one_sendme() {
    let or = make_or(ExitPolicy::default(), Duration::ZERO);
    let mut link = start_server(or);
    complete_handshake(&mut link).await;
    let mut circuit = ClientCircuit::create_fast(&mut link, 0x8000_0001).await;

    // Data for a stream the server never heard of: it still counts
    // against the circuit window, the rest is discarded.
    for _ in 0..100 {
        let body = circuit.seal_forward(RELAY_DATA, 42, b"payload");
        link.write_all(&fixed_cell(circuit.circ_id, CMD_RELAY, &body))
            .await
            .unwrap();
    }

    let cell = read_cell(&mut link).await;
    assert_eq!(cell.command, CMD_RELAY);
    assert_eq!(cell.circ_id, circuit.circ_id);
    let body = circuit.open_backward(&cell.payload);
    assert_eq!(body[0], RELAY_SENDME);
    assert_eq!(&body[3..5], &[0, 0], "circuit-level SENDME has stream 0");

    // One window's worth, one SENDME.
    assert_no_cell(&mut link, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn begin_blocked_by_exit_policy_ends_with_reason_4() {
    let mut policy = ExitPolicy::accept_all();
    policy.push_rule("reject *:25").unwrap();
    let or = make_or(policy, Duration::ZERO);
    let mut link = start_server(or);
    complete_handshake(&mut link).await;
    let mut circuit = ClientCircuit::create_fast(&mut link, 0x8000_0001).await;

    let body = circuit.seal_forward(RELAY_BEGIN, 7, b"192.0.2.9:25\0");
    link.write_all(&fixed_cell(circuit.circ_id, CMD_RELAY, &body))
        .await
        .unwrap();

    let cell = read_cell(&mut link).await;
    let body = circuit.open_backward(&cell.payload);
    assert_eq!(body[0], RELAY_END);
    assert_eq!(&body[3..5], &[0, 7], "END addresses the refused stream");
    assert_eq!(body[11], 4, "reason EXITPOLICY");
    assert_eq!(&body[12..16], &[192, 0, 2, 9]);
}

#[tokio::test]
async fn begin_dir_without_dirport_is_not_a_directory() {
    let or = make_or(ExitPolicy::accept_all(), Duration::ZERO);
    let mut link = start_server(or);
    complete_handshake(&mut link).await;
    let mut circuit = ClientCircuit::create_fast(&mut link, 0x8000_0001).await;

    let body = circuit.seal_forward(RELAY_BEGIN_DIR, 9, &[]);
    link.write_all(&fixed_cell(circuit.circ_id, CMD_RELAY, &body))
        .await
        .unwrap();

    let cell = read_cell(&mut link).await;
    let body = circuit.open_backward(&cell.payload);
    assert_eq!(body[0], RELAY_END);
    assert_eq!(body[11], 14, "reason NOTDIRECTORY");
}

#[tokio::test]
async fn malformed_begin_target_is_refused() {
    let or = make_or(ExitPolicy::accept_all(), Duration::ZERO);
    let mut link = start_server(or);
    complete_handshake(&mut link).await;
    let mut circuit = ClientCircuit::create_fast(&mut link, 0x8000_0001).await;

    let body = circuit.seal_forward(RELAY_BEGIN, 3, b"no port at all\0");
    link.write_all(&fixed_cell(circuit.circ_id, CMD_RELAY, &body))
        .await
        .unwrap();

    let cell = read_cell(&mut link).await;
    let body = circuit.open_backward(&cell.payload);
    assert_eq!(body[0], RELAY_END);
    assert_eq!(body[11], 13, "reason TORPROTOCOL");
}

/// EXTEND2 body: two link specifiers (IPv4+port and a fingerprint) plus an
/// ntor-typed handshake blob.
fn extend2_body(addr: [u8; 4], port: u16, fingerprint: &[u8; 20]) -> Vec<u8> {
    let mut body = vec![2u8];
    body.push(0);
    body.push(6);
    body.extend_from_slice(&addr);
    body.extend_from_slice(&port.to_be_bytes());
    body.push(2);
    body.push(20);
    body.extend_from_slice(fingerprint);
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&84u16.to_be_bytes());
    body.extend_from_slice(&[0u8; 84]);
    body
}

#[tokio::test]
async fn failed_extension_destroys_with_connectfailed() {
    let or = make_or(ExitPolicy::default(), Duration::ZERO);
    let mut link = start_server(or);
    complete_handshake(&mut link).await;
    let mut circuit = ClientCircuit::create_fast(&mut link, 0x8000_0001).await;

    // Nobody listens on the discard port; the dial fails and the origin
    // hears CONNECTFAILED.
    let body = circuit.seal_forward(RELAY_EXTEND2, 0, &extend2_body([127, 0, 0, 1], 9, &[7; 20]));
    link.write_all(&fixed_cell(circuit.circ_id, CMD_RELAY_EARLY, &body))
        .await
        .unwrap();

    let cell = read_cell(&mut link).await;
    assert_eq!(cell.command, CMD_DESTROY);
    assert_eq!(cell.circ_id, circuit.circ_id);
    assert_eq!(cell.payload[0], 6, "reason CONNECTFAILED");
}

#[tokio::test]
async fn extend_riding_plain_relay_is_a_protocol_violation() {
    let or = make_or(ExitPolicy::default(), Duration::ZERO);
    let mut link = start_server(or);
    complete_handshake(&mut link).await;
    let mut circuit = ClientCircuit::create_fast(&mut link, 0x8000_0001).await;

    let body = circuit.seal_forward(RELAY_EXTEND2, 0, &extend2_body([127, 0, 0, 1], 9, &[7; 20]));
    link.write_all(&fixed_cell(circuit.circ_id, CMD_RELAY, &body))
        .await
        .unwrap();

    let cell = read_cell(&mut link).await;
    assert_eq!(cell.command, CMD_DESTROY);
    assert_eq!(cell.payload[0], 1, "reason PROTOCOL");
}

#[tokio::test]
async fn destroy_aborts_an_inflight_extension() {
    // The outbound TLS attempt stalls long enough for the DESTROY to win.
    let or = make_or(ExitPolicy::default(), Duration::from_millis(400));
    let mut link = start_server(or);
    complete_handshake(&mut link).await;
    let mut circuit = ClientCircuit::create_fast(&mut link, 0x8000_0001).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let _ = listener.accept().await;
        }
    });

    let body = circuit.seal_forward(
        RELAY_EXTEND2,
        0,
        &extend2_body([127, 0, 0, 1], port, &[7; 20]),
    );
    link.write_all(&fixed_cell(circuit.circ_id, CMD_RELAY_EARLY, &body))
        .await
        .unwrap();

    // Tear the circuit down before the dialer finishes.
    link.write_all(&fixed_cell(circuit.circ_id, CMD_DESTROY, &[3]))
        .await
        .unwrap();

    // Nothing ever comes back for the aborted extension, and the link
    // itself stays healthy for new circuits.
    assert_no_cell(&mut link, Duration::from_millis(800)).await;
    let _fresh = ClientCircuit::create_fast(&mut link, 0x8000_0002).await;
}

#[tokio::test]
async fn unrecognized_cell_without_next_hop_closes_the_circuit() {
    let or = make_or(ExitPolicy::default(), Duration::ZERO);
    let mut link = start_server(or);
    complete_handshake(&mut link).await;
    let circuit = ClientCircuit::create_fast(&mut link, 0x8000_0001).await;

    // Random bytes: decryption will not be recognized, and with no next
    // hop there is nowhere to forward.
    link.write_all(&fixed_cell(circuit.circ_id, CMD_RELAY, &[0xA5; 509]))
        .await
        .unwrap();

    let cell = read_cell(&mut link).await;
    assert_eq!(cell.command, CMD_DESTROY);
    assert_eq!(cell.circ_id, circuit.circ_id);
    assert_eq!(cell.payload[0], 1, "reason PROTOCOL");
}
