//! Relay-through behavior: a circuit extended to a scripted next hop, with
//! unrecognized cells passed forward and backward traffic re-wrapped.

mod common;

use std::sync::Arc;

use common::*;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::RsaPrivateKey;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tor_relay::{ExitPolicy, TlsLink, TlsSessionInfo};

const CMD_CREATE2: u8 = 10;
const CMD_CREATED2: u8 = 11;
const RELAY_EXTENDED2: u8 = 15;

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

/// Play the next-hop relay: negotiate the link without authentication,
/// then answer the CREATE2. Returns the circuit ID the dialing side chose.
async fn run_next_hop(link: &mut DuplexStream, cert: &[u8]) -> u32 {
    let mut versions = [0u8; 7];
    link.read_exact(&mut versions).await.unwrap();
    assert_eq!(versions, [0, 0, 7, 0, 2, 0, 4]);
    link.write_all(&[0, 0, 7, 0, 2, 0, 4]).await.unwrap();

    // CERTS with just an identity certificate; no AUTH_CHALLENGE, so the
    // dialer may skip authentication.
    let mut payload = vec![1u8, 2];
    payload.extend_from_slice(&(cert.len() as u16).to_be_bytes());
    payload.extend_from_slice(cert);
    let mut certs = vec![0u8, 0, 0, 0, CMD_CERTS];
    certs.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    certs.extend_from_slice(&payload);
    link.write_all(&certs).await.unwrap();

    link.write_all(&fixed_cell(0, CMD_NETINFO, &[0; 12]))
        .await
        .unwrap();

    let netinfo = read_cell(link).await;
    assert_eq!(netinfo.command, CMD_NETINFO);

    let create2 = read_cell(link).await;
    assert_eq!(create2.command, CMD_CREATE2);
    assert_ne!(create2.circ_id & 0x8000_0000, 0, "dialer owns the circuit");
    assert_eq!(&create2.payload[0..2], &[0, 2], "ntor handshake type");
    assert_eq!(&create2.payload[2..4], &[0, 84]);

    let mut reply = vec![0u8, 64];
    reply.extend_from_slice(&[0xAB; 64]);
    link.write_all(&fixed_cell(create2.circ_id, CMD_CREATED2, &reply))
        .await
        .unwrap();
    create2.circ_id
}

#[tokio::test]
async fn extension_forwards_unrecognized_cells_both_ways() {
    // The outbound leg: a prepared in-memory link handed to the dialer.
    let (mut next_hop_end, outbound_end) = duplex(1 << 20);
    let or = make_or_with_transport(
        ExitPolicy::default(),
        Arc::new(HandoffTls {
            link: std::sync::Mutex::new(Some(TlsLink {
                stream: Box::new(outbound_end),
                session: TlsSessionInfo::default(),
            })),
        }),
    );

    let mut link = start_server(Arc::clone(&or));
    complete_handshake(&mut link).await;
    let mut circuit = ClientCircuit::create_fast(&mut link, 0x8000_0001).await;

    // Something must accept the TCP dial before the handoff happens.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let _ = listener.accept().await;
        }
    });

    // The identity the next hop will present.
    let next_hop_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).unwrap();
    let key_der = next_hop_key.to_public_key().to_pkcs1_der().unwrap();
    let cert = minimal_rsa_cert(key_der.as_bytes());

    let body = circuit.seal_forward(
        common::RELAY_EXTEND2,
        0,
        &extend2_body([127, 0, 0, 1], port, &[9; 20]),
    );
    link.write_all(&fixed_cell(circuit.circ_id, CMD_RELAY_EARLY, &body))
        .await
        .unwrap();

    let outbound_circ = run_next_hop(&mut next_hop_end, &cert).await;

    // The origin answers the client with RELAY_EXTENDED2 carrying the
    // next hop's handshake reply.
    let cell = read_cell(&mut link).await;
    assert_eq!(cell.command, CMD_RELAY);
    let body = circuit.open_backward(&cell.payload);
    assert_eq!(body[0], RELAY_EXTENDED2);
    assert_eq!(&body[3..5], &[0, 0]);
    assert_eq!(&body[9..11], &[0, 66]);
    assert_eq!(&body[11..13], &[0, 64]);
    assert_eq!(&body[13..77], &[0xAB; 64]);

    // Forward: a cell that fails recognition travels to the next hop
    // with exactly one layer peeled.
    let forward_payload = [0x5A; 509];
    let expected = circuit.apply_forward_keystream(&forward_payload);
    link.write_all(&fixed_cell(circuit.circ_id, CMD_RELAY, &forward_payload))
        .await
        .unwrap();
    let cell = read_cell(&mut next_hop_end).await;
    assert_eq!(cell.command, CMD_RELAY);
    assert_eq!(cell.circ_id, outbound_circ);
    assert_eq!(cell.payload, expected);

    // Backward: bytes from the next hop come back with our layer added.
    let backward_payload = [0xC3; 509];
    next_hop_end
        .write_all(&fixed_cell(outbound_circ, CMD_RELAY, &backward_payload))
        .await
        .unwrap();
    let cell = read_cell(&mut link).await;
    assert_eq!(cell.command, CMD_RELAY);
    assert_eq!(cell.circ_id, circuit.circ_id);
    let peeled = circuit.apply_backward_keystream(&cell.payload);
    assert_eq!(peeled, backward_payload);

    // A second extension attempt on the same circuit is a violation.
    let body = circuit.seal_forward(
        common::RELAY_EXTEND2,
        0,
        &extend2_body([127, 0, 0, 1], port, &[9; 20]),
    );
    link.write_all(&fixed_cell(circuit.circ_id, CMD_RELAY_EARLY, &body))
        .await
        .unwrap();
    let cell = read_cell(&mut link).await;
    assert_eq!(cell.command, CMD_DESTROY);
    assert_eq!(cell.payload[0], 1, "reason PROTOCOL");

    // Destroying the origin circuit propagates to the next hop.
    let cell = read_cell(&mut next_hop_end).await;
    assert_eq!(cell.command, CMD_DESTROY);
    assert_eq!(cell.circ_id, outbound_circ);
}
