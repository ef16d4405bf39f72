//! Shared harness for end-to-end tests: an in-memory link playing the
//! client side of the wire protocol against a real connection actor.

// Each test binary uses its own slice of this harness.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use aes::Aes128;
use async_trait::async_trait;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use sha1::{Digest, Sha1};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;

use tor_relay::protocol::kdf::kdf_tor;
use tor_relay::{
    Config, ExitPolicy, NtorKeys, OnionConnection, OrContext, RelayKeys, TlsLink, TlsSessionInfo,
    TlsTransport, TorError, TorTls,
};

pub type Aes128Ctr = Ctr128BE<Aes128>;

/// Cell commands used on the test wire.
pub const CMD_RELAY: u8 = 3;
pub const CMD_DESTROY: u8 = 4;
pub const CMD_CREATE_FAST: u8 = 5;
pub const CMD_CREATED_FAST: u8 = 6;
pub const CMD_NETINFO: u8 = 8;
pub const CMD_RELAY_EARLY: u8 = 9;
pub const CMD_CERTS: u8 = 129;
pub const CMD_AUTH_CHALLENGE: u8 = 130;

pub const RELAY_BEGIN: u8 = 1;
pub const RELAY_DATA: u8 = 2;
pub const RELAY_END: u8 = 3;
pub const RELAY_SENDME: u8 = 5;
pub const RELAY_EXTEND2: u8 = 14;
pub const RELAY_BEGIN_DIR: u8 = 13;

/// A transport for tests that drive the link directly; outbound TLS is
/// either refused or delayed-then-refused.
pub struct TestTls {
    pub connect_delay: Duration,
}

#[async_trait]
impl TlsTransport for TestTls {
    async fn accept(&self, _tcp: TcpStream) -> tor_relay::Result<TlsLink> {
        Err(TorError::Internal("test transport accepts nothing".into()))
    }

    async fn connect(&self, _tcp: TcpStream) -> tor_relay::Result<TlsLink> {
        tokio::time::sleep(self.connect_delay).await;
        Err(TorError::Internal("test transport connects nowhere".into()))
    }
}

/// A transport holding one prepared outbound link, handed out on the
/// first connect.
pub struct HandoffTls {
    pub link: std::sync::Mutex<Option<TlsLink>>,
}

#[async_trait]
impl TlsTransport for HandoffTls {
    async fn accept(&self, _tcp: TcpStream) -> tor_relay::Result<TlsLink> {
        Err(TorError::Internal("test transport accepts nothing".into()))
    }

    async fn connect(&self, _tcp: TcpStream) -> tor_relay::Result<TlsLink> {
        self.link
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TorError::Internal("outbound link already used".into()))
    }
}

/// The smallest certificate-shaped DER blob whose RSA subject key the
/// relay can extract: a sequence wrapping a tbsCertificate-alike that
/// holds a serial and a genuine SubjectPublicKeyInfo.
pub fn minimal_rsa_cert(key_der: &[u8]) -> Vec<u8> {
    fn push_len(out: &mut Vec<u8>, len: usize) {
        if len < 128 {
            out.push(len as u8);
        } else if len < 256 {
            out.push(0x81);
            out.push(len as u8);
        } else {
            out.push(0x82);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
    }
    fn der_seq(contents: &[u8]) -> Vec<u8> {
        let mut out = vec![0x30];
        push_len(&mut out, contents.len());
        out.extend_from_slice(contents);
        out
    }

    let alg = der_seq(&[
        0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01, 0x05, 0x00,
    ]);
    let mut bitstring = vec![0x03];
    push_len(&mut bitstring, key_der.len() + 1);
    bitstring.push(0);
    bitstring.extend_from_slice(key_der);

    let mut spki_body = alg;
    spki_body.extend_from_slice(&bitstring);
    let spki = der_seq(&spki_body);

    let mut tbs_body = vec![0x02, 0x01, 0x05];
    tbs_body.extend_from_slice(&spki);
    der_seq(&der_seq(&tbs_body))
}

pub fn make_or(exit_policy: ExitPolicy, connect_delay: Duration) -> Arc<OrContext> {
    make_or_with_transport(exit_policy, Arc::new(TestTls { connect_delay }))
}

pub fn make_or_with_transport(
    exit_policy: ExitPolicy,
    transport: Arc<dyn TlsTransport>,
) -> Arc<OrContext> {
    let onion = RsaPrivateKey::new(&mut OsRng, 1024).expect("onion key");
    let identity = RsaPrivateKey::new(&mut OsRng, 1024).expect("identity key");
    let tls = TorTls::new(
        b"link cert der".to_vec(),
        b"id cert der".to_vec(),
        b"auth cert der".to_vec(),
        identity.clone(),
        &identity.to_public_key(),
    )
    .expect("tls material");

    let config = Config {
        or_port: 9001,
        dir_port: 0,
        address: Some("192.0.2.1".parse().unwrap()),
        exit_policy,
    };
    OrContext::new(
        config,
        RelayKeys {
            onion,
            ntor: NtorKeys::generate(),
        },
        tls,
        transport,
    )
}

/// Spawn a server-side connection actor over an in-memory link and return
/// our (client) end.
pub fn start_server(or: Arc<OrContext>) -> DuplexStream {
    let (client, server) = duplex(1 << 20);
    let link = TlsLink {
        stream: Box::new(server),
        session: TlsSessionInfo::default(),
    };
    tokio::spawn(OnionConnection::handle_server(
        or,
        link,
        "198.51.100.7:45678".parse().unwrap(),
    ));
    client
}

/// A cell read off the v4 wire.
pub struct WireCell {
    pub circ_id: u32,
    pub command: u8,
    pub payload: Vec<u8>,
}

pub fn fixed_cell(circ_id: u32, command: u8, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= 509);
    let mut cell = vec![0u8; 514];
    cell[0..4].copy_from_slice(&circ_id.to_be_bytes());
    cell[4] = command;
    cell[5..5 + payload.len()].copy_from_slice(payload);
    cell
}

pub async fn read_cell(link: &mut DuplexStream) -> WireCell {
    let mut head = [0u8; 5];
    link.read_exact(&mut head).await.expect("cell header");
    let circ_id = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    let command = head[4];

    let len = if command == 7 || command & 0x80 != 0 {
        let mut len_bytes = [0u8; 2];
        link.read_exact(&mut len_bytes).await.expect("var length");
        u16::from_be_bytes(len_bytes) as usize
    } else {
        509
    };
    let mut payload = vec![0u8; len];
    link.read_exact(&mut payload).await.expect("cell payload");
    WireCell {
        circ_id,
        command,
        payload,
    }
}

/// Drive the client side of the link handshake: negotiate v4, swallow the
/// server's CERTS / AUTH_CHALLENGE / NETINFO, answer with NETINFO.
pub async fn complete_handshake(link: &mut DuplexStream) {
    link.write_all(&[0, 0, 7, 0, 2, 0, 4]).await.unwrap();
    let mut reply = [0u8; 7];
    link.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0, 0, 7, 0, 2, 0, 4]);

    let mut saw_certs = false;
    let mut saw_challenge = false;
    loop {
        let cell = read_cell(link).await;
        match cell.command {
            CMD_CERTS => saw_certs = true,
            CMD_AUTH_CHALLENGE => saw_challenge = true,
            CMD_NETINFO => break,
            other => panic!("unexpected {other} during handshake"),
        }
    }
    assert!(saw_certs && saw_challenge);

    link.write_all(&fixed_cell(0, CMD_NETINFO, &[0; 16]))
        .await
        .unwrap();
}

/// Client-side view of one CREATE_FAST circuit: the derived key material
/// and running relay crypto for both directions.
pub struct ClientCircuit {
    pub circ_id: u32,
    forward_cipher: Aes128Ctr,
    forward_digest: Sha1,
    backward_cipher: Aes128Ctr,
    backward_digest: Sha1,
}

impl ClientCircuit {
    /// CREATE_FAST with an all-zero X; checks KH against the KDF.
    pub async fn create_fast(link: &mut DuplexStream, circ_id: u32) -> ClientCircuit {
        let x = [0u8; 20];
        link.write_all(&fixed_cell(circ_id, CMD_CREATE_FAST, &x))
            .await
            .unwrap();

        let cell = read_cell(link).await;
        assert_eq!(cell.command, CMD_CREATED_FAST);
        assert_eq!(cell.circ_id, circ_id);

        let mut seed = [0u8; 40];
        seed[..20].copy_from_slice(&x);
        seed[20..].copy_from_slice(&cell.payload[..20]);
        let km = kdf_tor(92, &seed);
        assert_eq!(&cell.payload[20..40], &km[..20], "KH mismatch");

        let mut forward_digest = Sha1::new();
        forward_digest.update(&km[20..40]);
        let mut backward_digest = Sha1::new();
        backward_digest.update(&km[40..60]);
        ClientCircuit {
            circ_id,
            forward_cipher: Aes128Ctr::new_from_slices(&km[60..76], &[0u8; 16]).unwrap(),
            forward_digest,
            backward_cipher: Aes128Ctr::new_from_slices(&km[76..92], &[0u8; 16]).unwrap(),
            backward_digest,
        }
    }

    /// Frame, digest, and encrypt one forward relay cell.
    pub fn seal_forward(&mut self, command: u8, stream_id: u16, data: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8; 509];
        body[0] = command;
        body[3..5].copy_from_slice(&stream_id.to_be_bytes());
        body[9..11].copy_from_slice(&(data.len() as u16).to_be_bytes());
        body[11..11 + data.len()].copy_from_slice(data);
        self.forward_digest.update(&body);
        let sum = self.forward_digest.clone().finalize();
        body[5..9].copy_from_slice(&sum[..4]);
        self.forward_cipher.apply_keystream(&mut body);
        body
    }

    /// Apply the forward keystream to `data` without touching the digest:
    /// what the relay's one-layer decryption will produce for these bytes.
    pub fn apply_forward_keystream(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.forward_cipher.apply_keystream(&mut out);
        out
    }

    /// Apply the backward keystream to `data`: peels the layer the relay
    /// added on its backward path.
    pub fn apply_backward_keystream(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.backward_cipher.apply_keystream(&mut out);
        out
    }

    /// Decrypt and verify one backward relay cell; returns the body.
    pub fn open_backward(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut body = payload.to_vec();
        self.backward_cipher.apply_keystream(&mut body);
        assert_eq!(&body[1..3], &[0, 0], "backward cell not recognized");

        let mut probe = body.clone();
        probe[5..9].fill(0);
        self.backward_digest.update(&probe);
        let sum = self.backward_digest.clone().finalize();
        assert_eq!(&body[5..9], &sum[..4], "backward digest mismatch");
        body
    }
}

/// Expect silence on the link for `window`.
pub async fn assert_no_cell(link: &mut DuplexStream, window: Duration) {
    let mut byte = [0u8; 1];
    match tokio::time::timeout(window, link.read_exact(&mut byte)).await {
        Err(_) => {}
        Ok(res) => panic!("expected silence, got {res:?}"),
    }
}
