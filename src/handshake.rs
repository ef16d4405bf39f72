//! Link handshake
//!
//! After the TLS session comes up, both sides negotiate a link version,
//! exchange certificate chains, optionally authenticate, and finish with
//! NETINFO. The VERSIONS exchange happens on the raw stream before the
//! reader subtask exists, because the cell framing itself depends on the
//! negotiated version.

use hmac::{Hmac, Mac};
use rsa::Pkcs1v15Sign;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::connection::{OnionConnection, Reader};
use crate::error::{Result, TorError};
use crate::protocol::{Cell, CellBuf, CellCommand, CircuitId, LinkVersion};
use crate::protocol::cell::{OUR_MAX_VERSION, OUR_MIN_VERSION};
use crate::tls::{fingerprint256_of_key_der, x509_extract_rsa_public_der, Fingerprint};

/// Tag mixed into the TLS cross-certification MAC.
const TLS_CROSS_CERT_TAG: &[u8] = b"Tor V3 handshake TLS cross-certification\0";

/// The one AUTHENTICATE method this relay offers and performs.
const AUTH_METHOD_RSA_SHA256: u16 = 0x0001;

impl OnionConnection {
    /// Server side: wait for the client's VERSIONS cell, pick the highest
    /// version both sides support, and answer with ours.
    pub(crate) async fn negotiate_version_server(&mut self, read_half: &mut Reader) -> Result<()> {
        let mut head = [0u8; 5];
        read_half.read_exact(&mut head).await?;

        let circ_id = u16::from_be_bytes([head[0], head[1]]);
        let command = head[2];
        let length = u16::from_be_bytes([head[3], head[4]]) as usize;
        if command != CellCommand::Versions as u8
            || length == 0
            || length > 1024
            || length % 2 != 0
            || circ_id != 0
        {
            return Err(TorError::Handshake("VERSIONS cell seems weird".into()));
        }

        let mut body = vec![0u8; length];
        read_half.read_exact(&mut body).await?;

        let best = best_common_version(&body);
        let Some(best) = best else {
            return Err(TorError::Handshake("failed to negotiate a version".into()));
        };
        self.version = best;

        // The reply still uses the pre-negotiation framing: a two-byte
        // circuit ID regardless of the chosen version.
        let mut reply = CellBuf::with_len(7);
        reply[2] = CellCommand::Versions as u8;
        reply[4] = 2;
        reply[5..7].copy_from_slice(&best.get().to_be_bytes());
        let _ = self.write_tx.send(reply).await;
        Ok(())
    }

    /// Client side: offer our versions, read the server's pick. Both cells
    /// feed the running handshake transcripts.
    pub(crate) async fn negotiate_version_client(
        &mut self,
        read_half: &mut Reader,
        hash_in: &mut Sha256,
        hash_out: &mut Sha256,
    ) -> Result<()> {
        let count = (OUR_MAX_VERSION - OUR_MIN_VERSION + 1) as usize;
        let mut offer = CellBuf::with_len(5 + 2 * count);
        offer[2] = CellCommand::Versions as u8;
        offer[3..5].copy_from_slice(&((2 * count) as u16).to_be_bytes());
        for (i, version) in (OUR_MIN_VERSION..=OUR_MAX_VERSION).enumerate() {
            offer[5 + 2 * i..7 + 2 * i].copy_from_slice(&version.to_be_bytes());
        }
        hash_out.update(&offer[..]);
        let _ = self.write_tx.send(offer).await;

        let mut head = [0u8; 5];
        read_half.read_exact(&mut head).await?;
        hash_in.update(head);
        if head[0] != 0 || head[1] != 0 || head[2] != CellCommand::Versions as u8 {
            return Err(TorError::Handshake("that's no VERSIONS cell".into()));
        }
        let length = u16::from_be_bytes([head[3], head[4]]) as usize;
        if length == 0 || length > 1024 {
            return Err(TorError::Handshake("VERSIONS length out of range".into()));
        }

        let mut body = vec![0u8; length];
        read_half.read_exact(&mut body).await?;
        hash_in.update(&body);

        match best_common_version(&body) {
            Some(best) => {
                self.version = best;
                Ok(())
            }
            None => Err(TorError::Handshake("no versions in common".into())),
        }
    }

    /// Post-version handshake loop, server side. PADDING, VPADDING and
    /// AUTHORIZE are tolerated anywhere; NETINFO ends the handshake.
    pub(crate) async fn server_handshake_loop(
        &mut self,
        cell_rx: &mut mpsc::Receiver<Cell>,
    ) -> Result<()> {
        loop {
            let cell = cell_rx.recv().await.ok_or(TorError::ConnectionClosed)?;
            match cell.command() {
                Some(CellCommand::Padding)
                | Some(CellCommand::Vpadding)
                | Some(CellCommand::Authorize) => {}
                Some(CellCommand::Certs) => self.handle_certs(&cell)?,
                Some(CellCommand::Authenticate) => {
                    // Accepted but unverified; circuit extension never
                    // depends on an inbound peer's AUTHENTICATE.
                    log::debug!("peer sent AUTHENTICATE");
                }
                Some(CellCommand::Netinfo) => return Ok(()),
                other => {
                    return Err(TorError::Handshake(format!(
                        "unexpected {other:?} during handshake"
                    )))
                }
            }
        }
    }

    /// Post-version handshake loop, outbound side: collect CERTS and
    /// AUTH_CHALLENGE, authenticate, then answer the server's NETINFO.
    pub(crate) async fn client_handshake_loop(
        &mut self,
        cell_rx: &mut mpsc::Receiver<Cell>,
        hash_in: &mut Sha256,
        hash_out: &mut Sha256,
    ) -> Result<()> {
        loop {
            let cell = cell_rx.recv().await.ok_or(TorError::ConnectionClosed)?;
            hash_in.update(cell.bytes());
            match cell.command() {
                Some(CellCommand::Padding)
                | Some(CellCommand::Vpadding)
                | Some(CellCommand::Authorize) => {}
                Some(CellCommand::Certs) => self.handle_certs(&cell)?,
                Some(CellCommand::AuthChallenge) => {
                    self.handle_auth_challenge(&cell, hash_in, hash_out).await?
                }
                Some(CellCommand::Netinfo) => {
                    self.send_netinfo(None).await?;
                    return Ok(());
                }
                other => {
                    return Err(TorError::Handshake(format!(
                        "unexpected {other:?} during handshake"
                    )))
                }
            }
        }
    }

    /// Send our CERTS cell: link or auth certificate depending on the
    /// direction, plus the identity certificate.
    pub(crate) async fn send_certs(&self, hash_out: Option<&mut Sha256>) -> Result<()> {
        let (type1, der1): (u8, &[u8]) = if self.is_outbound {
            (3, &self.tls.auth_cert_der)
        } else {
            (1, &self.tls.link_cert_der)
        };
        let der2: &[u8] = &self.tls.id_cert_der;

        let total = 1 + (3 + der1.len()) + (3 + der2.len());
        let mut cell = Cell::new_var_zeroed(self.version, CircuitId::ZERO, CellCommand::Certs, total);
        let payload = cell.payload_mut();
        payload[0] = 2;
        payload[1] = type1;
        payload[2..4].copy_from_slice(&(der1.len() as u16).to_be_bytes());
        payload[4..4 + der1.len()].copy_from_slice(der1);
        let mut pos = 4 + der1.len();
        payload[pos] = 2;
        payload[pos + 1..pos + 3].copy_from_slice(&(der2.len() as u16).to_be_bytes());
        pos += 3;
        payload[pos..pos + der2.len()].copy_from_slice(der2);

        if let Some(hash) = hash_out {
            hash.update(cell.bytes());
        }
        self.queue_cell(cell).await;
        Ok(())
    }

    /// Parse the peer's CERTS cell and derive its fingerprints from the
    /// identity certificate.
    pub(crate) fn handle_certs(&mut self, cell: &Cell) -> Result<()> {
        let data = cell.payload();
        if data.is_empty() {
            return Err(TorError::Handshake("CERTS cell way too short".into()));
        }

        let mut type_seen = [false; 4];
        let mut fingerprint = None;
        let mut fingerprint256 = None;

        let num_certs = data[0] as usize;
        let mut pos = 1;
        for _ in 0..num_certs {
            if data.len() < pos + 3 {
                return Err(TorError::Handshake("malformed CERTS".into()));
            }
            let cert_type = data[pos];
            if !(1..=3).contains(&cert_type) {
                return Err(TorError::Handshake(format!(
                    "no idea what to do with a type {cert_type} certificate"
                )));
            }
            if type_seen[cert_type as usize] {
                return Err(TorError::Handshake("duplicate certificate in CERTS".into()));
            }
            type_seen[cert_type as usize] = true;

            let length = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
            pos += 3;
            if data.len() < pos + length {
                return Err(TorError::Handshake("malformed CERTS".into()));
            }
            let der = &data[pos..pos + length];

            if cert_type == 2 {
                let key_der = x509_extract_rsa_public_der(der)?;
                fingerprint = Some(Fingerprint::of_key_der(&key_der));
                fingerprint256 = Some(fingerprint256_of_key_der(&key_der));
            }
            pos += length;
        }

        if let (Some(fp), Some(fp256)) = (fingerprint, fingerprint256) {
            log::debug!("peer identity is {fp}");
            self.they_authenticated = true;
            self.their_fingerprint = Some(fp);
            self.their_fingerprint256 = Some(fp256);
        }
        Ok(())
    }

    /// Send a 32-byte challenge offering the RSA-SHA256 link method.
    pub(crate) async fn send_auth_challenge(&self) -> Result<()> {
        let mut cell = Cell::new_var_zeroed(
            self.version,
            CircuitId::ZERO,
            CellCommand::AuthChallenge,
            32 + 4,
        );
        let payload = cell.payload_mut();
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut payload[..32]);
        payload[32..34].copy_from_slice(&1u16.to_be_bytes());
        payload[34..36].copy_from_slice(&AUTH_METHOD_RSA_SHA256.to_be_bytes());
        self.queue_cell(cell).await;
        Ok(())
    }

    /// Outbound side: answer an AUTH_CHALLENGE with our certificates and
    /// an AUTHENTICATE cell binding the cell transcripts to this TLS
    /// session.
    pub(crate) async fn handle_auth_challenge(
        &mut self,
        cell: &Cell,
        hash_in: &Sha256,
        hash_out: &mut Sha256,
    ) -> Result<()> {
        if self.we_authenticated {
            return Err(TorError::Handshake("but we already authenticated".into()));
        }
        if !self.they_authenticated {
            return Err(TorError::Handshake(
                "challenged before we know who they are".into(),
            ));
        }
        self.we_authenticated = true;

        let data = cell.payload();
        if data.len() < 36 {
            return Err(TorError::Handshake("AUTH_CHALLENGE impossibly short".into()));
        }
        let method_count = u16::from_be_bytes([data[32], data[33]]) as usize;
        if data.len() != 34 + 2 * method_count {
            return Err(TorError::Handshake("AUTH_CHALLENGE size is wrong".into()));
        }
        let can_auth = data[34..]
            .chunks(2)
            .any(|m| u16::from_be_bytes([m[0], m[1]]) == AUTH_METHOD_RSA_SHA256);
        if !can_auth {
            log::info!("peer offers no authentication method we speak");
            return Ok(());
        }

        self.send_certs(Some(&mut *hash_out)).await?;

        let peer_cert = self
            .session
            .peer_cert_der
            .as_deref()
            .ok_or_else(|| TorError::Handshake("no peer TLS certificate".into()))?;
        let their_fp256 = self
            .their_fingerprint256
            .ok_or_else(|| TorError::Handshake("peer sent no identity".into()))?;

        // TYPE | LEN | AUTH0001 | CID | SID | SLOG | CLOG | SCERT | TLSSECRETS | RAND | SIG
        let mut body = Vec::with_capacity(4 + 8 + 32 * 6 + 24 + 128);
        body.extend_from_slice(&AUTH_METHOD_RSA_SHA256.to_be_bytes());
        body.extend_from_slice(&[0, 0]);
        body.extend_from_slice(b"AUTH0001");
        body.extend_from_slice(&self.tls.fingerprint256);
        body.extend_from_slice(&their_fp256);
        body.extend_from_slice(&hash_in.clone().finalize());
        body.extend_from_slice(&hash_out.clone().finalize());
        body.extend_from_slice(&Sha256::digest(peer_cert));

        let mut mac = Hmac::<Sha256>::new_from_slice(&self.session.master_secret)
            .expect("HMAC accepts any key size");
        mac.update(&self.session.hello_randoms);
        mac.update(TLS_CROSS_CERT_TAG);
        body.extend_from_slice(&mac.finalize().into_bytes());

        let mut nonce = [0u8; 24];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce);
        body.extend_from_slice(&nonce);

        let digest = Sha256::digest(&body[4..]);
        let signature = self
            .tls
            .auth_key
            .sign(Pkcs1v15Sign::new_unprefixed(), &digest)
            .map_err(|e| TorError::Crypto(format!("AUTHENTICATE signing failed: {e}")))?;
        body.extend_from_slice(&signature);

        let length = (body.len() - 4) as u16;
        body[2..4].copy_from_slice(&length.to_be_bytes());

        let cell = Cell::new_var(self.version, CircuitId::ZERO, CellCommand::Authenticate, &body);
        self.queue_cell(cell).await;
        Ok(())
    }

    /// Send NETINFO: timestamp, the address we see the peer at, and our
    /// own advertised addresses.
    pub(crate) async fn send_netinfo(&self, hash_out: Option<&mut Sha256>) -> Result<()> {
        let mut payload = [0u8; 64];
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        payload[0..4].copy_from_slice(&now.to_be_bytes());

        let mut pos = 4 + write_netinfo_addr(&mut payload[4..], self.peer_addr.ip());
        match self.or.config.address {
            Some(addr) => {
                payload[pos] = 1;
                pos += 1;
                pos += write_netinfo_addr(&mut payload[pos..], addr);
            }
            None => {
                payload[pos] = 0;
                pos += 1;
            }
        }

        let cell = Cell::new(self.version, CircuitId::ZERO, CellCommand::Netinfo, &payload[..pos]);
        if let Some(hash) = hash_out {
            hash.update(cell.bytes());
        }
        self.queue_cell(cell).await;
        Ok(())
    }
}

/// Encode one NETINFO address (type, length, bytes); returns bytes written.
fn write_netinfo_addr(out: &mut [u8], addr: std::net::IpAddr) -> usize {
    match addr {
        std::net::IpAddr::V4(v4) => {
            out[0] = 4;
            out[1] = 4;
            out[2..6].copy_from_slice(&v4.octets());
            6
        }
        std::net::IpAddr::V6(v6) => {
            out[0] = 6;
            out[1] = 16;
            out[2..18].copy_from_slice(&v6.octets());
            18
        }
    }
}

/// Pick the numerically largest version both sides support.
fn best_common_version(versions: &[u8]) -> Option<LinkVersion> {
    let mut best = 0u16;
    for pair in versions.chunks_exact(2) {
        let version = u16::from_be_bytes([pair[0], pair[1]]);
        if version >= OUR_MIN_VERSION && version <= OUR_MAX_VERSION && version > best {
            best = version;
        }
    }
    if best == 0 {
        None
    } else {
        Some(LinkVersion::new(best))
    }
}
