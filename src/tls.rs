//! TLS seam
//!
//! The TLS record layer itself lives outside this crate: whatever provides
//! it must hand over an ordered byte stream plus the handshake artifacts
//! the link-layer authentication ties into (peer leaf certificate, master
//! secret, hello randoms). This module defines that seam, along with the
//! identity material the relay presents in its CERTS cells and the
//! fingerprint arithmetic shared by both directions.

use async_trait::async_trait;
use der_parser::ber::{BerObject, BerObjectContent};
use der_parser::der::parse_der;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{Result, TorError};

/// SHA-1 of a peer identity public key's PKCS#1 DER encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 20]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 20]) -> Fingerprint {
        Fingerprint(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Fingerprint> {
        if bytes.len() != 20 {
            return Err(TorError::Protocol("that's no fingerprint".into()));
        }
        let mut fp = [0u8; 20];
        fp.copy_from_slice(bytes);
        Ok(Fingerprint(fp))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Fingerprint of an RSA public key in PKCS#1 DER form.
    pub fn of_key_der(key_der: &[u8]) -> Fingerprint {
        Fingerprint(Sha1::digest(key_der).into())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// SHA-256 of a key's PKCS#1 DER encoding.
pub fn fingerprint256_of_key_der(key_der: &[u8]) -> [u8; 32] {
    Sha256::digest(key_der).into()
}

/// Encode an RSA public key as PKCS#1 DER, the form Tor fingerprints.
pub fn rsa_public_pkcs1_der(key: &RsaPublicKey) -> Result<Vec<u8>> {
    Ok(key
        .to_pkcs1_der()
        .map_err(|e| TorError::Certificate(format!("RSA key encoding failed: {e}")))?
        .as_bytes()
        .to_vec())
}

const RSA_ENCRYPTION_OID: &str = "1.2.840.113549.1.1.1";

/// Pull the PKCS#1 RSA public key out of an X.509 certificate without a
/// full certificate parser: walk the DER tree for the
/// SubjectPublicKeyInfo sequence whose algorithm is rsaEncryption and
/// return its bit-string contents.
pub fn x509_extract_rsa_public_der(cert_der: &[u8]) -> Result<Vec<u8>> {
    let (_, obj) = parse_der(cert_der)
        .map_err(|e| TorError::Certificate(format!("certificate DER parse failed: {e}")))?;

    fn find_rsa_spki(obj: &BerObject) -> Option<Vec<u8>> {
        if let BerObjectContent::Sequence(items) = &obj.content {
            if items.len() == 2 {
                if let (
                    BerObjectContent::Sequence(alg),
                    BerObjectContent::BitString(_, bits),
                ) = (&items[0].content, &items[1].content)
                {
                    if let Some(BerObjectContent::OID(oid)) =
                        alg.first().map(|o| &o.content)
                    {
                        if oid.to_id_string() == RSA_ENCRYPTION_OID {
                            return Some(bits.data.to_vec());
                        }
                    }
                }
            }
            for item in items {
                if let Some(found) = find_rsa_spki(item) {
                    return Some(found);
                }
            }
        }
        None
    }

    let key_der = find_rsa_spki(&obj)
        .ok_or_else(|| TorError::Certificate("no RSA subject key in certificate".into()))?;
    // Make sure the bit string really is an RSA key before anyone hashes it.
    rsa::RsaPublicKey::from_pkcs1_der(&key_der)
        .map_err(|e| TorError::Certificate(format!("subject key is not RSA: {e}")))?;
    Ok(key_der)
}

/// The certificate material this relay presents on a link, together with
/// the authentication key for outbound AUTHENTICATE cells. Certificate
/// generation happens outside the core; this only carries the results.
pub struct TorTls {
    pub link_cert_der: Vec<u8>,
    pub id_cert_der: Vec<u8>,
    pub auth_cert_der: Vec<u8>,
    pub auth_key: RsaPrivateKey,
    pub fingerprint: Fingerprint,
    pub fingerprint256: [u8; 32],
}

impl TorTls {
    pub fn new(
        link_cert_der: Vec<u8>,
        id_cert_der: Vec<u8>,
        auth_cert_der: Vec<u8>,
        auth_key: RsaPrivateKey,
        identity_public: &RsaPublicKey,
    ) -> Result<TorTls> {
        let key_der = rsa_public_pkcs1_der(identity_public)?;
        Ok(TorTls {
            link_cert_der,
            id_cert_der,
            auth_cert_der,
            auth_key,
            fingerprint: Fingerprint::of_key_der(&key_der),
            fingerprint256: fingerprint256_of_key_der(&key_der),
        })
    }
}

/// Per-session artifacts the TLS layer exposes for the AUTHENTICATE
/// cross-certification.
#[derive(Clone, Default)]
pub struct TlsSessionInfo {
    /// Peer's leaf certificate, DER.
    pub peer_cert_der: Option<Vec<u8>>,
    /// TLS master secret.
    pub master_secret: Vec<u8>,
    /// Client hello random followed by server hello random.
    pub hello_randoms: Vec<u8>,
}

/// The ordered reliable byte stream carrying cells.
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkStream for T {}

/// An established TLS session.
pub struct TlsLink {
    pub stream: Box<dyn LinkStream>,
    pub session: TlsSessionInfo,
}

/// Hook for the embedding TLS implementation.
#[async_trait]
pub trait TlsTransport: Send + Sync {
    async fn accept(&self, tcp: TcpStream) -> Result<TlsLink>;
    async fn connect(&self, tcp: TcpStream) -> Result<TlsLink>;
}
