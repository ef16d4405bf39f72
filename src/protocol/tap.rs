//! TAP handshake, responder side
//!
//! The legacy CREATE handshake: plain Diffie-Hellman in the well-known
//! 1024-bit MODP group (generator 2) over the client's hybrid-encrypted
//! onionskin, expanded with KDF-TOR. Kept because deployed clients still
//! send it; new circuits use ntor.

use rand::rngs::OsRng;
use rand::RngCore;
use rsa::BigUint;
use std::sync::OnceLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::kdf::kdf_tor;
use crate::error::{Result, TorError};

/// The 1024-bit MODP prime ("Oakley group 2").
const DH_PRIME_HEX: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
                            020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
                            4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                            EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF";

/// Length of a DH public value on the wire.
pub const DH_LEN: usize = 128;

/// Client TAP onionskin length after hybrid decryption.
pub const TAP_CLIENT_LEN: usize = DH_LEN;

/// Server reply: our DH public value plus 20 bytes of KH.
pub const TAP_SERVER_REPLY_LEN: usize = DH_LEN + 20;

/// Private exponent size in bytes (320 bits).
const DH_PRIVATE_LEN: usize = 40;

fn dh_prime() -> &'static BigUint {
    static PRIME: OnceLock<BigUint> = OnceLock::new();
    PRIME.get_or_init(|| {
        let bytes = hex::decode(DH_PRIME_HEX).expect("well-known prime decodes");
        BigUint::from_bytes_be(&bytes)
    })
}

/// Outcome of a successful responder handshake.
///
/// SECURITY: the derived key material is zeroized when the response is
/// dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TapServerResponse {
    /// Our DH public value, exactly [`DH_LEN`] bytes.
    pub public: [u8; DH_LEN],
    /// KH (20) | Df (20) | Db (20) | Kf (16) | Kb (16).
    pub key_material: [u8; 92],
}

/// Run the responder side over the client's decrypted 128-byte DH value.
pub fn server_handshake(client_public: &[u8]) -> Result<TapServerResponse> {
    if client_public.len() != TAP_CLIENT_LEN {
        return Err(TorError::Handshake("invalid TAP handshake length".into()));
    }

    let p = dh_prime();
    let x_pub = BigUint::from_bytes_be(client_public);
    let one = BigUint::from(1u32);
    // Degenerate public values would fix the shared secret.
    if x_pub <= one || x_pub >= p - &one {
        return Err(TorError::Handshake("degenerate TAP client value".into()));
    }

    let mut priv_bytes = [0u8; DH_PRIVATE_LEN];
    OsRng.fill_bytes(&mut priv_bytes);
    let x = BigUint::from_bytes_be(&priv_bytes);
    priv_bytes.zeroize();

    let g = BigUint::from(2u32);
    let our_public = g.modpow(&x, p);
    let shared = x_pub.modpow(&x, p);

    // Shared secret goes into the KDF with leading zeros stripped, as
    // DH_compute_key produces it.
    let mut shared_bytes = shared.to_bytes_be();
    let mut kdf = kdf_tor(92, &shared_bytes);
    shared_bytes.zeroize();

    let pub_bytes = our_public.to_bytes_be();
    if pub_bytes.len() > DH_LEN {
        return Err(TorError::Internal("DH public value overflow".into()));
    }
    let mut public = [0u8; DH_LEN];
    public[DH_LEN - pub_bytes.len()..].copy_from_slice(&pub_bytes);

    let mut key_material = [0u8; 92];
    key_material.copy_from_slice(&kdf);
    kdf.zeroize();

    Ok(TapServerResponse {
        public,
        key_material,
    })
}
